#![cfg(not(tarpaulin_include))]

use env_logger::Env;
use sheetmailer::app;
use sheetmailer::config::Settings;

/// Entry point for the web server
///
/// Reads the settings from the environment. An optional first argument
/// overrides the listen address, e.g. `website 0.0.0.0:8080`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = Settings::from_env()?;

    if let Some(addr) = std::env::args().nth(1) {
        settings.bind_addr = addr
            .parse()
            .map_err(|e| format!("invalid listen address {:?}: {}", addr, e))?;
    }

    let level = if settings.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    app::run(settings).await
}
