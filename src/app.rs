use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use handlebars::Handlebars;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

use crate::config::Settings;
use crate::credentials::{CredentialProvider, FileCredentialProvider};
use crate::error::{Error, Result};
use crate::flash::{self, Flash};
use crate::loader;
use crate::mailer::{self, DispatchReport, GmailTransport, MailTransport};
use crate::oauth::InstalledAppFlow;
use crate::upload;

/// Message shown once every recipient has been attempted
pub const SUCCESS_MESSAGE: &str = "Emails sent successfully!";

const ACCEPTED_FILES: &str = ".xlsx,.xlsm,.xlsb,.xls,.ods,.csv";

/// Shared state handed to every request
///
/// The credential provider and the transport are injected so the handlers do
/// not depend on where tokens live or how mail leaves the process.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub transport: Arc<dyn MailTransport>,
    templates: Arc<Handlebars<'static>>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn MailTransport>,
    ) -> std::result::Result<Self, handlebars::TemplateError> {
        let mut templates = Handlebars::new();
        templates.register_template_string("index", include_str!("./static/index.hbs"))?;

        Ok(AppState {
            settings: Arc::new(settings),
            credentials,
            transport,
            templates: Arc::new(templates),
        })
    }
}

/// Build the router: the form on `/` plus static assets
pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes;
    let static_dir = state.settings.static_dir.clone();

    Router::new()
        .route("/", get(serve_form).post(submit))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Start the web server with the production collaborators
///
/// Creates the upload directory, wires the file-backed credential provider and
/// the Gmail transport, then serves until the process is stopped.
pub async fn run(settings: Settings) -> std::result::Result<(), Box<dyn std::error::Error>> {
    upload::init_upload_dir(&settings.upload_dir)?;

    let consent = Arc::new(InstalledAppFlow::new(settings.credentials_path.clone()));
    let credentials = Arc::new(FileCredentialProvider::new(
        settings.token_path.clone(),
        consent,
    ));
    let transport = Arc::new(GmailTransport::new(settings.gmail_api_base.clone()));

    if settings.debug {
        log::warn!("running in development mode, do not use this configuration in production");
    }

    let addr = settings.bind_addr;
    let state = AppState::new(settings, credentials, transport)?;

    let listener = TcpListener::bind(addr).await?;
    log::info!("Listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;

    Ok(())
}

async fn serve_form(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (jar, flashes) = flash::take(jar);

    let page = state.templates.render(
        "index",
        &json!({
            "flashes": flashes,
            "accept": ACCEPTED_FILES,
        }),
    );

    match page {
        Ok(html) => (jar, Html(html)).into_response(),
        Err(e) => {
            log::error!("failed to render form: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Error::from(e).to_string()).into_response()
        }
    }
}

async fn submit(
    State(state): State<AppState>,
    jar: CookieJar,
    multipart: Multipart,
) -> (CookieJar, Redirect) {
    let outcome = match upload::read_submission(multipart).await {
        Ok(submission) => process_submission(&state, submission).await,
        Err(e) => Err(e),
    };

    let message = match outcome {
        Ok(report) => {
            if !report.failed.is_empty() {
                log::warn!(
                    "{} of {} recipients were skipped",
                    report.failed.len(),
                    report.attempted()
                );
            }
            Flash::success(SUCCESS_MESSAGE)
        }
        Err(e) if e.is_validation() => Flash::warning(e.to_string()),
        Err(e) => {
            log::error!("submission failed: {}", e);
            Flash::danger(format!("An error occurred: {}", e))
        }
    };

    (flash::push(jar, message), Redirect::to("/"))
}

/// Run one submission end to end: store, extract, authenticate, send
///
/// Nothing is sent unless the whole recipient list could be read and a token
/// obtained.
///
/// # Errors
/// * `Error::Validation` if the form is incomplete; nothing else happens
/// * Any other error if storing, parsing or authenticating fails
pub async fn process_submission(
    state: &AppState,
    submission: upload::Submission,
) -> Result<DispatchReport> {
    let (file, campaign) = submission.validate()?;
    let path = upload::store_upload(&state.settings.upload_dir, &file).await?;

    let recipients = tokio::task::spawn_blocking(move || loader::load_recipients(&path)).await??;
    log::info!("sending to {} recipients", recipients.len());

    let token = state.credentials.access_token().await?;
    Ok(mailer::dispatch(state.transport.as_ref(), &token, &campaign, &recipients).await)
}
