use thiserror::Error;

/// Errors raised while handling a form submission
///
/// `Validation` is the only request-level variant: it is shown to the user as a
/// warning and means nothing was processed. Every other variant is a processing
/// failure and is reported with its text as-is.
#[derive(Debug, Error)]
pub enum Error {
    /// The submitted form is incomplete
    #[error("{0}")]
    Validation(String),

    /// A setting could not be parsed at startup
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The workbook could not be opened or read
    #[error("failed to read spreadsheet: {0}")]
    Workbook(#[from] calamine::Error),

    /// The file is readable but not usable as a recipient list
    #[error("{0}")]
    Spreadsheet(String),

    #[error("missing required column(s): {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("OAuth error: {0}")]
    OAuth(String),

    /// A recipient or sender address could not be turned into a message
    #[error("invalid message: {0}")]
    Message(String),

    #[error("mail API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid form data: {0}")]
    Multipart(#[from] axum::extract::multipart::MultipartError),

    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}
