use axum::body::Bytes;
use axum::extract::Multipart;
use lazy_static::lazy_static;
use regex::Regex;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::mailer::Campaign;

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r"[^A-Za-z0-9_.\-]").unwrap();
}

/// Warning shown when the spreadsheet is missing from the form
pub const MISSING_FILE: &str = "Please upload a valid Excel file.";

const WINDOWS_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3",
];

/// Spreadsheet received through the form
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Filename as sent by the browser, not yet sanitized
    pub file_name: String,

    /// Raw file contents
    pub bytes: Bytes,
}

impl UploadedFile {
    pub fn is_empty(&self) -> bool {
        self.file_name.is_empty() || self.bytes.is_empty()
    }
}

/// One form submission, as collected from the multipart body
///
/// Every field is optional here; [`Submission::validate`] decides whether the
/// request can be processed.
#[derive(Debug, Default)]
pub struct Submission {
    pub file: Option<UploadedFile>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub subject: Option<String>,
    pub message_body: Option<String>,
}

impl Submission {
    /// Split the submission into the stored file and the message settings
    ///
    /// # Errors
    /// * `Error::Validation` if the file is absent or empty, or a text field is missing
    pub fn validate(self) -> Result<(UploadedFile, Campaign)> {
        let file = match self.file {
            Some(file) if !file.is_empty() => file,
            _ => return Err(Error::Validation(MISSING_FILE.to_string())),
        };

        let campaign = Campaign {
            sender_name: required(self.sender_name, "sender_name")?,
            sender_email: required(self.sender_email, "sender_email")?,
            subject: required(self.subject, "subject")?,
            template: required(self.message_body, "message_body")?,
        };

        Ok((file, campaign))
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    value.ok_or_else(|| Error::Validation(format!("Missing form field: {field}")))
}

/// Collect the form fields from a multipart request body
///
/// Fields other than `file`, `sender_name`, `sender_email`, `subject` and
/// `message_body` are ignored.
pub async fn read_submission(mut multipart: Multipart) -> Result<Submission> {
    let mut submission = Submission::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                submission.file = Some(UploadedFile { file_name, bytes });
            }
            "sender_name" => submission.sender_name = Some(field.text().await?),
            "sender_email" => submission.sender_email = Some(field.text().await?),
            "subject" => submission.subject = Some(field.text().await?),
            "message_body" => submission.message_body = Some(field.text().await?),
            other => log::debug!("ignoring unexpected form field {other:?}"),
        }
    }

    Ok(submission)
}

/// Make a client-supplied filename safe to use as a single path component
///
/// Path separators are turned into whitespace, whitespace runs become `_`,
/// anything outside `[A-Za-z0-9_.-]` is dropped and leading or trailing `.`
/// and `_` are stripped. The result may be empty.
///
/// # Examples
/// ```
/// use sheetmailer::upload::secure_filename;
///
/// assert_eq!(secure_filename("My recipients.xlsx"), "My_recipients.xlsx");
/// assert_eq!(secure_filename("../../etc/passwd"), "etc_passwd");
/// ```
pub fn secure_filename(raw: &str) -> String {
    let spaced = raw.replace(['/', '\\'], " ");
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = UNSAFE_CHARS.replace_all(&joined, "");
    let mut name = cleaned.trim_matches(|c: char| c == '.' || c == '_').to_string();

    let stem = name.split('.').next().unwrap_or_default().to_ascii_uppercase();
    if WINDOWS_DEVICE_NAMES.contains(&stem.as_str()) {
        name.insert(0, '_');
    }

    name
}

/// Create the upload directory if it does not exist yet
pub fn init_upload_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        create_dir_all(dir)?;
    }
    Ok(())
}

/// Write an uploaded spreadsheet into `dir` under its sanitized name
///
/// An existing file with the same name is overwritten.
///
/// # Errors
/// * `Error::Validation` if nothing is left of the filename after sanitizing
/// * `Error::Io` if the file cannot be written
pub async fn store_upload(dir: &Path, file: &UploadedFile) -> Result<PathBuf> {
    let safe_name = secure_filename(&file.file_name);
    if safe_name.is_empty() {
        return Err(Error::Validation(MISSING_FILE.to_string()));
    }

    let path = dir.join(safe_name);
    tokio::fs::write(&path, &file.bytes).await?;
    log::info!("stored upload {} ({} bytes)", path.display(), file.bytes.len());

    Ok(path)
}
