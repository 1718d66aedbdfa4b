use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use serde::{Deserialize, Serialize};

use crate::credentials::AccessToken;
use crate::error::{Error, Result};
use crate::loader::Recipient;

/// Placeholder replaced by each recipient's display name
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Sender and message settings shared by every recipient of one submission
#[derive(Debug, Clone)]
pub struct Campaign {
    pub sender_name: String,
    pub sender_email: String,
    pub subject: String,

    /// Message body, may contain `{name}`
    pub template: String,
}

/// A complete RFC 2822 message, base64url encoded for the mail API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedMessage {
    pub raw: String,
}

impl EncodedMessage {
    /// Decode back to the raw message bytes
    pub fn decode(&self) -> Result<Vec<u8>> {
        URL_SAFE
            .decode(&self.raw)
            .map_err(|e| Error::Message(e.to_string()))
    }
}

/// A recipient the dispatcher could not deliver to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecipient {
    pub email: String,
    pub reason: String,
}

/// Outcome of one dispatch run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Message ids returned by the mail API, in send order
    pub sent: Vec<String>,
    pub failed: Vec<FailedRecipient>,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.sent.len() + self.failed.len()
    }
}

/// Anything that can submit one encoded message on behalf of a user
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send `message` as `user_id` and return the provider's message id
    async fn send(
        &self,
        user_id: &str,
        message: &EncodedMessage,
        token: &AccessToken,
    ) -> Result<String>;
}

/// Replace every `{name}` in `template` with `name`
///
/// # Examples
/// ```
/// use sheetmailer::mailer::personalize;
///
/// assert_eq!(personalize("Hello {name}", "Alex"), "Hello Alex");
/// assert_eq!(personalize("No placeholder", "Alex"), "No placeholder");
/// ```
pub fn personalize(template: &str, name: &str) -> String {
    template.replace(NAME_PLACEHOLDER, name)
}

/// Build a plain-text message and encode it for the mail API
///
/// The `From` header reads `<sender_name> <sender_email>`.
///
/// # Errors
/// * `Error::Message` if an address is malformed or the message cannot be built
pub fn build_message(
    sender_name: &str,
    sender_email: &str,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<EncodedMessage> {
    let from = Mailbox::new(
        Some(sender_name.to_string()),
        sender_email
            .trim()
            .parse()
            .map_err(|e| Error::Message(format!("sender {sender_email:?}: {e}")))?,
    );
    let to: Mailbox = to
        .trim()
        .parse()
        .map_err(|e| Error::Message(format!("recipient {to:?}: {e}")))?;

    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| Error::Message(e.to_string()))?;

    Ok(EncodedMessage {
        raw: URL_SAFE.encode(message.formatted()),
    })
}

/// Send one personalized message to each recipient, in order
///
/// A failed recipient is logged and recorded in the report; the loop always
/// runs to the end.
pub async fn dispatch(
    transport: &dyn MailTransport,
    token: &AccessToken,
    campaign: &Campaign,
    recipients: &[Recipient],
) -> DispatchReport {
    let mut report = DispatchReport::default();

    for recipient in recipients {
        let body = personalize(&campaign.template, &recipient.name);
        let outcome = match build_message(
            &campaign.sender_name,
            &campaign.sender_email,
            &recipient.email,
            &campaign.subject,
            &body,
        ) {
            Ok(message) => {
                transport
                    .send(&campaign.sender_email, &message, token)
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(id) => {
                log::debug!("sent message {} to {}", id, recipient.email);
                report.sent.push(id);
            }
            Err(e) => {
                log::error!("An error occurred sending to {}: {}", recipient.email, e);
                report.failed.push(FailedRecipient {
                    email: recipient.email.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    log::info!(
        "dispatch finished: {} sent, {} failed",
        report.sent.len(),
        report.failed.len()
    );
    report
}

/// Gmail REST transport (`users.messages.send`)
pub struct GmailTransport {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

impl GmailTransport {
    /// `base_url` is the API root, e.g. `https://gmail.googleapis.com`
    pub fn new(base_url: impl Into<String>) -> Self {
        GmailTransport {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn send_url(&self, user_id: &str) -> String {
        format!(
            "{}/gmail/v1/users/{}/messages/send",
            self.base_url,
            urlencoding::encode(user_id)
        )
    }
}

#[async_trait]
impl MailTransport for GmailTransport {
    async fn send(
        &self,
        user_id: &str,
        message: &EncodedMessage,
        token: &AccessToken,
    ) -> Result<String> {
        let resp = self
            .client
            .post(self.send_url(user_id))
            .bearer_auth(token.secret())
            .json(message)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        let sent: SendResponse = resp.json().await?;
        Ok(sent.id)
    }
}
