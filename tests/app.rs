use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use rust_xlsxwriter::Workbook;
use sheetmailer::app::{AppState, SUCCESS_MESSAGE, router};
use sheetmailer::config::Settings;
use sheetmailer::credentials::{AccessToken, CredentialProvider};
use sheetmailer::error::{Error, Result};
use sheetmailer::flash::{self, Flash, Level};
use sheetmailer::mailer::{EncodedMessage, MailTransport};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "sheetmailer-test-boundary";

#[derive(Default)]
struct CountingCredentials {
    calls: AtomicUsize,
}

#[async_trait]
impl CredentialProvider for CountingCredentials {
    async fn access_token(&self) -> Result<AccessToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken::new("test-token"))
    }
}

struct DeniedCredentials;

#[async_trait]
impl CredentialProvider for DeniedCredentials {
    async fn access_token(&self) -> Result<AccessToken> {
        Err(Error::OAuth("authorization denied: access_denied".into()))
    }
}

#[derive(Default)]
struct FakeTransport {
    fail: bool,
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn send(
        &self,
        user_id: &str,
        message: &EncodedMessage,
        token: &AccessToken,
    ) -> Result<String> {
        assert_eq!(token.secret(), "test-token");
        if self.fail {
            return Err(Error::Api {
                status: 500,
                body: "backend error".into(),
            });
        }
        let text = String::from_utf8(message.decode()?).unwrap();
        let mut sent = self.sent.lock().unwrap();
        sent.push((user_id.to_string(), text));
        Ok(format!("msg-{}", sent.len()))
    }
}

struct Harness {
    dir: TempDir,
    credentials: Arc<CountingCredentials>,
    transport: Arc<FakeTransport>,
    state: AppState,
}

fn harness_with(transport: FakeTransport) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        upload_dir: dir.path().join("uploads"),
        token_path: dir.path().join("token.json"),
        static_dir: dir.path().join("static"),
        ..Settings::default()
    };
    std::fs::create_dir_all(&settings.upload_dir).unwrap();

    let credentials = Arc::new(CountingCredentials::default());
    let transport = Arc::new(transport);
    let state = AppState::new(settings, credentials.clone(), transport.clone()).unwrap();

    Harness {
        dir,
        credentials,
        transport,
        state,
    }
}

fn harness() -> Harness {
    harness_with(FakeTransport::default())
}

fn workbook_bytes(dir: &Path, rows: &[[&str; 2]]) -> Vec<u8> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (r, row) in rows.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            if !value.is_empty() {
                sheet.write_string(r as u32, c as u16, *value).unwrap();
            }
        }
    }
    let path = dir.join("source.xlsx");
    workbook.save(&path).unwrap();
    std::fs::read(path).unwrap()
}

fn form_fields() -> Vec<(&'static str, &'static str)> {
    vec![
        ("sender_name", "Bob"),
        ("sender_email", "bob@x.com"),
        ("subject", "Hi"),
        ("message_body", "Hello {name}"),
    ]
}

fn multipart_request(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((file_name, contents)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(contents);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

// Value of the flash cookie set by a response
fn flash_cookie(response: &Response) -> String {
    let set_cookie = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("flash="))
        .expect("response sets the flash cookie")
        .to_string();
    let value = set_cookie.trim_start_matches("flash=");
    value.split(';').next().unwrap_or_default().to_string()
}

async fn submit(h: &Harness, request: Request<Body>) -> Vec<Flash> {
    let response = router(h.state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "/");
    flash::decode(&flash_cookie(&response))
}

#[tokio::test]
async fn sends_one_message_per_complete_row() {
    let h = harness();
    let xlsx = workbook_bytes(
        h.dir.path(),
        &[["Name", "Email"], ["Alice", "alice@x.com"], ["Bob", ""]],
    );

    let flashes = submit(&h, multipart_request(&form_fields(), Some(("list.xlsx", &xlsx[..])))).await;
    assert_eq!(flashes, [Flash::success(SUCCESS_MESSAGE)]);

    let sent = h.transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (user_id, text) = &sent[0];
    assert_eq!(user_id, "bob@x.com");
    assert!(text.contains("From: Bob <bob@x.com>"));
    assert!(text.contains("To: alice@x.com"));
    assert!(text.contains("Subject: Hi"));
    assert!(text.contains("Hello Alice"));

    assert!(h.dir.path().join("uploads").join("list.xlsx").exists());
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn csv_uploads_are_accepted() {
    let h = harness();
    let csv = b"Name,Email\r\n\"Smith, Jane\",jane@x.com\r\nCarol,carol@x.com\r\n";

    let flashes = submit(&h, multipart_request(&form_fields(), Some(("people.csv", &csv[..])))).await;
    assert_eq!(flashes, [Flash::success(SUCCESS_MESSAGE)]);

    let sent = h.transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].1.contains("Hello Smith, Jane"));
    assert!(sent[1].1.contains("To: carol@x.com"));
}

#[tokio::test]
async fn per_recipient_failures_still_report_success() {
    let h = harness_with(FakeTransport {
        fail: true,
        ..FakeTransport::default()
    });
    let xlsx = workbook_bytes(h.dir.path(), &[["Name", "Email"], ["Alice", "alice@x.com"]]);

    let flashes = submit(&h, multipart_request(&form_fields(), Some(("list.xlsx", &xlsx[..])))).await;
    assert_eq!(flashes, [Flash::success(SUCCESS_MESSAGE)]);
}

#[tokio::test]
async fn missing_column_is_reported_and_nothing_is_sent() {
    let h = harness();
    let xlsx = workbook_bytes(h.dir.path(), &[["Name", "Address"], ["Alice", "alice@x.com"]]);

    let flashes = submit(&h, multipart_request(&form_fields(), Some(("list.xlsx", &xlsx[..])))).await;
    assert_eq!(flashes.len(), 1);
    assert_eq!(flashes[0].level, Level::Danger);
    assert!(flashes[0].message.starts_with("An error occurred: "));
    assert!(flashes[0].message.contains("Email"));

    assert!(h.transport.sent.lock().unwrap().is_empty());
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_file_is_a_warning() {
    let h = harness();

    let flashes = submit(&h, multipart_request(&form_fields(), None)).await;
    assert_eq!(flashes, [Flash::warning("Please upload a valid Excel file.")]);

    let flashes = submit(&h, multipart_request(&form_fields(), Some(("", &b""[..])))).await;
    assert_eq!(flashes, [Flash::warning("Please upload a valid Excel file.")]);

    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_text_field_is_a_warning() {
    let h = harness();
    let fields: Vec<_> = form_fields()
        .into_iter()
        .filter(|(name, _)| *name != "subject")
        .collect();

    let flashes = submit(&h, multipart_request(&fields, Some(("people.csv", &b"Name,Email\n"[..])))).await;
    assert_eq!(flashes, [Flash::warning("Missing form field: subject")]);
}

#[tokio::test]
async fn authorization_failure_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        upload_dir: dir.path().to_path_buf(),
        ..Settings::default()
    };
    let transport = Arc::new(FakeTransport::default());
    let state = AppState::new(settings, Arc::new(DeniedCredentials), transport.clone()).unwrap();
    let csv = b"Name,Email\nAlice,alice@x.com\n";

    let response = router(state)
        .oneshot(multipart_request(&form_fields(), Some(("people.csv", &csv[..]))))
        .await
        .unwrap();
    let flashes = flash::decode(&flash_cookie(&response));

    assert_eq!(
        flashes,
        [Flash::danger(
            "An error occurred: OAuth error: authorization denied: access_denied"
        )]
    );
    assert!(transport.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn form_page_shows_and_clears_flashes() {
    let h = harness();
    let pending = flash::push(CookieJar::new(), Flash::warning("Please upload a valid Excel file."));
    let cookie = pending.get(flash::FLASH_COOKIE).unwrap().value().to_string();

    let request = Request::builder()
        .uri("/")
        .header(header::COOKIE, format!("flash={cookie}"))
        .body(Body::empty())
        .unwrap();
    let response = router(h.state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let removal = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(removal.starts_with("flash="));
    assert!(removal.contains("Max-Age=0"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let html = String::from_utf8(body.to_vec()).unwrap();
    assert!(html.contains("alert-warning"));
    assert!(html.contains("Please upload a valid Excel file."));
    assert!(html.contains("name=\"message_body\""));
}

#[tokio::test]
async fn form_page_without_flashes_sets_no_cookie() {
    let h = harness();
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = router(h.state.clone()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
}
