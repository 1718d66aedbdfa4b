/*!
# Sheetmailer

A small web application that sends one personalized email per spreadsheet row
through the Gmail API.

## Overview

The user fills in a single form: sender name and address, a subject, a message
body that may contain `{name}`, and a spreadsheet with `Name` and `Email`
columns. On submit the file is stored, the recipients are extracted, an OAuth2
access token is obtained and one plain-text message per row is sent.

## Request flow

1. **upload**: multipart form parsing, field validation, filename sanitizing and storage
2. **loader**: reads `.xlsx`, `.xlsm`, `.xlsb`, `.xls`, `.ods` and `.csv` files into [`loader::Recipient`]s
3. **credentials**: returns an access token from `token.json`, refreshing it or starting
   the consent flow (**oauth**) when needed
4. **mailer**: builds each RFC 2822 message, encodes it base64url and hands it to a
   [`mailer::MailTransport`]
5. **app**: routing, flash messages (**flash**) and the post/redirect/get cycle

A failure for one recipient is logged and skipped. Every other failure aborts the
submission before anything is sent and is shown on the page.

## Configuration

Settings come from `SHEETMAILER_*` environment variables, see [`config::Settings`].
*/

pub mod app;
pub mod config;
pub mod credentials;
pub mod error;
pub mod flash;
pub mod loader;
pub mod mailer;
pub mod oauth;
pub mod upload;

pub use error::{Error, Result};
