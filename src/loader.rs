use calamine::{Data, Reader, open_workbook_auto};
use std::fs;
use std::iter::Peekable;
use std::path::Path;
use std::str::Chars;

use crate::error::{Error, Result};

/// Header of the column holding each recipient's display name
pub const NAME_COLUMN: &str = "Name";

/// Header of the column holding each recipient's address
pub const EMAIL_COLUMN: &str = "Email";

/// One recipient taken from the uploaded spreadsheet
///
/// Both fields are trimmed and never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Display name, substituted for `{name}` in the message
    pub name: String,

    /// Destination address
    pub email: String,
}

/// Load the recipient list from a stored spreadsheet
///
/// The file type is picked from the extension: `.csv` goes through the CSV
/// reader, Excel and OpenDocument workbooks through calamine (first sheet only).
///
/// # Arguments
/// * `filepath` - Path of the uploaded file
///
/// # Returns
/// * `Result<Vec<Recipient>>` - Recipients in row order, rows without a name or
///   address left out
///
/// # Errors
/// * `Error::MissingColumns` if the header lacks `Name` or `Email`
/// * `Error::Workbook` / `Error::Spreadsheet` / `Error::Io` if the file cannot be read
///
/// # Examples
/// ```no_run
/// use sheetmailer::loader::load_recipients;
///
/// match load_recipients("uploads/list.xlsx") {
///     Ok(recipients) => println!("{} recipients", recipients.len()),
///     Err(e) => eprintln!("Error loading recipients: {}", e),
/// }
/// ```
pub fn load_recipients(filepath: impl AsRef<Path>) -> Result<Vec<Recipient>> {
    let path = filepath.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    let rows = match extension.as_deref() {
        Some("csv") => read_csv(path)?,
        Some("xlsx") | Some("xlsm") | Some("xlsb") | Some("xls") | Some("ods") => {
            read_workbook(path)?
        }
        Some(ext) => {
            return Err(Error::Spreadsheet(format!(
                "Unsupported file extension: {}",
                ext
            )));
        }
        None => return Err(Error::Spreadsheet("File has no extension".to_string())),
    };

    let recipients = recipients_from_rows(rows)?;
    log::debug!("loaded {} recipients from {}", recipients.len(), path.display());
    Ok(recipients)
}

/// Pick the recipients out of a table whose first row is the header
///
/// Header names must match exactly. Cells are trimmed before the emptiness check,
/// so a name or address made only of whitespace drops the row.
pub fn recipients_from_rows(rows: Vec<Vec<String>>) -> Result<Vec<Recipient>> {
    let mut rows = rows.into_iter();
    let header = rows
        .next()
        .ok_or_else(|| Error::Spreadsheet("Spreadsheet is empty".to_string()))?;

    let name_idx = header.iter().position(|h| h == NAME_COLUMN);
    let email_idx = header.iter().position(|h| h == EMAIL_COLUMN);

    let (name_idx, email_idx) = match (name_idx, email_idx) {
        (Some(n), Some(e)) => (n, e),
        (n, e) => {
            let mut missing = Vec::new();
            if n.is_none() {
                missing.push(NAME_COLUMN.to_string());
            }
            if e.is_none() {
                missing.push(EMAIL_COLUMN.to_string());
            }
            return Err(Error::MissingColumns(missing));
        }
    };

    let recipients = rows
        .filter_map(|row| {
            let name = row.get(name_idx).map(|s| s.trim()).unwrap_or_default();
            let email = row.get(email_idx).map(|s| s.trim()).unwrap_or_default();
            if name.is_empty() || email.is_empty() {
                return None;
            }
            Some(Recipient {
                name: name.to_string(),
                email: email.to_string(),
            })
        })
        .collect();

    Ok(recipients)
}

// First worksheet of a workbook as rows of display strings
fn read_workbook(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut workbook = open_workbook_auto(path)?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| Error::Spreadsheet("No sheets found in workbook".to_string()))??;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn read_csv(path: &Path) -> Result<Vec<Vec<String>>> {
    let text = fs::read_to_string(path)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    Ok(parse_csv(text))
}

// Split CSV text into rows of fields.
// Line breaks inside a quoted field belong to the field; blank lines are skipped.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut chars = text.chars().peekable();

    while chars.peek().is_some() {
        let row = parse_csv_row(&mut chars);
        let blank = row.len() == 1 && row[0].trim().is_empty();
        if !blank {
            rows.push(row);
        }
    }

    rows
}

// Parse one CSV row, consuming its line terminator
fn parse_csv_row(chars: &mut Peekable<Chars<'_>>) -> Vec<String> {
    let mut result = Vec::new();
    let mut current_field = String::new();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    // Doubled quote inside a quoted field
                    current_field.push('"');
                    chars.next();
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => {
                result.push(std::mem::take(&mut current_field));
            }
            '\n' if !in_quotes => break,
            '\r' if !in_quotes => {}
            _ => current_field.push(c),
        }
    }

    result.push(current_field);
    result
}
