//! File decoding for chat attachments and uploads.
//!
//! [`decode_file`] turns `(filename, content type, bytes)` into plain text
//! plus a one-line preview. The kind is detected from the content type
//! first and the extension second:
//!
//! | Kind | Decoder | Preview |
//! |------|---------|---------|
//! | PDF | `pdf-extract`, page count from `lopdf` | `N pages extracted` |
//! | DOCX | `zip` + `quick-xml` (`w:p`, `w:t`, `w:tbl`) | `N paragraphs, M tables` |
//! | XLSX | `zip` + `quick-xml` (shared strings, sheets) | `N sheets extracted` |
//! | CSV | `csv` | `N rows, M columns` |
//! | Text | UTF-8 (lossy) | `N characters` |
//! | Unknown | UTF-8 (lossy), first 1000 characters | `First 1000 characters extracted` |
//!
//! Empty files and files over [`MAX_FILE_BYTES`] are rejected before
//! decoding. Callers that need the string convention render an error with
//! [`failure_line`].

use std::io::Read;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use thiserror::Error;

pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
pub const UNKNOWN_PREVIEW_CHARS: usize = 1000;
const CSV_SAMPLE_ROWS: usize = 10;

const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Docx,
    Xlsx,
    Csv,
    Text,
    Unknown,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Xlsx => "xlsx",
            FileKind::Csv => "csv",
            FileKind::Text => "text",
            FileKind::Unknown => "unknown",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FileKind::Pdf => "application/pdf",
            FileKind::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            FileKind::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            FileKind::Csv => "text/csv",
            FileKind::Text => "text/plain",
            FileKind::Unknown => "application/octet-stream",
        }
    }
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Empty file")]
    Empty,
    #[error("Too large ({size} bytes, max 10MB)")]
    TooLarge { size: usize },
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("CSV parsing failed: {0}")]
    Csv(String),
}

/// Decoded text plus a short human-readable summary.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedFile {
    pub kind: FileKind,
    pub text: String,
    pub preview: String,
}

/// Pick a decoder from the content type, then the extension.
pub fn detect_kind(filename: &str, content_type: Option<&str>) -> FileKind {
    if let Some(ct) = content_type.map(str::to_lowercase) {
        if ct.contains("pdf") {
            return FileKind::Pdf;
        } else if ct.contains("csv") {
            return FileKind::Csv;
        } else if ct.contains("excel") || ct.contains("spreadsheet") {
            return FileKind::Xlsx;
        } else if ct.contains("word") || ct.contains("document") {
            return FileKind::Docx;
        } else if ct.starts_with("text/") {
            return FileKind::Text;
        }
    }

    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => FileKind::Pdf,
        "csv" => FileKind::Csv,
        "xlsx" => FileKind::Xlsx,
        "docx" => FileKind::Docx,
        "txt" | "md" | "markdown" | "json" | "log" | "toml" | "yaml" | "yml" => FileKind::Text,
        _ => FileKind::Unknown,
    }
}

pub fn decode_file(
    filename: &str,
    content_type: Option<&str>,
    bytes: &[u8],
) -> Result<DecodedFile, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::Empty);
    }
    if bytes.len() > MAX_FILE_BYTES {
        return Err(ExtractError::TooLarge { size: bytes.len() });
    }

    let kind = detect_kind(filename, content_type);
    let (text, preview) = match kind {
        FileKind::Pdf => decode_pdf(bytes)?,
        FileKind::Docx => decode_docx(bytes)?,
        FileKind::Xlsx => decode_xlsx(bytes)?,
        FileKind::Csv => decode_csv(filename, bytes)?,
        FileKind::Text => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            let preview = format!("{} characters", text.chars().count());
            (text, preview)
        }
        FileKind::Unknown => {
            let text: String = String::from_utf8_lossy(bytes)
                .chars()
                .take(UNKNOWN_PREVIEW_CHARS)
                .collect();
            (text, format!("First {} characters extracted", UNKNOWN_PREVIEW_CHARS))
        }
    };

    Ok(DecodedFile {
        kind,
        text,
        preview,
    })
}

/// Bracketed one-line failure used in place of file content.
pub fn failure_line(filename: &str, err: &ExtractError) -> String {
    format!("[File {}: {}]", filename, err)
}

fn decode_pdf(bytes: &[u8]) -> Result<(String, String), ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let pages = lopdf::Document::load_mem(bytes)
        .map(|doc| doc.get_pages().len())
        .unwrap_or(1)
        .max(1);
    Ok((text, format!("{} pages extracted", pages)))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!("{} exceeds size limit", name)));
    }
    Ok(out)
}

fn decode_docx(bytes: &[u8]) -> Result<(String, String), ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;

    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut tables = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"tbl" => tables += 1,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let para = current.trim();
                    if !para.is_empty() {
                        paragraphs.push(para.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }

    let preview = format!("{} paragraphs, {} tables", paragraphs.len(), tables);
    Ok((paragraphs.join("\n"), preview))
}

fn decode_xlsx(bytes: &[u8]) -> Result<(String, String), ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };

    let mut sheets: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    sheets.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    sheets.truncate(XLSX_MAX_SHEETS);

    let mut sections = Vec::with_capacity(sheets.len());
    for (i, name) in sheets.iter().enumerate() {
        let cells = sheet_cells(&read_entry(&mut archive, name)?, &shared)?;
        sections.push(format!("Sheet {}:\n{}", i + 1, cells.join(" ")));
    }

    let preview = format!("{} sheets extracted", sections.len());
    Ok((sections.join("\n\n"), preview))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one worksheet in document order. Shared-string cells are
/// resolved; numeric and inline values are kept as written.
fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cells = Vec::new();
    let mut in_value = false;
    let mut is_shared = false;

    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    is_shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if is_shared {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => is_shared = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells)
}

fn decode_csv(filename: &str, bytes: &[u8]) -> Result<(String, String), ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(|e| ExtractError::Csv(e.to_string()))?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_string())
        .collect();

    let mut rows = 0usize;
    let mut sample: Vec<String> = Vec::new();
    for record in reader.byte_records() {
        let record = record.map_err(|e| ExtractError::Csv(e.to_string()))?;
        if rows < CSV_SAMPLE_ROWS {
            sample.push(
                record
                    .iter()
                    .map(|f| String::from_utf8_lossy(f).into_owned())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        rows += 1;
    }

    let mut text = format!(
        "CSV File: {}\nColumns: {}\nRows: {}\n",
        filename,
        headers.join(", "),
        rows
    );
    if !sample.is_empty() {
        text.push_str("\nSample Data:\n");
        text.push_str(&sample.join("\n"));
        text.push('\n');
    }
    let preview = format!("{} rows, {} columns", rows, headers.len());
    Ok((text, preview))
}
