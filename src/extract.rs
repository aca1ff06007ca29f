//! Text extraction for uploaded documents.
//!
//! Supports PDF, CSV, and OOXML spreadsheets. Callers verify the file
//! signature first ([`verify_signature`]), then extract plain UTF-8 text
//! plus lightweight structural metadata with [`extract_document`].

use std::io::Read;

use crate::error::{ChatError, Result};

/// Maximum sheets to process in an xlsx workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Bytes of a claimed CSV inspected for binary content.
const CSV_SNIFF_BYTES: usize = 1024;

/// Document formats accepted by the upload pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentType {
    Pdf,
    Csv,
    Spreadsheet,
}

impl DocumentType {
    /// Maps a filename extension to a document type, case-insensitive.
    pub fn from_extension(name: &str) -> Option<Self> {
        let ext = name.rsplit('.').next()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentType::Pdf),
            "csv" => Some(DocumentType::Csv),
            "xlsx" => Some(DocumentType::Spreadsheet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Csv => "csv",
            DocumentType::Spreadsheet => "spreadsheet",
        }
    }
}

/// Extraction output: plain text plus structural metadata for the
/// vector record (page counts, row counts, headers).
#[derive(Debug)]
pub struct Extracted {
    pub text: String,
    pub metadata: serde_json::Value,
}

/// Checks the file's magic bytes against its claimed type. Extension
/// alone is not trusted; a renamed binary must be rejected before it
/// reaches a parser.
pub fn verify_signature(bytes: &[u8], ty: DocumentType) -> Result<()> {
    let ok = match ty {
        DocumentType::Pdf => bytes.starts_with(b"%PDF"),
        DocumentType::Spreadsheet => bytes.starts_with(b"PK\x03\x04"),
        DocumentType::Csv => {
            // No magic number for CSV. Reject files carrying another
            // format's signature or embedded NUL bytes.
            !bytes.starts_with(b"%PDF")
                && !bytes.starts_with(b"PK\x03\x04")
                && !bytes
                    .iter()
                    .take(CSV_SNIFF_BYTES)
                    .any(|&b| b == 0)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(ChatError::validation(format!(
            "file content does not match declared type {}",
            ty.as_str()
        )))
    }
}

/// Extracts plain text and metadata from a verified document.
pub fn extract_document(bytes: &[u8], ty: DocumentType) -> Result<Extracted> {
    match ty {
        DocumentType::Pdf => extract_pdf(bytes),
        DocumentType::Csv => extract_csv(bytes),
        DocumentType::Spreadsheet => extract_xlsx(bytes),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Extracted> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ChatError::validation(format!("PDF extraction failed: {e}")))?;
    let metadata = serde_json::json!({ "page_count": count_pdf_pages(bytes) });
    Ok(Extracted { text, metadata })
}

/// Counts `/Type /Page` object markers in the raw PDF. Approximate but
/// good enough for display metadata; falls back to 1.
fn count_pdf_pages(bytes: &[u8]) -> usize {
    let needle: &[u8] = b"/Type /Page";
    let mut count = 0;
    let mut i = 0;
    while i + needle.len() <= bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            // skip "/Type /Pages" (the page tree node)
            let next = bytes.get(i + needle.len());
            if next != Some(&b's') {
                count += 1;
            }
            i += needle.len();
        } else {
            i += 1;
        }
    }
    count.max(1)
}

fn extract_csv(bytes: &[u8]) -> Result<Extracted> {
    let text = String::from_utf8_lossy(bytes);
    let rows = parse_csv(&text);
    let headers: Vec<String> = rows.first().cloned().unwrap_or_default();

    let mut out = String::new();
    for row in &rows {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&row.join(", "));
    }

    let metadata = serde_json::json!({
        "row_count": rows.len().saturating_sub(1),
        "headers": headers,
    });
    Ok(Extracted {
        text: out,
        metadata,
    })
}

/// Minimal RFC 4180 parser: quoted fields, escaped quotes, CRLF and LF
/// line endings. Blank lines are skipped.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => {
                    row.push(std::mem::take(&mut field));
                }
                '\r' => {}
                '\n' => {
                    row.push(std::mem::take(&mut field));
                    if row.iter().any(|f| !f.is_empty()) {
                        rows.push(std::mem::take(&mut row));
                    } else {
                        row.clear();
                    }
                }
                _ => field.push(c),
            }
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        if row.iter().any(|f| !f.is_empty()) {
            rows.push(row);
        }
    }
    rows
}

fn extract_xlsx(bytes: &[u8]) -> Result<Extracted> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ChatError::validation(format!("spreadsheet open failed: {e}")))?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = list_worksheet_names(&mut archive);

    let mut out = String::new();
    let mut total_rows = 0usize;
    let sheet_count = sheet_names.len().min(XLSX_MAX_SHEETS);
    for (idx, name) in sheet_names.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let sheet = extract_sheet(&sheet_xml, &shared_strings)?;
        total_rows += sheet.rows;
        if idx > 0 && !out.is_empty() && !sheet.text.is_empty() {
            out.push('\n');
        }
        out.push_str(&sheet.text);
    }

    let metadata = serde_json::json!({
        "sheet_count": sheet_count,
        "row_count": total_rows,
    });
    Ok(Extracted {
        text: out,
        metadata,
    })
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ChatError::validation(format!("spreadsheet entry {name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ChatError::validation(format!("spreadsheet entry {name}: {e}")))?;
    if out.len() as u64 >= max_bytes {
        return Err(ChatError::validation(format!(
            "spreadsheet entry {name} exceeds size limit ({max_bytes} bytes)"
        )));
    }
    Ok(out)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>> {
    // Workbooks with only inline/numeric cells have no sharedStrings part.
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        strings.push(te.unescape().unwrap_or_default().into_owned());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(ChatError::validation(format!(
                    "spreadsheet shared strings: {e}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

struct SheetText {
    text: String,
    rows: usize,
}

fn extract_sheet(xml: &[u8], shared_strings: &[String]) -> Result<SheetText> {
    let mut cells: Vec<String> = Vec::new();
    let mut rows = 0usize;
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"row" {
                    rows += 1;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                } else if e.local_name().as_ref() == b"v" {
                    in_v = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if !s.is_empty() {
                    if cell_is_shared_str {
                        if let Ok(i) = s.parse::<usize>() {
                            if i < shared_strings.len() {
                                cells.push(shared_strings[i].clone());
                                cell_count += 1;
                            }
                        }
                    } else {
                        cells.push(s.to_string());
                        cell_count += 1;
                    }
                }
                in_v = false;
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"v" {
                    in_v = false;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ChatError::validation(format!("spreadsheet parse: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(SheetText {
        text: cells.join(" "),
        rows,
    })
}
