//! Text extraction for uploaded files (pdf, txt, docx).
//!
//! The file type is decided by extension. Anything else is rejected with
//! [`ExtractError::UnsupportedFileType`] before the pipeline touches disk.

use std::io::Read;

use thiserror::Error;

use crate::models::UploadedFile;

/// Extensions accepted by the uploader.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "txt", "docx"];

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: '{0}' (expected one of: pdf, txt, docx)")]
    UnsupportedFileType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Fails fast when the file's extension is not one we can extract.
pub fn check_supported(file: &UploadedFile) -> Result<&'static str, ExtractError> {
    let ext = file.extension().unwrap_or_default();
    SUPPORTED_EXTENSIONS
        .iter()
        .find(|s| **s == ext)
        .copied()
        .ok_or_else(|| {
            ExtractError::UnsupportedFileType(if ext.is_empty() {
                file.filename.clone()
            } else {
                ext
            })
        })
}

/// Extracts plain UTF-8 text from an uploaded file.
pub fn extract_text(file: &UploadedFile) -> Result<String, ExtractError> {
    match check_supported(file)? {
        "pdf" => extract_pdf(&file.bytes),
        "docx" => extract_docx(&file.bytes),
        _ => Ok(String::from_utf8_lossy(&file.bytes).into_owned()),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_paragraphs(&doc_xml)
}

/// Collects `<w:t>` runs, one line per `<w:p>` paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut paragraph = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let line = paragraph.trim();
                    if !line.is_empty() {
                        out.push_str(line);
                        out.push('\n');
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => paragraph.push('\t'),
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Docx(e.to_string()))?;
                paragraph.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    // Runs outside any paragraph element.
    let tail = paragraph.trim();
    if !tail.is_empty() {
        out.push_str(tail);
        out.push('\n');
    }
    Ok(out)
}
