//! Format extraction seam.
//!
//! The pipeline needs plain text; turning PDFs or Office files into text is
//! the job of a [`FormatExtractor`] supplied by the application. Failures
//! are typed so ingest can report "unsupported" separately from "broken".
//!
//! [`PlainTextExtractor`] covers the text-based formats and is what the
//! core uses when no richer extractor is configured.

use crate::error::ExtractionError;
use crate::models::DocumentFormat;

pub trait FormatExtractor: Send + Sync {
    fn extract_text(&self, bytes: &[u8], format: DocumentFormat) -> Result<String, ExtractionError>;
}

/// UTF-8 decoding for plain text, markdown, CSV and JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl FormatExtractor for PlainTextExtractor {
    fn extract_text(&self, bytes: &[u8], format: DocumentFormat) -> Result<String, ExtractionError> {
        match format {
            DocumentFormat::PlainText
            | DocumentFormat::Markdown
            | DocumentFormat::Csv
            | DocumentFormat::Json => decode_utf8(bytes, format),
            other => Err(ExtractionError::UnsupportedFormat(other.mime().to_string())),
        }
    }
}

/// Decode bytes as UTF-8 (a leading BOM is dropped) and normalize.
pub fn decode_utf8(bytes: &[u8], format: DocumentFormat) -> Result<String, ExtractionError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes).map_err(|e| ExtractionError::Extraction {
        format,
        message: format!("invalid UTF-8: {}", e),
    })?;
    Ok(normalize_text(text))
}

/// Line endings to `\n`, NUL and other stray control characters removed.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}
