//! Ingestion line framing: one JSON record per newline-delimited line, with
//! an enforced size cap so a runaway line cannot poison the stream.

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Pane content dominates record size; one megabyte is far above any
/// legitimate snapshot while still bounding a hostile line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("line exceeds max size: {size} > {max}")]
    OversizedLine { size: usize, max: usize },
    #[error("line decode failed: {0}")]
    Decode(String),
}

/// Decode one newline-terminated line into a record. Trailing `\n` and `\r`
/// are stripped before decoding.
pub fn decode_line<T: DeserializeOwned>(bytes: &[u8], max_line_bytes: usize) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_line_bytes {
        return Err(FrameError::OversizedLine {
            size: raw.len(),
            max: max_line_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}
