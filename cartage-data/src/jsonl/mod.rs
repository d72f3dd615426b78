//! JSON-lines feature files.
//!
//! The writer emits one `feature` record per line while the main pass runs
//! and appends `patch` records for references resolved afterwards. The
//! reader accepts the same layout, so exported files can be imported again;
//! patch records are skipped because the references they resolve are still
//! present on the features themselves.

use std::io::{BufRead, BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cartage_core::{
    Feature, FeatureWriter, FeatureWriterFactory, ReadError, ResolvedReference, SourceFeature,
    WriteError,
};
use parking_lot::Mutex;
use serde::Serialize;

type Stream = BufWriter<Box<dyn Write + Send>>;

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Line<'a> {
    Feature(&'a Feature),
    Patch(&'a ResolvedReference),
}

/// Opens [`JsonLinesWriter`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesWriterFactory;

impl FeatureWriterFactory for JsonLinesWriterFactory {
    fn open(&self, stream: Box<dyn Write + Send>) -> Result<Arc<dyn FeatureWriter>, WriteError> {
        Ok(Arc::new(JsonLinesWriter::new(stream)))
    }
}

/// Thread-safe JSON-lines writer.
///
/// # Examples
/// ```
/// use cartage_core::FeatureWriter;
/// use cartage_data::jsonl::JsonLinesWriter;
///
/// let writer = JsonLinesWriter::new(Box::new(std::io::sink()));
/// writer.close().unwrap();
/// assert_eq!(writer.lines_written(), 0);
/// ```
pub struct JsonLinesWriter {
    stream: Mutex<Option<Stream>>,
    lines: AtomicU64,
}

impl std::fmt::Debug for JsonLinesWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesWriter")
            .field("lines", &self.lines_written())
            .finish_non_exhaustive()
    }
}

impl JsonLinesWriter {
    /// Wrap `stream` in a buffered writer.
    #[must_use]
    pub fn new(stream: Box<dyn Write + Send>) -> Self {
        Self {
            stream: Mutex::new(Some(BufWriter::new(stream))),
            lines: AtomicU64::new(0),
        }
    }

    /// Number of lines written so far.
    #[must_use]
    pub fn lines_written(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    fn write_line(&self, line: &Line<'_>) -> Result<(), WriteError> {
        let mut encoded = serde_json::to_vec(line).map_err(|err| WriteError::Encode {
            message: err.to_string(),
        })?;
        encoded.push(b'\n');
        let mut guard = self.stream.lock();
        let stream = guard.as_mut().ok_or(WriteError::Closed)?;
        stream.write_all(&encoded)?;
        self.lines.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl FeatureWriter for JsonLinesWriter {
    fn write(&self, feature: &Feature) -> Result<(), WriteError> {
        self.write_line(&Line::Feature(feature))
    }

    fn apply(&self, reference: &ResolvedReference) -> Result<(), WriteError> {
        self.write_line(&Line::Patch(reference))
    }

    fn close(&self) -> Result<(), WriteError> {
        let stream = self.stream.lock().take();
        match stream {
            Some(mut open) => open.flush().map_err(WriteError::from),
            None => Ok(()),
        }
    }
}

/// Reads [`SourceFeature`]s from JSON lines.
///
/// Blank lines and `patch` records are skipped.
#[derive(Debug)]
pub struct JsonLinesReader<R> {
    input: R,
    line: usize,
    buffer: String,
}

impl<R: BufRead> JsonLinesReader<R> {
    /// Read features from `input`.
    pub const fn new(input: R) -> Self {
        Self {
            input,
            line: 0,
            buffer: String::new(),
        }
    }
}

fn decode(line: usize, text: &str) -> Result<Option<SourceFeature>, ReadError> {
    let decode_error = |err: serde_json::Error| ReadError::Decode {
        line,
        message: err.to_string(),
    };
    let value: serde_json::Value = serde_json::from_str(text).map_err(decode_error)?;
    if value.get("record").and_then(serde_json::Value::as_str) == Some("patch") {
        return Ok(None);
    }
    serde_json::from_value(value).map(Some).map_err(decode_error)
}

impl<R: BufRead> Iterator for JsonLinesReader<R> {
    type Item = Result<SourceFeature, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.input.read_line(&mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(ReadError::Io(err))),
            }
            self.line = self.line.saturating_add(1);
            let text = self.buffer.trim();
            if text.is_empty() {
                continue;
            }
            match decode(self.line, text) {
                Ok(Some(feature)) => return Some(Ok(feature)),
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests;
