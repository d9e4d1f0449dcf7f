//! Document load progress reporting.
//!
//! Reports what the loader is doing (extracting, chunking, embedding) so CLI
//! users see progress on large PDFs. Progress is emitted on **stderr** so
//! stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for one document load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadProgressEvent {
    /// Text is being pulled out of the uploaded file.
    Extracting { filename: String },
    /// Text was split; `chunks` may be 0 for an empty document.
    Chunked { filename: String, chunks: u64 },
    /// Vectors are being computed or read from the cache.
    Embedding { filename: String, total: u64 },
    /// Index built; the document can be queried.
    Ready {
        filename: String,
        computed: u64,
        cached: u64,
    },
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait LoadProgressReporter: Send + Sync {
    fn report(&self, event: LoadProgressEvent);
}

/// Human-friendly progress on stderr: "load policy.txt  embedding  1,234 chunks".
pub struct StderrProgress;

impl LoadProgressReporter for StderrProgress {
    fn report(&self, event: LoadProgressEvent) {
        let line = match &event {
            LoadProgressEvent::Extracting { filename } => {
                format!("load {}  extracting...\n", filename)
            }
            LoadProgressEvent::Chunked { filename, chunks } => {
                format!("load {}  chunked  {} chunks\n", filename, format_number(*chunks))
            }
            LoadProgressEvent::Embedding { filename, total } => {
                format!("load {}  embedding  {} chunks\n", filename, format_number(*total))
            }
            LoadProgressEvent::Ready {
                filename,
                computed,
                cached,
            } => format!(
                "load {}  ready  {} embedded, {} cached\n",
                filename,
                format_number(*computed),
                format_number(*cached)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &LoadProgressEvent) -> serde_json::Value {
        match event {
            LoadProgressEvent::Extracting { filename } => serde_json::json!({
                "event": "progress",
                "file": filename,
                "phase": "extracting"
            }),
            LoadProgressEvent::Chunked { filename, chunks } => serde_json::json!({
                "event": "progress",
                "file": filename,
                "phase": "chunked",
                "chunks": chunks
            }),
            LoadProgressEvent::Embedding { filename, total } => serde_json::json!({
                "event": "progress",
                "file": filename,
                "phase": "embedding",
                "total": total
            }),
            LoadProgressEvent::Ready {
                filename,
                computed,
                cached,
            } => serde_json::json!({
                "event": "progress",
                "file": filename,
                "phase": "ready",
                "embedded": computed,
                "cached": cached
            }),
        }
    }
}

impl LoadProgressReporter for JsonProgress {
    fn report(&self, event: LoadProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter; used by the HTTP server.
pub struct NoProgress;

impl LoadProgressReporter for NoProgress {
    fn report(&self, _event: LoadProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn LoadProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
