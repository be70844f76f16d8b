//! Index-build progress reporting.
//!
//! A build emits one event when scanning finishes, one when chunking
//! finishes, and one per embedded batch. Reporters write to **stderr** so
//! stdout stays reserved for command output.

use serde::Serialize;
use std::io::Write;

/// One step of an index build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum IndexProgressEvent {
    /// The collector selected this many files.
    Scanning { files: u64 },
    /// Chunking produced this many chunks.
    Chunked { chunks: u64 },
    /// `n` of `total` chunks embedded so far.
    Embedding { n: u64, total: u64 },
}

pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-readable lines such as `index  embedding  1,024 / 4,096 chunks`.
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let (phase, detail) = match event {
            IndexProgressEvent::Scanning { files } => {
                ("scanning", format!("{} files", group_thousands(files)))
            }
            IndexProgressEvent::Chunked { chunks } => {
                ("chunked", format!("{} chunks", group_thousands(chunks)))
            }
            IndexProgressEvent::Embedding { n, total } => (
                "embedding",
                format!("{} / {} chunks", group_thousands(n), group_thousands(total)),
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "index  {}  {}", phase, detail);
        let _ = stderr.flush();
    }
}

/// One JSON object per line, e.g. `{"event":"progress","phase":"chunked","chunks":12}`.
pub struct JsonProgress;

#[derive(Serialize)]
struct JsonLine<'a> {
    event: &'static str,
    #[serde(flatten)]
    progress: &'a IndexProgressEvent,
}

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = JsonLine {
            event: "progress",
            progress: &event,
        };
        if let Ok(json) = serde_json::to_string(&line) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", json);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

/// `1234567` -> `"1,234,567"`.
fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// `--progress` setting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human output when stderr is a terminal, nothing otherwise.
    pub fn default_for_tty() -> Self {
        match atty::is(atty::Stream::Stderr) {
            true => ProgressMode::Human,
            false => ProgressMode::Off,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thousands_are_grouped() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(65_536), "65,536");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn parse_progress_mode() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }

    #[test]
    fn json_line_shape() {
        let event = IndexProgressEvent::Embedding { n: 32, total: 64 };
        let json = serde_json::to_value(JsonLine {
            event: "progress",
            progress: &event,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "progress", "phase": "embedding", "n": 32, "total": 64})
        );
    }
}
