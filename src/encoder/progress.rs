//! Encoder diagnostic stream scanning
//!
//! ffmpeg rewrites its progress line in place with carriage returns, so the stream is
//! split on both `\r` and `\n`. Only the `speed=` figure is extracted; everything else is
//! classified for logging.

/// Accumulates diagnostic bytes and yields complete lines
#[derive(Debug, Default)]
pub struct ProgressScanner {
    pending: Vec<u8>,
}

impl ProgressScanner {
    /// Longest partial line kept between reads
    const MAX_PENDING: usize = 16 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk read from the stream; returns the lines it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\r' || byte == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else if self.pending.len() < Self::MAX_PENDING {
                self.pending.push(byte);
            }
        }

        lines
    }

    /// Flush whatever partial line is left at end of stream
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

/// Extract the `speed=<ratio>x` figure from a progress line
pub fn parse_speed(line: &str) -> Option<f64> {
    let rest = &line[line.find("speed=")? + "speed=".len()..];
    let rest = rest.trim_start();
    let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    if !rest[end..].starts_with('x') {
        return None;
    }
    rest[..end].parse().ok()
}

/// How a diagnostic line should be logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Error,
    Warning,
    Other,
}

pub fn classify(line: &str) -> LineKind {
    if line.contains("Error") || line.contains("error") {
        LineKind::Error
    } else if line.contains("Warning") || line.contains("warning") {
        LineKind::Warning
    } else {
        LineKind::Other
    }
}
