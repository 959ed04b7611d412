//! Utility modules for the snapshot engine.

pub mod env;
pub mod errors;
pub mod logger;
pub mod shutdown;

pub use errors::{EngineError, Result};

/// Collapse command output into a single bounded log line.
///
/// Output is cut at 2 KiB (on a char boundary) and newlines become ` | `.
pub fn summarize_output(output: &[u8]) -> String {
    const LIMIT: usize = 2048;

    let text = String::from_utf8_lossy(output);
    let mut joined = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" | ");

    if joined.len() > LIMIT {
        let mut cut = LIMIT;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
        joined.push_str("...");
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_collapses_newlines() {
        let summary = summarize_output(b"line one\n\nline two\r\n  line three  \n");
        assert_eq!(summary, "line one | line two | line three");
    }

    #[test]
    fn test_summarize_truncates() {
        let big = "x".repeat(5000);
        let summary = summarize_output(big.as_bytes());
        assert_eq!(summary.len(), 2048 + 3);
        assert!(summary.ends_with("..."));
    }
}
