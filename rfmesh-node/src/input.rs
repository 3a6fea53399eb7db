//! Hex frame input.
//!
//! Accepts one frame per line as plain hex or wrapped `*hex;` (the framing
//! dump1090-style tools emit), with comments and blank lines skipped.

use std::fs;
use std::io::{self, BufRead};
use std::path::Path;

use rfmesh_core::frame::{MAX_FRAME_LEN, MIN_FRAME_LEN};
use rfmesh_core::types::hex_decode;

/// One frame read from input, with the 1-based line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub line: usize,
    pub bytes: Vec<u8>,
}

/// Read all frames from a file, or stdin when the path is `-`.
pub fn read_frames(path: &Path) -> io::Result<Vec<RawFrame>> {
    if path == Path::new("-") {
        let stdin = io::stdin();
        let lines = stdin.lock().lines().collect::<io::Result<Vec<_>>>()?;
        return Ok(frames_from_lines(lines.iter().map(String::as_str)));
    }
    let content = fs::read_to_string(path)?;
    Ok(frames_from_lines(content.lines()))
}

/// Parse every usable line; unusable lines are skipped.
pub fn frames_from_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<RawFrame> {
    lines
        .enumerate()
        .filter_map(|(i, line)| {
            let hex = clean_hex_line(line)?;
            let bytes = hex_decode(&hex).ok()?;
            Some(RawFrame { line: i + 1, bytes })
        })
        .collect()
}

/// Extract a frame hex string from a line.
///
/// Handles plain hex, `*hex;` framing, and whitespace. Lengths outside the
/// possible frame sizes are rejected here; content is checked by the decoder.
pub fn clean_hex_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let inner = line
        .strip_prefix('*')
        .and_then(|l| l.strip_suffix(';'))
        .unwrap_or(line);

    is_valid_hex(inner).then(|| inner.to_ascii_uppercase())
}

fn is_valid_hex(s: &str) -> bool {
    s.len().is_multiple_of(2)
        && (MIN_FRAME_LEN * 2..=MAX_FRAME_LEN * 2).contains(&s.len())
        && s.chars().all(|c| c.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn min_frame_hex() -> String {
        "0a".repeat(MIN_FRAME_LEN)
    }

    #[test]
    fn test_clean_hex_line_plain() {
        let hex = min_frame_hex();
        assert_eq!(clean_hex_line(&hex), Some(hex.to_ascii_uppercase()));
    }

    #[test]
    fn test_clean_hex_line_wrapped() {
        let hex = min_frame_hex();
        let line = format!("*{hex};");
        assert_eq!(clean_hex_line(&line), Some(hex.to_ascii_uppercase()));
    }

    #[test]
    fn test_clean_hex_line_whitespace() {
        let hex = min_frame_hex();
        assert!(clean_hex_line(&format!("  {hex}\t")).is_some());
    }

    #[test]
    fn test_clean_hex_line_comment_and_empty() {
        assert!(clean_hex_line("# comment").is_none());
        assert!(clean_hex_line("").is_none());
        assert!(clean_hex_line("   ").is_none());
    }

    #[test]
    fn test_clean_hex_line_invalid() {
        assert!(clean_hex_line("not hex at all").is_none());
        // Too short for any frame
        assert!(clean_hex_line("0102030405").is_none());
        // Odd digit count
        assert!(clean_hex_line(&format!("{}0", min_frame_hex())).is_none());
        // Longer than the MTU
        assert!(clean_hex_line(&"00".repeat(MAX_FRAME_LEN + 1)).is_none());
    }

    #[test]
    fn test_frames_from_lines_keeps_line_numbers() {
        let hex = min_frame_hex();
        let text = format!("# capture\n{hex}\n\ngarbage\n*{hex};\n");
        let frames = frames_from_lines(text.lines());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].line, 2);
        assert_eq!(frames[1].line, 5);
        assert_eq!(frames[0].bytes, vec![0x0a; MIN_FRAME_LEN]);
    }

    #[test]
    fn test_read_frames_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.txt");
        std::fs::write(&path, format!("{}\n", min_frame_hex())).unwrap();
        assert_eq!(read_frames(&path).unwrap().len(), 1);
    }
}
