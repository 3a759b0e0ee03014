//! REPL wire protocol
//!
//! The hub runs an interactive interpreter. Two byte sequences drive it:
//! - interrupt: `0x03 0x0D 0x0A` stops whatever is running
//! - paste frame: `0x05 <code> 0x04` submits a block of code as one unit
//!
//! Device output is free text. [`LineDecoder`] turns the raw chunks into
//! complete lines for display.

/// Ctrl-C, aborts the running program
pub const INTERRUPT: u8 = 0x03;
/// Line terminator sent after the interrupt
pub const CRLF: [u8; 2] = [0x0D, 0x0A];
/// Ctrl-E, enters paste mode
pub const PASTE_START: u8 = 0x05;
/// Ctrl-D, leaves paste mode and runs the pasted block
pub const PASTE_END: u8 = 0x04;

/// Prompt prefix echoed by the interpreter while in paste mode
const PASTE_PROMPT: &str = "=== ";

/// The interrupt sequence
pub fn interrupt() -> Vec<u8> {
    vec![INTERRUPT, CRLF[0], CRLF[1]]
}

/// Wrap `code` in a paste-mode frame
pub fn frame(code: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(code.len() + 2);
    framed.push(PASTE_START);
    framed.extend_from_slice(code);
    framed.push(PASTE_END);
    framed
}

/// The framed import preamble sent once per connection
pub fn init_preamble<S: AsRef<str>>(imports: &[S]) -> Vec<u8> {
    let body = imports
        .iter()
        .map(|line| line.as_ref())
        .collect::<Vec<_>>()
        .join("\n");
    frame(body.as_bytes())
}

/// Longest line a [`LineDecoder`] buffers before emitting it unterminated
pub const MAX_LINE_BYTES: usize = 4096;

/// Splits device output into lines
///
/// Bytes are buffered until a `\n` arrives, so multi-byte characters and
/// lines split across chunks come out whole. Carriage returns are dropped
/// and the paste-mode prompt is stripped. Output without newlines is emitted
/// in pieces of at most [`MAX_LINE_BYTES`].
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.pending);
                lines.push(Self::clean(&raw));
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_LINE_BYTES {
                    lines.push(self.take_overlong());
                }
            }
        }
        lines
    }

    /// Cut the buffer at the last complete character
    fn take_overlong(&mut self) -> String {
        let split = match std::str::from_utf8(&self.pending) {
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            _ => self.pending.len(),
        };
        let rest = self.pending.split_off(split);
        let raw = std::mem::replace(&mut self.pending, rest);
        Self::clean(&raw)
    }

    /// Flush a trailing partial line, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(Self::clean(&raw))
    }

    fn clean(raw: &[u8]) -> String {
        let text: String = String::from_utf8_lossy(raw)
            .chars()
            .filter(|c| *c != '\r')
            .collect();
        match text.strip_prefix(PASTE_PROMPT) {
            Some(rest) => rest.to_string(),
            None => text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_bytes() {
        assert_eq!(interrupt(), vec![0x03, 0x0D, 0x0A]);
    }

    #[test]
    fn test_frame_wraps_payload() {
        assert_eq!(frame(b"print(1)"), b"\x05print(1)\x04".to_vec());
        assert_eq!(frame(b""), vec![0x05, 0x04]);
    }

    #[test]
    fn test_preamble_joins_imports() {
        let preamble = init_preamble(&["import hub", "import time"]);
        assert_eq!(preamble, b"\x05import hub\nimport time\x04".to_vec());
    }

    #[test]
    fn test_line_decoder_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"hel").is_empty());
        assert_eq!(decoder.push(b"lo\r\nwor"), vec!["hello".to_string()]);
        assert_eq!(decoder.push(b"ld\n"), vec!["world".to_string()]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_line_decoder_split_utf8_and_prompt() {
        let mut decoder = LineDecoder::new();
        let text = "=== température\r\n".as_bytes();
        let (a, b) = text.split_at(13);
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.push(b), vec!["température".to_string()]);

        decoder.push(b">>> ");
        assert_eq!(decoder.finish(), Some(">>> ".to_string()));
    }

    #[test]
    fn test_line_decoder_caps_unterminated_output() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(&vec![b'.'; MAX_LINE_BYTES * 2 + 10]);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| line.len() == MAX_LINE_BYTES));
        assert_eq!(decoder.finish(), Some(".".repeat(10)));
    }

    #[test]
    fn test_line_decoder_cap_keeps_characters_whole() {
        let mut decoder = LineDecoder::new();
        let mut bytes = vec![b'a'; MAX_LINE_BYTES - 1];
        bytes.extend_from_slice("é\n".as_bytes());

        let lines = decoder.push(&bytes);

        assert_eq!(lines, vec!["a".repeat(MAX_LINE_BYTES - 1), "é".to_string()]);
        assert_eq!(decoder.finish(), None);
    }
}
