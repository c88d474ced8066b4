//! Reconstructs command lines from the attacker's interactive keystrokes.
//!
//! The relay only sees raw terminal bytes; this buffer applies the line
//! editing an interactive shell would (backspace, cursor movement, delete)
//! so the `command` events carry what the attacker actually ran, not the
//! keystroke soup.

/// Escape-sequence parser state, kept across `feed` calls because
/// sequences can straddle packet boundaries.
#[derive(Debug, Clone, PartialEq)]
enum EscapeState {
    None,
    /// Saw ESC, waiting for the introducer.
    Escape,
    /// Inside a CSI sequence, accumulating parameter bytes.
    Csi(Vec<u8>),
}

/// Line editor state for one interactive sub-channel.
#[derive(Debug)]
pub struct CommandBuffer {
    line: Vec<u8>,
    cursor: usize,
    escape: EscapeState,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            cursor: 0,
            escape: EscapeState::None,
        }
    }

    /// Feeds attacker-to-backend bytes and returns any command lines
    /// completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut completed = Vec::new();
        for &byte in bytes {
            match std::mem::replace(&mut self.escape, EscapeState::None) {
                EscapeState::None => self.feed_plain(byte, &mut completed),
                EscapeState::Escape => {
                    if byte == b'[' {
                        self.escape = EscapeState::Csi(Vec::new());
                    }
                    // Anything else ends the sequence; lone ESC chords
                    // (alt-keys) are not line editing, drop them.
                }
                EscapeState::Csi(mut params) => {
                    // Final bytes of a CSI sequence are 0x40..=0x7e.
                    if (0x40..=0x7e).contains(&byte) {
                        self.apply_csi(&params, byte);
                    } else {
                        params.push(byte);
                        self.escape = EscapeState::Csi(params);
                    }
                }
            }
        }
        completed
    }

    fn feed_plain(&mut self, byte: u8, completed: &mut Vec<String>) {
        match byte {
            b'\r' | b'\n' => {
                let line = self.take_line();
                if !line.is_empty() {
                    completed.push(line);
                }
            }
            // Interrupt: record what was typed so far, flagged as aborted.
            0x03 => {
                let line = self.take_line();
                if !line.is_empty() {
                    completed.push(format!("{}^C", line));
                }
            }
            0x7f | 0x08 => {
                if self.cursor > 0 {
                    self.cursor -= 1;
                    self.line.remove(self.cursor);
                }
            }
            // Tab completion happens on the backend; the completed text
            // comes back as echo, not as input, so the tab itself is noise.
            b'\t' => {}
            0x1b => self.escape = EscapeState::Escape,
            b if (0x20..0x7f).contains(&b) => {
                self.line.insert(self.cursor, b);
                self.cursor += 1;
            }
            // High bytes: keep them, UTF-8 input arrives this way.
            b if b >= 0x80 => {
                self.line.insert(self.cursor, b);
                self.cursor += 1;
            }
            // Remaining control bytes are not line editing.
            _ => {}
        }
    }

    fn apply_csi(&mut self, params: &[u8], final_byte: u8) {
        match final_byte {
            // Cursor right / left.
            b'C' => self.cursor = std::cmp::min(self.cursor + 1, self.line.len()),
            b'D' => self.cursor = self.cursor.saturating_sub(1),
            b'H' => self.cursor = 0,
            b'F' => self.cursor = self.line.len(),
            // ESC [ 3 ~ is forward delete.
            b'~' if params == b"3" => {
                if self.cursor < self.line.len() {
                    self.line.remove(self.cursor);
                }
            }
            b'~' if params == b"1" => self.cursor = 0,
            b'~' if params == b"4" => self.cursor = self.line.len(),
            // Up/down recall backend-side history we cannot see; the
            // recalled command surfaces in the echo stream instead.
            _ => {}
        }
    }

    fn take_line(&mut self) -> String {
        let line = std::mem::take(&mut self.line);
        self.cursor = 0;
        String::from_utf8_lossy(&line).into_owned()
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_on_enter() {
        let mut buf = CommandBuffer::new();
        assert!(buf.feed(b"ls -la").is_empty());
        assert_eq!(buf.feed(b"\r"), vec!["ls -la".to_string()]);
    }

    #[test]
    fn backspace_edits_the_line() {
        let mut buf = CommandBuffer::new();
        buf.feed(b"cat /etc/passwdd");
        buf.feed(&[0x7f]);
        assert_eq!(buf.feed(b"\r"), vec!["cat /etc/passwd".to_string()]);
    }

    #[test]
    fn arrow_left_inserts_mid_line() {
        let mut buf = CommandBuffer::new();
        buf.feed(b"ecko hi");
        // Left four times, delete the 'k', type 'h'.
        buf.feed(b"\x1b[D\x1b[D\x1b[D\x1b[D");
        buf.feed(&[0x7f]);
        buf.feed(b"h");
        assert_eq!(buf.feed(b"\n"), vec!["echo hi".to_string()]);
    }

    #[test]
    fn interrupt_flags_the_aborted_line() {
        let mut buf = CommandBuffer::new();
        buf.feed(b"rm -rf /");
        assert_eq!(buf.feed(&[0x03]), vec!["rm -rf /^C".to_string()]);
        // The buffer is clean afterwards.
        assert_eq!(buf.feed(b"id\r"), vec!["id".to_string()]);
    }

    #[test]
    fn escape_sequence_split_across_packets() {
        let mut buf = CommandBuffer::new();
        buf.feed(b"ab");
        buf.feed(&[0x1b]);
        buf.feed(b"[");
        buf.feed(b"D");
        buf.feed(b"x");
        assert_eq!(buf.feed(b"\r"), vec!["axb".to_string()]);
    }

    #[test]
    fn home_end_and_delete() {
        let mut buf = CommandBuffer::new();
        buf.feed(b"xwhoami");
        buf.feed(b"\x1b[H");
        buf.feed(b"\x1b[3~");
        buf.feed(b"\x1b[F");
        assert_eq!(buf.feed(b"\r"), vec!["whoami".to_string()]);
    }

    #[test]
    fn empty_lines_produce_no_commands() {
        let mut buf = CommandBuffer::new();
        assert!(buf.feed(b"\r\n\r").is_empty());
        assert!(buf.feed(&[0x03]).is_empty());
    }

    #[test]
    fn utf8_input_survives() {
        let mut buf = CommandBuffer::new();
        buf.feed("echo héllo".as_bytes());
        assert_eq!(buf.feed(b"\r"), vec!["echo héllo".to_string()]);
    }
}
