//! Serial line editor with history
//!
//! Byte-at-a-time state machine between the UART and the shell. In
//! interactive mode it echoes, supports cursor movement and recalls history
//! with the arrow keys; in non-interactive mode bytes accumulate silently and
//! only CR matters. Output never goes to the wire directly; each fed byte
//! appends its echo into a caller-supplied buffer so the owner of the UART
//! handle decides when to flush.

/// Command buffer size; one byte is reserved so history entries stay
/// distinguishable from a full line
pub const LINE_SIZE: usize = 64;

/// Entries kept in the history ring
pub const HISTORY_SIZE: usize = 8;

const KEY_UP: u8 = 0x41;
const KEY_DOWN: u8 = 0x42;
const KEY_RIGHT: u8 = 0x43;
const KEY_LEFT: u8 = 0x44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditState
{
    Normal,
    /// ESC seen
    Escape,
    /// ESC `[` seen
    Csi,
}

pub struct LineEditor
{
    buf: [u8; LINE_SIZE],
    len: usize,
    cursor: usize,
    state: EditState,
    echo: bool,
    history: Vec<Vec<u8>>,
    hist_pos: usize,
}

impl LineEditor
{
    pub fn new() -> Self
    {
        Self {
            buf: [0; LINE_SIZE],
            len: 0,
            cursor: 0,
            state: EditState::Normal,
            echo: false,
            history: Vec::new(),
            hist_pos: 0,
        }
    }

    /// Start a fresh line; prints the prompt when echoing
    pub fn reset(&mut self, echo: bool, out: &mut Vec<u8>)
    {
        self.echo = echo;
        if echo {
            out.extend_from_slice(b"<GPIB> ");
        }
        self.len = 0;
        self.cursor = 0;
        self.hist_pos = self.history.len();
        self.state = EditState::Normal;
    }

    /// The line as collected so far (valid when `feed` returned a command)
    pub fn line(&self) -> &[u8]
    {
        &self.buf[..self.len]
    }

    pub fn history(&self) -> &[Vec<u8>]
    {
        &self.history
    }

    /// Process one byte; echo lands in `out`
    ///
    /// Returns `0` while the line is still being edited, the uppercased
    /// command letter when a line completed, or `13` for an empty line.
    /// After a nonzero return the caller runs the command and then calls
    /// [`LineEditor::reset`].
    pub fn feed(&mut self, c: u8, out: &mut Vec<u8>) -> u8
    {
        match self.state {
            EditState::Escape => {
                self.state = if c == 0x5b { EditState::Csi } else { EditState::Normal };
                return 0;
            }
            EditState::Csi => {
                self.csi(c, out);
                self.state = EditState::Normal;
                return 0;
            }
            EditState::Normal => {}
        }

        let mut cmd = 0u8;
        match c {
            0x7f | 0x08 => {
                if self.echo && self.cursor > 0 {
                    self.len -= 1;
                    self.cursor -= 1;
                    self.buf.copy_within(self.cursor + 1..self.len + 1, self.cursor);
                    out.push(0x08);
                    out.extend_from_slice(&self.buf[self.cursor..self.len]);
                    out.push(b' ');
                    for _ in self.cursor..self.len + 1 {
                        out.push(0x08);
                    }
                }
            }
            27 => {
                if self.echo {
                    self.state = EditState::Escape;
                }
            }
            10 => {}
            13 => {
                if self.echo {
                    out.push(13);
                    out.push(10);
                }
                if self.len > 0 {
                    cmd = self.buf[0].to_ascii_uppercase();
                    if self.echo && cmd != b'H' {
                        self.remember();
                    }
                }
                else {
                    cmd = 13;
                }
            }
            0 => {}
            _ => {
                if self.len < LINE_SIZE - 1 {
                    self.buf.copy_within(self.cursor..self.len, self.cursor + 1);
                    self.buf[self.cursor] = c;
                    self.cursor += 1;
                    self.len += 1;
                    if self.echo {
                        out.push(c);
                        out.extend_from_slice(&self.buf[self.cursor..self.len]);
                        for _ in self.cursor..self.len {
                            out.push(0x08);
                        }
                    }
                }
            }
        }

        cmd
    }

    fn csi(&mut self, c: u8, out: &mut Vec<u8>)
    {
        match c {
            KEY_UP | KEY_DOWN => {
                let recalled: Vec<u8>;
                if c == KEY_UP {
                    if self.hist_pos == 0 {
                        return;
                    }
                    self.hist_pos -= 1;
                    recalled = self.history[self.hist_pos].clone();
                }
                else if !self.history.is_empty() && self.hist_pos == self.history.len() - 1 {
                    self.hist_pos += 1;
                    recalled = Vec::new();
                }
                else if self.hist_pos + 1 >= self.history.len() {
                    // below the newest entry, down-arrow clears the line
                    recalled = Vec::new();
                }
                else {
                    self.hist_pos += 1;
                    recalled = self.history[self.hist_pos].clone();
                }

                while self.cursor < self.len {
                    out.push(b' ');
                    self.cursor += 1;
                }
                for _ in 0..self.len {
                    out.push(0x08);
                    out.push(b' ');
                    out.push(0x08);
                }
                out.extend_from_slice(&recalled);
                self.buf[..recalled.len()].copy_from_slice(&recalled);
                self.len = recalled.len();
                self.cursor = recalled.len();
            }
            KEY_LEFT => {
                if self.cursor > 0 {
                    self.cursor -= 1;
                    out.extend_from_slice(&[0x1b, 0x5b, b'D']);
                }
            }
            KEY_RIGHT => {
                if self.cursor < self.len {
                    self.cursor += 1;
                    out.extend_from_slice(&[0x1b, 0x5b, b'C']);
                }
            }
            _ => {}
        }
    }

    fn remember(&mut self)
    {
        let line = self.buf[..self.len].to_vec();
        if self.history.last().map(|h| h == &line).unwrap_or(false) {
            return; // adjacent duplicate
        }
        if self.history.len() == HISTORY_SIZE {
            self.history.remove(0);
        }
        self.history.push(line);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn feed_line(ed: &mut LineEditor, text: &str) -> (u8, Vec<u8>)
    {
        let mut out = Vec::new();
        let mut cmd = 0;
        for &b in text.as_bytes() {
            cmd = ed.feed(b, &mut out);
        }
        (cmd, out)
    }

    fn interactive() -> LineEditor
    {
        let mut ed = LineEditor::new();
        let mut out = Vec::new();
        ed.reset(true, &mut out);
        ed
    }

    #[test]
    fn reset_emits_prompt_when_echoing()
    {
        let mut ed = LineEditor::new();
        let mut out = Vec::new();
        ed.reset(true, &mut out);
        assert_eq!(out, b"<GPIB> ");

        out.clear();
        ed.reset(false, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn command_letter_is_uppercased()
    {
        let mut ed = interactive();
        let (cmd, _) = feed_line(&mut ed, "ox1\r");
        assert_eq!(cmd, b'O');
        assert_eq!(ed.line(), b"ox1");
    }

    #[test]
    fn empty_line_returns_cr()
    {
        let mut ed = interactive();
        let (cmd, _) = feed_line(&mut ed, "\r");
        assert_eq!(cmd, 13);
    }

    #[test]
    fn echo_repeats_typed_bytes()
    {
        let mut ed = interactive();
        let (_, out) = feed_line(&mut ed, "S");
        assert_eq!(out, b"S");
    }

    #[test]
    fn no_echo_in_noninteractive_mode()
    {
        let mut ed = LineEditor::new();
        let mut out = Vec::new();
        ed.reset(false, &mut out);
        let (cmd, out) = feed_line(&mut ed, "D?\r");
        assert_eq!(cmd, b'D');
        assert!(out.is_empty());
    }

    #[test]
    fn backspace_removes_before_cursor()
    {
        let mut ed = interactive();
        let (cmd, _) = feed_line(&mut ed, "SX\x08\r");
        assert_eq!(cmd, b'S');
        assert_eq!(ed.line(), b"S");
    }

    #[test]
    fn backspace_ignored_without_echo()
    {
        let mut ed = LineEditor::new();
        let mut out = Vec::new();
        ed.reset(false, &mut out);
        let (_, _) = feed_line(&mut ed, "SX\x08\r");
        assert_eq!(ed.line(), b"SX");
    }

    #[test]
    fn left_arrow_then_insert_edits_in_place()
    {
        let mut ed = interactive();
        // type "C1", move left, insert "0" -> "C01"
        let (cmd, _) = feed_line(&mut ed, "C1\x1b[D0\r");
        assert_eq!(cmd, b'C');
        assert_eq!(ed.line(), b"C01");
    }

    #[test]
    fn history_skips_adjacent_duplicates()
    {
        let mut ed = interactive();
        let mut out = Vec::new();
        for _ in 0..2 {
            feed_line(&mut ed, "S\r");
            ed.reset(true, &mut out);
        }
        feed_line(&mut ed, "R\r");
        ed.reset(true, &mut out);
        assert_eq!(ed.history(), &[b"S".to_vec(), b"R".to_vec()]);
    }

    #[test]
    fn history_evicts_oldest_at_capacity()
    {
        let mut ed = interactive();
        let mut out = Vec::new();
        for i in 0..HISTORY_SIZE + 2 {
            feed_line(&mut ed, &format!("C{}\r", i));
            ed.reset(true, &mut out);
        }
        assert_eq!(ed.history().len(), HISTORY_SIZE);
        assert_eq!(ed.history()[0], b"C2".to_vec());
    }

    #[test]
    fn history_excludes_h_and_noninteractive_lines()
    {
        let mut ed = interactive();
        let mut out = Vec::new();
        feed_line(&mut ed, "H\r");
        ed.reset(true, &mut out);
        assert!(ed.history().is_empty());

        ed.reset(false, &mut out);
        feed_line(&mut ed, "S\r");
        ed.reset(true, &mut out);
        assert!(ed.history().is_empty());
    }

    #[test]
    fn up_arrow_recalls_previous_command()
    {
        let mut ed = interactive();
        let mut out = Vec::new();
        feed_line(&mut ed, "OX1\r");
        ed.reset(true, &mut out);

        let (cmd, _) = feed_line(&mut ed, "\x1b[A\r");
        assert_eq!(cmd, b'O');
        assert_eq!(ed.line(), b"OX1");
    }

    #[test]
    fn down_arrow_below_newest_clears_line()
    {
        let mut ed = interactive();
        let mut out = Vec::new();
        feed_line(&mut ed, "S\r");
        ed.reset(true, &mut out);

        feed_line(&mut ed, "\x1b[A"); // recall "S"
        let (cmd, _) = feed_line(&mut ed, "\x1b[B\r"); // and clear it
        assert_eq!(cmd, 13);
        assert_eq!(ed.line(), b"");
    }

    #[test]
    fn line_capacity_is_bounded()
    {
        let mut ed = interactive();
        let long: String = "C".repeat(LINE_SIZE + 10);
        let (cmd, _) = feed_line(&mut ed, &format!("{}\r", long));
        assert_eq!(cmd, b'C');
        assert_eq!(ed.line().len(), LINE_SIZE - 1);
    }
}
