//! Byte-stream classification.
//!
//! The extractor feeds bytes from the ring into a small state machine that
//! cuts the stream into messages and tags each with a [`MessageKind`].
//! Text is treated as opaque bytes; classification never requires valid
//! UTF-8.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Header byte introducing a variable-length binary debugger record.
pub const DB_HEADER_BYTE: u8 = 0xDB;

/// Length of the fixed-size debugger snapshot frame.
pub const DEBUGGER_FRAME_LEN: usize = 416;

/// The exact line the device emits on reset.
pub const REBOOT_MARKER: &[u8] = b"Cog0 INIT $0000_0000 $0000_0000 load";

/// Number of execution cores on the device.
pub const COG_COUNT: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Variable-length binary record framed by a `0xDB` header.
    DbPacket,
    /// Fixed-length 416-byte snapshot.
    DebuggerFrame,
    /// The golden reboot marker line.
    SystemInit,
    /// An ASCII line beginning with `CogN ` (N in 0..7, case-insensitive).
    CogMessage { cog: u8 },
    /// An ASCII segment beginning with a backtick.
    WindowCommand,
    /// Default sink for everything else.
    TerminalOutput,
}

impl MessageKind {
    /// Stable wire code used by the pool's slot metadata.
    pub fn code(&self) -> u8 {
        match self {
            MessageKind::DbPacket => 0,
            MessageKind::DebuggerFrame => 1,
            MessageKind::SystemInit => 2,
            MessageKind::CogMessage { .. } => 3,
            MessageKind::WindowCommand => 4,
            MessageKind::TerminalOutput => 5,
        }
    }

    /// Rebuild a kind from its code plus the slot's COG byte (0xFF = none).
    pub fn from_parts(code: u8, cog: u8) -> Self {
        match code {
            0 => MessageKind::DbPacket,
            1 => MessageKind::DebuggerFrame,
            2 => MessageKind::SystemInit,
            3 => MessageKind::CogMessage {
                cog: if cog < COG_COUNT { cog } else { 0 },
            },
            4 => MessageKind::WindowCommand,
            _ => MessageKind::TerminalOutput,
        }
    }

    /// The COG this message belongs to, where applicable. The reboot
    /// marker is a COG-0 line, so it carries index 0.
    pub fn cog_index(&self) -> Option<u8> {
        match self {
            MessageKind::CogMessage { cog } => Some(*cog),
            MessageKind::SystemInit => Some(0),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MessageKind::DbPacket => "DbPacket",
            MessageKind::DebuggerFrame => "DebuggerFrame",
            MessageKind::SystemInit => "SystemInit",
            MessageKind::CogMessage { .. } => "CogMessage",
            MessageKind::WindowCommand => "WindowCommand",
            MessageKind::TerminalOutput => "TerminalOutput",
        }
    }
}

/// Gate for the fixed 416-byte snapshot frames.
///
/// The snapshot has no self-describing header, so frames are only
/// admissible while the protocol engine has announced one is coming: the
/// engine arms the gate when it sends a snapshot-eliciting request and the
/// classifier disarms it after collecting one frame. This is the
/// discriminator this pipeline commits to.
#[derive(Clone, Default)]
pub struct SnapshotGate {
    armed: Arc<AtomicBool>,
}

impl SnapshotGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    LineText,
    Backtick,
    BinDb,
    Bin416,
}

/// Outcome of feeding one byte.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Byte absorbed; the message is not complete yet.
    Incomplete,
    /// Byte absorbed and it completed a message.
    Complete(MessageKind),
    /// The current frame is invalid. The caller should rewind, discard
    /// exactly one byte and resume; the classifier has already reset.
    Reject,
}

pub struct Classifier {
    state: State,
    buf: Vec<u8>,
    /// Framing bound for DB payloads and text lines.
    max_payload: usize,
    gate: SnapshotGate,
}

impl Classifier {
    pub fn new(max_payload: usize, gate: SnapshotGate) -> Self {
        Self {
            state: State::Idle,
            buf: Vec::new(),
            max_payload,
            gate,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle && self.buf.is_empty()
    }

    /// Take the bytes of the message just completed.
    pub fn take_message(&mut self) -> Vec<u8> {
        self.state = State::Idle;
        std::mem::take(&mut self.buf)
    }

    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.buf.clear();
    }

    pub fn push(&mut self, byte: u8) -> Step {
        match self.state {
            State::Idle => self.start(byte),
            State::LineText => {
                self.buf.push(byte);
                if byte == b'\n' || self.buf.len() >= self.max_payload {
                    Step::Complete(classify_line(&self.buf))
                } else {
                    Step::Incomplete
                }
            }
            State::Backtick => {
                self.buf.push(byte);
                if byte == b'\n' || self.buf.len() >= self.max_payload {
                    Step::Complete(MessageKind::WindowCommand)
                } else {
                    Step::Incomplete
                }
            }
            State::BinDb => {
                self.buf.push(byte);
                if self.buf.len() == 4 {
                    let len = db_payload_len(&self.buf) as usize;
                    if len > self.max_payload.saturating_sub(4) {
                        self.reset();
                        return Step::Reject;
                    }
                    if len == 0 {
                        return Step::Complete(MessageKind::DbPacket);
                    }
                } else if self.buf.len() > 4 {
                    let total = 4 + db_payload_len(&self.buf) as usize;
                    if self.buf.len() == total {
                        return Step::Complete(MessageKind::DbPacket);
                    }
                }
                Step::Incomplete
            }
            State::Bin416 => {
                self.buf.push(byte);
                if self.buf.len() == DEBUGGER_FRAME_LEN {
                    self.gate.disarm();
                    Step::Complete(MessageKind::DebuggerFrame)
                } else {
                    Step::Incomplete
                }
            }
        }
    }

    fn start(&mut self, byte: u8) -> Step {
        // An armed gate wins over everything else: the snapshot's bytes
        // are arbitrary, whitespace values included, and the frame must
        // collect exactly 416 of them from its first byte.
        if self.gate.is_armed() {
            self.state = State::Bin416;
            self.buf.push(byte);
            return Step::Incomplete;
        }
        // Whitespace between messages is not part of any message.
        if is_ascii_whitespace(byte) {
            return Step::Incomplete;
        }
        match byte {
            DB_HEADER_BYTE => {
                self.state = State::BinDb;
                self.buf.push(byte);
                Step::Incomplete
            }
            b'`' => {
                self.state = State::Backtick;
                self.buf.push(byte);
                Step::Incomplete
            }
            _ => {
                self.state = State::LineText;
                self.buf.push(byte);
                Step::Incomplete
            }
        }
    }
}

fn is_ascii_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n')
}

/// Payload length from a DB frame header. The frame travels marker-first:
/// `0xDB`, message type, then the 16-bit length high byte before low, so
/// the whole header reads as the u32 `0xDBtt_llll`.
pub fn db_payload_len(header: &[u8]) -> u16 {
    ((header[2] as u16) << 8) | header[3] as u16
}

fn classify_line(line: &[u8]) -> MessageKind {
    if line.starts_with(REBOOT_MARKER) {
        return MessageKind::SystemInit;
    }
    if let Some(cog) = cog_prefix(line) {
        return MessageKind::CogMessage { cog };
    }
    MessageKind::TerminalOutput
}

/// Matches `Cog<N><whitespace>` case-insensitively, N in 0..7.
fn cog_prefix(line: &[u8]) -> Option<u8> {
    if line.len() < 5 {
        return None;
    }
    if !line[0].eq_ignore_ascii_case(&b'c')
        || !line[1].eq_ignore_ascii_case(&b'o')
        || !line[2].eq_ignore_ascii_case(&b'g')
    {
        return None;
    }
    let digit = line[3];
    if !(b'0'..=b'7').contains(&digit) {
        return None;
    }
    if !is_ascii_whitespace(line[4]) {
        return None;
    }
    Some(digit - b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(c: &mut Classifier, bytes: &[u8]) -> Vec<(MessageKind, Vec<u8>)> {
        let mut out = Vec::new();
        for &b in bytes {
            match c.push(b) {
                Step::Complete(kind) => out.push((kind, c.take_message())),
                Step::Incomplete => {}
                Step::Reject => panic!("unexpected reject"),
            }
        }
        out
    }

    fn classifier() -> Classifier {
        Classifier::new(65_536, SnapshotGate::new())
    }

    #[test]
    fn plain_text_line() {
        let mut c = classifier();
        let msgs = feed(&mut c, b"Hello\n");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, MessageKind::TerminalOutput);
        assert_eq!(msgs[0].1, b"Hello\n");
    }

    #[test]
    fn cog_line_carries_index() {
        let mut c = classifier();
        let msgs = feed(&mut c, b"Cog3 PC=1234\n");
        assert_eq!(msgs[0].0, MessageKind::CogMessage { cog: 3 });
        assert_eq!(msgs[0].1, b"Cog3 PC=1234\n");
    }

    #[test]
    fn cog_match_is_case_insensitive() {
        let mut c = classifier();
        let msgs = feed(&mut c, b"COG5 status\ncog8 nope\nCogX no\n");
        assert_eq!(msgs[0].0, MessageKind::CogMessage { cog: 5 });
        assert_eq!(msgs[1].0, MessageKind::TerminalOutput);
        assert_eq!(msgs[2].0, MessageKind::TerminalOutput);
    }

    #[test]
    fn reboot_marker_wins_over_cog_match() {
        let mut c = classifier();
        let msgs = feed(&mut c, b"Cog0 INIT $0000_0000 $0000_0000 load\n");
        assert_eq!(msgs[0].0, MessageKind::SystemInit);
        assert_eq!(msgs[0].0.cog_index(), Some(0));
    }

    #[test]
    fn window_command_keeps_backtick_and_newline() {
        let mut c = classifier();
        let msgs = feed(&mut c, b"`plot 1 2 3\n");
        assert_eq!(msgs[0].0, MessageKind::WindowCommand);
        assert_eq!(msgs[0].1, b"`plot 1 2 3\n");
    }

    #[test]
    fn db_packet_frame_length_from_header() {
        let mut c = classifier();
        let frame = [0xDB, 0x05, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00];
        let msgs = feed(&mut c, &frame);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, MessageKind::DbPacket);
        assert_eq!(msgs[0].1.len(), 8);
    }

    #[test]
    fn db_packet_with_empty_payload() {
        let mut c = classifier();
        let msgs = feed(&mut c, &[0xDB, 0x01, 0x00, 0x00]);
        assert_eq!(msgs[0].0, MessageKind::DbPacket);
        assert_eq!(msgs[0].1.len(), 4);
    }

    #[test]
    fn oversized_db_payload_is_rejected() {
        let mut c = Classifier::new(1024, SnapshotGate::new());
        assert_eq!(c.push(0xDB), Step::Incomplete);
        assert_eq!(c.push(0x01), Step::Incomplete);
        assert_eq!(c.push(0xFF), Step::Incomplete);
        assert_eq!(c.push(0xFF), Step::Reject);
        assert!(c.is_idle());
    }

    #[test]
    fn snapshot_gate_admits_exactly_one_frame() {
        let gate = SnapshotGate::new();
        let mut c = Classifier::new(65_536, gate.clone());
        gate.arm();
        // The frame's first byte is a whitespace value; it still belongs
        // to the frame, not to inter-message whitespace.
        let mut frame = vec![0xAAu8; DEBUGGER_FRAME_LEN];
        frame[0] = b' ';
        let msgs = feed(&mut c, &frame);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, MessageKind::DebuggerFrame);
        assert_eq!(msgs[0].1, frame);
        assert!(!gate.is_armed());
        // Without the gate the same bytes fall back to line text.
        let msgs = feed(&mut c, b"\xAA\n");
        assert_eq!(msgs[0].0, MessageKind::TerminalOutput);
    }

    #[test]
    fn idle_whitespace_is_skipped_between_messages() {
        let mut c = classifier();
        let msgs = feed(&mut c, b"  \r\nHello\n\t `w\n");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].1, b"Hello\n");
        assert_eq!(msgs[1].1, b"`w\n");
    }

    #[test]
    fn interleaved_text_and_binary() {
        let mut c = classifier();
        let mut input = Vec::new();
        input.extend_from_slice(b"Cog1 go\n");
        input.extend_from_slice(&[0xDB, 0x02, 0x00, 0x02, 0x11, 0x22]);
        input.extend_from_slice(b"tail\n");
        let msgs = feed(&mut c, &input);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].0, MessageKind::CogMessage { cog: 1 });
        assert_eq!(msgs[1].0, MessageKind::DbPacket);
        assert_eq!(msgs[2].0, MessageKind::TerminalOutput);
    }
}
