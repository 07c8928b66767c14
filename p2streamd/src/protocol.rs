//! The bidirectional debugger wire protocol.
//!
//! All multi-byte fields are little-endian. Outgoing requests are exactly
//! 16 bytes and bypass the message pool: they are written straight to the
//! USB TX path. Incoming records arrive through the router as `DbPacket`
//! and `DebuggerFrame` messages.
//!
//! Wire layouts committed to here:
//! - request: `u32 command, u32 sequence, u32 cog_id, u32 param`;
//! - DB record: marker-first header `0xDB, type, len_hi, len_lo` (the u32
//!   value `0xDBtt_llll`), then `len` payload bytes; payload words are
//!   `u32 sequence, u32 cog_id[, u32 address, data words…]`;
//! - initial frame: 20 LE u32 words, word 0 the COG number, word 5 the
//!   program counter; the remaining words are device-defined and kept raw;
//! - snapshot frame: 416 bytes = the 80-byte initial frame, then 64 COG,
//!   64 LUT and 124 HUB per-block checksums (one byte each), then
//!   84 reserved bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::classify::{SnapshotGate, COG_COUNT, DB_HEADER_BYTE, DEBUGGER_FRAME_LEN};
use crate::events::{EventBus, PipelineEvent};
use crate::metrics::Metrics;

pub const REQUEST_LEN: usize = 16;
pub const INITIAL_FRAME_LEN: usize = 80;
pub const INITIAL_FRAME_WORDS: usize = 20;
/// COG program counters address a 512 KiB space.
pub const PC_LIMIT: u32 = 1 << 19;

pub const COG_BLOCKS: usize = 64;
pub const LUT_BLOCKS: usize = 64;
pub const HUB_BLOCKS: usize = 124;
/// Words per COG/LUT memory block.
pub const BLOCK_WORDS: usize = 16;
/// Bytes per HUB memory block.
pub const HUB_BLOCK_BYTES: usize = 4096;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_COMM_TIMEOUT: Duration = Duration::from_secs(5);

/// Outgoing command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Stall = 1,
    Break = 2,
    Go = 3,
    ReadCogBlock = 4,
    ReadLutBlock = 5,
    ReadHubMemory = 6,
}

impl Command {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Command::Stall),
            2 => Some(Command::Break),
            3 => Some(Command::Go),
            4 => Some(Command::ReadCogBlock),
            5 => Some(Command::ReadLutBlock),
            6 => Some(Command::ReadHubMemory),
            _ => None,
        }
    }

    /// A break halts the COG and the device answers with the fixed-size
    /// status snapshot. Block reads do not: their replies are ordinary DB
    /// DATA packets.
    fn elicits_snapshot(self) -> bool {
        matches!(self, Command::Break)
    }
}

/// Incoming message type, the middle byte of the DB header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseKind {
    Data = 1,
    Ack = 2,
    Nak = 3,
}

impl ResponseKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ResponseKind::Data),
            2 => Some(ResponseKind::Ack),
            3 => Some(ResponseKind::Nak),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub sequence: u16,
    pub cog_id: u8,
    pub param: u32,
}

/// Serialise a request into its fixed 16-byte wire form.
pub fn build_request(req: &Request) -> [u8; REQUEST_LEN] {
    let mut out = [0u8; REQUEST_LEN];
    out[0..4].copy_from_slice(&(req.command as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(req.sequence as u32).to_le_bytes());
    out[8..12].copy_from_slice(&(req.cog_id as u32).to_le_bytes());
    out[12..16].copy_from_slice(&req.param.to_le_bytes());
    out
}

pub fn parse_request(bytes: &[u8]) -> Option<Request> {
    if bytes.len() != REQUEST_LEN {
        return None;
    }
    let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    Some(Request {
        command: Command::from_u32(word(0))?,
        sequence: word(1) as u16,
        cog_id: word(2) as u8,
        param: word(3),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub kind: ResponseKind,
    pub sequence: u16,
    pub cog_id: u8,
    pub address: Option<u32>,
    pub words: Vec<u32>,
}

/// Decode a DB record as delivered by the router (header included).
pub fn parse_response(packet: &[u8]) -> Option<Response> {
    if packet.len() < 4 || packet[0] != DB_HEADER_BYTE {
        return None;
    }
    let kind = ResponseKind::from_u8(packet[1])?;
    let len = crate::classify::db_payload_len(packet) as usize;
    let payload = packet.get(4..4 + len)?;
    if payload.len() < 8 {
        return None;
    }
    let word = |i: usize| u32::from_le_bytes(payload[i * 4..i * 4 + 4].try_into().unwrap());
    let sequence = word(0) as u16;
    let cog_id = word(1) as u8;
    let (address, data_start) = match kind {
        ResponseKind::Data if payload.len() >= 12 => (Some(word(2)), 3),
        ResponseKind::Data => return None,
        _ => (None, 2),
    };
    let words = (data_start..payload.len() / 4).map(word).collect();
    Some(Response {
        kind,
        sequence,
        cog_id,
        address,
        words,
    })
}

/// The 20-word frame the device emits when a COG reaches a break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialFrame {
    pub cog: u8,
    pub program_counter: u32,
    /// All twenty words, raw; the layout beyond words 0 and 5 is
    /// device-defined.
    pub words: [u32; INITIAL_FRAME_WORDS],
}

impl InitialFrame {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < INITIAL_FRAME_LEN {
            return None;
        }
        let mut words = [0u32; INITIAL_FRAME_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        let cog = words[0];
        let pc = words[5];
        if cog >= COG_COUNT as u32 || pc >= PC_LIMIT {
            return None;
        }
        Some(Self {
            cog: cog as u8,
            program_counter: pc,
            words,
        })
    }
}

/// The fixed 416-byte snapshot: status frame plus per-block checksums.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub frame: InitialFrame,
    pub cog_checksums: [u8; COG_BLOCKS],
    pub lut_checksums: [u8; LUT_BLOCKS],
    pub hub_checksums: [u8; HUB_BLOCKS],
}

impl Snapshot {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != DEBUGGER_FRAME_LEN {
            return None;
        }
        let frame = InitialFrame::parse(&bytes[..INITIAL_FRAME_LEN])?;
        let mut cog_checksums = [0u8; COG_BLOCKS];
        let mut lut_checksums = [0u8; LUT_BLOCKS];
        let mut hub_checksums = [0u8; HUB_BLOCKS];
        let mut off = INITIAL_FRAME_LEN;
        cog_checksums.copy_from_slice(&bytes[off..off + COG_BLOCKS]);
        off += COG_BLOCKS;
        lut_checksums.copy_from_slice(&bytes[off..off + LUT_BLOCKS]);
        off += LUT_BLOCKS;
        hub_checksums.copy_from_slice(&bytes[off..off + HUB_BLOCKS]);
        Some(Self {
            frame,
            cog_checksums,
            lut_checksums,
            hub_checksums,
        })
    }
}

/// Tracks when bytes last arrived from the device. Shared with the
/// ingest path, which touches it on every accepted chunk.
pub struct ActivityTracker {
    start: Instant,
    last_micros: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last_micros: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_micros
            .store(self.start.elapsed().as_micros() as u64, Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_micros.load(Ordering::Acquire);
        self.start
            .elapsed()
            .saturating_sub(Duration::from_micros(last))
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct Pending {
    request: Request,
    sent_at: Instant,
}

/// What a timeout sweep found.
#[derive(Debug, Default)]
pub struct TimeoutReport {
    pub expired: Vec<Request>,
    pub communication_lost: bool,
}

/// Per-request terminal outcome handed back to the caller of
/// [`ProtocolEngine::on_db_packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Acked(Response),
    Naked(Response),
    Data(Response),
}

pub struct ProtocolEngine {
    sequence: u16,
    pending: HashMap<u16, Pending>,
    tx: mpsc::UnboundedSender<Bytes>,
    gate: SnapshotGate,
    activity: Arc<ActivityTracker>,
    metrics: Arc<Metrics>,
    events: EventBus,
    request_timeout: Duration,
    comm_timeout: Duration,
    comm_lost: bool,
}

impl ProtocolEngine {
    pub fn new(
        tx: mpsc::UnboundedSender<Bytes>,
        gate: SnapshotGate,
        activity: Arc<ActivityTracker>,
        metrics: Arc<Metrics>,
        events: EventBus,
    ) -> Self {
        Self {
            sequence: 0,
            pending: HashMap::new(),
            tx,
            gate,
            activity,
            metrics,
            events,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            comm_timeout: DEFAULT_COMM_TIMEOUT,
            comm_lost: false,
        }
    }

    #[cfg(test)]
    fn with_timeouts(mut self, request: Duration, comm: Duration) -> Self {
        self.request_timeout = request;
        self.comm_timeout = comm;
        self
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Build, track and transmit one request. Returns its sequence.
    pub fn send_request(&mut self, command: Command, cog_id: u8, param: u32) -> u16 {
        let sequence = self.next_sequence();
        let request = Request {
            command,
            sequence,
            cog_id,
            param,
        };
        let wire = build_request(&request);
        if command.elicits_snapshot() {
            // Tell the extractor the 416-byte status frame is legal next.
            self.gate.arm();
        }
        self.pending.insert(
            sequence,
            Pending {
                request,
                sent_at: Instant::now(),
            },
        );
        if self.tx.send(Bytes::copy_from_slice(&wire)).is_err() {
            log::warn!("protocol TX channel closed; request {sequence} not sent");
        }
        sequence
    }

    pub fn send_stall(&mut self, cog_id: u8) -> u16 {
        self.send_request(Command::Stall, cog_id, 0)
    }

    pub fn send_break(&mut self, cog_id: u8) -> u16 {
        self.send_request(Command::Break, cog_id, 0)
    }

    pub fn send_go(&mut self, cog_id: u8) -> u16 {
        self.send_request(Command::Go, cog_id, 0)
    }

    pub fn request_cog_block(&mut self, cog_id: u8, index: u16) -> u16 {
        self.send_request(Command::ReadCogBlock, cog_id, index as u32)
    }

    pub fn request_lut_block(&mut self, cog_id: u8, index: u16) -> u16 {
        self.send_request(Command::ReadLutBlock, cog_id, index as u32)
    }

    pub fn request_hub_memory(&mut self, address: u32, _size: u32) -> u16 {
        self.send_request(Command::ReadHubMemory, 0, address)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Handle one incoming DB record. Unsolicited or repeated sequences
    /// are dropped so each request sees at most one terminal outcome.
    pub fn on_db_packet(&mut self, packet: &[u8]) -> Option<(Request, Outcome)> {
        let response = match parse_response(packet) {
            Some(r) => r,
            None => {
                self.metrics.inc_framing_error();
                return None;
            }
        };
        self.comm_lost = false;
        let pending = match self.pending.remove(&response.sequence) {
            Some(p) => p,
            None => {
                log::debug!(
                    "unmatched response sequence {} ({:?})",
                    response.sequence,
                    response.kind
                );
                return None;
            }
        };
        let outcome = match response.kind {
            ResponseKind::Ack => Outcome::Acked(response),
            ResponseKind::Nak => Outcome::Naked(response),
            ResponseKind::Data => Outcome::Data(response),
        };
        Some((pending.request, outcome))
    }

    /// Handle one 416-byte snapshot frame.
    pub fn on_snapshot(&mut self, bytes: &[u8]) -> Option<Snapshot> {
        self.comm_lost = false;
        match Snapshot::parse(bytes) {
            Some(snap) => Some(snap),
            None => {
                self.metrics.inc_framing_error();
                None
            }
        }
    }

    /// Expire pending requests and check the communication watchdog.
    pub fn check_timeouts(&mut self) -> TimeoutReport {
        let now = Instant::now();
        let timeout = self.request_timeout;
        let sequences: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= timeout)
            .map(|(&seq, _)| seq)
            .collect();
        let mut expired = Vec::with_capacity(sequences.len());
        for sequence in sequences {
            if let Some(p) = self.pending.remove(&sequence) {
                expired.push(p.request);
            }
            self.metrics.inc_request_timeout();
            self.events.emit(PipelineEvent::RequestTimeout { sequence });
        }
        let mut communication_lost = false;
        if !self.comm_lost && self.activity.idle_for() >= self.comm_timeout {
            self.comm_lost = true;
            communication_lost = true;
            self.events.emit(PipelineEvent::CommunicationLost);
            log::warn!(
                "no bytes from the device for {:?}; marking all COGs inactive",
                self.comm_timeout
            );
        }
        TimeoutReport {
            expired,
            communication_lost,
        }
    }
}
