//! Cached view of device memory, plus breakpoint bookkeeping.
//!
//! The manager never talks to the wire directly: it compares snapshot
//! checksums against its cache, schedules block requests, and lets the
//! 100 ms tick flush them through the protocol engine. Outstanding
//! requests are deduplicated per `(kind, cog, block)` and bounded by
//! `MAX_PENDING_REQUESTS`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::classify::COG_COUNT;
use crate::protocol::{
    Command, ProtocolEngine, Request, Response, Snapshot, COG_BLOCKS, HUB_BLOCKS, HUB_BLOCK_BYTES,
    LUT_BLOCKS,
};

pub const MAX_PENDING_REQUESTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    Cog,
    Lut,
    Hub,
}

type BlockKey = (MemKind, u8, u16);

/// One tracked memory block.
#[derive(Debug, Clone, Default)]
pub struct BlockState {
    pub checksum: u8,
    pub dirty: bool,
    pub last_access_us: u64,
    pub hit_count: u32,
    pub data: Option<Vec<u32>>,
}

/// Per-COG cached state.
#[derive(Debug, Clone)]
pub struct CogState {
    pub active: bool,
    pub program_counter: u32,
    pub cog_blocks: Vec<BlockState>,
    pub lut_blocks: Vec<BlockState>,
    pub breakpoints: HashSet<u32>,
}

impl Default for CogState {
    fn default() -> Self {
        Self {
            active: false,
            program_counter: 0,
            cog_blocks: vec![BlockState::default(); COG_BLOCKS],
            lut_blocks: vec![BlockState::default(); LUT_BLOCKS],
            breakpoints: HashSet::new(),
        }
    }
}

/// 8-bit wrapping sum over the little-endian bytes of a block.
pub fn block_checksum(words: &[u32]) -> u8 {
    let mut sum = 0u8;
    for word in words {
        for byte in word.to_le_bytes() {
            sum = sum.wrapping_add(byte);
        }
    }
    sum
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

pub struct DataManager {
    cogs: Vec<CogState>,
    hub_blocks: Vec<BlockState>,
    scheduled: VecDeque<BlockKey>,
    /// Keys that are scheduled or in flight; the dedupe set.
    queued: HashSet<BlockKey>,
    in_flight: HashMap<u16, BlockKey>,
    request_break: u8,
}

impl DataManager {
    pub fn new() -> Self {
        Self {
            cogs: (0..COG_COUNT).map(|_| CogState::default()).collect(),
            hub_blocks: vec![BlockState::default(); HUB_BLOCKS],
            scheduled: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashMap::new(),
            request_break: 0,
        }
    }

    pub fn cog(&self, cog: u8) -> Option<&CogState> {
        self.cogs.get(cog as usize)
    }

    pub fn hub_block(&self, index: usize) -> Option<&BlockState> {
        self.hub_blocks.get(index)
    }

    pub fn request_break_mask(&self) -> u8 {
        self.request_break
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn schedule(&mut self, key: BlockKey) {
        if self.queued.insert(key) {
            self.scheduled.push_back(key);
        }
    }

    /// Fold one snapshot into the cache: refresh COG status, mark blocks
    /// whose checksum changed dirty and queue them for refetch.
    pub fn on_snapshot(&mut self, snap: &Snapshot) {
        let cog = snap.frame.cog;
        let now = now_micros();
        {
            let state = &mut self.cogs[cog as usize];
            state.active = true;
            state.program_counter = snap.frame.program_counter;
        }
        for (i, &sum) in snap.cog_checksums.iter().enumerate() {
            let stale = {
                let block = &mut self.cogs[cog as usize].cog_blocks[i];
                let stale = block.data.is_none() || block.checksum != sum;
                if stale {
                    block.dirty = true;
                    block.last_access_us = now;
                }
                stale
            };
            if stale {
                self.schedule((MemKind::Cog, cog, i as u16));
            }
        }
        for (i, &sum) in snap.lut_checksums.iter().enumerate() {
            let stale = {
                let block = &mut self.cogs[cog as usize].lut_blocks[i];
                let stale = block.data.is_none() || block.checksum != sum;
                if stale {
                    block.dirty = true;
                    block.last_access_us = now;
                }
                stale
            };
            if stale {
                self.schedule((MemKind::Lut, cog, i as u16));
            }
        }
        for (i, &sum) in snap.hub_checksums.iter().enumerate() {
            let stale = {
                let block = &mut self.hub_blocks[i];
                let stale = block.data.is_none() || block.checksum != sum;
                if stale {
                    block.dirty = true;
                    block.last_access_us = now;
                }
                stale
            };
            if stale {
                self.schedule((MemKind::Hub, 0, i as u16));
            }
        }
    }

    fn block_mut(&mut self, key: BlockKey) -> Option<&mut BlockState> {
        match key {
            (MemKind::Cog, cog, idx) => self
                .cogs
                .get_mut(cog as usize)?
                .cog_blocks
                .get_mut(idx as usize),
            (MemKind::Lut, cog, idx) => self
                .cogs
                .get_mut(cog as usize)?
                .lut_blocks
                .get_mut(idx as usize),
            (MemKind::Hub, _, idx) => self.hub_blocks.get_mut(idx as usize),
        }
    }

    /// Install a DATA response for a block we asked for.
    pub fn on_block_data(&mut self, response: &Response) {
        let Some(key) = self.in_flight.remove(&response.sequence) else {
            return;
        };
        self.queued.remove(&key);
        let now = now_micros();
        let Some(block) = self.block_mut(key) else {
            return;
        };
        block.checksum = block_checksum(&response.words);
        block.data = Some(response.words.clone());
        block.dirty = false;
        block.hit_count += 1;
        block.last_access_us = now;
    }

    /// A request expired; the block stays dirty and goes back in line.
    pub fn on_request_timeout(&mut self, request: &Request) {
        let Some(key) = self.in_flight.remove(&request.sequence) else {
            return;
        };
        self.queued.remove(&key);
        self.schedule(key);
    }

    /// The 100 ms tick: flush scheduled requests through the engine and
    /// decay hit counts geometrically for the heat map.
    pub fn tick(&mut self, engine: &mut ProtocolEngine) {
        while self.in_flight.len() < MAX_PENDING_REQUESTS {
            let Some(key) = self.scheduled.pop_front() else {
                break;
            };
            let sequence = match key {
                (MemKind::Cog, cog, idx) => engine.request_cog_block(cog, idx),
                (MemKind::Lut, cog, idx) => engine.request_lut_block(cog, idx),
                (MemKind::Hub, _, idx) => engine
                    .request_hub_memory(idx as u32 * HUB_BLOCK_BYTES as u32, HUB_BLOCK_BYTES as u32),
            };
            self.in_flight.insert(sequence, key);
        }
        for cog in &mut self.cogs {
            for block in cog.cog_blocks.iter_mut().chain(cog.lut_blocks.iter_mut()) {
                block.hit_count -= block.hit_count / 8;
            }
        }
        for block in &mut self.hub_blocks {
            block.hit_count -= block.hit_count / 8;
        }
    }

    pub fn set_breakpoint(&mut self, cog: u8, address: u32) {
        if let Some(state) = self.cogs.get_mut(cog as usize) {
            state.breakpoints.insert(address);
            self.recompute_break_mask();
        }
    }

    pub fn clear_breakpoint(&mut self, cog: u8, address: u32) {
        if let Some(state) = self.cogs.get_mut(cog as usize) {
            state.breakpoints.remove(&address);
            self.recompute_break_mask();
        }
    }

    pub fn clear_all_breakpoints(&mut self, cog: u8) {
        if let Some(state) = self.cogs.get_mut(cog as usize) {
            state.breakpoints.clear();
            self.recompute_break_mask();
        }
    }

    pub fn is_at_breakpoint(&self, cog: u8) -> bool {
        self.cogs
            .get(cog as usize)
            .map(|s| s.breakpoints.contains(&s.program_counter))
            .unwrap_or(false)
    }

    fn recompute_break_mask(&mut self) {
        let mut mask = 0u8;
        for (i, state) in self.cogs.iter().enumerate() {
            if !state.breakpoints.is_empty() {
                mask |= 1 << i;
            }
        }
        self.request_break = mask;
    }

    /// Communication lost: every COG is demoted to inactive.
    pub fn set_all_inactive(&mut self) {
        for cog in &mut self.cogs {
            cog.active = false;
        }
    }

    pub fn command_kind(command: Command) -> Option<MemKind> {
        match command {
            Command::ReadCogBlock => Some(MemKind::Cog),
            Command::ReadLutBlock => Some(MemKind::Lut),
            Command::ReadHubMemory => Some(MemKind::Hub),
            _ => None,
        }
    }
}

impl Default for DataManager {
    fn default() -> Self {
        Self::new()
    }
}
