use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{AppError, Result};

/// Custom epoch in milliseconds (2010-11-04T01:42:54.657Z).
pub const EPOCH_MS: u64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const TIME_BITS: u32 = 41;

const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1 << TIME_BITS) - 1;

const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIME_SHIFT: u32 = SEQUENCE_BITS + NODE_BITS;

struct State {
    last_ms: u64,
    sequence: u16,
}

/// Time-ordered 64-bit id generator: 41 bits of milliseconds since
/// [`EPOCH_MS`], 10 bits of node, 12 bits of per-millisecond sequence.
///
/// One instance per process, shared by reference. Ids from one instance are
/// strictly increasing; when a millisecond's 4096 sequence values run out the
/// caller spins until the clock moves on. If the clock is behind the last
/// millisecond used, the generator moves to the next millisecond instead of
/// waiting for the clock to catch up.
pub struct IdGenerator {
    node: u16,
    state: Mutex<State>,
}

impl IdGenerator {
    /// Creates a generator for `node` (0..=1023).
    pub fn new(node: u16) -> Result<Self> {
        if node > MAX_NODE {
            return Err(AppError::Internal(format!(
                "Node id {} out of range (max {})",
                node, MAX_NODE
            )));
        }
        Ok(Self {
            node,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    pub fn node(&self) -> u16 {
        self.node
    }

    /// Returns the next id.
    pub fn next(&self) -> i64 {
        self.next_with(current_ms)
    }

    fn next_with(&self, mut clock: impl FnMut() -> u64) -> i64 {
        let mut state = self.state.lock();

        // A clock that steps back keeps using the last millisecond seen.
        let mut now = clock().max(state.last_ms);

        if now == state.last_ms {
            if state.sequence == MAX_SEQUENCE {
                now = loop {
                    let observed = clock();
                    if observed > state.last_ms {
                        break observed;
                    }
                    if observed < state.last_ms {
                        break state.last_ms + 1;
                    }
                    std::hint::spin_loop();
                };
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        compose(now, self.node, state.sequence)
    }
}

/// Splits an id into `(unix_ms, node, sequence)`.
pub fn decompose(id: i64) -> (u64, u16, u16) {
    let raw = id as u64;
    let ms = (raw >> TIME_SHIFT) + EPOCH_MS;
    let node = ((raw >> NODE_SHIFT) & MAX_NODE as u64) as u16;
    let sequence = (raw & MAX_SEQUENCE as u64) as u16;
    (ms, node, sequence)
}

fn compose(unix_ms: u64, node: u16, sequence: u16) -> i64 {
    let elapsed = unix_ms.saturating_sub(EPOCH_MS) & MAX_TIMESTAMP;
    ((elapsed << TIME_SHIFT) | ((node as u64) << NODE_SHIFT) | sequence as u64) as i64
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MS)
}
