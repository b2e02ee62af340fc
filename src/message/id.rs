use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// 2024-01-01T00:00:00Z in milliseconds.
const EPOCH_MS: i64 = 1_704_067_200_000;
const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;

struct State {
    last_ms: i64,
    sequence: u16,
}

/// Snowflake-style id generator: 41 bits of milliseconds, 10 bits of worker
/// id, 12 bits of sequence.
///
/// Ids are strictly increasing per generator. If the wall clock steps
/// backwards the last observed millisecond is reused.
pub struct IdGenerator {
    worker_id: u16,
    state: Mutex<State>,
}

impl IdGenerator {
    /// Worker ids are masked to 10 bits.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: worker_id & MAX_WORKER_ID,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock();
        let mut now = current_ms().max(state.last_ms);

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond.
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = current_ms().max(state.last_ms);
                    if now == state.last_ms {
                        std::thread::yield_now();
                    }
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;
        ((now - EPOCH_MS) << (WORKER_BITS + SEQUENCE_BITS))
            | (i64::from(self.worker_id) << SEQUENCE_BITS)
            | i64::from(state.sequence)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(u16::try_from(std::process::id() % 1024).unwrap_or(0))
    }
}

fn current_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(EPOCH_MS)
}
