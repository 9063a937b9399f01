//! Connection state held in a single atomic word
//!
//! The word packs the state in its low two bits and a connection epoch in the
//! rest. Every transition is a compare-and-swap against the exact
//! `(epoch, state)` it expects, so a processing task from an old connection
//! can never knock a newer connection back to `Disconnected`.
//!
//! ```text
//! Disconnected(e) --begin_connect--> Connecting(e+1)
//! Connecting(e)   --mark_connected-> Connected(e)
//! Connecting(e)   --connect_failed-> Disconnected(e)
//! Connected(e)    --stream_ended---> Disconnected(e)
//! any(e)          --disconnect-----> Disconnected(e)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn bits(self) -> u64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

const STATE_MASK: u64 = 0b11;
const EPOCH_SHIFT: u32 = 2;

fn pack(epoch: u64, state: ConnectionState) -> u64 {
    (epoch << EPOCH_SHIFT) | state.bits()
}

fn epoch_of(word: u64) -> u64 {
    word >> EPOCH_SHIFT
}

#[derive(Debug, Default)]
pub(crate) struct StateCell {
    word: AtomicU64,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn load(&self) -> ConnectionState {
        ConnectionState::from_bits(self.word.load(Ordering::Acquire))
    }

    /// Disconnected -> Connecting, opening a new epoch.
    ///
    /// Fails with the current state if the client is not disconnected.
    pub(crate) fn begin_connect(&self) -> Result<u64, ConnectionState> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let state = ConnectionState::from_bits(current);
            if state != ConnectionState::Disconnected {
                return Err(state);
            }
            let epoch = epoch_of(current) + 1;
            match self.word.compare_exchange_weak(
                current,
                pack(epoch, ConnectionState::Connecting),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(epoch),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn mark_connected(&self, epoch: u64) -> bool {
        self.transition(
            epoch,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        )
    }

    pub(crate) fn connect_failed(&self, epoch: u64) -> bool {
        self.transition(
            epoch,
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
        )
    }

    pub(crate) fn stream_ended(&self, epoch: u64) -> bool {
        self.transition(
            epoch,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        )
    }

    /// Force Disconnected, keeping the epoch. Returns the previous state.
    pub(crate) fn disconnect(&self) -> ConnectionState {
        let previous = self
            .word
            .fetch_and(!STATE_MASK, Ordering::AcqRel);
        ConnectionState::from_bits(previous)
    }

    fn transition(&self, epoch: u64, from: ConnectionState, to: ConnectionState) -> bool {
        self.word
            .compare_exchange(
                pack(epoch, from),
                pack(epoch, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
