//! Service status record and the lock-free cell that owns it
//!
//! The cell is written by two thread roles: the control-dispatch thread
//! announces a pending state, a worker thread completes it. A pending
//! transition is claimed with a compare-exchange on the state, so only one
//! writer owns the record at a time and readers (interrogate, query-remove)
//! never take a lock.

use crate::error::{HostError, Result};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Lifecycle state of a hosted unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceState {
    StartPending = 0,
    Running = 1,
    PausePending = 2,
    Paused = 3,
    ContinuePending = 4,
    StopPending = 5,
    Stopped = 6,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceState::StartPending,
            1 => ServiceState::Running,
            2 => ServiceState::PausePending,
            3 => ServiceState::Paused,
            4 => ServiceState::ContinuePending,
            5 => ServiceState::StopPending,
            _ => ServiceState::Stopped,
        }
    }

    /// True for the four transitional states
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ServiceState::StartPending
                | ServiceState::PausePending
                | ServiceState::ContinuePending
                | ServiceState::StopPending
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::StartPending => "start pending",
            ServiceState::Running => "running",
            ServiceState::PausePending => "pause pending",
            ServiceState::Paused => "paused",
            ServiceState::ContinuePending => "continue pending",
            ServiceState::StopPending => "stop pending",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Bitset of control requests a unit accepts
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AcceptedCommands(u32);

impl AcceptedCommands {
    pub const STOP: Self = Self(0x01);
    pub const PAUSE_CONTINUE: Self = Self(0x02);
    pub const SHUTDOWN: Self = Self(0x04);
    pub const POWER_EVENT: Self = Self(0x40);
    pub const SESSION_CHANGE: Self = Self(0x80);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keeps only the known command bits
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0xC7)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn set(&mut self, other: Self, enabled: bool) {
        if enabled {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for AcceptedCommands {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AcceptedCommands {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AcceptedCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(AcceptedCommands, &str); 5] = [
            (AcceptedCommands::STOP, "STOP"),
            (AcceptedCommands::PAUSE_CONTINUE, "PAUSE_CONTINUE"),
            (AcceptedCommands::SHUTDOWN, "SHUTDOWN"),
            (AcceptedCommands::POWER_EVENT, "POWER_EVENT"),
            (AcceptedCommands::SESSION_CHANGE, "SESSION_CHANGE"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "AcceptedCommands({})", names.join(" | "))
    }
}

/// How the unit reports its process type to the service manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// The only unit hosted by the process
    OwnProcess,
    /// One of several units sharing the process
    ShareProcess,
}

/// Snapshot of a unit's status as pushed to the service manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub kind: ServiceKind,
    pub current_state: ServiceState,
    pub accepted: AcceptedCommands,
    pub checkpoint: u32,
    pub wait_hint_ms: u32,
    pub exit_code: u32,
}

/// State, checkpoint and wait hint packed into one word so a pending
/// transition and its progress fields always change together.
///
/// Bits 0..8 hold the state, 8..32 the checkpoint, 32..64 the wait hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    state: ServiceState,
    checkpoint: u32,
    wait_hint_ms: u32,
}

const CHECKPOINT_MASK: u32 = 0x00FF_FFFF;

impl Progress {
    fn settled(state: ServiceState) -> Self {
        Self {
            state,
            checkpoint: 0,
            wait_hint_ms: 0,
        }
    }

    fn pack(self) -> u64 {
        (u64::from(self.wait_hint_ms) << 32)
            | (u64::from(self.checkpoint & CHECKPOINT_MASK) << 8)
            | u64::from(self.state as u8)
    }

    fn unpack(word: u64) -> Self {
        Self {
            state: ServiceState::from_u8((word & 0xFF) as u8),
            checkpoint: ((word >> 8) as u32) & CHECKPOINT_MASK,
            wait_hint_ms: (word >> 32) as u32,
        }
    }
}

/// Atomic storage for a unit's status fields
pub(crate) struct StatusCell {
    progress: AtomicU64,
    exit_code: AtomicU32,
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            progress: AtomicU64::new(Progress::settled(ServiceState::StartPending).pack()),
            exit_code: AtomicU32::new(0),
        }
    }

    fn progress(&self) -> Progress {
        Progress::unpack(self.progress.load(Ordering::Acquire))
    }

    /// Replace the progress word when its state is `from`
    fn transition(&self, from: ServiceState, next: Progress) -> bool {
        self.progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (Progress::unpack(word).state == from).then(|| next.pack())
            })
            .is_ok()
    }

    pub fn state(&self) -> ServiceState {
        self.progress().state
    }

    /// Claim a transition from `from` into the pending state `to`.
    ///
    /// Returns false if another writer got there first or the state moved.
    pub fn begin_pending(&self, from: ServiceState, to: ServiceState, wait_hint_ms: u32) -> bool {
        debug_assert!(to.is_pending());
        self.transition(
            from,
            Progress {
                state: to,
                checkpoint: 0,
                wait_hint_ms,
            },
        )
    }

    /// Re-enter StartPending for a fresh start
    pub fn reset_for_start(&self, wait_hint_ms: u32) {
        let start = Progress {
            state: ServiceState::StartPending,
            checkpoint: 0,
            wait_hint_ms,
        };
        self.progress.store(start.pack(), Ordering::Release);
    }

    /// Complete a transition owned by the caller
    pub fn settle(&self, to: ServiceState) {
        debug_assert!(!to.is_pending());
        self.progress
            .store(Progress::settled(to).pack(), Ordering::Release);
    }

    /// Move from `from` to the settled state `to` only if nothing else moved first
    pub fn try_settle(&self, from: ServiceState, to: ServiceState) -> bool {
        self.transition(from, Progress::settled(to))
    }

    /// Extend the wait hint of the current pending state.
    ///
    /// The pending check and the update are one atomic step.
    pub fn request_more_time(&self, wait_hint_ms: u32) -> Result<u32> {
        let updated = self
            .progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let current = Progress::unpack(word);
                current.state.is_pending().then(|| {
                    Progress {
                        state: current.state,
                        checkpoint: current.checkpoint.wrapping_add(1) & CHECKPOINT_MASK,
                        wait_hint_ms,
                    }
                    .pack()
                })
            });
        match updated {
            Ok(previous) => {
                Ok(Progress::unpack(previous).checkpoint.wrapping_add(1) & CHECKPOINT_MASK)
            }
            Err(word) => Err(HostError::InvalidOperation(format!(
                "additional time can only be requested while pending, service is {}",
                Progress::unpack(word).state
            ))),
        }
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn set_exit_code(&self, code: u32) {
        self.exit_code.store(code, Ordering::Release);
    }

    /// Build the record pushed to the service manager.
    ///
    /// Commands are only advertised in Running and Paused.
    pub fn snapshot(&self, kind: ServiceKind, configured: AcceptedCommands) -> StatusRecord {
        let progress = self.progress();
        let current_state = progress.state;
        let accepted = match current_state {
            ServiceState::Running | ServiceState::Paused => configured,
            _ => AcceptedCommands::empty(),
        };
        StatusRecord {
            kind,
            current_state,
            accepted,
            checkpoint: progress.checkpoint,
            wait_hint_ms: progress.wait_hint_ms,
            exit_code: self.exit_code(),
        }
    }
}
