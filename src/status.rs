//! Accumulation bitmask for composite events.

use serde::{Deserialize, Serialize};

/// Most member events a single composite event can track.
///
/// One bit per member in a 32-bit word, with the top bit left unused so the
/// mask survives round trips through signed integer columns.
pub const MAX_COMPOSITE_EVENTS: usize = 31;

/// Tracks which member events of a composite have been observed.
///
/// The value lives on the host instance (one field per composite event) and
/// is updated by the engine whenever a member event is dispatched. Updates
/// only set bits, so the mask grows monotonically; re-raising a member is
/// idempotent. The host owns any reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeEventStatus(u32);

impl CompositeEventStatus {
    /// Creates a status with the given raw bits.
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw bit pattern.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// ORs the given flags into this status.
    pub fn set(&mut self, flags: CompositeEventStatus) {
        self.0 |= flags.0;
    }

    /// Whether exactly the bits of `required` have accumulated.
    pub const fn is_complete(&self, required: CompositeEventStatus) -> bool {
        self.0 == required.0
    }

    /// Whether no member has been observed yet.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}
