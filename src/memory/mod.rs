//! Arena-managed accelerator memory.
//!
//! All device allocations are owned by an [`Arena`]; everything else holds
//! opaque [`AllocId`] handles with a generation counter. Freed blocks go to
//! an exact-size free list and are handed back before the device is asked
//! for new memory.

mod arena;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use arena::{Arena, ArenaScope, ArenaStats};

/// Opaque index of one device allocation within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocId(pub(crate) u32);

impl AllocId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AllocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}
