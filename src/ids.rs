//! Identifier types used across sessions, stores, buffers and streams.
//!
//! All ids are plain `u32`s with a reserved `INVALID` sentinel and, where
//! the original protocol distinguishes a server-owned id from a
//! client-allocated one, a second `SERVER` sentinel directly below it.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub const INVALID: $name = $name(u32::MAX);
            pub const SERVER: $name = $name(u32::MAX - 1);

            pub fn is_valid(self) -> bool {
                self != Self::INVALID
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(SessionId);
id_type!(StoreId);
id_type!(BufferId);
id_type!(StreamId);
id_type!(SegmentId);

/// 128-bit globally unique id used to identify a stream type. Compared
/// only for equality, never ordered or parsed from text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub const NIL: Guid = Guid([0u8; 16]);
}

/// Monotonic sequence number assigned to a segment within a stream.
pub type SequenceNumber = u64;

pub const INVALID_SEQUENCE_NUMBER: SequenceNumber = u64::MAX;

/// Allocates ids from a monotonically increasing counter and refuses to
/// wrap back into a previously issued value.
pub struct IdAllocator {
    next: AtomicU32,
    limit: u32,
}

impl IdAllocator {
    pub fn new(limit: u32) -> Self {
        IdAllocator {
            next: AtomicU32::new(0),
            limit,
        }
    }

    pub fn allocate(&self) -> Result<u32> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        if id >= self.limit {
            return Err(Error::InvalidOperation(
                "id allocator exhausted".to_string(),
            ));
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sentinel_differs_from_fresh_ids() {
        assert!(!StreamId::INVALID.is_valid());
        assert!(StreamId(0).is_valid());
        assert_ne!(StreamId::INVALID, StreamId::SERVER);
    }

    #[test]
    fn allocator_refuses_past_limit() {
        let alloc = IdAllocator::new(2);
        assert_eq!(alloc.allocate().unwrap(), 0);
        assert_eq!(alloc.allocate().unwrap(), 1);
        assert!(alloc.allocate().is_err());
    }
}
