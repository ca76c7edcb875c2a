//! Broadcast variables.
//!
//! In-process rendering of the driver-side broadcast service: the value is
//! stored once behind an `Arc` and every task reads through the handle. The
//! serialized size is recorded at creation so operators that ship a broadcast
//! (the broadcast inner join) can account for its memory in their task
//! budget.

use anyhow::{Result, anyhow};
use serde::Serialize;
use std::sync::Arc;

/// Handle to a broadcast value.
pub struct Broadcast<T> {
    value: Arc<T>,
    bytes: usize,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            bytes: self.bytes,
        }
    }
}

impl<T: Serialize> Broadcast<T> {
    pub(crate) fn new(value: T) -> Result<Self> {
        let bytes = postcard::to_allocvec(&value)
            .map_err(|e| anyhow!("serialize broadcast value: {e}"))?
            .len();
        Ok(Self {
            value: Arc::new(value),
            bytes,
        })
    }
}

impl<T> Broadcast<T> {
    /// The broadcast value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Serialized size in bytes, for task memory accounting.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn share(&self) -> Arc<T> {
        Arc::clone(&self.value)
    }
}
