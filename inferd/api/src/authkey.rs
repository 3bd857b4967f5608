// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Anti-replay table for inference auth keys.
//!
//! The developer's signature over the request body doubles as the inference
//! id and as the replay token. One key must pass through the transfer
//! context and the executor context exactly once each; a second sighting in
//! the same context is a replay. Keys are indexed by the block height they
//! were first seen at so eviction is a range drop, swept on every record.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

/// Minimum number of blocks a key is remembered for.
const MIN_RETENTION_BLOCKS: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthContext {
    Transfer,
    Executor,
}

impl AuthContext {
    fn bit(self) -> u8 {
        match self {
            AuthContext::Transfer => 0b01,
            AuthContext::Executor => 0b10,
        }
    }

    fn with_article(self) -> &'static str {
        match self {
            AuthContext::Transfer => "a transfer",
            AuthContext::Executor => "an executor",
        }
    }
}

impl fmt::Display for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthContext::Transfer => write!(f, "transfer"),
            AuthContext::Executor => write!(f, "executor"),
        }
    }
}

/// How long keys are retained, derived from the chain's timestamp expiration:
/// twice the tolerated request age, converted to blocks, floored at 4.
pub fn retention_blocks(timestamp_expiration_secs: i64) -> u64 {
    let blocks = (2 * timestamp_expiration_secs.max(0) as u64) / 4;
    blocks.max(MIN_RETENTION_BLOCKS)
}

#[derive(Debug, Default)]
struct TableInner {
    /// Key to the set of contexts it was seen in.
    contexts: HashMap<String, u8>,
    /// First-seen height to keys, for O(range) eviction.
    by_height: BTreeMap<u64, Vec<String>>,
}

#[derive(Debug, Default)]
pub struct AuthKeyTable {
    inner: Mutex<TableInner>,
}

impl AuthKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key sighting in a context.
    ///
    /// Returns the error message for the HTTP response on replay. The
    /// check-then-insert runs under one lock so a racing duplicate cannot
    /// slip through. Stale keys are evicted first.
    pub fn record(
        &self,
        key: &str,
        context: AuthContext,
        current_height: u64,
        retention: u64,
    ) -> Result<(), String> {
        let mut inner = self.inner.lock().expect("auth key table poisoned");

        evict(&mut inner, current_height, retention);

        let bits = inner.contexts.entry(key.to_string()).or_insert(0);
        if *bits & context.bit() != 0 {
            return Err(format!(
                "AuthKey has already been used for {} request",
                context.with_article()
            ));
        }
        let first_sighting = *bits == 0;
        *bits |= context.bit();

        if first_sighting {
            inner
                .by_height
                .entry(current_height)
                .or_default()
                .push(key.to_string());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("auth key table poisoned").contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict(inner: &mut TableInner, current_height: u64, retention: u64) {
    let cutoff = current_height.saturating_sub(retention);
    let stale: Vec<u64> = inner
        .by_height
        .range(..cutoff)
        .map(|(h, _)| *h)
        .collect();
    for height in stale {
        if let Some(keys) = inner.by_height.remove(&height) {
            for key in keys {
                inner.contexts.remove(&key);
            }
        }
    }
}
