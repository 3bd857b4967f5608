// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Local chain-halt detection from block staleness.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use inferd_chain_rpc::ChainClient;

/// How often the tracker is willing to hit the status RPC by default.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3);

/// How long the chain may go without a new block before it counts as halted.
pub const DEFAULT_MAX_BLOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct TrackerState {
    latest_block_time: i64,
    latest_block_height: u64,
    /// When a strictly newer block was last observed. `None` until the first
    /// observation, during which halt detection stays off.
    last_updated_at: Option<Instant>,
    /// When the status RPC was last attempted, successful or not.
    last_checked_at: Option<Instant>,
    chain_halt: bool,
}

/// Tracks the chain head and flags a halt when it stops advancing.
///
/// Writes go through the mutex; the latest block time is mirrored into an
/// atomic so the submission hot path can read it without locking.
#[derive(Debug)]
pub struct BlockTimeTracker {
    state: Mutex<TrackerState>,
    latest_block_time: AtomicI64,
    max_block_timeout: Duration,
    refresh_interval: Duration,
}

impl BlockTimeTracker {
    pub fn new(max_block_timeout: Duration, refresh_interval: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            latest_block_time: AtomicI64::new(0),
            max_block_timeout,
            refresh_interval,
        }
    }

    /// Latest observed block time in unix nanoseconds; 0 before the first
    /// observation. Lock-free.
    pub fn latest_block_time_nanos(&self) -> i64 {
        self.latest_block_time.load(Ordering::Acquire)
    }

    pub fn latest_block_height(&self) -> u64 {
        self.state.lock().expect("tracker poisoned").latest_block_height
    }

    pub fn chain_halted(&self) -> bool {
        self.state.lock().expect("tracker poisoned").chain_halt
    }

    /// Refresh the head from the node and re-evaluate the halt flag.
    ///
    /// Rate-limited: calls within the refresh interval of the previous one
    /// are no-ops, so the consumers may call this on every iteration.
    /// RPC failures leave the previous verdict in place.
    pub async fn update<C: ChainClient>(&self, client: &C) {
        {
            let mut state = self.state.lock().expect("tracker poisoned");
            if let Some(checked) = state.last_checked_at {
                if checked.elapsed() < self.refresh_interval {
                    return;
                }
            }
            state.last_checked_at = Some(Instant::now());
        }

        let status = match client.status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = e.to_string(), "failed to refresh chain status");
                return;
            }
        };

        let mut state = self.state.lock().expect("tracker poisoned");
        let advanced = status.latest_block_height > state.latest_block_height
            || status.latest_block_time > state.latest_block_time;

        if advanced {
            state.latest_block_height = status.latest_block_height;
            state.latest_block_time = status.latest_block_time;
            state.last_updated_at = Some(Instant::now());
            if state.chain_halt {
                tracing::info!(
                    height = status.latest_block_height,
                    "chain resumed producing blocks"
                );
            }
            state.chain_halt = false;
            self.latest_block_time
                .store(status.latest_block_time, Ordering::Release);
        } else if let Some(updated) = state.last_updated_at {
            if updated.elapsed() > self.max_block_timeout && !state.chain_halt {
                tracing::warn!(
                    height = state.latest_block_height,
                    stale_for = ?updated.elapsed(),
                    "no new blocks; treating chain as halted"
                );
                state.chain_halt = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use inferd_chain_rpc::testing::MockChainClient;

    use crate::tracker::BlockTimeTracker;

    #[tokio::test]
    async fn first_observation_sets_head() {
        let client = MockChainClient::new();
        client.set_status(5, 5_000);

        let tracker = BlockTimeTracker::new(Duration::from_secs(10), Duration::ZERO);
        tracker.update(&client).await;

        assert_eq!(tracker.latest_block_height(), 5);
        assert_eq!(tracker.latest_block_time_nanos(), 5_000);
        assert!(!tracker.chain_halted());
    }

    #[tokio::test]
    async fn stale_head_flags_halt_and_new_block_clears_it() {
        let client = MockChainClient::new();
        client.set_status(5, 5_000);

        // Zero timeout: any repeated head counts as stale.
        let tracker = BlockTimeTracker::new(Duration::ZERO, Duration::ZERO);
        tracker.update(&client).await;
        assert!(!tracker.chain_halted());

        tracker.update(&client).await;
        assert!(tracker.chain_halted());

        client.set_status(6, 6_000);
        tracker.update(&client).await;
        assert!(!tracker.chain_halted());
        assert_eq!(tracker.latest_block_time_nanos(), 6_000);
    }

    #[tokio::test]
    async fn refresh_is_rate_limited() {
        let client = MockChainClient::new();
        client.set_status(5, 5_000);

        let tracker = BlockTimeTracker::new(Duration::from_secs(10), Duration::from_secs(3));
        tracker.update(&client).await;

        // A newer block exists but the tracker must not look yet.
        client.set_status(6, 6_000);
        tracker.update(&client).await;
        assert_eq!(tracker.latest_block_height(), 5);
    }
}
