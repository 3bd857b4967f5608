// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Admission control for inference traffic against a per-block kilobyte
//! budget averaged over the request's validation window.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use inferd_chain_rpc::{BandwidthParams, ChainClient};

/// Default spacing of the background cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Kilobytes booked per block height.
///
/// Admission (`can_accept`, read lock) and booking (`record`, write lock)
/// are deliberately not atomic: two concurrent accepts may overshoot the
/// limit by at most one request, which is acceptable and cheaper than
/// serializing the whole admission path.
#[derive(Debug, Default)]
pub struct BandwidthLimiter {
    usage: RwLock<BTreeMap<u64, f64>>,
}

impl BandwidthLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimated footprint of a request in kilobytes.
    pub fn estimate_kb(prompt_tokens: u64, max_tokens: u64, params: &BandwidthParams) -> f64 {
        prompt_tokens as f64 * params.kb_per_input_token
            + max_tokens as f64 * params.kb_per_output_token
    }

    /// Whether a request starting at `start_height` fits the budget averaged
    /// over `[start_height, start_height + lifespan]`.
    pub fn can_accept(
        &self,
        start_height: u64,
        prompt_tokens: u64,
        max_tokens: u64,
        params: &BandwidthParams,
        lifespan_blocks: u64,
    ) -> (bool, f64) {
        let estimated_kb = Self::estimate_kb(prompt_tokens, max_tokens, params);

        let usage = self.usage.read().expect("bandwidth lock poisoned");
        let in_window: f64 = usage
            .range(start_height..=start_height + lifespan_blocks)
            .map(|(_, kb)| kb)
            .sum();

        let average_kb = (in_window + estimated_kb) / (lifespan_blocks + 1) as f64;
        (average_kb <= params.estimated_limits_per_block_kb, estimated_kb)
    }

    /// Book a request's footprint at its projected completion block.
    pub fn record(&self, completion_height: u64, kb: f64) {
        let mut usage = self.usage.write().expect("bandwidth lock poisoned");
        *usage.entry(completion_height).or_insert(0.0) += kb;
    }

    /// Undo a booking made by [`Self::record`].
    pub fn release(&self, completion_height: u64, kb: f64) {
        let mut usage = self.usage.write().expect("bandwidth lock poisoned");
        if let Some(entry) = usage.get_mut(&completion_height) {
            *entry -= kb;
            if *entry <= f64::EPSILON {
                usage.remove(&completion_height);
            }
        }
    }

    /// Drop every entry older than the window reaching the current height.
    /// Idempotent.
    pub fn cleanup(&self, current_height: u64, lifespan_blocks: u64) {
        let cutoff = current_height.saturating_sub(lifespan_blocks);
        let mut usage = self.usage.write().expect("bandwidth lock poisoned");
        usage.retain(|height, _| *height >= cutoff);
    }

    pub fn tracked_blocks(&self) -> usize {
        self.usage.read().expect("bandwidth lock poisoned").len()
    }
}

/// Holds a booking until the response it covers completes (or fails);
/// releases it on drop either way.
pub struct BandwidthGuard {
    limiter: Arc<BandwidthLimiter>,
    completion_height: u64,
    kb: f64,
}

impl BandwidthGuard {
    /// Book `kb` at the completion height and tie the booking's lifetime to
    /// the returned guard.
    pub fn book(limiter: Arc<BandwidthLimiter>, completion_height: u64, kb: f64) -> Self {
        limiter.record(completion_height, kb);
        Self {
            limiter,
            completion_height,
            kb,
        }
    }
}

impl Drop for BandwidthGuard {
    fn drop(&mut self) {
        self.limiter.release(self.completion_height, self.kb);
    }
}

/// Periodically sweep stale bookings, sizing the window from chain params.
pub fn spawn_cleanup<C>(
    limiter: Arc<BandwidthLimiter>,
    client: C,
    interval: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    C: ChainClient + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let status = match client.status().await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(error = e.to_string(), "bandwidth cleanup: status failed");
                    continue;
                }
            };
            let params = match client.params().await {
                Ok(params) => params,
                Err(e) => {
                    tracing::warn!(error = e.to_string(), "bandwidth cleanup: params failed");
                    continue;
                }
            };

            limiter.cleanup(
                status.latest_block_height,
                params.validation.expiration_blocks,
            );
        }
        tracing::debug!("bandwidth cleanup stopped");
    })
}
