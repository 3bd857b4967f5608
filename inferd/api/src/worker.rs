// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Broker over the node's local ML workers.
//!
//! A worker serves a fixed set of models and takes a bounded number of
//! concurrent jobs; both inference and tokenization go through the same
//! lock so a busy worker is never double-booked.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub url: String,
    pub models: Vec<String>,
    /// Concurrent jobs the worker accepts.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

struct Worker {
    url: String,
    models: Vec<String>,
    slots: Arc<Semaphore>,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
    http: reqwest::Client,
}

impl WorkerPool {
    pub fn new(configs: Vec<WorkerConfig>, http: reqwest::Client) -> Self {
        let workers = configs
            .into_iter()
            .map(|c| Worker {
                url: c.url.trim_end_matches('/').to_string(),
                models: c.models,
                slots: Arc::new(Semaphore::new(c.concurrency.max(1))),
            })
            .collect();
        Self { workers, http }
    }

    /// Lock a worker serving the model: an idle one if any, otherwise wait
    /// on the first candidate.
    pub async fn lock(&self, model: &str) -> Result<WorkerLease, ApiError> {
        let candidates: Vec<&Worker> = self
            .workers
            .iter()
            .filter(|w| w.models.iter().any(|m| m == model))
            .collect();

        if candidates.is_empty() {
            return Err(ApiError::unavailable(format!(
                "no local worker serves model '{model}'"
            )));
        }

        for worker in &candidates {
            if let Ok(permit) = worker.slots.clone().try_acquire_owned() {
                return Ok(self.lease(worker, permit));
            }
        }

        let worker = candidates[0];
        let permit = worker
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApiError::unavailable("worker pool is shutting down"))?;
        Ok(self.lease(worker, permit))
    }

    fn lease(&self, worker: &Worker, permit: OwnedSemaphorePermit) -> WorkerLease {
        WorkerLease {
            url: worker.url.clone(),
            http: self.http.clone(),
            _permit: permit,
        }
    }
}

/// Exclusive use of one worker slot; released on drop.
#[derive(Debug)]
pub struct WorkerLease {
    url: String,
    http: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

#[derive(Serialize)]
struct TokenizeRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct TokenizeResponse {
    count: u64,
}

impl WorkerLease {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run the (seed-rewritten) request on the locked worker.
    pub async fn infer(&self, body: Vec<u8>) -> Result<reqwest::Response, ApiError> {
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ApiError::bad_gateway(format!("worker request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ApiError::bad_gateway(format!(
                "worker returned {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Count the prompt's tokens on the locked worker.
    pub async fn tokenize(&self, model: &str, prompt: &str) -> Result<u64, ApiError> {
        let response = self
            .http
            .post(format!("{}/tokenize", self.url))
            .json(&TokenizeRequest { model, prompt })
            .send()
            .await
            .map_err(|e| ApiError::bad_gateway(format!("tokenize request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ApiError::bad_gateway(format!(
                "tokenize returned {}",
                response.status()
            )));
        }

        let counted: TokenizeResponse = response
            .json()
            .await
            .map_err(|e| ApiError::bad_gateway(format!("invalid tokenize response: {e}")))?;
        Ok(counted.count)
    }
}
