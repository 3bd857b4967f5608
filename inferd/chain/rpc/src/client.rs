// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::str::FromStr;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tendermint_rpc::{Client, HttpClient, Scheme, Url};

use crate::query::{
    AccountResponse, BalanceResponse, BroadcastResponse, ChainParams, ChainQuery, ChainStatus,
    GranteesPage, ModelPriceResponse, Participant, TxResult,
};
use crate::{get_all_paginated, ChainClient, ChainRpcError, PageRequest};

// Retrieve the proxy URL with precedence:
// 1. If supplied, that's the proxy URL used.
// 2. If not supplied, but environment variable HTTP_PROXY or HTTPS_PROXY are
//    supplied, then use the appropriate variable for the URL in question.
//
// Copied from `tendermint_rpc`.
fn get_http_proxy_url(url_scheme: Scheme, proxy_url: Option<Url>) -> anyhow::Result<Option<Url>> {
    match proxy_url {
        Some(u) => Ok(Some(u)),
        None => match url_scheme {
            Scheme::Http => std::env::var("HTTP_PROXY").ok(),
            Scheme::Https => std::env::var("HTTPS_PROXY")
                .ok()
                .or_else(|| std::env::var("HTTP_PROXY").ok()),
            _ => {
                if std::env::var("HTTP_PROXY").is_ok() || std::env::var("HTTPS_PROXY").is_ok() {
                    tracing::warn!(
                        "Ignoring HTTP proxy environment variables for non-HTTP client connection"
                    );
                }
                None
            }
        }
        .map(|u| u.parse::<Url>().map_err(|e| anyhow!(e)))
        .transpose(),
    }
}

/// Create a Tendermint HTTP client.
pub fn http_client(url: Url, proxy_url: Option<Url>) -> anyhow::Result<HttpClient> {
    let proxy_url = get_http_proxy_url(url.scheme(), proxy_url)?;
    let client = match proxy_url {
        Some(proxy_url) => {
            tracing::debug!(
                "Using HTTP client with proxy {} to submit request to {}",
                proxy_url,
                url
            );
            HttpClient::new_with_proxy(url, proxy_url)?
        }
        None => {
            tracing::debug!("Using HTTP client to submit request to: {}", url);
            HttpClient::new(url)?
        }
    };
    Ok(client)
}

/// [`ChainClient`] over a Tendermint HTTP connection.
#[derive(Clone)]
pub struct HttpChainClient {
    inner: HttpClient,
}

impl HttpChainClient {
    pub fn new(inner: HttpClient) -> Self {
        Self { inner }
    }

    pub fn new_http(url: Url, proxy_url: Option<Url>) -> anyhow::Result<Self> {
        let inner = http_client(url, proxy_url)?;
        Ok(Self { inner })
    }

    /// Run an inference module query over `abci_query`.
    async fn perform(&self, query: &ChainQuery) -> Result<Vec<u8>, ChainRpcError> {
        let path = query.path();
        tracing::debug!(?query, path, "perform ABCI query");
        let data = serde_json::to_vec(query)?;
        let res = self
            .inner
            .abci_query(Some(path.to_string()), data, None, false)
            .await?;

        if res.code.is_err() {
            return Err(ChainRpcError::Query {
                path: path.to_string(),
                message: res.log,
            });
        }
        Ok(res.value)
    }

    async fn perform_typed<T: DeserializeOwned>(
        &self,
        query: &ChainQuery,
    ) -> Result<T, ChainRpcError> {
        let value = self.perform(query).await?;
        Ok(serde_json::from_slice(&value)?)
    }

    /// Like [`Self::perform_typed`] but treating an empty value as "no record".
    async fn perform_opt<T: DeserializeOwned>(
        &self,
        query: &ChainQuery,
    ) -> Result<Option<T>, ChainRpcError> {
        let value = self.perform(query).await?;
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&value)?))
    }
}

fn is_not_found(e: &tendermint_rpc::Error) -> bool {
    e.to_string().contains("not found")
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn broadcast_tx_sync(&self, raw: Vec<u8>) -> Result<BroadcastResponse, ChainRpcError> {
        let res = self.inner.broadcast_tx_sync(raw).await?;
        Ok(BroadcastResponse {
            tx_hash: res.hash.to_string(),
            code: res.code.value(),
            raw_log: res.log,
        })
    }

    async fn tx(&self, hash: &str) -> Result<TxResult, ChainRpcError> {
        let hash = tendermint::Hash::from_str(&hash.to_uppercase())
            .map_err(|e| ChainRpcError::Query {
                path: "/tx".to_string(),
                message: format!("invalid tx hash: {e}"),
            })?;

        match self.inner.tx(hash, false).await {
            Ok(res) => Ok(TxResult {
                height: res.height.value(),
                code: res.tx_result.code.value(),
                codespace: res.tx_result.codespace,
                log: res.tx_result.log,
                data: res.tx_result.data.to_vec(),
            }),
            Err(e) if is_not_found(&e) => Err(ChainRpcError::TxNotFound(hash.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self) -> Result<ChainStatus, ChainRpcError> {
        let res = self.inner.status().await?;
        Ok(ChainStatus {
            latest_block_height: res.sync_info.latest_block_height.value(),
            latest_block_time: res.sync_info.latest_block_time.unix_timestamp_nanos() as i64,
            catching_up: res.sync_info.catching_up,
        })
    }

    async fn participant(&self, address: &str) -> Result<Option<Participant>, ChainRpcError> {
        self.perform_opt(&ChainQuery::Participant {
            address: address.to_string(),
        })
        .await
    }

    async fn random_executor(&self, model: &str) -> Result<Option<Participant>, ChainRpcError> {
        self.perform_opt(&ChainQuery::RandomExecutor {
            model: model.to_string(),
        })
        .await
    }

    async fn grantees(
        &self,
        granter: &str,
        msg_type_url: &str,
    ) -> Result<Vec<String>, ChainRpcError> {
        let fetch = |page: PageRequest| async move {
            let res: GranteesPage = self
                .perform_typed(&ChainQuery::Grantees {
                    granter: granter.to_string(),
                    msg_type_url: msg_type_url.to_string(),
                    page,
                })
                .await?;
            Ok(crate::Page {
                items: res.pubkeys,
                next_key: res.next_key,
            })
        };

        get_all_paginated(fetch)
            .await
            .map_err(|e| ChainRpcError::Query {
                path: "/inference/grantees".to_string(),
                message: e.to_string(),
            })
    }

    async fn params(&self) -> Result<ChainParams, ChainRpcError> {
        self.perform_typed(&ChainQuery::Params).await
    }

    async fn model_price(&self, model: &str) -> Result<Option<u64>, ChainRpcError> {
        let res: Option<ModelPriceResponse> = self
            .perform_opt(&ChainQuery::ModelPrice {
                model: model.to_string(),
            })
            .await?;
        Ok(res.and_then(|r| r.price_per_token))
    }

    async fn account_number(&self, address: &str) -> Result<u64, ChainRpcError> {
        let res: AccountResponse = self
            .perform_typed(&ChainQuery::Account {
                address: address.to_string(),
            })
            .await?;
        Ok(res.account_number)
    }

    async fn bank_balance(&self, address: &str, denom: &str) -> Result<u64, ChainRpcError> {
        let res: BalanceResponse = self
            .perform_typed(&ChainQuery::Balance {
                address: address.to_string(),
                denom: denom.to_string(),
            })
            .await?;
        Ok(res.amount)
    }
}
