// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::future::Future;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Page size used for every cursored query.
pub const PAGE_SIZE: u64 = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageRequest {
    /// Cursor from the previous page; `None` for the first page.
    pub key: Option<String>,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` or empty when this was the last page.
    pub next_key: Option<String>,
}

/// Fetch every page of a cursored query.
///
/// Stops when the response carries no next key. A failing page aborts the
/// whole fetch; the error records how many items had been collected so the
/// caller can tell a cold failure from a mid-stream one.
pub async fn get_all_paginated<T, F, Fut>(mut fetch: F) -> anyhow::Result<Vec<T>>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = anyhow::Result<Page<T>>>,
{
    let mut items: Vec<T> = Vec::new();
    let mut key: Option<String> = None;

    loop {
        let page = fetch(PageRequest {
            key: key.clone(),
            limit: PAGE_SIZE,
        })
        .await
        .map_err(|e| anyhow!("failed to fetch page (items so far: {}): {}", items.len(), e))?;

        items.extend(page.items);

        match page.next_key {
            Some(k) if !k.is_empty() => key = Some(k),
            _ => return Ok(items),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use crate::paginated::{get_all_paginated, Page, PAGE_SIZE};

    #[tokio::test]
    async fn empty_first_page() {
        let items: Vec<u64> = get_all_paginated(|page| async move {
            assert_eq!(page.limit, PAGE_SIZE);
            assert!(page.key.is_none());
            Ok(Page {
                items: vec![],
                next_key: None,
            })
        })
        .await
        .unwrap();

        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn follows_cursor_until_exhausted() {
        let items = get_all_paginated(|page| async move {
            match page.key.as_deref() {
                None => Ok(Page {
                    items: vec![1u64, 2],
                    next_key: Some("a".to_string()),
                }),
                Some("a") => Ok(Page {
                    items: vec![3],
                    // An empty cursor also terminates.
                    next_key: Some(String::new()),
                }),
                other => panic!("unexpected cursor {other:?}"),
            }
        })
        .await
        .unwrap();

        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn error_reports_items_so_far() {
        let err = get_all_paginated(|page| async move {
            match page.key.as_deref() {
                None => Ok(Page {
                    items: vec![0u64; 50],
                    next_key: Some("k".to_string()),
                }),
                Some(_) => Err(anyhow!("boom")),
            }
        })
        .await
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed to fetch page (items so far: 50): boom"
        );
    }
}
