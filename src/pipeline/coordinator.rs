//! Batch execution with per-item and whole-batch deadlines.
//!
//! Every batch stage goes through [`run_batch`]; only the [`BatchPolicy`]
//! differs between stages. Results come back as one slot per input item, in
//! input order, whatever order the operations finished in.

use crate::config::BatchTimeouts;
use crate::providers::ProviderError;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub mode: BatchMode,
    pub per_item_timeout: Duration,
    pub batch_timeout: Duration,
}

impl BatchPolicy {
    pub fn parallel(timeouts: BatchTimeouts) -> Self {
        Self {
            mode: BatchMode::Parallel,
            per_item_timeout: timeouts.item(),
            batch_timeout: timeouts.batch(),
        }
    }

    pub fn sequential(timeouts: BatchTimeouts) -> Self {
        Self {
            mode: BatchMode::Sequential,
            per_item_timeout: timeouts.item(),
            batch_timeout: timeouts.batch(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    Item,
    Batch,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutScope::Item => f.write_str("per-item"),
            TimeoutScope::Batch => f.write_str("batch"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{scope} timeout of {}s reached", .limit.as_secs())]
    Timeout { scope: TimeoutScope, limit: Duration },
}

impl ItemError {
    /// True when the slot was cut short by the batch ceiling rather than its
    /// own deadline or a provider error.
    pub fn is_batch_timeout(&self) -> bool {
        matches!(
            self,
            ItemError::Timeout {
                scope: TimeoutScope::Batch,
                ..
            }
        )
    }
}

pub type ItemResult<T> = Result<T, ItemError>;

/// Runs `op` once per item under `policy`.
///
/// The batch timeout is a hard ceiling: when it fires, unfinished operations
/// are dropped and their slots (plus the slots of items that never started)
/// get a batch-scope timeout.
pub async fn run_batch<I, T, F, Fut>(items: Vec<I>, policy: BatchPolicy, op: F) -> Vec<ItemResult<T>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let deadline = Instant::now() + policy.batch_timeout;
    debug!(
        target = "insights.coordinator",
        items = items.len(),
        mode = ?policy.mode,
        per_item_secs = policy.per_item_timeout.as_secs(),
        batch_secs = policy.batch_timeout.as_secs(),
        "batch started"
    );
    match policy.mode {
        BatchMode::Parallel => run_parallel(items, policy, deadline, op).await,
        BatchMode::Sequential => run_sequential(items, policy, deadline, op).await,
    }
}

async fn run_parallel<I, T, F, Fut>(
    items: Vec<I>,
    policy: BatchPolicy,
    deadline: Instant,
    op: F,
) -> Vec<ItemResult<T>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let limit = policy.per_item_timeout;
    let mut slots: Vec<Option<ItemResult<T>>> = items.iter().map(|_| None).collect();
    let mut pending: FuturesUnordered<_> = items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let fut = op(item);
            async move { (idx, with_item_timeout(limit, fut).await) }
        })
        .collect();

    loop {
        let next = timeout_at(deadline, pending.next()).await;
        match next {
            Ok(Some((idx, result))) => slots[idx] = Some(result),
            Ok(None) => break,
            Err(_) => {
                debug!(target = "insights.coordinator", unfinished = pending.len(), "batch timeout reached");
                break;
            }
        }
    }
    drop(pending);

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(batch_timeout(policy))))
        .collect()
}

async fn run_sequential<I, T, F, Fut>(
    items: Vec<I>,
    policy: BatchPolicy,
    deadline: Instant,
    op: F,
) -> Vec<ItemResult<T>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let now = Instant::now();
        if now >= deadline {
            results.push(Err(batch_timeout(policy)));
            continue;
        }
        let remaining = deadline - now;
        let result = if remaining < policy.per_item_timeout {
            match timeout(remaining, op(item)).await {
                Ok(result) => result.map_err(ItemError::from),
                Err(_) => Err(batch_timeout(policy)),
            }
        } else {
            with_item_timeout(policy.per_item_timeout, op(item)).await
        };
        results.push(result);
    }
    results
}

async fn with_item_timeout<T, Fut>(limit: Duration, fut: Fut) -> ItemResult<T>
where
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(ItemError::from),
        Err(_) => Err(ItemError::Timeout {
            scope: TimeoutScope::Item,
            limit,
        }),
    }
}

fn batch_timeout(policy: BatchPolicy) -> ItemError {
    ItemError::Timeout {
        scope: TimeoutScope::Batch,
        limit: policy.batch_timeout,
    }
}
