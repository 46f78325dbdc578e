//! Concurrent evaluation of a dependency graph.
//!
//! Every node gets a [`Thunk`] that first waits for the thunks of its
//! dependencies and then evaluates the node, so each node runs at most once
//! and never before its dependencies have finished. A semaphore bounds how
//! many nodes evaluate at the same time.

use anyhow::Result;
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    sync::Arc,
};
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument as _};

use super::Graph;
use crate::{cancel::CancelSignal, control::thunk::Thunk};

/// The terminal state of a node.
pub enum Outcome<T> {
    Complete(T),
    Failed(Arc<anyhow::Error>),
    /// Skipped because something it needs is not available yet.
    Deferred(String),
    /// Not started because the walk was canceled.
    Canceled,
}
impl<T: Clone> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Complete(v) => Outcome::Complete(v.clone()),
            Outcome::Failed(e) => Outcome::Failed(e.clone()),
            Outcome::Deferred(reason) => Outcome::Deferred(reason.clone()),
            Outcome::Canceled => Outcome::Canceled,
        }
    }
}
impl<T> Outcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Complete(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete(_))
    }

    /// Why dependents of this node cannot run, if they cannot.
    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            Outcome::Complete(_) => None,
            Outcome::Failed(_) => Some(BlockReason::Failed),
            Outcome::Deferred(_) => Some(BlockReason::Deferred),
            Outcome::Canceled => Some(BlockReason::Canceled),
        }
    }
}
impl<T> std::fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Complete(_) => write!(f, "Complete(..)"),
            Outcome::Failed(e) => write!(f, "Failed({:#})", e),
            Outcome::Deferred(reason) => write!(f, "Deferred({:?})", reason),
            Outcome::Canceled => write!(f, "Canceled"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    Failed,
    Deferred,
    Canceled,
}
impl Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Failed => write!(f, "failed"),
            BlockReason::Deferred => write!(f, "was deferred"),
            BlockReason::Canceled => write!(f, "was canceled"),
        }
    }
}

/// What to do for each node of a walk.
#[async_trait]
pub trait NodeWork: Send + Sync + 'static {
    type Key: Ord + Clone + Display + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Evaluate a node whose dependencies all completed. `upstream` holds
    /// the outcomes of its direct dependencies. An `Err` makes the node
    /// [`Outcome::Failed`].
    async fn evaluate(
        &self,
        key: &Self::Key,
        upstream: &BTreeMap<Self::Key, Outcome<Self::Output>>,
    ) -> Result<Outcome<Self::Output>>;

    /// Called instead of [`NodeWork::evaluate`] when some dependency did not
    /// complete.
    fn upstream_blocked(
        &self,
        _key: &Self::Key,
        blocked: &[(Self::Key, BlockReason)],
    ) -> Outcome<Self::Output> {
        let reasons: Vec<String> = blocked
            .iter()
            .map(|(key, reason)| format!("{} {}", key, reason))
            .collect();
        Outcome::Deferred(reasons.join(", "))
    }
}

#[derive(Clone, Debug)]
pub struct WalkOptions {
    /// Upper bound on nodes evaluating at once.
    pub parallelism: usize,
    pub cancel: CancelSignal,
}
impl Default for WalkOptions {
    fn default() -> Self {
        WalkOptions {
            parallelism: 10,
            cancel: CancelSignal::new(),
        }
    }
}

type Outcomes<W> = BTreeMap<<W as NodeWork>::Key, Outcome<<W as NodeWork>::Output>>;

/// Evaluate every node of `graph` and return all outcomes.
///
/// Fails only if the graph has a cycle; node failures are outcomes.
pub async fn walk<W: NodeWork>(
    work: Arc<W>,
    graph: &Graph<W::Key>,
    options: &WalkOptions,
) -> Result<Outcomes<W>> {
    let order = graph.topological_order()?;
    let semaphore = Arc::new(Semaphore::new(options.parallelism.max(1)));
    let mut thunks: BTreeMap<W::Key, Thunk<Outcome<W::Output>>> = BTreeMap::new();

    for key in order {
        let deps: Vec<(W::Key, Thunk<Outcome<W::Output>>)> = graph
            .dependencies(&key)
            .filter_map(|d| thunks.get(d).map(|t| (d.clone(), t.clone())))
            .collect();
        let work = work.clone();
        let semaphore = semaphore.clone();
        let cancel = options.cancel.clone();
        let span = info_span!("node", node = %key);
        let node = key.clone();
        let thunk = Thunk::new(
            async move {
                let upstream: Outcomes<W> = Thunk::force_all(&deps)
                    .await
                    .into_iter()
                    .map(|(k, o)| (k.clone(), o.clone()))
                    .collect();
                run_node(&*work, &node, upstream, &semaphore, &cancel).await
            }
            .instrument(span),
        );
        thunks.insert(key, thunk);
    }

    let tasks: Vec<_> = thunks
        .iter()
        .map(|(key, thunk)| {
            let thunk = thunk.clone();
            (
                key.clone(),
                tokio::spawn(async move { thunk.force().await.clone() }),
            )
        })
        .collect();
    let mut outcomes = BTreeMap::new();
    for (key, task) in tasks {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(Arc::new(anyhow::anyhow!("node task failed: {}", e))),
        };
        outcomes.insert(key, outcome);
    }
    Ok(outcomes)
}

async fn run_node<W: NodeWork>(
    work: &W,
    key: &W::Key,
    upstream: Outcomes<W>,
    semaphore: &Semaphore,
    cancel: &CancelSignal,
) -> Outcome<W::Output> {
    if cancel.is_canceled() {
        info!("canceled before start");
        return Outcome::Canceled;
    }
    let blocked: Vec<(W::Key, BlockReason)> = upstream
        .iter()
        .filter_map(|(k, o)| o.block_reason().map(|r| (k.clone(), r)))
        .collect();
    if !blocked.is_empty() {
        let outcome = work.upstream_blocked(key, &blocked);
        info!(outcome = ?outcome, "not evaluated, upstream incomplete");
        return outcome;
    }
    let _permit = match semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => return Outcome::Canceled,
    };
    if cancel.is_canceled() {
        info!("canceled before start");
        return Outcome::Canceled;
    }
    match work.evaluate(key, &upstream).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("node failed: {:#}", e);
            Outcome::Failed(Arc::new(e))
        }
    }
}
