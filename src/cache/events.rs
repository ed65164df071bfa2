//! Invalidation Bus
//!
//! Every instance keeps its own L1, so an invalidation in one process must be
//! announced to the others. Notices travel over the shared store's pub/sub
//! channel:
//!
//! ```text
//! Instance A: delete_by_pattern("widget:*")
//!   ↓
//! PUBLISH cache:invalidate {"origin":"A","scope":"pattern","pattern":"widget:*"}
//!   ↓
//! Instance B: listener receives notice → purges matching L1 entries
//! Instance C: listener receives notice → purges matching L1 entries
//! ```
//!
//! Single-key deletes travel as `{"scope":"key","key":…}` and are removed by
//! exact name, so keys containing glob metacharacters still match themselves.
//!
//! Delivery is best effort. A lost notice leaves a peer's L1 stale for at
//! most the L1 ceiling.

use crate::cache::local::LocalCache;
use crate::cache::storage::{bounded, SharedStoreRef};
use crate::error::Result;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First reconnect delay after the subscription drops
const RECONNECT_INITIAL: Duration = Duration::from_millis(100);

/// Longest delay between reconnect attempts
const RECONNECT_MAX: Duration = Duration::from_secs(30);

// =============================================================================
// Notices
// =============================================================================

/// What a notice invalidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InvalidationScope {
    /// One key, matched literally
    Key { key: String },
    /// Keys matching a glob pattern
    Pattern { pattern: String },
    /// Keys that were members of a tag
    Tag { tag: String, keys: Vec<String> },
}

/// Message published on the invalidation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationNotice {
    /// Instance that published the notice
    pub origin: String,
    #[serde(flatten)]
    pub scope: InvalidationScope,
}

impl InvalidationNotice {
    /// Purge the L1 entries this notice covers, returning how many went
    pub fn apply(&self, local: &LocalCache) -> usize {
        match &self.scope {
            InvalidationScope::Key { key } => usize::from(local.remove(key)),
            InvalidationScope::Pattern { pattern } => local.purge_matching(pattern),
            InvalidationScope::Tag { keys, .. } => local.purge_keys(keys),
        }
    }
}

// =============================================================================
// Invalidation Bus
// =============================================================================

/// Publishes and consumes invalidation notices for one instance
pub struct InvalidationBus {
    store: SharedStoreRef,
    channel: String,
    instance_id: String,
    timeout: Duration,
}

impl InvalidationBus {
    pub fn new(
        store: SharedStoreRef,
        channel: impl Into<String>,
        instance_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            channel: channel.into(),
            instance_id: instance_id.into(),
            timeout,
        }
    }

    /// Identifier stamped on notices from this instance
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Announce an invalidation to peer instances
    pub async fn publish(&self, scope: InvalidationScope) -> Result<()> {
        let notice = InvalidationNotice {
            origin: self.instance_id.clone(),
            scope,
        };
        let payload = serde_json::to_string(&notice)?;
        bounded(
            "PUBLISH",
            self.timeout,
            self.store.publish(&self.channel, &payload),
        )
        .await?;
        debug!(channel = %self.channel, scope = ?notice.scope, "Published invalidation");
        Ok(())
    }

    /// Handle one raw message from the channel
    ///
    /// Notices from this instance are skipped: their L1 purge already
    /// happened locally. Malformed payloads are logged and dropped.
    pub fn handle_message(&self, payload: &str, local: &LocalCache) -> usize {
        let notice: InvalidationNotice = match serde_json::from_str(payload) {
            Ok(notice) => notice,
            Err(e) => {
                warn!(error = %e, "Failed to parse invalidation notice");
                return 0;
            }
        };
        if notice.origin == self.instance_id {
            return 0;
        }

        let purged = notice.apply(local);
        debug!(origin = %notice.origin, scope = ?notice.scope, purged = purged, "Applied invalidation");
        purged
    }

    /// Start consuming notices into `local`
    ///
    /// The first subscription is made before this returns, so notices
    /// published afterwards are not missed. If the subscription later drops,
    /// the listener resubscribes with exponential backoff until `cancel`
    /// fires.
    pub async fn listen(
        self: &Arc<Self>,
        local: Arc<LocalCache>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let initial = match self.subscribe().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "Initial invalidation subscription failed");
                None
            }
        };

        let bus = Arc::clone(self);
        tokio::spawn(async move { bus.run(initial, local, cancel).await })
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Result<String>>> {
        let stream = bounded("SUBSCRIBE", self.timeout, self.store.subscribe(&self.channel)).await?;
        info!(channel = %self.channel, "Subscribed to invalidation channel");
        Ok(stream)
    }

    async fn run(
        &self,
        mut stream: Option<BoxStream<'static, Result<String>>>,
        local: Arc<LocalCache>,
        cancel: CancellationToken,
    ) {
        let mut backoff = reconnect_backoff();

        loop {
            if let Some(subscription) = stream.take() {
                backoff.reset();
                if self.consume(subscription, &local, &cancel).await {
                    break;
                }
                warn!(channel = %self.channel, "Invalidation subscription lost, reconnecting");
            }

            let delay = backoff.next_backoff().unwrap_or(RECONNECT_MAX);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.subscribe().await {
                Ok(subscription) => stream = Some(subscription),
                Err(e) => {
                    error!(
                        channel = %self.channel,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Invalidation listener failed to resubscribe"
                    );
                }
            }
        }

        debug!(channel = %self.channel, "Invalidation listener stopped");
    }

    /// Drain a subscription; returns true if stopped by cancellation
    async fn consume(
        &self,
        mut subscription: BoxStream<'static, Result<String>>,
        local: &LocalCache,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return true,
                message = subscription.next() => match message {
                    Some(Ok(payload)) => {
                        self.handle_message(&payload, local);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Failed to read invalidation message");
                    }
                    None => return false,
                }
            }
        }
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(RECONNECT_INITIAL)
        .with_max_interval(RECONNECT_MAX)
        .with_max_elapsed_time(None)
        .build()
}
