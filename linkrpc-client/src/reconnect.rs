//! Automatic reconnection after an unexpected disconnect.

use crate::dispatcher::{Dispatcher, WeakDispatcher};
use crate::error::FatalError;
use std::time::Duration;

/// What to do when the active connection terminates with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Retry every `interval` until a relink succeeds.
    Unbounded { interval: Duration },
    /// Retry at most `limit` times, then escalate.
    Bounded { limit: u32, interval: Duration },
    /// Escalate immediately.
    Disabled,
}

impl ReconnectPolicy {
    /// Policy from the `auto_reconnect` / `retry_limit` pair; a limit of zero
    /// or less means unbounded.
    pub fn from_settings(auto_reconnect: bool, retry_limit: i64, interval: Duration) -> Self {
        if !auto_reconnect {
            return ReconnectPolicy::Disabled;
        }
        if retry_limit <= 0 {
            ReconnectPolicy::Unbounded { interval }
        } else {
            ReconnectPolicy::Bounded {
                limit: u32::try_from(retry_limit).unwrap_or(u32::MAX),
                interval,
            }
        }
    }
}

/// Registers a close hook on `dispatcher` that applies `policy`.
///
/// Clean closes are ignored. Each error termination spawns a retry task that
/// is handed to the dispatcher, so [`Dispatcher::close`] cancels it.
pub fn install(dispatcher: &Dispatcher, policy: ReconnectPolicy) {
    let weak = dispatcher.downgrade();
    dispatcher.on_close(move |connection_id, err| {
        let Some(err) = err else {
            return;
        };
        let Some(dp) = weak.upgrade() else {
            return;
        };
        if dp.is_closed() {
            tracing::debug!("connection [{}] lost after close, not reconnecting", connection_id);
            return;
        }

        match policy {
            ReconnectPolicy::Disabled => {
                tracing::error!(
                    "connection [{}] lost and auto reconnect is disabled",
                    connection_id
                );
                dp.report_fatal(FatalError::ConnectionLost {
                    connection_id: connection_id.to_string(),
                    reason: err.to_string(),
                });
            }
            ReconnectPolicy::Unbounded { interval } => {
                let task = tokio::spawn(retry_unbounded(dp.downgrade(), interval));
                dp.supervise(task);
            }
            ReconnectPolicy::Bounded { limit, interval } => {
                let task = tokio::spawn(retry_bounded(dp.downgrade(), limit, interval));
                dp.supervise(task);
            }
        }
    });
}

async fn retry_unbounded(weak: WeakDispatcher, interval: Duration) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        tracing::warn!(
            "connection closed, reconnecting in {:?} (attempt {})",
            interval,
            attempt
        );
        tokio::time::sleep(interval).await;

        let Some(dp) = weak.upgrade() else {
            return;
        };
        if dp.relink().await {
            tracing::info!("reconnected after {} attempt(s)", attempt);
            return;
        }
    }
}

async fn retry_bounded(weak: WeakDispatcher, limit: u32, interval: Duration) {
    for attempt in 1..=limit {
        tracing::warn!(
            "connection closed, reconnecting in {:?} (attempt {}/{})",
            interval,
            attempt,
            limit
        );
        tokio::time::sleep(interval).await;

        let Some(dp) = weak.upgrade() else {
            return;
        };
        if dp.relink().await {
            tracing::info!("reconnected after {} attempt(s)", attempt);
            return;
        }
    }

    if let Some(dp) = weak.upgrade() {
        tracing::error!("connection closed, reconnect retry limit {} reached", limit);
        dp.report_fatal(FatalError::ReconnectExhausted { limit });
    }
}
