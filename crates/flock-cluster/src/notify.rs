//! Fan-out of internal requests to a set of members.
//!
//! Failures are logged and reported, never returned as errors: a peer
//! that is down must not fail the request that triggered the broadcast.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};

use crate::transport::{InternalRequest, InternalResponse, PeerTarget, PeerTransport, TransportError};

/// Outcome of one broadcast, by peer address.
#[derive(Debug, Default, Clone)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BroadcastReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct NotificationBroadcaster {
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
    concurrency: usize,
}

impl NotificationBroadcaster {
    pub fn new(transport: Arc<dyn PeerTransport>, timeout: Duration, concurrency: usize) -> Self {
        Self {
            transport,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Send `request` to every target, at most `concurrency` at a time.
    pub async fn broadcast(&self, targets: Vec<PeerTarget>, request: InternalRequest) -> BroadcastReport {
        let kind = request.name();
        let results: Vec<(String, Result<InternalResponse, TransportError>)> = stream::iter(targets)
            .map(|target| {
                let request = request.clone();
                async move {
                    let result = match tokio::time::timeout(
                        self.timeout,
                        self.transport.send(&target, request),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout(target.address.clone())),
                    };
                    (target.address, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = BroadcastReport::default();
        for (address, result) in results {
            match result {
                Ok(_) => report.delivered.push(address),
                Err(e) => {
                    tracing::warn!(peer = %address, request = kind, error = %e, "Failed to notify peer");
                    report.failed.push((address, e.to_string()));
                }
            }
        }
        report.delivered.sort();
        report
    }
}
