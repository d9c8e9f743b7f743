//! # Event Forwarder
//!
//! Best-effort relay of [`ReconcileEvent`]s to an external receiver.
//! Coordinators hand events to [`EventForwarder::forward`], which never
//! blocks: when the buffer is full the event is dropped. A single
//! [`ForwarderWorker`] posts buffered events one at a time; delivery
//! failures are logged and the event discarded.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use sctl_core::ReconcileEvent;

use crate::error::FetchError;

/// Events buffered before new ones are dropped.
pub const DEFAULT_BUFFER: usize = 256;

/// Per-post timeout.
pub const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(5);

/// Producer handle; cheap to clone.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: Option<mpsc::Sender<ReconcileEvent>>,
}

impl EventForwarder {
    /// A forwarder that discards everything (no receiver configured).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A forwarder posting to `endpoint`, plus the worker that does the
    /// posting.
    pub fn new(
        endpoint: Url,
        buffer: usize,
        timeout: Duration,
    ) -> Result<(Self, ForwarderWorker), FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Ok((
            Self { tx: Some(tx) },
            ForwarderWorker {
                rx,
                client,
                endpoint,
            },
        ))
    }

    /// Whether a receiver is configured.
    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue `event` for delivery without waiting.
    pub fn forward(&self, event: ReconcileEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "buffer full",
                mpsc::error::TrySendError::Closed(_) => "forwarder stopped",
            };
            tracing::debug!(reason, "dropping reconcile event");
        }
    }
}

/// Consumer side; posts events as JSON.
pub struct ForwarderWorker {
    rx: mpsc::Receiver<ReconcileEvent>,
    client: reqwest::Client,
    endpoint: Url,
}

impl ForwarderWorker {
    /// Deliver events until `cancel` fires or every producer is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(endpoint = %self.endpoint, "event forwarder started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.post(&event).await;
        }
        tracing::info!("event forwarder stopped");
    }

    async fn post(&self, event: &ReconcileEvent) {
        let result = self
            .client
            .post(self.endpoint.clone())
            .json(event)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => tracing::warn!(
                endpoint = %self.endpoint,
                status = resp.status().as_u16(),
                kind = %event.resource_kind,
                name = %event.name,
                "event receiver rejected event"
            ),
            Err(e) => tracing::warn!(
                endpoint = %self.endpoint,
                error = %e,
                kind = %event.resource_kind,
                name = %event.name,
                "failed to forward event"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sctl_core::{ObjectRef, Outcome, ResourceKind};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> ReconcileEvent {
        let id = ObjectRef::new(ResourceKind::GitRepository, "flux-system", "podinfo").unwrap();
        ReconcileEvent::new(&id, Outcome::Succeeded, "stored artifact")
    }

    #[tokio::test]
    async fn posts_event_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "resourceKind": "GitRepository",
                "name": "podinfo",
                "outcome": "succeeded",
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = Url::parse(&server.uri()).unwrap();
        let (forwarder, worker) = EventForwarder::new(endpoint, 8, DEFAULT_POST_TIMEOUT).unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        forwarder.forward(event());
        drop(forwarder);
        handle.await.unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn receiver_failure_does_not_stop_worker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let endpoint = Url::parse(&server.uri()).unwrap();
        let (forwarder, worker) = EventForwarder::new(endpoint, 8, DEFAULT_POST_TIMEOUT).unwrap();
        let handle = tokio::spawn(worker.run(CancellationToken::new()));
        forwarder.forward(event());
        forwarder.forward(event());
        drop(forwarder);
        handle.await.unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn full_buffer_drops_without_blocking() {
        let endpoint = Url::parse("http://127.0.0.1:1/").unwrap();
        let (forwarder, _worker) = EventForwarder::new(endpoint, 1, DEFAULT_POST_TIMEOUT).unwrap();
        // Worker never runs; the second and third events are dropped.
        forwarder.forward(event());
        forwarder.forward(event());
        forwarder.forward(event());
    }

    #[test]
    fn disabled_forwarder_discards() {
        let forwarder = EventForwarder::disabled();
        assert!(!forwarder.is_enabled());
        forwarder.forward(event());
    }
}
