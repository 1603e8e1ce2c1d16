//! Message router: maps endpoint ids to delivery channels.
//!
//! The registry is owned by the router task. Every mutation (add/remove
//! channel) travels through the same inbox as ordinary envelopes, so it is
//! applied in order with dispatch and never from outside the task.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RouterError;
use crate::router::envelope::{EndpointId, Envelope, JobType};

/// Delivery channel for one endpoint.
pub type Mailbox = mpsc::UnboundedSender<Envelope>;

/// Receiving side of a [`Mailbox`].
pub type MailboxReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Create a fresh mailbox pair.
pub fn mailbox() -> (Mailbox, MailboxReceiver) {
    mpsc::unbounded_channel()
}

/// Counters reported by [`RouterHandle::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Endpoints currently registered.
    pub registered: usize,
    /// Envelopes forwarded to a mailbox.
    pub delivered: u64,
    /// Envelopes with no live recipient.
    pub dropped: u64,
}

enum Inbound {
    Dispatch(Envelope),
    AddChannel { envelope: Envelope, channel: Mailbox },
    Stats(oneshot::Sender<RouterStats>),
}

/// Cloneable handle used by producers to reach the router.
#[derive(Clone)]
pub struct RouterHandle {
    id: EndpointId,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl std::fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterHandle")
            .field("id", &self.id)
            .field("closed", &self.inbox.is_closed())
            .finish()
    }
}

impl RouterHandle {
    /// The router's own endpoint id.
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Queue an envelope for dispatch.
    ///
    /// Only fails when the router task has stopped; an unknown recipient is
    /// handled (and logged) by the router, not reported here.
    pub fn send(&self, envelope: Envelope) -> Result<(), RouterError> {
        self.inbox
            .send(Inbound::Dispatch(envelope))
            .map_err(|_| self.closed())
    }

    /// Add or replace the channel for `endpoint`.
    pub fn register(
        &self,
        endpoint: impl Into<EndpointId>,
        channel: Mailbox,
    ) -> Result<(), RouterError> {
        let endpoint = endpoint.into();
        let envelope = Envelope::add_channel(self.id.clone(), self.id.clone(), &endpoint);
        self.inbox
            .send(Inbound::AddChannel { envelope, channel })
            .map_err(|_| self.closed())
    }

    /// Remove the channel for `endpoint`, if any.
    pub fn unregister(&self, endpoint: impl Into<EndpointId>) -> Result<(), RouterError> {
        let endpoint = endpoint.into();
        self.send(Envelope::remove_channel(
            self.id.clone(),
            self.id.clone(),
            &endpoint,
        ))
    }

    /// Snapshot of the router's counters, taken after everything queued
    /// before this call has been dispatched.
    pub async fn stats(&self) -> Result<RouterStats, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Inbound::Stats(tx))
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    fn closed(&self) -> RouterError {
        RouterError::Closed {
            router: self.id.to_string(),
        }
    }
}

/// The router task state.
pub struct Router {
    id: EndpointId,
    registry: HashMap<EndpointId, Mailbox>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    stats: RouterStats,
}

impl Router {
    /// Create a router and its handle. Call [`Router::run`] to start it.
    pub fn new(id: impl Into<EndpointId>) -> (Self, RouterHandle) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Self {
            id: id.clone(),
            registry: HashMap::new(),
            inbox: rx,
            stats: RouterStats::default(),
        };
        (router, RouterHandle { id, inbox: tx })
    }

    /// Create a router with the default id and run it on its own task.
    pub fn spawn() -> (RouterHandle, JoinHandle<RouterStats>) {
        let (router, handle) = Self::new(EndpointId::router());
        (handle, tokio::spawn(router.run()))
    }

    /// Process the inbox until every handle is dropped.
    pub async fn run(mut self) -> RouterStats {
        info!(router = %self.id, "Router started");
        while let Some(inbound) = self.inbox.recv().await {
            self.step(inbound);
        }
        info!(
            router = %self.id,
            delivered = self.stats.delivered,
            dropped = self.stats.dropped,
            "Router stopped"
        );
        self.stats
    }

    /// One dispatch step.
    fn step(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Dispatch(envelope)
                if envelope.recipient() == &self.id || envelope.job_type().is_router_control() =>
            {
                self.handle_control(envelope, None);
            }
            Inbound::Dispatch(envelope) => self.forward(envelope),
            Inbound::AddChannel { envelope, channel } => {
                self.handle_control(envelope, Some(channel));
            }
            Inbound::Stats(reply) => {
                let _ = reply.send(self.stats);
            }
        }
    }

    fn handle_control(&mut self, envelope: Envelope, channel: Option<Mailbox>) {
        let Some(endpoint) = envelope.endpoint_field() else {
            warn!(
                router = %self.id,
                sender = %envelope.sender(),
                job_type = ?envelope.job_type(),
                "Control envelope without endpoint field ignored"
            );
            return;
        };

        match (envelope.job_type(), channel) {
            (JobType::AddChannel, Some(channel)) => {
                let replaced = self.registry.insert(endpoint.clone(), channel).is_some();
                self.stats.registered = self.registry.len();
                debug!(router = %self.id, endpoint = %endpoint, replaced, "Channel registered");
            }
            (JobType::AddChannel, None) => {
                warn!(
                    router = %self.id,
                    endpoint = %endpoint,
                    "AddChannel request carried no channel"
                );
            }
            (JobType::RemoveChannel, _) => {
                let removed = self.registry.remove(&endpoint).is_some();
                self.stats.registered = self.registry.len();
                debug!(router = %self.id, endpoint = %endpoint, removed, "Channel removed");
            }
            (other, _) => {
                warn!(
                    router = %self.id,
                    job_type = ?other,
                    "Unsupported control envelope ignored"
                );
            }
        }
    }

    fn forward(&mut self, envelope: Envelope) {
        let recipient = envelope.recipient().clone();
        let Some(channel) = self.registry.get(&recipient) else {
            self.stats.dropped += 1;
            warn!(
                router = %self.id,
                sender = %envelope.sender(),
                recipient = %recipient,
                "No channel registered for recipient, envelope dropped"
            );
            return;
        };

        if channel.send(envelope).is_err() {
            self.registry.remove(&recipient);
            self.stats.registered = self.registry.len();
            self.stats.dropped += 1;
            warn!(
                router = %self.id,
                recipient = %recipient,
                "Recipient channel closed, endpoint pruned"
            );
            return;
        }

        self.stats.delivered += 1;
        debug!(router = %self.id, recipient = %recipient, "Envelope delivered");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::router::envelope::{Body, Status};

    fn note(sender: &str, recipient: &str, n: u64) -> Envelope {
        Envelope::answer(
            sender,
            recipient,
            Status::Ok,
            Body::new(JobType::Progress).with_field("n", n),
        )
    }

    #[tokio::test]
    async fn registered_endpoint_receives_exactly_once() {
        let (router, _task) = Router::spawn();
        let (tx, mut rx) = mailbox();
        router.register("A", tx).unwrap();
        router.send(note("w", "A", 1)).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.body().get("n"), Some(&serde_json::json!(1)));

        let stats = router.stats().await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_recipient_is_dropped_without_error() {
        let (router, _task) = Router::spawn();
        assert!(router.send(note("w", "B", 1)).is_ok());
        let stats = router.stats().await.unwrap();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let (router, _task) = Router::spawn();
        let (tx, mut rx) = mailbox();
        router.register("A", tx).unwrap();
        for n in 0..50 {
            router.send(note("w", "A", n)).unwrap();
        }
        for n in 0..50 {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.body().get("n"), Some(&serde_json::json!(n)));
        }
    }

    #[tokio::test]
    async fn register_replaces_previous_channel() {
        let (router, _task) = Router::spawn();
        let (old_tx, mut old_rx) = mailbox();
        let (new_tx, mut new_rx) = mailbox();
        router.register("A", old_tx).unwrap();
        router.register("A", new_tx).unwrap();
        router.send(note("w", "A", 7)).unwrap();

        assert!(new_rx.recv().await.is_some());
        router.stats().await.unwrap();
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let (router, _task) = Router::spawn();
        let (tx, mut rx) = mailbox();
        router.register("A", tx).unwrap();
        router.unregister("A").unwrap();
        router.send(note("w", "A", 1)).unwrap();

        let stats = router.stats().await.unwrap();
        assert_eq!(stats.registered, 0);
        assert_eq!(stats.dropped, 1);
        // Router dropped its sender on removal, so the mailbox is closed.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_mailbox_is_pruned() {
        let (router, _task) = Router::spawn();
        let (tx, rx) = mailbox();
        router.register("A", tx).unwrap();
        drop(rx);
        router.send(note("w", "A", 1)).unwrap();

        let stats = router.stats().await.unwrap();
        assert_eq!(stats.registered, 0);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn router_stops_when_handles_dropped() {
        let (router, task) = Router::spawn();
        let (tx, _rx) = mailbox();
        router.register("A", tx).unwrap();
        router.send(note("w", "A", 1)).unwrap();
        drop(router);

        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn send_after_router_stopped_reports_closed() {
        let (router, handle) = Router::new("R");
        drop(router);
        let err = handle.send(note("w", "A", 1)).unwrap_err();
        assert!(matches!(err, RouterError::Closed { ref router } if router == "R"));
    }
}
