use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::communication::inbox::{PushOutcome, WorkerInbox};
use crate::communication::message::{Message, MessageKind, MessagePriority};
use crate::error::coordination_error::CoordinationError;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Total capacity of one worker's inbox across all priority levels.
    pub inbox_capacity: usize,
    /// Lowest priority allowed to shed queued Low traffic on overflow.
    pub shed_floor: MessagePriority,
    pub default_timeout_secs: u64,
    /// Expected heartbeat cadence; links go inactive after 3x this.
    pub heartbeat_interval_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1000,
            shed_floor: MessagePriority::High,
            default_timeout_secs: 30,
            heartbeat_interval_secs: 10,
        }
    }
}

/// Resolution of a request: the worker's result payload, or its error payload.
/// Delivery failures are errors; a worker-reported failure is still a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(serde_json::Value),
    Failure(serde_json::Value),
}

impl Reply {
    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success(_))
    }
}

struct LinkState {
    active: bool,
    last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
struct RouterCounters {
    messages_sent: u64,
    messages_failed: u64,
    messages_shed: u64,
    requests_timed_out: u64,
    broadcasts: u64,
    publishes: u64,
}

/// Receiving handle for one attached worker.
pub struct Mailbox {
    pub worker_id: String,
    inbox: Arc<WorkerInbox>,
}

impl Mailbox {
    /// Suspend until the next message, drained high priority first.
    pub async fn recv(&self) -> Message {
        self.inbox.recv().await
    }

    pub async fn try_recv(&self) -> Option<Message> {
        self.inbox.pop().await
    }
}

/// Per-worker priority inboxes plus request/response correlation, broadcast
/// and publish/subscribe.
///
/// The router owns link liveness (heartbeat freshness); the registry owns
/// worker status. Cross-component reactions are wired by the coordinator.
pub struct CommunicationRouter {
    inboxes: Arc<RwLock<HashMap<String, Arc<WorkerInbox>>>>,
    links: Arc<RwLock<HashMap<String, LinkState>>>,
    pending: Arc<RwLock<HashMap<Uuid, oneshot::Sender<Reply>>>>,
    subscriptions: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    counters: Arc<RwLock<RouterCounters>>,
    config: RouterConfig,
}

impl CommunicationRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RwLock::new(RouterCounters::default())),
            config,
        }
    }

    /// Attach a worker: create its inbox and link state, returning the
    /// receiving handle.
    pub async fn attach(&self, worker_id: impl Into<String>) -> Result<Mailbox> {
        let worker_id = worker_id.into();
        let inbox = Arc::new(WorkerInbox::new());

        {
            let mut inboxes = self.inboxes.write().await;
            if inboxes.contains_key(&worker_id) {
                return Err(Error::CoordinationError(
                    CoordinationError::DuplicateRegistration(worker_id),
                ));
            }
            inboxes.insert(worker_id.clone(), inbox.clone());
        }

        self.links.write().await.insert(
            worker_id.clone(),
            LinkState {
                active: true,
                last_heartbeat: Utc::now(),
            },
        );

        info!("worker {} attached to router", worker_id);
        Ok(Mailbox { worker_id, inbox })
    }

    /// Detach a worker, dropping its inbox, link state and subscriptions.
    /// Idempotent.
    pub async fn detach(&self, worker_id: &str) -> bool {
        let existed = self.inboxes.write().await.remove(worker_id).is_some();
        self.links.write().await.remove(worker_id);

        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.retain(|_, subscribers| {
            subscribers.remove(worker_id);
            !subscribers.is_empty()
        });

        if existed {
            info!("worker {} detached from router", worker_id);
        }
        existed
    }

    pub async fn is_active(&self, worker_id: &str) -> bool {
        self.links
            .read()
            .await
            .get(worker_id)
            .map(|l| l.active)
            .unwrap_or(false)
    }

    /// Enqueue a message for its receiver.
    ///
    /// Fails if the receiver is unknown or its link is inactive, or if the
    /// inbox is full after the shedding policy has run.
    pub async fn send(&self, message: Message) -> Result<Uuid> {
        if !self.is_active(&message.receiver).await {
            self.counters.write().await.messages_failed += 1;
            return Err(Error::CoordinationError(
                CoordinationError::ReceiverUnavailable(message.receiver),
            ));
        }

        let inbox = self
            .inboxes
            .read()
            .await
            .get(&message.receiver)
            .cloned()
            .ok_or_else(|| {
                Error::CoordinationError(CoordinationError::ReceiverUnavailable(
                    message.receiver.clone(),
                ))
            })?;

        let message_id = message.id;
        let receiver = message.receiver.clone();
        let outcome = inbox
            .push(message, self.config.inbox_capacity, self.config.shed_floor)
            .await;

        match outcome {
            PushOutcome::Enqueued { shed } => {
                let mut counters = self.counters.write().await;
                counters.messages_sent += 1;
                counters.messages_shed += shed as u64;
                if shed > 0 {
                    warn!("shed {} low-priority messages for {}", shed, receiver);
                }
                Ok(message_id)
            }
            PushOutcome::Rejected => {
                self.counters.write().await.messages_failed += 1;
                Err(Error::CoordinationError(CoordinationError::QueueFull(receiver)))
            }
        }
    }

    /// Fire-and-forget Notification.
    pub async fn notify(
        &self,
        sender: &str,
        receiver: &str,
        method: &str,
        params: serde_json::Value,
        priority: MessagePriority,
    ) -> Result<Uuid> {
        self.send(Message::notification(sender, receiver, method, params).with_priority(priority))
            .await
    }

    /// Send a Request and suspend until it resolves or times out.
    ///
    /// The response handle is keyed by message id and resolves at most once;
    /// on timeout the handle is discarded and a late reply is dropped.
    pub async fn request(
        &self,
        sender: &str,
        receiver: &str,
        method: &str,
        params: serde_json::Value,
        priority: MessagePriority,
        timeout_secs: Option<u64>,
    ) -> Result<Reply> {
        let timeout_secs = timeout_secs.unwrap_or(self.config.default_timeout_secs);
        let message = Message::request(sender, receiver, method, params)
            .with_priority(priority)
            .with_timeout(timeout_secs);
        let message_id = message.id;

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(message_id, tx);

        if let Err(e) = self.send(message).await {
            self.pending.write().await.remove(&message_id);
            return Err(e);
        }

        let timeout = std::time::Duration::from_secs(timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                // Sender dropped without resolving; treat as delivery failure.
                self.pending.write().await.remove(&message_id);
                Err(Error::CoordinationError(
                    CoordinationError::MessageDeliveryError(format!(
                        "request {message_id} abandoned"
                    )),
                ))
            }
            Err(_) => {
                self.pending.write().await.remove(&message_id);
                self.counters.write().await.requests_timed_out += 1;
                debug!("request {} to {} timed out after {}s", message_id, receiver, timeout_secs);
                Err(Error::CoordinationError(CoordinationError::Timeout(timeout_secs)))
            }
        }
    }

    /// Resolve the pending request the given message answers.
    ///
    /// Returns `false` when no handle is waiting (already resolved, timed
    /// out, or never a request) — the reply is silently discarded.
    pub async fn respond(&self, original: &Message, reply: Reply) -> bool {
        let Some(tx) = self.pending.write().await.remove(&original.id) else {
            debug!("no pending handle for {}, reply discarded", original.id);
            return false;
        };
        tx.send(reply).is_ok()
    }

    /// Fan out independent sends to every active worker except the sender
    /// and the excluded set. Partial delivery is possible; the returned ids
    /// cover only the successful sends.
    pub async fn broadcast(
        &self,
        sender: &str,
        method: &str,
        params: serde_json::Value,
        priority: MessagePriority,
        exclude: &HashSet<String>,
    ) -> Vec<Uuid> {
        let targets: Vec<String> = {
            let links = self.links.read().await;
            links
                .iter()
                .filter(|(id, link)| {
                    link.active && id.as_str() != sender && !exclude.contains(*id)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut delivered = Vec::new();
        for target in targets {
            let mut message = Message::request(sender, &target, method, params.clone())
                .with_priority(priority);
            message.kind = MessageKind::Broadcast;

            match self.send(message).await {
                Ok(id) => delivered.push(id),
                Err(e) => warn!("broadcast to {} failed: {}", target, e),
            }
        }

        self.counters.write().await.broadcasts += 1;
        debug!("broadcast from {} reached {} workers", sender, delivered.len());
        delivered
    }

    pub async fn subscribe(&self, worker_id: &str, topic: &str) {
        self.subscriptions
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(worker_id.to_string());
        debug!("{} subscribed to {}", worker_id, topic);
    }

    pub async fn unsubscribe(&self, worker_id: &str, topic: &str) {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(subscribers) = subscriptions.get_mut(topic) {
            subscribers.remove(worker_id);
            if subscribers.is_empty() {
                subscriptions.remove(topic);
            }
        }
    }

    /// Deliver a Notification to every current subscriber except the
    /// publisher. The subscriber set is snapshotted up front, so concurrent
    /// (un)subscribes do not affect this publish.
    pub async fn publish(
        &self,
        publisher: &str,
        topic: &str,
        data: serde_json::Value,
        priority: MessagePriority,
    ) -> usize {
        let snapshot: Vec<String> = self
            .subscriptions
            .read()
            .await
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let method = format!("event.{topic}");
        let mut sent = 0;
        for subscriber in snapshot {
            if subscriber == publisher {
                continue;
            }
            match self
                .notify(publisher, &subscriber, &method, data.clone(), priority)
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => warn!("publish {} to {} failed: {}", topic, subscriber, e),
            }
        }

        self.counters.write().await.publishes += 1;
        sent
    }

    /// Refresh a link's heartbeat, recovering it if it was flagged inactive.
    pub async fn record_heartbeat(&self, worker_id: &str) -> bool {
        let mut links = self.links.write().await;
        let Some(link) = links.get_mut(worker_id) else {
            return false;
        };

        link.last_heartbeat = Utc::now();
        if !link.active {
            link.active = true;
            info!("link {} recovered", worker_id);
        }
        true
    }

    /// Flag links inactive when no heartbeat arrives within 3x the interval.
    pub fn start_heartbeat_monitor(self: Arc<Self>) -> JoinHandle<()> {
        let interval_secs = self.config.heartbeat_interval_secs;

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let cutoff = chrono::Duration::seconds(interval_secs as i64 * 3);

            loop {
                ticker.tick().await;
                let now = Utc::now();
                let mut links = self.links.write().await;
                for (worker_id, link) in links.iter_mut() {
                    if link.active && now - link.last_heartbeat > cutoff {
                        link.active = false;
                        warn!("link {} timed out, flagged inactive", worker_id);
                    }
                }
            }
        })
    }

    pub async fn get_stats(&self) -> RouterStats {
        let counters = self.counters.read().await.clone();
        let links = self.links.read().await;
        let active_links = links.values().filter(|l| l.active).count();
        let total_links = links.len();
        drop(links);

        let mut queue_depths = HashMap::new();
        for (worker_id, inbox) in self.inboxes.read().await.iter() {
            queue_depths.insert(worker_id.clone(), inbox.len().await);
        }

        RouterStats {
            messages_sent: counters.messages_sent,
            messages_failed: counters.messages_failed,
            messages_shed: counters.messages_shed,
            requests_timed_out: counters.requests_timed_out,
            broadcasts: counters.broadcasts,
            publishes: counters.publishes,
            pending_requests: self.pending.read().await.len(),
            active_links,
            total_links,
            queue_depths,
        }
    }

}

/// Router statistics for the monitoring surface.
#[derive(Debug, Clone)]
pub struct RouterStats {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub messages_shed: u64,
    pub requests_timed_out: u64,
    pub broadcasts: u64,
    pub publishes: u64,
    pub pending_requests: usize,
    pub active_links: usize,
    pub total_links: usize,
    pub queue_depths: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Arc<CommunicationRouter> {
        Arc::new(CommunicationRouter::new(RouterConfig::default()))
    }

    #[tokio::test]
    async fn test_send_to_unknown_receiver_fails() {
        let router = router();

        let err = router
            .notify("a", "ghost", "ping", serde_json::json!({}), MessagePriority::Normal)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::CoordinationError(CoordinationError::ReceiverUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let router = router();
        let _a = router.attach("a").await.unwrap();
        let b = router.attach("b").await.unwrap();

        let responder = {
            let router = router.clone();
            tokio::spawn(async move {
                let msg = b.recv().await;
                router
                    .respond(&msg, Reply::Success(serde_json::json!({"echo": msg.method})))
                    .await;
            })
        };

        let reply = router
            .request("a", "b", "build.compile", serde_json::json!({}), MessagePriority::Normal, Some(5))
            .await
            .unwrap();

        match reply {
            Reply::Success(value) => assert_eq!(value["echo"], "build.compile"),
            Reply::Failure(_) => panic!("expected success"),
        }
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_at_deadline() {
        let router = router();
        let _a = router.attach("a").await.unwrap();
        let _b = router.attach("b").await.unwrap();

        // "b" never responds.
        let started = tokio::time::Instant::now();
        let err = router
            .request("a", "b", "ping", serde_json::json!({}), MessagePriority::Normal, Some(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::CoordinationError(CoordinationError::Timeout(1))
        ));
        assert_eq!(started.elapsed().as_secs(), 1);
        // The handle is gone; a late reply is discarded.
        assert_eq!(router.get_stats().await.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_late_response_is_discarded() {
        let router = router();
        let _a = router.attach("a").await.unwrap();

        let orphan = Message::request("a", "b", "ping", serde_json::json!({}));
        assert!(!router.respond(&orphan, Reply::Success(serde_json::json!(null))).await);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_excluded() {
        let router = router();
        let _a = router.attach("a").await.unwrap();
        let b = router.attach("b").await.unwrap();
        let _c = router.attach("c").await.unwrap();

        let mut exclude = HashSet::new();
        exclude.insert("c".to_string());

        let ids = router
            .broadcast("a", "announce", serde_json::json!({}), MessagePriority::Normal, &exclude)
            .await;

        assert_eq!(ids.len(), 1);
        let msg = b.recv().await;
        assert_eq!(msg.kind, MessageKind::Broadcast);
        assert_eq!(msg.sender, "a");
    }

    #[tokio::test]
    async fn test_publish_uses_snapshot_and_skips_publisher() {
        let router = router();
        let _a = router.attach("a").await.unwrap();
        let b = router.attach("b").await.unwrap();

        router.subscribe("a", "deploys").await;
        router.subscribe("b", "deploys").await;

        let sent = router
            .publish("a", "deploys", serde_json::json!({"v": 2}), MessagePriority::Normal)
            .await;

        assert_eq!(sent, 1);
        let msg = b.recv().await;
        assert_eq!(msg.method, "event.deploys");
    }

    #[tokio::test]
    async fn test_inactive_link_rejects_sends_until_heartbeat() {
        let router = Arc::new(CommunicationRouter::new(RouterConfig {
            heartbeat_interval_secs: 1,
            ..Default::default()
        }));
        let _b = router.attach("b").await.unwrap();

        // Force the link inactive by hand, as the monitor loop would.
        router.links.write().await.get_mut("b").unwrap().active = false;

        let err = router
            .notify("a", "b", "ping", serde_json::json!({}), MessagePriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CoordinationError(CoordinationError::ReceiverUnavailable(_))
        ));

        // Recovery is automatic on the next heartbeat.
        assert!(router.record_heartbeat("b").await);
        assert!(router.is_active("b").await);
        router
            .notify("a", "b", "ping", serde_json::json!({}), MessagePriority::Normal)
            .await
            .unwrap();
    }
}
