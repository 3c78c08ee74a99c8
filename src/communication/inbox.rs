use std::collections::VecDeque;

use tokio::sync::{Notify, RwLock};

use crate::communication::message::{Message, MessagePriority};

/// Outcome of enqueueing a message.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued; carries the number of Low-priority messages shed to make room.
    Enqueued { shed: usize },
    /// Inbox full and the message's priority does not permit shedding,
    /// or shedding could not free enough room.
    Rejected,
}

/// One worker's inbox: five bounded FIFO queues, one per priority level.
///
/// The capacity bounds the whole inbox, so evicting Low traffic genuinely
/// frees room for higher-priority arrivals.
pub struct WorkerInbox {
    queues: RwLock<[VecDeque<Message>; MessagePriority::LEVELS]>,
    notify: Notify,
}

impl WorkerInbox {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(std::array::from_fn(|_| VecDeque::new())),
            notify: Notify::new(),
        }
    }

    /// Enqueue under the backpressure policy.
    ///
    /// When the inbox is full, messages at or above `shed_floor` evict
    /// queued Low-priority messages; everything else is rejected outright.
    pub async fn push(
        &self,
        message: Message,
        capacity: usize,
        shed_floor: MessagePriority,
    ) -> PushOutcome {
        let mut queues = self.queues.write().await;
        let total: usize = queues.iter().map(|q| q.len()).sum();

        let mut shed = 0;
        if total >= capacity {
            if message.priority >= shed_floor && message.priority > MessagePriority::Low {
                let low = &mut queues[MessagePriority::Low.index()];
                while total - shed >= capacity {
                    if low.pop_front().is_none() {
                        break;
                    }
                    shed += 1;
                }
            }
            if total - shed >= capacity {
                return PushOutcome::Rejected;
            }
        }

        queues[message.priority.index()].push_back(message);
        drop(queues);

        self.notify.notify_one();
        PushOutcome::Enqueued { shed }
    }

    /// Dequeue the next message, draining priorities high to low with FIFO
    /// order inside each level.
    pub async fn pop(&self) -> Option<Message> {
        let mut queues = self.queues.write().await;
        for priority in MessagePriority::descending() {
            if let Some(message) = queues[priority.index()].pop_front() {
                return Some(message);
            }
        }
        None
    }

    /// Suspend until a message is available, then dequeue it.
    pub async fn recv(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.pop().await {
                return message;
            }
            notified.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.queues.read().await.iter().map(|q| q.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for WorkerInbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(priority: MessagePriority, tag: &str) -> Message {
        Message::notification("s", "r", tag, serde_json::json!({})).with_priority(priority)
    }

    #[tokio::test]
    async fn test_priority_drain_order() {
        let inbox = WorkerInbox::new();

        inbox.push(msg(MessagePriority::Low, "low-1"), 10, MessagePriority::High).await;
        inbox.push(msg(MessagePriority::Critical, "crit"), 10, MessagePriority::High).await;
        inbox.push(msg(MessagePriority::Low, "low-2"), 10, MessagePriority::High).await;
        inbox.push(msg(MessagePriority::Normal, "norm"), 10, MessagePriority::High).await;

        assert_eq!(inbox.pop().await.unwrap().method, "crit");
        assert_eq!(inbox.pop().await.unwrap().method, "norm");
        // FIFO within a level.
        assert_eq!(inbox.pop().await.unwrap().method, "low-1");
        assert_eq!(inbox.pop().await.unwrap().method, "low-2");
        assert!(inbox.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_high_priority_sheds_low_backlog() {
        let inbox = WorkerInbox::new();

        for i in 0..3 {
            let outcome = inbox
                .push(msg(MessagePriority::Low, &format!("low-{i}")), 3, MessagePriority::High)
                .await;
            assert_eq!(outcome, PushOutcome::Enqueued { shed: 0 });
        }

        // Low overflow hard-errors without shedding peers.
        let outcome = inbox
            .push(msg(MessagePriority::Low, "low-x"), 3, MessagePriority::High)
            .await;
        assert_eq!(outcome, PushOutcome::Rejected);

        // Normal sits below the shed floor: also a hard error.
        let outcome = inbox
            .push(msg(MessagePriority::Normal, "norm"), 3, MessagePriority::High)
            .await;
        assert_eq!(outcome, PushOutcome::Rejected);

        // High evicts one queued Low message.
        let outcome = inbox
            .push(msg(MessagePriority::High, "high"), 3, MessagePriority::High)
            .await;
        assert_eq!(outcome, PushOutcome::Enqueued { shed: 1 });
        assert_eq!(inbox.pop().await.unwrap().method, "high");
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let inbox = std::sync::Arc::new(WorkerInbox::new());

        let receiver = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.recv().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        inbox.push(msg(MessagePriority::Normal, "wake"), 10, MessagePriority::High).await;

        let received = receiver.await.unwrap();
        assert_eq!(received.method, "wake");
    }
}
