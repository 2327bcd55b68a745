use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use orderflow_core::MessageId;

use super::{OutboundMessage, PublishError, QueueSink};

type RejectRule = Box<dyn Fn(&OutboundMessage) -> Option<PublishError> + Send + Sync>;

/// In-process queue that records every accepted message.
///
/// Failures can be scripted: a FIFO of one-shot errors, a predicate that
/// rejects matching messages, or a blanket "unavailable" switch.
pub struct InMemoryQueue {
    name: String,
    messages: Mutex<Vec<(MessageId, OutboundMessage)>>,
    scripted: Mutex<VecDeque<PublishError>>,
    reject: Mutex<Option<RejectRule>>,
    unavailable: AtomicBool,
    send_delay: Option<Duration>,
    sequence: AtomicU64,
    send_calls: AtomicU64,
    /// Messages already handed out by `receive`.
    received: AtomicUsize,
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            reject: Mutex::new(None),
            unavailable: AtomicBool::new(false),
            send_delay: None,
            sequence: AtomicU64::new(0),
            send_calls: AtomicU64::new(0),
            received: AtomicUsize::new(0),
        }
    }

    /// Simulated network latency per send.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    /// Fail the next send with `error`. Queued errors are used in order.
    pub fn push_failure(&self, error: PublishError) {
        lock(&self.scripted).push_back(error);
    }

    pub fn reject_if(&self, rule: impl Fn(&OutboundMessage) -> Option<PublishError> + Send + Sync + 'static) {
        *lock(&self.reject) = Some(Box::new(rule));
    }

    /// While unavailable every send fails with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<(MessageId, OutboundMessage)> {
        lock(&self.messages).clone()
    }

    /// Consume up to `max` messages not received yet, oldest first. Received
    /// messages stay visible through `messages`.
    pub fn receive(&self, max: usize) -> Vec<(MessageId, OutboundMessage)> {
        let messages = lock(&self.messages);
        let start = self.received.load(Ordering::SeqCst).min(messages.len());
        let end = start.saturating_add(max).min(messages.len());
        self.received.store(end, Ordering::SeqCst);
        messages[start..end].to_vec()
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of send calls, successful or not.
    pub fn send_calls(&self) -> u64 {
        self.send_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueSink for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: OutboundMessage) -> Result<MessageId, PublishError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PublishError::Transient(format!("queue {} unavailable", self.name)));
        }
        if let Some(error) = lock(&self.scripted).pop_front() {
            return Err(error);
        }
        if let Some(error) = lock(&self.reject).as_ref().and_then(|rule| rule(&message)) {
            return Err(error);
        }

        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = MessageId::new(format!("{}-{n}", self.name));
        lock(&self.messages).push((id.clone(), message));
        Ok(id)
    }
}
