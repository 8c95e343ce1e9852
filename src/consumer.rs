//! Per-queue consumer lists with round-robin selection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::lock;
use crate::message::BasicProperties;
use crate::{Error, Result};

/// Invoked with `(consumer tag, properties, body)` for every delivery.
pub type DeliveryCallback = Arc<dyn Fn(&str, &BasicProperties, &[u8]) + Send + Sync>;

pub struct Consumer {
    pub tag: String,
    pub queue: String,
    pub auto_ack: bool,
    callback: DeliveryCallback,
}

impl Consumer {
    pub fn deliver(&self, properties: &BasicProperties, body: &[u8]) {
        (self.callback)(&self.tag, properties, body);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .finish()
    }
}

/// Consumers of one queue in registration order, plus the rotating index.
/// Both sit under the same lock. A retired list has been unlinked from the
/// registry and refuses new consumers.
#[derive(Default)]
struct QueueConsumers {
    consumers: Vec<Arc<Consumer>>,
    next: usize,
    retired: bool,
}

impl QueueConsumers {
    fn choose(&mut self) -> Option<Arc<Consumer>> {
        if self.consumers.is_empty() {
            return None;
        }
        let index = self.next % self.consumers.len();
        self.next = (index + 1) % self.consumers.len();
        Some(Arc::clone(&self.consumers[index]))
    }

    fn remove(&mut self, tag: &str) -> Option<Arc<Consumer>> {
        let index = self.consumers.iter().position(|c| c.tag == tag)?;
        let removed = self.consumers.remove(index);
        if self.consumers.is_empty() {
            self.next = 0;
        } else {
            if index < self.next {
                self.next -= 1;
            }
            self.next %= self.consumers.len();
        }
        Some(removed)
    }
}

/// queue name → consumer list. The outer map and each list have their own
/// locks, so registration on one queue never blocks dispatch on another.
#[derive(Default)]
pub struct ConsumerRegistry {
    queues: Mutex<HashMap<String, Arc<Mutex<QueueConsumers>>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty list for `queue`; existing lists are kept.
    pub fn init_queue(&self, queue: &str) -> Result<()> {
        lock(&self.queues, "consumer registry")?
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    /// Drops the list and every consumer on it.
    pub fn destroy_queue(&self, queue: &str) -> Result<Vec<Arc<Consumer>>> {
        let list = match lock(&self.queues, "consumer registry")?.remove(queue) {
            Some(list) => list,
            None => return Ok(Vec::new()),
        };
        let mut list = lock(&list, "consumer list")?;
        let dropped = std::mem::take(&mut list.consumers);
        list.next = 0;
        list.retired = true;
        Ok(dropped)
    }

    /// Unlinks the list of `queue` only if it is still empty, checked and
    /// retired under the list lock. Returns false when a consumer is present
    /// or the queue has no list.
    pub fn retire_if_idle(&self, queue: &str) -> Result<bool> {
        let mut queues = lock(&self.queues, "consumer registry")?;
        let list = match queues.get(queue) {
            Some(list) => Arc::clone(list),
            None => return Ok(false),
        };
        let mut list = lock(&list, "consumer list")?;
        if !list.consumers.is_empty() {
            return Ok(false);
        }
        list.retired = true;
        queues.remove(queue);
        Ok(true)
    }

    fn list(&self, queue: &str) -> Result<Option<Arc<Mutex<QueueConsumers>>>> {
        Ok(lock(&self.queues, "consumer registry")?.get(queue).cloned())
    }

    pub fn create(
        &self,
        tag: &str,
        queue: &str,
        auto_ack: bool,
        callback: DeliveryCallback,
    ) -> Result<Arc<Consumer>> {
        let list = self
            .list(queue)?
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        self.register(&list, tag, queue, auto_ack, callback)
    }

    fn register(
        &self,
        list: &Mutex<QueueConsumers>,
        tag: &str,
        queue: &str,
        auto_ack: bool,
        callback: DeliveryCallback,
    ) -> Result<Arc<Consumer>> {
        let mut list = lock(list, "consumer list")?;
        if list.retired {
            return Err(Error::QueueNotFound(queue.to_string()));
        }
        if list.consumers.iter().any(|c| c.tag == tag) {
            warn!("queue {queue:?}: duplicate consumer tag {tag:?}");
            return Err(Error::DuplicateConsumer {
                queue: queue.to_string(),
                tag: tag.to_string(),
            });
        }
        let consumer = Arc::new(Consumer {
            tag: tag.to_string(),
            queue: queue.to_string(),
            auto_ack,
            callback,
        });
        list.consumers.push(Arc::clone(&consumer));
        debug!(
            "queue {queue:?}: consumer {tag:?} registered ({} total)",
            list.consumers.len()
        );
        Ok(consumer)
    }

    /// Removes a consumer; returns the number left on the queue, or `None`
    /// if nothing was removed.
    pub fn remove(&self, tag: &str, queue: &str) -> Result<Option<usize>> {
        let list = match self.list(queue)? {
            Some(list) => list,
            None => return Ok(None),
        };
        let mut list = lock(&list, "consumer list")?;
        Ok(list.remove(tag).map(|_| list.consumers.len()))
    }

    /// Next consumer of `queue` in round-robin order.
    pub fn choose(&self, queue: &str) -> Result<Option<Arc<Consumer>>> {
        let list = match self.list(queue)? {
            Some(list) => list,
            None => return Ok(None),
        };
        let mut list = lock(&list, "consumer list")?;
        Ok(list.choose())
    }

    pub fn count(&self, queue: &str) -> Result<usize> {
        let list = match self.list(queue)? {
            Some(list) => list,
            None => return Ok(0),
        };
        let count = lock(&list, "consumer list")?.consumers.len();
        Ok(count)
    }
}
