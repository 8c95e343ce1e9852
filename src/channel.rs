//! Logical channels: turn requests into virtual host calls and push
//! deliveries back through the session's response sink.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::consumer::{Consumer, ConsumerRegistry, DeliveryCallback};
use crate::error::lock;
use crate::message::BasicProperties;
use crate::pool::WorkerPool;
use crate::protocol::{ChannelId, Request, Response, ResponseSink};
use crate::registry::{Binding, Exchange, QueueMeta};
use crate::vhost::{NackOutcome, VirtualHost};
use crate::{Error, Result};

/// Shared broker state a session works against.
#[derive(Clone)]
pub struct SessionContext {
    pub host: Arc<VirtualHost>,
    pub consumers: Arc<ConsumerRegistry>,
    pub pool: Arc<WorkerPool>,
}

impl SessionContext {
    /// Declares the queue in the host and gives it a consumer list.
    pub fn declare_queue(&self, queue: QueueMeta) -> Result<bool> {
        let name = queue.name.clone();
        let created = self.host.declare_queue(queue)?;
        self.consumers.init_queue(&name)?;
        Ok(created)
    }

    /// Drops the consumer list first so no new dispatch picks a consumer of
    /// a queue that is going away.
    pub fn delete_queue(&self, name: &str) -> Result<bool> {
        self.consumers.destroy_queue(name)?;
        self.host.delete_queue(name)
    }

    /// Queues one dispatch task per routed queue.
    pub fn schedule_dispatch(&self, queue: &str, count: usize) {
        for _ in 0..count {
            let host = Arc::clone(&self.host);
            let consumers = Arc::clone(&self.consumers);
            let queue_name = queue.to_string();
            let submitted = self.pool.submit(move || {
                if let Err(err) = dispatch(&host, &consumers, &queue_name) {
                    warn!("dispatch on queue {queue_name:?} failed: {err}");
                }
            });
            if let Err(err) = submitted {
                warn!("could not schedule dispatch for queue {queue:?}: {err}");
                return;
            }
        }
    }

    /// Unregisters a consumer and deletes an auto-delete queue once its
    /// last consumer is gone.
    fn release_consumer(&self, tag: &str, queue: &str) -> Result<()> {
        let remaining = self.consumers.remove(tag, queue)?;
        if remaining != Some(0) {
            return Ok(());
        }
        let auto_delete = self
            .host
            .queue(queue)?
            .map(|meta| meta.auto_delete)
            .unwrap_or(false);
        if !auto_delete {
            return Ok(());
        }
        // A subscribe may have landed since the removal above.
        if !self.consumers.retire_if_idle(queue)? {
            debug!("queue {queue:?}: new consumer arrived, keeping auto-delete queue");
            return Ok(());
        }
        info!("queue {queue:?}: last consumer gone, auto-deleting");
        self.host.delete_queue(queue)?;
        Ok(())
    }
}

/// Delivers the head of `queue` to the next consumer in rotation.
///
/// Leaves the message queued when nobody is subscribed. A consumer that
/// disappears between the pop and the pick loses the message, matching the
/// at-most-once consume model.
pub fn dispatch(host: &VirtualHost, consumers: &ConsumerRegistry, queue: &str) -> Result<bool> {
    if consumers.count(queue)? == 0 {
        debug!("queue {queue:?}: no consumers, leaving message queued");
        return Ok(false);
    }
    let message = match host.basic_consume(queue)? {
        Some(message) => message,
        None => return Ok(false),
    };
    let consumer = match consumers.choose(queue)? {
        Some(consumer) => consumer,
        None => {
            warn!(
                "queue {queue:?}: consumer vanished, dropping message {}",
                message.id()
            );
            return Ok(false);
        }
    };
    debug!(
        "queue {queue:?}: delivering {} to {:?}",
        message.id(),
        consumer.tag
    );
    consumer.deliver(&message.properties, &message.body);
    if consumer.auto_ack {
        host.basic_ack(queue, message.id())?;
    }
    Ok(true)
}

pub struct Channel {
    id: ChannelId,
    ctx: SessionContext,
    sink: Arc<dyn ResponseSink>,
    consumer: Mutex<Option<Arc<Consumer>>>,
}

impl Channel {
    pub fn new(id: impl Into<ChannelId>, ctx: SessionContext, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            id: id.into(),
            ctx,
            sink,
            consumer: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tag of the channel's subscription, if any.
    pub fn consumer_tag(&self) -> Option<String> {
        self.consumer
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|c| c.tag.clone()))
    }

    /// Runs one request and sends its reply. Failures become negative
    /// common responses; nothing here is fatal to the session.
    pub fn handle(&self, request: Request) {
        let rid = request.rid().to_string();
        let reply = match request {
            Request::DeclareExchange { exchange, .. } => self.common(&rid, self.declare_exchange(exchange)),
            Request::DeleteExchange { name, .. } => {
                self.common(&rid, self.ctx.host.delete_exchange(&name).map(|_| ()))
            }
            Request::DeclareQueue { queue, .. } => {
                self.common(&rid, self.ctx.declare_queue(queue).map(|_| ()))
            }
            Request::DeleteQueue { name, .. } => self.common(&rid, self.ctx.delete_queue(&name).map(|_| ())),
            Request::Bind { binding, .. } => self.common(&rid, self.bind(binding)),
            Request::Unbind { exchange, queue, .. } => {
                self.common(&rid, self.ctx.host.unbind(&exchange, &queue).map(|_| ()))
            }
            Request::Publish {
                exchange,
                properties,
                body,
                ..
            } => self.common(&rid, self.publish(&exchange, properties, &body)),
            Request::Ack {
                queue, message_id, ..
            } => self.common(&rid, self.ctx.host.basic_ack(&queue, &message_id).map(|_| ())),
            Request::Nack {
                queue,
                message_id,
                requeue,
                reason,
                ..
            } => self.common(&rid, self.nack(&queue, &message_id, requeue, &reason)),
            Request::Consume {
                queue,
                consumer_tag,
                auto_ack,
                ..
            } => self.common(&rid, self.subscribe(&queue, &consumer_tag, auto_ack)),
            Request::Cancel {
                queue, consumer_tag, ..
            } => self.common(&rid, self.cancel(&queue, &consumer_tag)),
            Request::Query { .. } => match self.ctx.host.basic_query() {
                Ok(message) => Response::Query {
                    rid,
                    cid: self.id.clone(),
                    body: message.map(|m| m.body),
                },
                Err(err) => self.common(&rid, Err(err)),
            },
            Request::QueueStatus { queue, .. } => match self.ctx.host.queue_status(&queue) {
                Ok(status) => Response::QueueStatus {
                    rid,
                    cid: self.id.clone(),
                    status,
                },
                Err(err) => self.common(&rid, Err(err)),
            },
            Request::OpenChannel { .. } | Request::CloseChannel { .. } | Request::Heartbeat { .. } => {
                warn!("channel {}: connection-level request routed to channel", self.id);
                Response::common(&rid, &self.id, false)
            }
        };
        self.send(reply);
    }

    fn common(&self, rid: &str, result: Result<()>) -> Response {
        if let Err(err) = &result {
            warn!("channel {} request {rid}: {err}", self.id);
        }
        Response::common(rid, &self.id, result.is_ok())
    }

    fn send(&self, response: Response) {
        if let Err(err) = self.sink.send(response) {
            warn!("channel {}: failed to send response: {err}", self.id);
        }
    }

    fn declare_exchange(&self, exchange: Exchange) -> Result<()> {
        self.ctx.host.declare_exchange(exchange).map(|_| ())
    }

    fn bind(&self, binding: Binding) -> Result<()> {
        self.ctx.host.bind(binding)
    }

    /// Routes the message and schedules one dispatch per receiving queue.
    /// A publish nobody receives still succeeds.
    pub fn publish(&self, exchange: &str, properties: BasicProperties, body: &[u8]) -> Result<()> {
        let outcome = self.ctx.host.publish_to_exchange(exchange, properties, body)?;
        for queue in &outcome.routed {
            self.ctx.schedule_dispatch(queue, 1);
        }
        Ok(())
    }

    fn nack(&self, queue: &str, message_id: &str, requeue: bool, reason: &str) -> Result<()> {
        if let NackOutcome::DeadLettered(outcome) =
            self.ctx.host.basic_nack(queue, message_id, requeue, reason)?
        {
            for target in &outcome.routed {
                self.ctx.schedule_dispatch(target, 1);
            }
        }
        Ok(())
    }

    /// Registers this channel's single consumer and schedules delivery of
    /// anything already waiting on the queue.
    pub fn subscribe(&self, queue: &str, tag: &str, auto_ack: bool) -> Result<()> {
        if !self.ctx.host.queue_exists(queue)? {
            return Err(Error::QueueNotFound(queue.to_string()));
        }
        let mut slot = lock(&self.consumer, "channel consumer")?;
        if slot.is_some() {
            return Err(Error::ChannelBusy(self.id.clone()));
        }

        let sink = Arc::clone(&self.sink);
        let cid = self.id.clone();
        let callback: DeliveryCallback = Arc::new(move |tag, properties, body| {
            let delivery = Response::Deliver {
                cid: cid.clone(),
                consumer_tag: tag.to_string(),
                properties: properties.clone(),
                body: body.to_vec(),
            };
            if let Err(err) = sink.send(delivery) {
                warn!("channel {cid}: delivery to {tag:?} failed: {err}");
            }
        });
        let consumer = self.ctx.consumers.create(tag, queue, auto_ack, callback)?;
        *slot = Some(consumer);
        drop(slot);

        let backlog = self.ctx.host.queue_depth(queue)?;
        self.ctx.schedule_dispatch(queue, backlog);
        Ok(())
    }

    pub fn cancel(&self, queue: &str, tag: &str) -> Result<()> {
        {
            let mut slot = lock(&self.consumer, "channel consumer")?;
            if slot
                .as_ref()
                .map(|c| c.tag == tag && c.queue == queue)
                .unwrap_or(false)
            {
                *slot = None;
            }
        }
        self.ctx.release_consumer(tag, queue)
    }

    /// Releases the channel's consumer. Safe to call more than once.
    pub fn close(&self) {
        let consumer = match self.consumer.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(consumer) = consumer {
            if let Err(err) = self.ctx.release_consumer(&consumer.tag, &consumer.queue) {
                warn!(
                    "channel {}: releasing consumer {:?} failed: {err}",
                    self.id, consumer.tag
                );
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BrokerConfig;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct Recorder {
        responses: Mutex<Vec<Response>>,
    }

    impl ResponseSink for Recorder {
        fn send(&self, response: Response) -> Result<()> {
            self.responses.lock().unwrap().push(response);
            Ok(())
        }

        fn shutdown(&self) {}
    }

    fn context() -> (TempDir, SessionContext) {
        let dir = tempdir().unwrap();
        let host = VirtualHost::open(
            &BrokerConfig::with_data_dir(dir.path()),
            Arc::new(ManualClock::new(1)),
        )
        .unwrap();
        let ctx = SessionContext {
            host: Arc::new(host),
            consumers: Arc::new(ConsumerRegistry::new()),
            pool: Arc::new(WorkerPool::new(1).unwrap()),
        };
        (dir, ctx)
    }

    #[test]
    fn dispatch_leaves_message_without_consumers() {
        let (_dir, ctx) = context();
        ctx.declare_queue(QueueMeta::new("q")).unwrap();
        ctx.host
            .basic_publish("q", BasicProperties::default(), b"a")
            .unwrap();
        assert!(!dispatch(&ctx.host, &ctx.consumers, "q").unwrap());
        assert_eq!(ctx.host.queue_depth("q").unwrap(), 1);
    }

    #[test]
    fn second_subscription_on_channel_is_busy() {
        let (_dir, ctx) = context();
        ctx.declare_queue(QueueMeta::new("q")).unwrap();
        let channel = Channel::new("c1", ctx.clone(), Arc::new(Recorder::default()));
        channel.subscribe("q", "t1", true).unwrap();
        assert!(matches!(
            channel.subscribe("q", "t2", true),
            Err(Error::ChannelBusy(_))
        ));
        assert!(matches!(
            channel.subscribe("missing", "t3", true),
            Err(Error::QueueNotFound(_))
        ));
        assert_eq!(channel.consumer_tag().as_deref(), Some("t1"));
    }

    #[test]
    fn closing_channel_unregisters_consumer() {
        let (_dir, ctx) = context();
        ctx.declare_queue(QueueMeta::new("q")).unwrap();
        let channel = Channel::new("c1", ctx.clone(), Arc::new(Recorder::default()));
        channel.subscribe("q", "t1", true).unwrap();
        assert_eq!(ctx.consumers.count("q").unwrap(), 1);
        drop(channel);
        assert_eq!(ctx.consumers.count("q").unwrap(), 0);
    }

    #[test]
    fn auto_delete_queue_goes_with_last_consumer() {
        let (_dir, ctx) = context();
        ctx.declare_queue(QueueMeta::new("tmp").auto_delete(true))
            .unwrap();
        let channel = Channel::new("c1", ctx.clone(), Arc::new(Recorder::default()));
        channel.subscribe("tmp", "t1", false).unwrap();
        channel.cancel("tmp", "t1").unwrap();
        assert!(!ctx.host.queue_exists("tmp").unwrap());
        assert!(channel.consumer_tag().is_none());
    }

    #[test]
    fn auto_delete_queue_stays_while_a_consumer_remains() {
        let (_dir, ctx) = context();
        ctx.declare_queue(QueueMeta::new("tmp").auto_delete(true))
            .unwrap();
        let first = Channel::new("c1", ctx.clone(), Arc::new(Recorder::default()));
        let second = Channel::new("c2", ctx.clone(), Arc::new(Recorder::default()));
        first.subscribe("tmp", "t1", false).unwrap();
        second.subscribe("tmp", "t2", false).unwrap();

        first.cancel("tmp", "t1").unwrap();
        assert!(ctx.host.queue_exists("tmp").unwrap());
        assert_eq!(ctx.consumers.count("tmp").unwrap(), 1);

        second.cancel("tmp", "t2").unwrap();
        assert!(!ctx.host.queue_exists("tmp").unwrap());
        assert!(matches!(
            first.subscribe("tmp", "late", false),
            Err(Error::QueueNotFound(_))
        ));
    }

    #[test]
    fn failures_become_negative_responses() {
        let (_dir, ctx) = context();
        let recorder = Arc::new(Recorder::default());
        let channel = Channel::new("c1", ctx, recorder.clone());
        channel.handle(Request::Publish {
            rid: "r1".into(),
            cid: "c1".into(),
            exchange: "missing".into(),
            properties: BasicProperties::default(),
            body: b"x".to_vec(),
        });
        channel.handle(Request::Query {
            rid: "r2".into(),
            cid: "c1".into(),
        });
        let responses = recorder.responses.lock().unwrap();
        assert_eq!(responses[0], Response::common("r1", "c1", false));
        assert_eq!(
            responses[1],
            Response::Query {
                rid: "r2".into(),
                cid: "c1".into(),
                body: None,
            }
        );
    }
}
