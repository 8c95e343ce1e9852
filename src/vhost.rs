//! The virtual host: registry, queue stores and routing composed into the
//! publish / consume / ack / nack operations every session goes through.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::BrokerConfig;
use crate::error::lock;
use crate::message::{BasicProperties, DeliveryMode, IdGenerator, Message};
use crate::meta::{MetaStore, Metadata};
use crate::registry::{Arguments, Binding, DeadLetterConfig, Exchange, QueueMeta, Registry};
use crate::router::{match_headers, match_route, ExchangeType};
use crate::store::{CompactionReport, QueueStats, QueueStore};
use crate::{Error, Result};

/// Name of the implicit direct exchange every queue is bound to.
pub const DEFAULT_EXCHANGE: &str = "";
pub const X_DEATH_QUEUE: &str = "x-death-queue";
pub const X_DEATH_REASON: &str = "x-death-reason";

/// Result of routing one message through an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub id: String,
    /// Queues that received a copy, in binding order.
    pub routed: Vec<String>,
}

impl PublishOutcome {
    pub fn delivered(&self) -> bool {
        !self.routed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// `requeue` was set; the message was left alone.
    Ignored,
    /// No message with that id was still queued.
    Missing,
    Removed,
    DeadLettered(PublishOutcome),
}

/// Registry flags plus store health for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub args: Arguments,
    pub dead_letter: Option<DeadLetterConfig>,
    pub depth: usize,
    pub file_size: u64,
    pub invalid_ratio: f64,
}

pub struct VirtualHost {
    queues_dir: PathBuf,
    sync_writes: bool,
    registry: Registry,
    stores: Mutex<BTreeMap<String, Arc<QueueStore>>>,
    meta: MetaStore,
    // Serialises snapshot + save so concurrent changes cannot reorder writes.
    meta_lock: Mutex<()>,
    ids: IdGenerator,
    clock: Arc<dyn Clock>,
}

impl VirtualHost {
    /// Opens the host rooted at `config.data_dir`, restoring durable
    /// exchanges, queues and bindings and recovering every durable queue log.
    pub fn open(config: &BrokerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let queues_dir = config.queues_dir();
        std::fs::create_dir_all(&queues_dir)?;

        let host = Self {
            queues_dir,
            sync_writes: config.sync_writes,
            registry: Registry::new(),
            stores: Mutex::new(BTreeMap::new()),
            meta: MetaStore::new(&config.data_dir),
            meta_lock: Mutex::new(()),
            ids: IdGenerator::new(clock.now()),
            clock,
        };

        host.registry
            .declare_exchange(Exchange::new(DEFAULT_EXCHANGE, ExchangeType::Direct).durable(true))?;

        let snapshot = host.meta.load()?;
        for exchange in snapshot.exchanges {
            host.registry.declare_exchange(exchange)?;
        }
        for queue in snapshot.queues {
            host.create_queue(queue)?;
        }
        for binding in snapshot.bindings {
            let (exchange, queue) = (binding.exchange.clone(), binding.queue.clone());
            if let Err(err) = host.registry.bind(binding) {
                warn!("dropping persisted binding {exchange:?} -> {queue:?}: {err}");
            }
        }

        info!(
            "virtual host open at {} ({} exchanges, {} queues)",
            config.data_dir.display(),
            host.registry.exchanges().all()?.len(),
            host.registry.queues().all()?.len()
        );
        Ok(host)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn declare_exchange(&self, exchange: Exchange) -> Result<bool> {
        let durable = exchange.durable;
        let created = self.registry.declare_exchange(exchange)?;
        if created && durable {
            self.persist()?;
        }
        Ok(created)
    }

    /// Removes the exchange and its bindings. The default exchange is fixed.
    pub fn delete_exchange(&self, name: &str) -> Result<bool> {
        if name == DEFAULT_EXCHANGE {
            return Err(Error::DefaultExchange("deleted"));
        }
        let durable = self
            .registry
            .exchanges()
            .get(name)?
            .map(|e| e.durable)
            .unwrap_or(false);
        let removed = self.registry.delete_exchange(name)?;
        if removed && durable {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Declares the queue, its store and the default-exchange binding.
    /// Redeclaring leaves the existing queue untouched.
    pub fn declare_queue(&self, queue: QueueMeta) -> Result<bool> {
        if queue.name.is_empty() {
            return Err(Error::InvalidName(queue.name));
        }
        let durable = queue.durable;
        let created = self.create_queue(queue)?;
        if created && durable {
            self.persist()?;
        }
        Ok(created)
    }

    /// Registers the queue, then attaches its store and default binding.
    /// If either of those fails the registration is rolled back, so a later
    /// declare starts from scratch.
    fn create_queue(&self, queue: QueueMeta) -> Result<bool> {
        let name = queue.name.clone();
        let durable = queue.durable;
        if !self.registry.declare_queue(queue)? {
            return Ok(false);
        }
        if let Err(err) = self.attach_store(&name, durable) {
            error!("queue {name:?}: declare failed, rolling back: {err}");
            self.detach_queue(&name);
            return Err(err);
        }
        Ok(true)
    }

    fn attach_store(&self, name: &str, durable: bool) -> Result<()> {
        let store = Arc::new(QueueStore::new(&self.queues_dir, name, self.sync_writes));
        if durable {
            store.recovery()?;
        }
        lock(&self.stores, "queue stores")?.insert(name.to_string(), store);
        self.registry
            .bind(Binding::new(DEFAULT_EXCHANGE, name, name))
    }

    /// Drops a half-declared queue without touching its log.
    fn detach_queue(&self, name: &str) {
        if let Err(err) = self.registry.delete_queue(name) {
            warn!("queue {name:?}: rollback of registry entry failed: {err}");
        }
        match lock(&self.stores, "queue stores") {
            Ok(mut stores) => {
                stores.remove(name);
            }
            Err(err) => warn!("queue {name:?}: rollback of store failed: {err}"),
        }
    }

    /// Deletes the queue, destroys its log and strips it from every binding.
    pub fn delete_queue(&self, name: &str) -> Result<bool> {
        let removed = match self.registry.delete_queue(name)? {
            Some(meta) => meta,
            None => return Ok(false),
        };
        let store = lock(&self.stores, "queue stores")?.remove(name);
        if let Some(store) = store {
            store.destroy()?;
        }
        if removed.durable {
            self.persist()?;
        }
        Ok(true)
    }

    pub fn bind(&self, binding: Binding) -> Result<()> {
        let persist = self.is_durable_pair(&binding.exchange, &binding.queue)?;
        self.registry.bind(binding)?;
        if persist {
            self.persist()?;
        }
        Ok(())
    }

    pub fn unbind(&self, exchange: &str, queue: &str) -> Result<bool> {
        let removed = self.registry.unbind(exchange, queue)?;
        if removed && self.is_durable_pair(exchange, queue)? {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn exchange_exists(&self, name: &str) -> Result<bool> {
        self.registry.exchanges().exists(name)
    }

    pub fn queue_exists(&self, name: &str) -> Result<bool> {
        self.registry.queues().exists(name)
    }

    pub fn exchange(&self, name: &str) -> Result<Option<Arc<Exchange>>> {
        self.registry.exchanges().get(name)
    }

    pub fn queue(&self, name: &str) -> Result<Option<Arc<QueueMeta>>> {
        self.registry.queues().get(name)
    }

    pub fn exchanges(&self) -> Result<Vec<Arc<Exchange>>> {
        self.registry.exchanges().all()
    }

    pub fn queues(&self) -> Result<Vec<Arc<QueueMeta>>> {
        self.registry.queues().all()
    }

    pub fn bindings(&self, exchange: &str) -> Result<Vec<Arc<Binding>>> {
        self.registry.bindings().for_exchange(exchange)
    }

    /// Routes a message through `exchange` into every matching queue.
    ///
    /// All copies share one id. Routing misses are not errors; the outcome
    /// simply lists no queues.
    pub fn publish_to_exchange(
        &self,
        exchange: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<PublishOutcome> {
        let target = self
            .registry
            .exchanges()
            .get(exchange)?
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;
        let properties = self.stamp(properties);
        let mut outcome = PublishOutcome {
            id: properties.id.clone(),
            routed: Vec::new(),
        };

        let mut failure = None;
        for binding in self.registry.bindings().for_exchange(exchange)? {
            let hit = match target.kind {
                ExchangeType::Headers => match_headers(&properties.headers, &binding.args),
                kind => match_route(kind, &properties.routing_key, &binding.binding_key),
            };
            if !hit {
                continue;
            }
            match self.insert_into(&binding.queue, properties.clone(), body.to_vec()) {
                Ok(true) => outcome.routed.push(binding.queue.clone()),
                Ok(false) => {}
                Err(err) => {
                    error!(
                        "exchange {exchange:?}: insert into queue {:?} failed: {err}",
                        binding.queue
                    );
                    failure.get_or_insert(err);
                }
            }
        }

        if !outcome.delivered() {
            if let Some(err) = failure {
                return Err(err);
            }
            warn!(
                "exchange {exchange:?}: message {} with routing key {:?} not delivered",
                outcome.id, properties.routing_key
            );
        } else {
            debug!(
                "exchange {exchange:?}: message {} routed to {:?}",
                outcome.id, outcome.routed
            );
        }
        Ok(outcome)
    }

    /// Publishes straight into `queue` through the default exchange rules.
    pub fn basic_publish(
        &self,
        queue: &str,
        mut properties: BasicProperties,
        body: &[u8],
    ) -> Result<String> {
        let (meta, store) = self.lookup(queue)?;
        if properties.routing_key.is_empty() {
            properties.routing_key = queue.to_string();
        } else if properties.routing_key != queue {
            return Err(Error::RoutingKeyMismatch {
                queue: queue.to_string(),
                routing_key: properties.routing_key,
            });
        }
        let properties = self.stamp(properties);
        let id = store.insert(properties, body.to_vec(), meta.durable)?;
        debug!("queue {queue:?}: published {id}");
        Ok(id)
    }

    /// Removes and returns the head of `queue`. Delivery is at-most-once.
    pub fn basic_consume(&self, queue: &str) -> Result<Option<Message>> {
        let (_, store) = self.lookup(queue)?;
        store.pop_front()
    }

    /// Removes `id` if it is still queued. Unknown queues and ids are no-ops.
    pub fn basic_ack(&self, queue: &str, id: &str) -> Result<bool> {
        let store = match self.store(queue)? {
            Some(store) => store,
            None => return Ok(false),
        };
        Ok(store.remove(id)?.is_some())
    }

    /// Rejects a message that is still queued.
    ///
    /// With a dead-letter config the message is republished to the
    /// dead-letter exchange before it leaves the source queue; if that
    /// publish fails the message stays where it is.
    pub fn basic_nack(&self, queue: &str, id: &str, requeue: bool, reason: &str) -> Result<NackOutcome> {
        if requeue {
            return Ok(NackOutcome::Ignored);
        }
        let (meta, store) = match (self.registry.queues().get(queue)?, self.store(queue)?) {
            (Some(meta), Some(store)) => (meta, store),
            _ => return Ok(NackOutcome::Missing),
        };

        let config = match meta.dead_letter_config() {
            Some(config) => config,
            None => {
                return Ok(match store.remove(id)? {
                    Some(_) => NackOutcome::Removed,
                    None => NackOutcome::Missing,
                });
            }
        };

        let message = match store.find(id)? {
            Some(message) => message,
            None => return Ok(NackOutcome::Missing),
        };
        let mut properties = message.properties.clone();
        properties.id.clear();
        properties.timestamp_ns = 0;
        properties.routing_key = config.routing_key.clone();
        properties.delivery_mode = DeliveryMode::Persistent;
        properties
            .headers
            .insert(X_DEATH_QUEUE.to_string(), queue.to_string());
        properties
            .headers
            .insert(X_DEATH_REASON.to_string(), reason.to_string());

        let outcome = self.publish_to_exchange(&config.exchange, properties, &message.body)?;
        store.remove(id)?;
        info!(
            "queue {queue:?}: dead-lettered {id} to exchange {:?} as {}",
            config.exchange, outcome.id
        );
        Ok(NackOutcome::DeadLettered(outcome))
    }

    /// Pops the head of the first non-empty queue, scanning in name order.
    pub fn basic_query(&self) -> Result<Option<Message>> {
        let stores: Vec<_> = lock(&self.stores, "queue stores")?.values().cloned().collect();
        for store in stores {
            if let Some(message) = store.pop_front()? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    pub fn queue_depth(&self, queue: &str) -> Result<usize> {
        self.lookup(queue)?.1.len()
    }

    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.lookup(queue)?.1.stats()
    }

    pub fn compact_queue(&self, queue: &str) -> Result<CompactionReport> {
        self.lookup(queue)?.1.compact()
    }

    /// `None` when the queue does not exist.
    pub fn queue_status(&self, queue: &str) -> Result<Option<QueueStatus>> {
        let (meta, store) = match self.lookup(queue) {
            Ok(found) => found,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let stats = store.stats()?;
        Ok(Some(QueueStatus {
            name: meta.name.clone(),
            durable: meta.durable,
            exclusive: meta.exclusive,
            auto_delete: meta.auto_delete,
            args: meta.args.clone(),
            dead_letter: meta.dead_letter.clone(),
            depth: stats.depth,
            file_size: stats.file_size,
            invalid_ratio: stats.invalid_ratio,
        }))
    }

    fn store(&self, queue: &str) -> Result<Option<Arc<QueueStore>>> {
        Ok(lock(&self.stores, "queue stores")?.get(queue).cloned())
    }

    fn lookup(&self, queue: &str) -> Result<(Arc<QueueMeta>, Arc<QueueStore>)> {
        let meta = self.registry.queues().get(queue)?;
        let store = self.store(queue)?;
        match (meta, store) {
            (Some(meta), Some(store)) => Ok((meta, store)),
            _ => Err(Error::QueueNotFound(queue.to_string())),
        }
    }

    /// Returns false when the queue vanished between routing and insert.
    fn insert_into(&self, queue: &str, properties: BasicProperties, body: Vec<u8>) -> Result<bool> {
        match self.lookup(queue) {
            Ok((meta, store)) => {
                store.insert(properties, body, meta.durable)?;
                Ok(true)
            }
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn stamp(&self, mut properties: BasicProperties) -> BasicProperties {
        if properties.id.is_empty() {
            properties.id = self.ids.next_id();
        }
        if properties.timestamp_ns == 0 {
            properties.timestamp_ns = self.clock.now();
        }
        properties
    }

    fn is_durable_pair(&self, exchange: &str, queue: &str) -> Result<bool> {
        let exchange = self.registry.exchanges().get(exchange)?;
        let queue = self.registry.queues().get(queue)?;
        Ok(matches!((exchange, queue), (Some(e), Some(q)) if e.durable && q.durable))
    }

    /// Durable exchanges (minus the default), durable queues, and bindings
    /// between durable entities. Default-exchange bindings are recreated on
    /// declare and are not stored.
    fn snapshot(&self) -> Result<Metadata> {
        let exchanges: Vec<Exchange> = self
            .registry
            .exchanges()
            .all()?
            .into_iter()
            .filter(|e| e.durable && e.name != DEFAULT_EXCHANGE)
            .map(|e| e.as_ref().clone())
            .collect();
        let queues: Vec<QueueMeta> = self
            .registry
            .queues()
            .all()?
            .into_iter()
            .filter(|q| q.durable)
            .map(|q| q.as_ref().clone())
            .collect();

        let durable_exchanges: HashSet<&str> = exchanges.iter().map(|e| e.name.as_str()).collect();
        let durable_queues: HashSet<&str> = queues.iter().map(|q| q.name.as_str()).collect();
        let bindings = self
            .registry
            .bindings()
            .all()?
            .into_iter()
            .filter(|b| {
                durable_exchanges.contains(b.exchange.as_str())
                    && durable_queues.contains(b.queue.as_str())
            })
            .map(|b| b.as_ref().clone())
            .collect();

        Ok(Metadata {
            exchanges,
            queues,
            bindings,
        })
    }

    fn persist(&self) -> Result<()> {
        let _guard = lock(&self.meta_lock, "metadata")?;
        let snapshot = self.snapshot()?;
        self.meta.save(&snapshot).map_err(|err| {
            error!("failed to save metadata to {}: {err}", self.meta.path().display());
            err
        })
    }
}
