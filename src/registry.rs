//! Name-keyed tables for exchanges, queues and bindings.
//!
//! Each table sits behind its own lock; no operation holds two table locks
//! at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::lock;
use crate::router::ExchangeType;
use crate::{Error, Result};

pub type Arguments = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeType,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub args: Arguments,
}

impl Exchange {
    pub fn new(name: impl Into<String>, kind: ExchangeType) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            args: Arguments::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

/// Where a queue sends messages it rejects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    pub exchange: String,
    pub routing_key: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl DeadLetterConfig {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMeta {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub args: Arguments,
    #[serde(default)]
    pub dead_letter: Option<DeadLetterConfig>,
}

impl QueueMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            args: Arguments::new(),
            dead_letter: None,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn dead_letter(mut self, config: DeadLetterConfig) -> Self {
        self.dead_letter = Some(config);
        self
    }

    /// An empty exchange name means "no dead-lettering".
    pub fn dead_letter_config(&self) -> Option<&DeadLetterConfig> {
        self.dead_letter
            .as_ref()
            .filter(|config| !config.exchange.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    #[serde(default)]
    pub binding_key: String,
    /// Header predicates (plus `x-match`) for headers exchanges.
    #[serde(default)]
    pub args: Arguments,
}

impl Binding {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>, binding_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            binding_key: binding_key.into(),
            args: Arguments::new(),
        }
    }

    pub fn with_args(mut self, args: Arguments) -> Self {
        self.args = args;
        self
    }
}

#[derive(Default)]
pub struct ExchangeTable {
    exchanges: Mutex<HashMap<String, Arc<Exchange>>>,
}

impl ExchangeTable {
    /// Inserts the exchange unless the name is taken. Returns whether it was
    /// created; an existing entry is left exactly as it was.
    pub fn declare(&self, exchange: Exchange) -> Result<bool> {
        let mut exchanges = lock(&self.exchanges, "exchange table")?;
        if exchanges.contains_key(&exchange.name) {
            return Ok(false);
        }
        exchanges.insert(exchange.name.clone(), Arc::new(exchange));
        Ok(true)
    }

    pub fn remove(&self, name: &str) -> Result<Option<Arc<Exchange>>> {
        Ok(lock(&self.exchanges, "exchange table")?.remove(name))
    }

    pub fn get(&self, name: &str) -> Result<Option<Arc<Exchange>>> {
        Ok(lock(&self.exchanges, "exchange table")?.get(name).cloned())
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.exchanges, "exchange table")?.contains_key(name))
    }

    pub fn all(&self) -> Result<Vec<Arc<Exchange>>> {
        let mut all: Vec<_> = lock(&self.exchanges, "exchange table")?
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

#[derive(Default)]
pub struct QueueTable {
    queues: Mutex<HashMap<String, Arc<QueueMeta>>>,
}

impl QueueTable {
    pub fn declare(&self, queue: QueueMeta) -> Result<bool> {
        let mut queues = lock(&self.queues, "queue table")?;
        if queues.contains_key(&queue.name) {
            return Ok(false);
        }
        queues.insert(queue.name.clone(), Arc::new(queue));
        Ok(true)
    }

    pub fn remove(&self, name: &str) -> Result<Option<Arc<QueueMeta>>> {
        Ok(lock(&self.queues, "queue table")?.remove(name))
    }

    pub fn get(&self, name: &str) -> Result<Option<Arc<QueueMeta>>> {
        Ok(lock(&self.queues, "queue table")?.get(name).cloned())
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.queues, "queue table")?.contains_key(name))
    }

    pub fn all(&self) -> Result<Vec<Arc<QueueMeta>>> {
        let mut all: Vec<_> = lock(&self.queues, "queue table")?
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

/// exchange → (queue → binding). At most one binding per queue per exchange.
#[derive(Default)]
pub struct BindingTable {
    bindings: Mutex<HashMap<String, BTreeMap<String, Arc<Binding>>>>,
}

impl BindingTable {
    /// Inserts or replaces the binding for `(exchange, queue)`.
    pub fn insert(&self, binding: Binding) -> Result<()> {
        let mut bindings = lock(&self.bindings, "binding table")?;
        bindings
            .entry(binding.exchange.clone())
            .or_default()
            .insert(binding.queue.clone(), Arc::new(binding));
        Ok(())
    }

    pub fn remove(&self, exchange: &str, queue: &str) -> Result<bool> {
        let mut bindings = lock(&self.bindings, "binding table")?;
        Ok(bindings
            .get_mut(exchange)
            .map(|table| table.remove(queue).is_some())
            .unwrap_or(false))
    }

    /// Drops every binding of `exchange`; returns how many were removed.
    pub fn remove_exchange(&self, exchange: &str) -> Result<usize> {
        let mut bindings = lock(&self.bindings, "binding table")?;
        Ok(bindings.remove(exchange).map(|t| t.len()).unwrap_or(0))
    }

    /// Strips `queue` from every exchange's table.
    pub fn remove_queue(&self, queue: &str) -> Result<usize> {
        let mut bindings = lock(&self.bindings, "binding table")?;
        Ok(bindings
            .values_mut()
            .filter_map(|table| table.remove(queue))
            .count())
    }

    /// Bindings of one exchange, ordered by queue name.
    pub fn for_exchange(&self, exchange: &str) -> Result<Vec<Arc<Binding>>> {
        let bindings = lock(&self.bindings, "binding table")?;
        Ok(bindings
            .get(exchange)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    pub fn all(&self) -> Result<Vec<Arc<Binding>>> {
        let bindings = lock(&self.bindings, "binding table")?;
        let mut all: Vec<_> = bindings
            .values()
            .flat_map(|table| table.values().cloned())
            .collect();
        all.sort_by(|a, b| (&a.exchange, &a.queue).cmp(&(&b.exchange, &b.queue)));
        Ok(all)
    }
}

/// Exchange, queue and binding tables with declare/delete semantics.
#[derive(Default)]
pub struct Registry {
    exchanges: ExchangeTable,
    queues: QueueTable,
    bindings: BindingTable,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchanges(&self) -> &ExchangeTable {
        &self.exchanges
    }

    pub fn queues(&self) -> &QueueTable {
        &self.queues
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Idempotent; returns whether a new exchange was created.
    pub fn declare_exchange(&self, exchange: Exchange) -> Result<bool> {
        let name = exchange.name.clone();
        let kind = exchange.kind;
        let created = self.exchanges.declare(exchange)?;
        if created {
            info!("declared {kind} exchange {name:?}");
        }
        Ok(created)
    }

    /// Removes the exchange and all of its bindings. Missing names are a no-op.
    pub fn delete_exchange(&self, name: &str) -> Result<bool> {
        let removed = self.exchanges.remove(name)?.is_some();
        let bindings = self.bindings.remove_exchange(name)?;
        if removed {
            info!("deleted exchange {name:?} and {bindings} bindings");
        }
        Ok(removed)
    }

    pub fn declare_queue(&self, queue: QueueMeta) -> Result<bool> {
        let name = queue.name.clone();
        let created = self.queues.declare(queue)?;
        if created {
            info!("declared queue {name:?}");
        }
        Ok(created)
    }

    /// Removes the queue and strips it from every binding table.
    pub fn delete_queue(&self, name: &str) -> Result<Option<Arc<QueueMeta>>> {
        let removed = self.queues.remove(name)?;
        self.bindings.remove_queue(name)?;
        if removed.is_some() {
            info!("deleted queue {name:?}");
        }
        Ok(removed)
    }

    /// Both ends must exist; an existing `(exchange, queue)` binding is replaced.
    pub fn bind(&self, binding: Binding) -> Result<()> {
        if !self.exchanges.exists(&binding.exchange)? {
            warn!("bind failed: exchange {:?} not found", binding.exchange);
            return Err(Error::ExchangeNotFound(binding.exchange));
        }
        if !self.queues.exists(&binding.queue)? {
            warn!("bind failed: queue {:?} not found", binding.queue);
            return Err(Error::QueueNotFound(binding.queue));
        }
        self.bindings.insert(binding)
    }

    pub fn unbind(&self, exchange: &str, queue: &str) -> Result<bool> {
        self.bindings.remove(exchange, queue)
    }
}
