//! The broker facade a transport adapter talks to.

use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::channel::SessionContext;
use crate::clock::{Clock, QuantaClock};
use crate::config::BrokerConfig;
use crate::connection::{Connection, ConnectionId, ConnectionManager, HeartbeatMonitor};
use crate::consumer::ConsumerRegistry;
use crate::pool::WorkerPool;
use crate::protocol::{Request, ResponseSink};
use crate::store::{CompactionReport, QueueStats};
use crate::vhost::VirtualHost;
use crate::Result;

/// Owns the virtual host, consumer lists, worker pool, connection table
/// and heartbeat thread.
pub struct Broker {
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    ctx: SessionContext,
    connections: Arc<ConnectionManager>,
    heartbeat: Mutex<Option<HeartbeatMonitor>>,
}

impl Broker {
    pub fn open(config: BrokerConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(QuantaClock::new()))
    }

    pub fn open_with_clock(config: BrokerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let host = Arc::new(VirtualHost::open(&config, Arc::clone(&clock))?);
        let consumers = Arc::new(ConsumerRegistry::new());
        for queue in host.queues()? {
            consumers.init_queue(&queue.name)?;
        }
        let pool = Arc::new(WorkerPool::new(config.worker_count())?);
        let connections = Arc::new(ConnectionManager::new());
        let heartbeat = HeartbeatMonitor::start(
            Arc::clone(&connections),
            config.heartbeat_interval(),
            config.idle_timeout(),
        )?;
        info!(
            "broker ready: {} workers, idle timeout {:?}",
            pool.size(),
            config.idle_timeout()
        );
        Ok(Self {
            config,
            clock,
            ctx: SessionContext {
                host,
                consumers,
                pool,
            },
            connections,
            heartbeat: Mutex::new(Some(heartbeat)),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<VirtualHost> {
        &self.ctx.host
    }

    pub fn consumers(&self) -> &Arc<ConsumerRegistry> {
        &self.ctx.consumers
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Registers a transport session. Reconnecting with a live id returns the
    /// existing connection.
    pub fn connect(&self, id: ConnectionId, sink: Arc<dyn ResponseSink>) -> Result<Arc<Connection>> {
        let connection = Connection::new(id, self.ctx.clone(), sink, Arc::clone(&self.clock));
        let connection = self.connections.insert(connection)?;
        info!("connection {id} established");
        Ok(connection)
    }

    pub fn disconnect(&self, id: ConnectionId) -> Result<bool> {
        let removed = self.connections.remove(id)?;
        if removed {
            info!("connection {id} closed");
        }
        Ok(removed)
    }

    /// Single entry point for inbound requests. Every request counts as
    /// activity for idle eviction.
    pub fn handle(&self, id: ConnectionId, request: Request) -> Result<()> {
        let connection = self.connections.get(id)?;
        connection.refresh();
        connection.handle(request);
        Ok(())
    }

    /// Runs an eviction pass now instead of waiting for the heartbeat thread.
    pub fn sweep_idle(&self) -> Result<Vec<ConnectionId>> {
        self.connections.sweep(self.config.idle_timeout())
    }

    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.ctx.host.queue_stats(queue)
    }

    pub fn compact_queue(&self, queue: &str) -> Result<CompactionReport> {
        self.ctx.host.compact_queue(queue)
    }

    /// Stops the heartbeat, closes every connection and drains the pool.
    pub fn shutdown(&self) {
        match self.heartbeat.lock() {
            Ok(mut heartbeat) => {
                if let Some(mut monitor) = heartbeat.take() {
                    monitor.stop();
                }
            }
            Err(_) => warn!("heartbeat lock poisoned during shutdown"),
        }
        self.connections.close_all();
        self.ctx.pool.shutdown();
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
