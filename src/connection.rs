//! Connections, their channel tables, and idle eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::channel::{Channel, SessionContext};
use crate::clock::Clock;
use crate::error::lock;
use crate::protocol::{Request, Response, ResponseSink};
use crate::{Error, Result};

pub type ConnectionId = u64;

/// One transport session and the channels opened on it.
pub struct Connection {
    id: ConnectionId,
    ctx: SessionContext,
    sink: Arc<dyn ResponseSink>,
    clock: Arc<dyn Clock>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    last_active: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        ctx: SessionContext,
        sink: Arc<dyn ResponseSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            id,
            ctx,
            sink,
            clock,
            channels: Mutex::new(HashMap::new()),
            last_active: AtomicU64::new(now),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn open_channel(&self, cid: &str) -> Result<Arc<Channel>> {
        let mut channels = lock(&self.channels, "channel table")?;
        if channels.contains_key(cid) {
            return Err(Error::DuplicateChannel(cid.to_string()));
        }
        let channel = Arc::new(Channel::new(cid, self.ctx.clone(), Arc::clone(&self.sink)));
        channels.insert(cid.to_string(), Arc::clone(&channel));
        debug!("connection {}: opened channel {cid:?}", self.id);
        Ok(channel)
    }

    /// Closing an unknown channel is a no-op.
    pub fn close_channel(&self, cid: &str) -> Result<bool> {
        let channel = lock(&self.channels, "channel table")?.remove(cid);
        match channel {
            Some(channel) => {
                channel.close();
                debug!("connection {}: closed channel {cid:?}", self.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn channel(&self, cid: &str) -> Result<Arc<Channel>> {
        lock(&self.channels, "channel table")?
            .get(cid)
            .cloned()
            .ok_or_else(|| Error::ChannelNotFound(cid.to_string()))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn refresh(&self) {
        self.last_active.store(self.clock.now(), Ordering::Release);
    }

    pub fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Acquire)
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        let idle = self.clock.now().saturating_sub(self.last_active());
        idle > timeout.as_nanos() as u64
    }

    /// Routes a request: channel lifecycle and heartbeats are answered here,
    /// everything else goes to the addressed channel.
    pub fn handle(&self, request: Request) {
        match request {
            Request::OpenChannel { rid, cid } => {
                let ok = match self.open_channel(&cid) {
                    Ok(_) => true,
                    Err(err) => {
                        warn!("connection {}: open channel failed: {err}", self.id);
                        false
                    }
                };
                self.send(Response::common(&rid, &cid, ok));
            }
            Request::CloseChannel { rid, cid } => {
                let ok = self.close_channel(&cid).is_ok();
                self.send(Response::common(&rid, &cid, ok));
            }
            Request::Heartbeat { rid } => self.send(Response::Heartbeat { rid }),
            request => {
                let cid = request.cid().unwrap_or_default().to_string();
                match self.channel(&cid) {
                    Ok(channel) => channel.handle(request),
                    Err(err) => {
                        warn!("connection {}: {err}", self.id);
                        self.send(Response::common(request.rid(), &cid, false));
                    }
                }
            }
        }
    }

    fn send(&self, response: Response) {
        if let Err(err) = self.sink.send(response) {
            warn!("connection {}: failed to send response: {err}", self.id);
        }
    }

    /// Closes every channel and shuts the transport down. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<_> = match self.channels.lock() {
            Ok(mut channels) => channels.drain().map(|(_, c)| c).collect(),
            Err(_) => Vec::new(),
        };
        for channel in channels {
            channel.close();
        }
        self.sink.shutdown();
    }
}

/// Connection table keyed by transport session id.
#[derive(Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection; an id already in use keeps its existing entry.
    pub fn insert(&self, connection: Connection) -> Result<Arc<Connection>> {
        let mut connections = lock(&self.connections, "connection table")?;
        let entry = connections
            .entry(connection.id())
            .or_insert_with(|| Arc::new(connection));
        Ok(Arc::clone(entry))
    }

    /// Removes and closes the connection. Unknown ids are a no-op.
    pub fn remove(&self, id: ConnectionId) -> Result<bool> {
        let connection = lock(&self.connections, "connection table")?.remove(&id);
        match connection {
            Some(connection) => {
                connection.close();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        lock(&self.connections, "connection table")?
            .get(&id)
            .cloned()
            .ok_or(Error::ConnectionNotFound(id))
    }

    pub fn refresh(&self, id: ConnectionId) -> Result<()> {
        self.get(id)?.refresh();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts connections idle for longer than `timeout`. The table lock is
    /// released before any connection is closed.
    pub fn sweep(&self, timeout: Duration) -> Result<Vec<ConnectionId>> {
        let expired: Vec<_> = {
            let mut connections = lock(&self.connections, "connection table")?;
            let ids: Vec<_> = connections
                .iter()
                .filter(|(_, c)| c.is_expired(timeout))
                .map(|(id, _)| *id)
                .collect();
            let removed: Vec<_> = ids.iter().filter_map(|id| connections.remove(id)).collect();
            removed
        };
        let mut evicted = Vec::with_capacity(expired.len());
        for connection in expired {
            info!(
                "evicting connection {} after {:?} idle",
                connection.id(),
                timeout
            );
            connection.close();
            evicted.push(connection.id());
        }
        Ok(evicted)
    }

    pub fn close_all(&self) {
        let connections: Vec<_> = match self.connections.lock() {
            Ok(mut connections) => connections.drain().map(|(_, c)| c).collect(),
            Err(_) => Vec::new(),
        };
        for connection in connections {
            connection.close();
        }
    }
}

/// Background thread sweeping idle connections at a fixed interval.
pub struct HeartbeatMonitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn start(
        connections: Arc<ConnectionManager>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("micromq-heartbeat".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = connections.sweep(timeout) {
                            error!("heartbeat sweep failed: {err}");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
