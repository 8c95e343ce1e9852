use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("record of {len} bytes exceeds the {max} byte limit")]
    RecordTooLarge { len: usize, max: usize },
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(#[from] serde_json::Error),
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("connection not found: {0}")]
    ConnectionNotFound(u64),
    #[error("consumer tag already registered on queue {queue}: {tag}")]
    DuplicateConsumer { queue: String, tag: String },
    #[error("channel already open: {0}")]
    DuplicateChannel(String),
    #[error("channel {0} already owns a consumer")]
    ChannelBusy(String),
    #[error("routing key {routing_key:?} does not match queue {queue}")]
    RoutingKeyMismatch { queue: String, routing_key: String },
    #[error("default exchange cannot be {0}")]
    DefaultExchange(&'static str),
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
    #[error("worker pool shut down")]
    PoolShutdown,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid name {0:?}")]
    InvalidName(String),
}

impl Error {
    /// True for the "named thing is absent" family of failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ExchangeNotFound(_)
                | Error::QueueNotFound(_)
                | Error::ChannelNotFound(_)
                | Error::ConnectionNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Locks `mutex`, turning poisoning into [`Error::LockPoisoned`].
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| Error::LockPoisoned(what))
}
