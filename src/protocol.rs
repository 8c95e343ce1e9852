//! Requests a transport adapter feeds into the broker and the responses it
//! gets back. Framing and wire encoding belong to the adapter; the types
//! derive serde so a JSON or binary codec can be layered on directly.

use serde::{Deserialize, Serialize};

use crate::message::BasicProperties;
use crate::registry::{Binding, Exchange, QueueMeta};
use crate::vhost::QueueStatus;
use crate::Result;

pub type RequestId = String;
pub type ChannelId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    OpenChannel {
        rid: RequestId,
        cid: ChannelId,
    },
    CloseChannel {
        rid: RequestId,
        cid: ChannelId,
    },
    DeclareExchange {
        rid: RequestId,
        cid: ChannelId,
        exchange: Exchange,
    },
    DeleteExchange {
        rid: RequestId,
        cid: ChannelId,
        name: String,
    },
    /// `queue.dead_letter` carries the optional dead-letter config.
    DeclareQueue {
        rid: RequestId,
        cid: ChannelId,
        queue: QueueMeta,
    },
    DeleteQueue {
        rid: RequestId,
        cid: ChannelId,
        name: String,
    },
    Bind {
        rid: RequestId,
        cid: ChannelId,
        binding: Binding,
    },
    Unbind {
        rid: RequestId,
        cid: ChannelId,
        exchange: String,
        queue: String,
    },
    Publish {
        rid: RequestId,
        cid: ChannelId,
        exchange: String,
        #[serde(default)]
        properties: BasicProperties,
        body: Vec<u8>,
    },
    Ack {
        rid: RequestId,
        cid: ChannelId,
        queue: String,
        message_id: String,
    },
    Nack {
        rid: RequestId,
        cid: ChannelId,
        queue: String,
        message_id: String,
        #[serde(default)]
        requeue: bool,
        #[serde(default)]
        reason: String,
    },
    Consume {
        rid: RequestId,
        cid: ChannelId,
        queue: String,
        consumer_tag: String,
        #[serde(default)]
        auto_ack: bool,
    },
    Cancel {
        rid: RequestId,
        cid: ChannelId,
        queue: String,
        consumer_tag: String,
    },
    Query {
        rid: RequestId,
        cid: ChannelId,
    },
    QueueStatus {
        rid: RequestId,
        cid: ChannelId,
        queue: String,
    },
    Heartbeat {
        rid: RequestId,
    },
}

impl Request {
    pub fn rid(&self) -> &str {
        match self {
            Request::OpenChannel { rid, .. }
            | Request::CloseChannel { rid, .. }
            | Request::DeclareExchange { rid, .. }
            | Request::DeleteExchange { rid, .. }
            | Request::DeclareQueue { rid, .. }
            | Request::DeleteQueue { rid, .. }
            | Request::Bind { rid, .. }
            | Request::Unbind { rid, .. }
            | Request::Publish { rid, .. }
            | Request::Ack { rid, .. }
            | Request::Nack { rid, .. }
            | Request::Consume { rid, .. }
            | Request::Cancel { rid, .. }
            | Request::Query { rid, .. }
            | Request::QueueStatus { rid, .. }
            | Request::Heartbeat { rid } => rid,
        }
    }

    /// Channel the request targets; heartbeats are connection-level.
    pub fn cid(&self) -> Option<&str> {
        match self {
            Request::OpenChannel { cid, .. }
            | Request::CloseChannel { cid, .. }
            | Request::DeclareExchange { cid, .. }
            | Request::DeleteExchange { cid, .. }
            | Request::DeclareQueue { cid, .. }
            | Request::DeleteQueue { cid, .. }
            | Request::Bind { cid, .. }
            | Request::Unbind { cid, .. }
            | Request::Publish { cid, .. }
            | Request::Ack { cid, .. }
            | Request::Nack { cid, .. }
            | Request::Consume { cid, .. }
            | Request::Cancel { cid, .. }
            | Request::Query { cid, .. }
            | Request::QueueStatus { cid, .. } => Some(cid),
            Request::Heartbeat { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Common {
        rid: RequestId,
        cid: ChannelId,
        ok: bool,
    },
    Deliver {
        cid: ChannelId,
        consumer_tag: String,
        properties: BasicProperties,
        body: Vec<u8>,
    },
    /// `body` is `None` when every queue was empty.
    Query {
        rid: RequestId,
        cid: ChannelId,
        body: Option<Vec<u8>>,
    },
    QueueStatus {
        rid: RequestId,
        cid: ChannelId,
        status: Option<QueueStatus>,
    },
    Heartbeat {
        rid: RequestId,
    },
}

impl Response {
    pub fn common(rid: &str, cid: &str, ok: bool) -> Self {
        Response::Common {
            rid: rid.to_string(),
            cid: cid.to_string(),
            ok,
        }
    }
}

/// The transport side of a session.
pub trait ResponseSink: Send + Sync {
    fn send(&self, response: Response) -> Result<()>;

    /// Close the underlying session. Called on eviction and disconnect.
    fn shutdown(&self);
}
