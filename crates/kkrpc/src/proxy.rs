//! Path builders over the peer's expose tree.
//!
//! Script-language hosts of this protocol synthesize a recursive proxy
//! whose field accesses build a dotted path at runtime.  Here the same
//! chaining is an explicit builder: [`RemotePath`] accumulates segments
//! without any I/O, and the terminal operations (`call`, `call_stream`,
//! `get`, `set`, `construct`) issue the corresponding channel operation.

use crate::channel::Channel;
use crate::err::RpcError;
use crate::streams::RpcStream;
use crate::value::Value;

/// A dotted path into the peer's expose tree, with the channel to reach it.
#[derive(Clone)]
pub struct RemotePath {
    /// The channel operations go through.
    channel: Channel,
    /// Accumulated path segments.
    segments: Vec<String>,
}

impl RemotePath {
    /// The root path of a channel's peer.
    pub(crate) fn new(channel: Channel) -> Self {
        RemotePath {
            channel,
            segments: Vec::new(),
        }
    }

    /// Extend the path by one (or several dotted) segments.
    pub fn sub(&self, segment: &str) -> RemotePath {
        let mut segments = self.segments.clone();
        segments.extend(segment.split('.').map(str::to_owned));
        RemotePath {
            channel: self.channel.clone(),
            segments,
        }
    }

    /// The dotted form of this path.
    pub fn path(&self) -> String {
        self.segments.join(".")
    }

    /// The dotted form of this path extended by `name`.
    fn joined(&self, name: &str) -> String {
        if self.segments.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{name}", self.path())
        }
    }

    /// Invoke the unary method `name` under this path.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.channel.call(&self.joined(name), args).await
    }

    /// Invoke the streaming method `name` under this path.
    pub async fn call_stream(&self, name: &str, args: Vec<Value>) -> Result<RpcStream, RpcError> {
        self.channel.call_stream(&self.joined(name), args).await
    }

    /// Read this path as a property.
    pub async fn get(&self) -> Result<Value, RpcError> {
        self.channel.get(&self.path()).await
    }

    /// Assign this path as a property.
    pub async fn set(&self, value: Value) -> Result<(), RpcError> {
        self.channel.set(&self.path(), value).await
    }

    /// Invoke the constructor `name` under this path.
    pub async fn construct(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.channel.construct(&self.joined(name), args).await
    }
}

impl std::fmt::Debug for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RemotePath").field(&self.path()).finish()
    }
}
