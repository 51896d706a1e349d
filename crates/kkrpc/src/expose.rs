//! The local API tree a channel exposes to its peer.
//!
//! An [`ExposeTree`] maps dotted paths to handlers and properties.  Unlike
//! the dynamic-object dispatch of script runtimes, every entry declares
//! what it is up front: a unary method, a streaming method, a constructor,
//! a property value, or a subtree.  The channel resolves inbound `request`,
//! `get`, `set`, and `construct` messages against this tree and answers
//! `MethodNotFound` when a path does not lead to an entry of the right
//! kind.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::err::RpcError;
use crate::value::Value;

/// The future a unary handler returns.
pub type HandlerFuture = BoxFuture<'static, Result<Value, RpcError>>;

/// A lazy sequence of values, as produced by a streaming handler.
///
/// Finite or not, a stream is consumed at most once; an `Err` item
/// terminates it on the consumer's side.
pub type ValueStream = BoxStream<'static, Result<Value, RpcError>>;

/// The future a streaming handler returns: it resolves to the stream once
/// the handler has validated its arguments.
pub type StreamFuture = BoxFuture<'static, Result<ValueStream, RpcError>>;

/// A method returning a single value.
pub trait UnaryHandler: Send + Sync {
    /// Invoke the method with rehydrated positional arguments.
    fn invoke(&self, args: Vec<Value>) -> HandlerFuture;
}

/// A method returning a lazy sequence.
///
/// Streaming is declared here, at registration, rather than sniffed from
/// the return value: the channel announces the stream to the caller with a
/// `{result: null, stream: true}` response before the first chunk.
pub trait StreamingHandler: Send + Sync {
    /// Start the stream for the given positional arguments.
    fn open(&self, args: Vec<Value>) -> StreamFuture;
}

/// Wrap an async closure as a [`UnaryHandler`].
pub fn handler_fn<F, Fut>(f: F) -> impl UnaryHandler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    /// Adapter from a closure to the handler trait.
    struct FnHandler<F>(F);
    impl<F, Fut> UnaryHandler for FnHandler<F>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        fn invoke(&self, args: Vec<Value>) -> HandlerFuture {
            (self.0)(args).boxed()
        }
    }
    FnHandler(f)
}

/// Wrap an async closure as a [`StreamingHandler`].
pub fn stream_fn<F, Fut>(f: F) -> impl StreamingHandler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<ValueStream, RpcError>> + Send + 'static,
{
    /// Adapter from a closure to the streaming-handler trait.
    struct FnStream<F>(F);
    impl<F, Fut> StreamingHandler for FnStream<F>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ValueStream, RpcError>> + Send + 'static,
    {
        fn open(&self, args: Vec<Value>) -> StreamFuture {
            (self.0)(args).boxed()
        }
    }
    FnStream(f)
}

/// One entry in the expose tree.
enum ExposeNode {
    /// A unary method.
    Unary(Arc<dyn UnaryHandler>),
    /// A streaming method.
    Streaming(Arc<dyn StreamingHandler>),
    /// A constructor, reachable only through `construct`.
    Constructor(Arc<dyn UnaryHandler>),
    /// A property, reachable through `get` and `set`.
    Property(RwLock<Value>),
    /// A namespace of further entries.
    Tree(BTreeMap<String, ExposeNode>),
}

/// What a `request` path resolved to.
pub(crate) enum Invokable {
    /// A unary method.
    Unary(Arc<dyn UnaryHandler>),
    /// A streaming method.
    Streaming(Arc<dyn StreamingHandler>),
}

impl std::fmt::Debug for Invokable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invokable::Unary(_) => f.write_str("Invokable::Unary(..)"),
            Invokable::Streaming(_) => f.write_str("Invokable::Streaming(..)"),
        }
    }
}

/// The nested mapping of names a channel makes callable from the peer.
#[derive(Default)]
pub struct ExposeTree {
    /// Top-level entries.
    root: BTreeMap<String, ExposeNode>,
}

impl ExposeTree {
    /// Return an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a unary method at a dotted path.
    ///
    /// Panics if `path` is empty or has an empty segment.
    pub fn method(mut self, path: &str, handler: impl UnaryHandler + 'static) -> Self {
        self.insert(path, ExposeNode::Unary(Arc::new(handler)));
        self
    }

    /// Expose a streaming method at a dotted path.
    ///
    /// Panics if `path` is empty or has an empty segment.
    pub fn stream_method(
        mut self,
        path: &str,
        handler: impl StreamingHandler + 'static,
    ) -> Self {
        self.insert(path, ExposeNode::Streaming(Arc::new(handler)));
        self
    }

    /// Expose a constructor at a dotted path.
    ///
    /// Panics if `path` is empty or has an empty segment.
    pub fn constructor(mut self, path: &str, handler: impl UnaryHandler + 'static) -> Self {
        self.insert(path, ExposeNode::Constructor(Arc::new(handler)));
        self
    }

    /// Expose a readable and writable property at a dotted path.
    ///
    /// Panics if `path` is empty or has an empty segment.
    pub fn value(mut self, path: &str, initial: Value) -> Self {
        self.insert(path, ExposeNode::Property(RwLock::new(initial)));
        self
    }

    /// Install `node` at `path`, creating namespaces as needed.  The last
    /// insertion at a given path wins.
    ///
    /// Panics if `path` is empty or has an empty segment: a name like `""`
    /// or `"a..b"` could never be addressed by a well-formed message, so
    /// registering one is a programming error.
    fn insert(&mut self, path: &str, node: ExposeNode) {
        assert!(
            !path.is_empty() && path.split('.').all(|seg| !seg.is_empty()),
            "expose path {path:?} is empty or has an empty segment"
        );
        let mut segments = path.split('.').peekable();
        let mut map = &mut self.root;
        while let Some(seg) = segments.next() {
            if segments.peek().is_none() {
                map.insert(seg.to_owned(), node);
                return;
            }
            let entry = map
                .entry(seg.to_owned())
                .and_modify(|e| {
                    if !matches!(e, ExposeNode::Tree(_)) {
                        *e = ExposeNode::Tree(BTreeMap::new());
                    }
                })
                .or_insert_with(|| ExposeNode::Tree(BTreeMap::new()));
            let ExposeNode::Tree(next) = entry else {
                unreachable!("entry was just made a tree");
            };
            map = next;
        }
    }

    /// Walk to the node at a sequence of segments.
    fn node<'a, I>(&self, segments: I) -> Option<&ExposeNode>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut map = &self.root;
        let mut current: Option<&ExposeNode> = None;
        for seg in segments {
            let node = map.get(seg)?;
            current = Some(node);
            map = match node {
                ExposeNode::Tree(next) => next,
                // A non-tree node can only be the final segment; arrange
                // for any further segment to miss.
                _ => {
                    map = &EMPTY_TREE;
                    continue;
                }
            };
        }
        current
    }

    /// Resolve a `request` method path.
    pub(crate) fn resolve_invoke(&self, method: &str) -> Result<Invokable, RpcError> {
        match self.node(method.split('.')) {
            Some(ExposeNode::Unary(h)) => Ok(Invokable::Unary(Arc::clone(h))),
            Some(ExposeNode::Streaming(h)) => Ok(Invokable::Streaming(Arc::clone(h))),
            _ => Err(RpcError::MethodNotFound {
                method: method.to_owned(),
            }),
        }
    }

    /// Resolve a `construct` method path.
    pub(crate) fn resolve_constructor(
        &self,
        method: &str,
    ) -> Result<Arc<dyn UnaryHandler>, RpcError> {
        match self.node(method.split('.')) {
            Some(ExposeNode::Constructor(h)) => Ok(Arc::clone(h)),
            _ => Err(RpcError::MethodNotFound {
                method: method.to_owned(),
            }),
        }
    }

    /// Read the property at a path.
    pub(crate) fn get(&self, path: &[String]) -> Result<Value, RpcError> {
        match self.node(path.iter().map(String::as_str)) {
            Some(ExposeNode::Property(v)) => Ok(v.read().expect("lock poisoned").clone()),
            _ => Err(RpcError::MethodNotFound {
                method: path.join("."),
            }),
        }
    }

    /// Assign the property at a path.
    pub(crate) fn set(&self, path: &[String], value: Value) -> Result<(), RpcError> {
        match self.node(path.iter().map(String::as_str)) {
            Some(ExposeNode::Property(v)) => {
                *v.write().expect("lock poisoned") = value;
                Ok(())
            }
            _ => Err(RpcError::MethodNotFound {
                method: path.join("."),
            }),
        }
    }
}

/// A permanently empty namespace, used to dead-end path walks that try to
/// descend through a leaf.
static EMPTY_TREE: BTreeMap<String, ExposeNode> = BTreeMap::new();

impl std::fmt::Debug for ExposeTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposeTree")
            .field("entries", &self.root.len())
            .finish()
    }
}
