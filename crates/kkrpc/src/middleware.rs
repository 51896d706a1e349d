//! The interceptor chain and per-method validation.
//!
//! Every inbound `request` runs through the same pipeline: argument
//! rehydration, then input validation, then the interceptor chain in onion
//! order, then the handler itself.  Output validation applies to the
//! handler's value, or to each chunk of a stream.  Interceptors wrap the
//! handler call exactly once per request; they are not invoked per chunk,
//! and they do not see `get`/`set`/`construct`/`callback` traffic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::err::{Issue, RpcError};
use crate::expose::ValueStream;
use crate::value::Value;

/// What a handler invocation produced.
#[non_exhaustive]
pub enum Outcome {
    /// A single value; it becomes the `response` payload.
    Value(Value),
    /// A lazy sequence; the channel announces a stream and forwards its
    /// chunks.
    Stream(ValueStream),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Outcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The shared mutable bag interceptors may use to talk to each other.
pub type StateBag = Arc<Mutex<BTreeMap<String, Value>>>;

/// The context threaded through the interceptor chain.
#[allow(clippy::exhaustive_structs)]
pub struct InvokeContext {
    /// The dotted method path being invoked.
    pub method: String,
    /// The (validated, rehydrated) positional arguments.  Interceptors may
    /// rewrite these before passing the context on.
    pub args: Vec<Value>,
    /// A mutable bag shared by every interceptor on this call.
    pub state: StateBag,
}

impl InvokeContext {
    /// Build a fresh context for one request.
    pub(crate) fn new(method: String, args: Vec<Value>) -> Self {
        InvokeContext {
            method,
            args,
            state: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

/// One layer of the onion around a handler invocation.
///
/// An interceptor may inspect or rewrite the context, transform the outcome
/// of `next.run(ctx)`, or fail without calling `next` at all, in which case
/// its error becomes the response.
pub trait Interceptor: Send + Sync {
    /// Wrap the rest of the chain.
    fn around(
        &self,
        ctx: InvokeContext,
        next: Next,
    ) -> BoxFuture<'static, Result<Outcome, RpcError>>;
}

/// Wrap an async closure as an [`Interceptor`].
pub fn interceptor_fn<F, Fut>(f: F) -> impl Interceptor
where
    F: Fn(InvokeContext, Next) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Outcome, RpcError>> + Send + 'static,
{
    /// Adapter from a closure to the interceptor trait.
    struct FnInterceptor<F>(F);
    impl<F, Fut> Interceptor for FnInterceptor<F>
    where
        F: Fn(InvokeContext, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Outcome, RpcError>> + Send + 'static,
    {
        fn around(
            &self,
            ctx: InvokeContext,
            next: Next,
        ) -> BoxFuture<'static, Result<Outcome, RpcError>> {
            Box::pin((self.0)(ctx, next))
        }
    }
    FnInterceptor(f)
}

/// The innermost call of a chain: the handler itself.
pub(crate) type Terminal =
    Arc<dyn Fn(InvokeContext) -> BoxFuture<'static, Result<Outcome, RpcError>> + Send + Sync>;

/// The remainder of the chain, as seen by one interceptor.
///
/// Calling [`run`](Next::run) invokes the next interceptor, or the handler
/// once the chain is exhausted.  Dropping it without calling `run`
/// short-circuits the request.
pub struct Next {
    /// The whole chain, in order.
    chain: Arc<[Arc<dyn Interceptor>]>,
    /// The position of the interceptor this `Next` continues after.
    index: usize,
    /// The handler invocation at the center.
    terminal: Terminal,
}

impl Next {
    /// Continue with the rest of the chain.
    pub fn run(self, ctx: InvokeContext) -> BoxFuture<'static, Result<Outcome, RpcError>> {
        match self.chain.get(self.index) {
            Some(interceptor) => {
                let interceptor = Arc::clone(interceptor);
                let next = Next {
                    chain: self.chain,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                interceptor.around(ctx, next)
            }
            None => (self.terminal)(ctx),
        }
    }
}

/// Run a full chain around `terminal` in onion order.
pub(crate) fn run_chain(
    chain: Arc<[Arc<dyn Interceptor>]>,
    terminal: Terminal,
    ctx: InvokeContext,
) -> BoxFuture<'static, Result<Outcome, RpcError>> {
    Next {
        chain,
        index: 0,
        terminal,
    }
    .run(ctx)
}

/// The minimal validator contract.
///
/// A validator receives a value by reference and either accepts it
/// (possibly returning a coerced replacement) or rejects it with a list of
/// issues.  Input validators receive the positional argument tuple as an
/// array value and should return an array.
pub trait Validate: Send + Sync {
    /// Check (and possibly coerce) `value`.
    fn validate(&self, value: &Value) -> Result<Value, Vec<Issue>>;
}

/// Wrap a closure as a [`Validate`] implementation.
pub fn validator_fn<F>(f: F) -> impl Validate
where
    F: Fn(&Value) -> Result<Value, Vec<Issue>> + Send + Sync + 'static,
{
    /// Adapter from a closure to the validator trait.
    struct FnValidate<F>(F);
    impl<F> Validate for FnValidate<F>
    where
        F: Fn(&Value) -> Result<Value, Vec<Issue>> + Send + Sync + 'static,
    {
        fn validate(&self, value: &Value) -> Result<Value, Vec<Issue>> {
            (self.0)(value)
        }
    }
    FnValidate(f)
}

/// The optional schemas attached to one method.
#[derive(Clone, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct MethodValidators {
    /// Runs against the argument tuple before interceptors.
    pub input: Option<Arc<dyn Validate>>,
    /// Runs against the result, or against each stream chunk.
    pub output: Option<Arc<dyn Validate>>,
}

/// A sparse mapping from dotted method path to schemas.
///
/// Entries exist only at leaves; intermediate path segments are just
/// namespaces and carry nothing.
#[derive(Clone, Default)]
pub struct ValidatorTree {
    /// Schema entries by full dotted path.
    entries: BTreeMap<String, MethodValidators>,
}

impl ValidatorTree {
    /// Return an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an input schema to a method.
    pub fn input(mut self, method: &str, validator: impl Validate + 'static) -> Self {
        self.entries.entry(method.to_owned()).or_default().input = Some(Arc::new(validator));
        self
    }

    /// Attach an output schema to a method.
    pub fn output(mut self, method: &str, validator: impl Validate + 'static) -> Self {
        self.entries.entry(method.to_owned()).or_default().output = Some(Arc::new(validator));
        self
    }

    /// Look up the schemas for a method, if any.
    pub(crate) fn lookup(&self, method: &str) -> Option<&MethodValidators> {
        self.entries.get(method)
    }
}

impl std::fmt::Debug for ValidatorTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorTree")
            .field("entries", &self.entries.len())
            .finish()
    }
}
