//! A bidirectional, type-agnostic RPC channel over a minimal frame
//! transport.
//!
//! Both sides of a connection are symmetric: each exposes a tree of
//! methods, streams, constructors, and properties, and each may call the
//! other.  One connection multiplexes four protocols — request/response
//! calls with nested method paths, property get/set, constructor
//! invocation, and server-streamed sequences — and additionally carries
//! first-class callback arguments and zero-copy transfers of owned buffers
//! on transports that support them.
//!
//! The core pieces:
//!
//! - [`Channel`] and its driver future: correlation, routing, timeouts,
//!   and teardown (see [`channel`]-level docs via [`Channel::new`]).
//! - [`ExposeTree`]: the local API made callable from the peer, with
//!   handlers declared unary or streaming up front.
//! - [`Value`]: the dynamic payload tree, including rich kinds preserved
//!   by the `superjson` wire format.
//! - [`Interceptor`] and [`Validate`]: the pipeline wrapped around every
//!   inbound request.
//! - [`RpcIo`]: the transport contract, with a newline-framing adapter
//!   ([`line_io`]) and an in-process pair ([`duplex`]).
//!
//! ```no_run
//! # futures::executor::block_on(async {
//! use kkrpc::{duplex, Channel, ChannelConfig, ExposeTree, IoCapabilities, Value};
//! use kkrpc::handler_fn;
//!
//! let (io_a, io_b) = duplex(IoCapabilities::default());
//! let tree = ExposeTree::new().method(
//!     "add",
//!     handler_fn(|args| async move {
//!         let a = args[0].as_i64().unwrap_or(0);
//!         let b = args[1].as_i64().unwrap_or(0);
//!         Ok(Value::Int(a + b))
//!     }),
//! );
//! let (_server, server_driver) = Channel::new(io_a, ChannelConfig::new().expose(tree));
//! let (client, client_driver) = Channel::new(io_b, ChannelConfig::new());
//!
//! let logic = async move {
//!     let sum = client.call("add", vec![2.into(), 3.into()]).await.unwrap();
//!     assert_eq!(sum, Value::Int(5));
//!     client.destroy();
//! };
//! futures::join!(server_driver, client_driver, logic);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::uninlined_format_args)]

mod callback;
mod channel;
mod codec;
mod err;
mod expose;
mod io;
mod middleware;
mod msgs;
mod proxy;
mod streams;
mod transfer;
mod value;

pub use callback::{CallbackArg, RemoteCallback};
pub use channel::{Channel, ChannelConfig};
pub use codec::WireFormat;
pub use err::{
    ConnectionError, ErrorRecord, Issue, ProtocolViolation, RpcError, ValidationPhase,
};
pub use expose::{
    handler_fn, stream_fn, ExposeTree, HandlerFuture, StreamFuture, StreamingHandler,
    UnaryHandler, ValueStream,
};
pub use io::{duplex, line_io, FrameReader, FrameWriter, IoCapabilities, IoFrame, RpcIo};
pub use middleware::{
    interceptor_fn, validator_fn, Interceptor, InvokeContext, MethodValidators, Next, Outcome,
    StateBag, Validate, ValidatorTree,
};
pub use msgs::RequestId;
pub use proxy::RemotePath;
pub use streams::RpcStream;
pub use transfer::{Transfer, TransferHandle, TransferHandler, TransferRegistry};
pub use value::Value;
