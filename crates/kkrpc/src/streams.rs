//! Consumer-side streams.
//!
//! When a pending request's response announces `{result: null, stream: true}`,
//! the channel upgrades the pending entry into an [`RpcStream`]: a lazy,
//! non-restartable sequence fed by subsequent `stream-chunk` frames on the
//! same id.  Exactly one terminal is observed per stream: the end of the
//! sequence, an error thrown during iteration, or silence after a local
//! cancel.  Dropping the stream before its terminal sends `stream-cancel`
//! so the producer can wind down.

use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures::Stream;
use futures::channel::mpsc;

use crate::channel::Core;
use crate::err::RpcError;
use crate::msgs::RequestId;
use crate::value::Value;

/// One delivery from the channel driver to a consumer stream.
pub(crate) enum StreamEvent {
    /// A produced value.
    Chunk(Value),
    /// The stream completed normally.
    End,
    /// The stream failed (or the channel was destroyed mid-stream).
    Error(RpcError),
}

/// A stream of values produced by the peer.
///
/// Yields `Ok` chunks in production order, then ends; a production error
/// surfaces as one `Err` item followed by the end of the stream.
pub struct RpcStream {
    /// The id of the request that opened this stream.
    id: RequestId,
    /// Deliveries from the channel driver.
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    /// The channel, for cancel-on-drop.  Weak: a retained stream must not
    /// keep a destroyed channel alive.
    core: Weak<Core>,
    /// Set once a terminal has been observed; afterwards the stream is
    /// exhausted and dropping it sends nothing.
    done: bool,
}

impl RpcStream {
    /// Bind a new consumer stream to its delivery queue.
    pub(crate) fn new(
        id: RequestId,
        rx: mpsc::UnboundedReceiver<StreamEvent>,
        core: Weak<Core>,
    ) -> Self {
        RpcStream {
            id,
            rx,
            core,
            done: false,
        }
    }

}

impl Stream for RpcStream {
    type Item = Result<Value, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.rx).poll_next(cx) {
            Poll::Ready(Some(StreamEvent::Chunk(v))) => Poll::Ready(Some(Ok(v))),
            Poll::Ready(Some(StreamEvent::End)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Error(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            // The driver dropped the queue without a terminal; treat it as
            // the channel going away.
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(Some(Err(RpcError::ChannelClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RpcStream {
    fn drop(&mut self) {
        if !self.done {
            if let Some(core) = self.core.upgrade() {
                core.cancel_consumer(&self.id);
            }
        }
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
