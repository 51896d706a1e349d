//! The frame-oriented IO contract the channel consumes.
//!
//! The channel does not know how bytes move: it reads and writes
//! [`IoFrame`]s through a pair of object-safe traits and consults the
//! transport's [`IoCapabilities`] to decide whether structured frames (and
//! their transferable handles) may be emitted.  Framing is the transport's
//! job; every successful `read` yields exactly one logical frame.
//!
//! Two adapters live here: [`line_io`] frames text messages with newlines
//! over any async byte stream, and [`duplex`] connects two in-process
//! endpoints over queues, which is how the test suite (and in-process
//! workers) run a pair of channels.

use std::io;

use async_trait::async_trait;
use asynchronous_codec::{FramedRead, FramedWrite};
use bytes::BytesMut;
use futures::channel::mpsc;
use futures::{AsyncRead, AsyncWrite, SinkExt as _, StreamExt as _};

use crate::transfer::TransferHandle;

/// What a transport can do beyond moving text.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct IoCapabilities {
    /// The transport can carry structured frames at all.
    pub structured: bool,
    /// The transport can hand off owned resources without copying.  The
    /// channel emits v2 envelopes only when this is set and the frame has
    /// handles.
    pub transfer: bool,
}

impl IoCapabilities {
    /// Capabilities of a transport that can move handles zero-copy.
    pub fn transferable() -> Self {
        IoCapabilities {
            structured: true,
            transfer: true,
        }
    }
}

/// One logical message on the transport.
#[derive(Debug)]
#[non_exhaustive]
pub enum IoFrame {
    /// A v1 string frame.
    Text(String),
    /// A v2 structured frame: the envelope text plus the handles moving
    /// with it.
    Structured {
        /// The serialized envelope.
        payload: String,
        /// The transferred handles, aligned with the envelope's slots.
        transfers: Vec<TransferHandle>,
    },
}

/// The read half of a transport.
///
/// Read futures must be cancel-safe: the channel driver drops and re-issues
/// them freely, and a dropped read must not lose buffered data.
#[async_trait]
pub trait FrameReader: Send {
    /// Return the next frame, or `None` on orderly end-of-stream.
    async fn read(&mut self) -> io::Result<Option<IoFrame>>;
}

/// The write half of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Deliver one frame.  Implementations may buffer, but must not
    /// silently drop: an error return is the only permitted failure.
    async fn write(&mut self, frame: IoFrame) -> io::Result<()>;

    /// Best-effort teardown; after this the peer should observe
    /// end-of-stream.
    fn destroy(&mut self) {}
}

/// A connected transport, as handed to [`Channel::new`](crate::Channel::new).
#[allow(clippy::exhaustive_structs)]
pub struct RpcIo {
    /// Where inbound frames come from.
    pub reader: Box<dyn FrameReader>,
    /// Where outbound frames go.
    pub writer: Box<dyn FrameWriter>,
    /// What the transport can do.
    pub capabilities: IoCapabilities,
}

impl RpcIo {
    /// Bundle a reader and writer with their capabilities.
    pub fn new(
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        capabilities: IoCapabilities,
    ) -> Self {
        RpcIo {
            reader,
            writer,
            capabilities,
        }
    }
}

impl std::fmt::Debug for RpcIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcIo")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Decoder half of the newline framing: one frame per line.
struct LineDecoder;

impl asynchronous_codec::Decoder for LineDecoder {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(pos) = memchr::memchr(b'\n', src) else {
            return Ok(None);
        };
        let line = src.split_to(pos + 1);
        let line = &line[..pos];
        // Tolerate CRLF peers.
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame was not utf-8"))
    }
}

/// Encoder half of the newline framing: places a newline after every frame.
struct LineEncoder;

impl asynchronous_codec::Encoder for LineEncoder {
    type Item<'a> = String;
    type Error = io::Error;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use std::fmt::Write as _;
        // The line format won't survive embedded newlines.
        debug_assert!(!item.contains('\n'));
        writeln!(dst, "{}", item).expect("write! of string on BytesMut failed");
        Ok(())
    }
}

/// Read half of [`line_io`].
struct LineReader<R> {
    /// The framed byte source.
    inner: FramedRead<R, LineDecoder>,
}

#[async_trait]
impl<R> FrameReader for LineReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self) -> io::Result<Option<IoFrame>> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Ok(line)) => Ok(Some(IoFrame::Text(line))),
            Some(Err(e)) => Err(e),
        }
    }
}

/// Write half of [`line_io`].
struct LineWriter<W> {
    /// The framed byte sink.
    inner: FramedWrite<W, LineEncoder>,
}

#[async_trait]
impl<W> FrameWriter for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, frame: IoFrame) -> io::Result<()> {
        match frame {
            IoFrame::Text(s) => self.inner.send(s).await,
            IoFrame::Structured { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "text-only transport cannot carry transfer handles",
            )),
        }
    }
}

/// Frame a byte stream with newlines.
///
/// This is the adapter for pipe-like transports (stdio, sockets): v1 text
/// frames only, one per line, no transfer capability.
pub fn line_io<R, W>(read: R, write: W) -> RpcIo
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    RpcIo {
        reader: Box::new(LineReader {
            inner: FramedRead::new(read, LineDecoder),
        }),
        writer: Box::new(LineWriter {
            inner: FramedWrite::new(write, LineEncoder),
        }),
        capabilities: IoCapabilities::default(),
    }
}

/// Read half of [`duplex`].
struct QueueReader {
    /// Frames arriving from the peer endpoint.
    rx: mpsc::UnboundedReceiver<IoFrame>,
}

#[async_trait]
impl FrameReader for QueueReader {
    async fn read(&mut self) -> io::Result<Option<IoFrame>> {
        Ok(self.rx.next().await)
    }
}

/// Write half of [`duplex`].
struct QueueWriter {
    /// Frames departing toward the peer endpoint.
    tx: mpsc::UnboundedSender<IoFrame>,
}

#[async_trait]
impl FrameWriter for QueueWriter {
    async fn write(&mut self, frame: IoFrame) -> io::Result<()> {
        self.tx
            .unbounded_send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer endpoint closed"))
    }

    fn destroy(&mut self) {
        self.tx.close_channel();
    }
}

/// Connect two in-process endpoints.
///
/// Frames written on one side arrive on the other in order.  With
/// [`IoCapabilities::transferable`] the structured path moves handles
/// without copying their backing storage.
pub fn duplex(capabilities: IoCapabilities) -> (RpcIo, RpcIo) {
    let (tx_ab, rx_ab) = mpsc::unbounded();
    let (tx_ba, rx_ba) = mpsc::unbounded();
    let a = RpcIo {
        reader: Box::new(QueueReader { rx: rx_ba }),
        writer: Box::new(QueueWriter { tx: tx_ab }),
        capabilities,
    };
    let b = RpcIo {
        reader: Box::new(QueueReader { rx: rx_ab }),
        writer: Box::new(QueueWriter { tx: tx_ba }),
        capabilities,
    };
    (a, b)
}
