// na-mux: Typed stream multiplexing over a single transport.
//
// Restates the multiplex contract the session engine relies on: many
// bidirectional streams over one connection, each opened with a one-byte
// type tag, plus a heartbeat exchange on a dedicated stream type.  The
// framing itself is yamux; nothing here inspects its wire format.
//
// yamux's connection state machine is driven by polling, so each session
// spawns a driver task that owns the connection and services stream-open
// requests and inbound streams through channels.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub mod heartbeat;

/// Stream type tag reserved for the heartbeat exchange.  Not an RPC type;
/// chosen well clear of the frozen request-type constants.
pub const HEARTBEAT_TYPE: u8 = 0xFF;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("multiplex session closed")]
    Closed,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection: {0}")]
    Connection(#[from] yamux::ConnectionError),
}

/// Which end of the transport this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

enum Cmd {
    Open(oneshot::Sender<Result<yamux::Stream, MuxError>>),
    Close,
}

/// Handle to a live multiplex session.  Cheap to clone; all clones refer
/// to the same underlying connection.
#[derive(Clone)]
pub struct MuxSession {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    done: CancellationToken,
}

/// Receiver half for server-originated streams.  Exactly one per session.
pub struct MuxAcceptor {
    rx: mpsc::UnboundedReceiver<yamux::Stream>,
}

impl MuxSession {
    /// Start a session over `io`, spawning the connection driver task.
    pub fn new<I>(io: I, side: Side) -> (MuxSession, MuxAcceptor)
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mode = match side {
            Side::Client => yamux::Mode::Client,
            Side::Server => yamux::Mode::Server,
        };
        let conn = yamux::Connection::new(io.compat(), yamux::Config::default(), mode);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let done = CancellationToken::new();

        tokio::spawn(drive(conn, cmd_rx, inbound_tx, done.clone()));

        (
            MuxSession { cmd_tx, done },
            MuxAcceptor { rx: inbound_rx },
        )
    }

    /// Open a new stream tagged with `ty`.
    pub async fn open_typed(&self, ty: u8) -> Result<TypedStream, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Open(tx))
            .map_err(|_| MuxError::Closed)?;
        let stream = rx.await.map_err(|_| MuxError::Closed)??;
        let mut io = stream.compat();
        io.write_u8(ty).await?;
        io.flush().await?;
        Ok(TypedStream { ty, io })
    }

    /// Begin a graceful close.  Idempotent; streams error out as the
    /// connection winds down.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Cmd::Close);
    }

    /// Resolves once the driver has torn the connection down.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }
}

impl MuxAcceptor {
    /// Wait for the next peer-originated stream and read its type tag.
    pub async fn accept(&mut self) -> Result<TypedStream, MuxError> {
        let stream = self.rx.recv().await.ok_or(MuxError::Closed)?;
        let mut io = stream.compat();
        let ty = io.read_u8().await?;
        Ok(TypedStream { ty, io })
    }
}

/// One multiplexed stream with its type tag already exchanged.
pub struct TypedStream {
    ty: u8,
    io: Compat<yamux::Stream>,
}

impl TypedStream {
    pub fn stream_type(&self) -> u8 {
        self.ty
    }
}

impl AsyncRead for TypedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TypedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for TypedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedStream").field("ty", &self.ty).finish()
    }
}

/// Connection driver.  Owns the yamux state machine; everything else talks
/// to it through the command and inbound channels.
async fn drive<I>(
    mut conn: yamux::Connection<Compat<I>>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    inbound_tx: mpsc::UnboundedSender<yamux::Stream>,
    done: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut pending_opens: VecDeque<oneshot::Sender<Result<yamux::Stream, MuxError>>> =
        VecDeque::new();
    let mut closing = false;

    poll_fn(|cx: &mut Context<'_>| {
        if !closing {
            loop {
                match cmd_rx.poll_recv(cx) {
                    Poll::Ready(Some(Cmd::Open(tx))) => pending_opens.push_back(tx),
                    Poll::Ready(Some(Cmd::Close)) | Poll::Ready(None) => {
                        closing = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        if closing {
            for tx in pending_opens.drain(..) {
                let _ = tx.send(Err(MuxError::Closed));
            }
            return match conn.poll_close(cx) {
                Poll::Ready(res) => {
                    if let Err(e) = res {
                        debug!(error = %e, "multiplex close");
                    }
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            };
        }

        while !pending_opens.is_empty() {
            match conn.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    let tx = pending_opens.pop_front().expect("queue is non-empty");
                    // Receiver may have given up waiting; yamux reaps the
                    // dropped stream.
                    let _ = tx.send(Ok(stream));
                }
                Poll::Ready(Err(e)) => {
                    debug!(error = %e, "outbound open failed, connection is dead");
                    for tx in pending_opens.drain(..) {
                        let _ = tx.send(Err(MuxError::Closed));
                    }
                    return Poll::Ready(());
                }
                Poll::Pending => break,
            }
        }

        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    trace!("inbound stream");
                    // If the acceptor is gone the stream is dropped, which
                    // resets it at the yamux layer.
                    let _ = inbound_tx.send(stream);
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!(error = %e, "multiplex terminal error");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    debug!("multiplex closed by peer");
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    done.cancel();
}
