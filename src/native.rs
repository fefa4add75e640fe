//! Driver running a [`Connection`] over a tokio byte stream.
use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{future::poll_fn, SinkExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    close::CloseCode, CompressionConfig, Connection, Event, Message, Options, Result, Role,
    WebSocketError,
};

/// Bytes requested from the transport per read.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A WebSocket over an already upgraded stream.
///
/// `WebSocket` reads from and writes to `S` on behalf of a [`Connection`]. Pongs and close
/// frames queued by the connection are written while waiting for input, so a reader that keeps
/// polling [`WebSocket::next_event`] also keeps the protocol obligations flowing.
///
/// It implements [`futures::Stream`] of events and [`futures::Sink`] of messages. The sink
/// only waits for the transport once the queued output passes the high water mark, call
/// `flush` to force it out.
///
/// # Example
/// ```no_run
/// use wsengine::{CompressionConfig, Event, Message, Options, Role, WebSocket};
///
/// # async fn run(stream: tokio::net::TcpStream) -> wsengine::Result<()> {
/// let mut ws = WebSocket::new(stream, Role::Server, Options::default(), CompressionConfig::disabled());
/// while let Some(event) = ws.next_event().await? {
///     if let Event::Message(message @ Message::Text(_)) = event {
///         ws.send(message).await?;
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct WebSocket<S> {
    stream: S,
    connection: Connection,
    read_buf: BytesMut,
    events: VecDeque<Event>,
    /// Output taken from the connection and not completely written yet.
    pending: VecDeque<Bytes>,
    needs_flush: bool,
    /// The event stream ended, with `None` or after an error.
    done: bool,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `stream`, on which the opening handshake already completed.
    pub fn new(stream: S, role: Role, options: Options, config: CompressionConfig) -> Self {
        Self::from_connection(stream, Connection::new(role, options, config))
    }

    pub fn from_connection(stream: S, connection: Connection) -> Self {
        Self {
            stream,
            connection,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            events: VecDeque::new(),
            pending: VecDeque::new(),
            needs_flush: false,
            done: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Returns the underlying stream. Output not written yet is lost.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Polls for the next event.
    ///
    /// Output queued by the connection is written while waiting for input, and before reading
    /// more once it passes the high water mark. Returns `None` once the connection is closed
    /// and every queued byte was written.
    pub fn poll_next_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Event>>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Poll::Ready(Ok(Some(event)));
            }

            if self.connection.is_closed() {
                ready!(self.poll_write_pending(cx))?;
                return Poll::Ready(Ok(None));
            }

            // a peer that never stops sending must not grow the output without bound
            if self.connection.needs_drain() || !self.pending.is_empty() {
                ready!(self.poll_write_pending(cx))?;
            }

            match self.poll_read(cx) {
                Poll::Ready(Ok(0)) => {
                    let events = self.connection.transport_closed();
                    self.events.extend(events);
                }
                Poll::Ready(Ok(_)) => {
                    let chunk = self.read_buf.split();
                    let events = self.connection.feed(&chunk);
                    self.events.extend(events);
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
                Poll::Pending => {
                    ready!(self.poll_write_pending(cx))?;
                    return Poll::Pending;
                }
            }
        }
    }

    /// Waits for the next event. See [`WebSocket::poll_next_event`].
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        poll_fn(|cx| self.poll_next_event(cx)).await
    }

    /// Sends a message and flushes it to the transport.
    pub async fn send(&mut self, message: Message) -> Result<()> {
        SinkExt::send(self, message).await
    }

    /// Sends a data message split in frames of at most `fragment_size` bytes.
    pub async fn send_fragmented(&mut self, message: Message, fragment_size: usize) -> Result<()> {
        self.connection.send_fragmented(message, fragment_size)?;
        self.flush_output().await
    }

    pub async fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.connection.ping(payload)?;
        self.flush_output().await
    }

    /// Starts the close handshake. Keep polling for events to receive the peer's answer.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        self.connection.close(code, reason)?;
        self.events.extend(self.connection.poll_events());
        self.flush_output().await
    }

    async fn flush_output(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_write_pending(cx)).await
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        self.read_buf.reserve(READ_BUFFER_SIZE);

        let mut buf = ReadBuf::uninit(self.read_buf.spare_capacity_mut());
        ready!(Pin::new(&mut self.stream).poll_read(cx, &mut buf))?;
        let n = buf.filled().len();

        // SAFETY: poll_read initialized the first `n` bytes of the spare capacity.
        unsafe { self.read_buf.advance_mut(n) };

        Poll::Ready(Ok(n))
    }

    /// Writes out everything the connection queued, then flushes the transport.
    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.pending.extend(self.connection.take_output());

        while let Some(buf) = self.pending.front_mut() {
            let n = ready!(Pin::new(&mut self.stream).poll_write(cx, buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero).into()));
            }

            buf.advance(n);
            if buf.is_empty() {
                self.pending.pop_front();
            }
            self.needs_flush = true;
        }

        if self.needs_flush {
            ready!(Pin::new(&mut self.stream).poll_flush(cx))?;
            self.needs_flush = false;
        }

        Poll::Ready(Ok(()))
    }
}

impl<S> futures::Stream for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match ready!(this.poll_next_event(cx)) {
            Ok(Some(event)) => Poll::Ready(Some(Ok(event))),
            Ok(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Err(err) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<S> futures::Sink<Message> for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = WebSocketError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if this.connection.needs_drain() {
            ready!(this.poll_write_pending(cx))?;
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<()> {
        let this = self.get_mut();
        this.connection.send(item)?;
        this.events.extend(this.connection.poll_events());
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.get_mut().poll_write_pending(cx)
    }

    /// Starts the close handshake with [`CloseCode::Normal`] unless it already started.
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if this.connection.state() == crate::State::Open {
            this.connection.close(CloseCode::Normal, "")?;
            this.events.extend(this.connection.poll_events());
        }
        this.poll_write_pending(cx)
    }
}
