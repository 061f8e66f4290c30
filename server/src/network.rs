//! Server network layer: newline-delimited JSON over TCP.
//!
//! Every connection gets its own task. The task owns the connection's
//! outbound queue and multiplexes three things with `select!`: inbound
//! frames, queued outbound messages and the idle timer. Replies produced by
//! `dispatch` go through the same queue as pushes from other connections, so
//! each connection sees messages in the order they were queued.

use crate::error::ServerError;
use crate::handlers::{GameServer, Session};
use crate::leaderboard::SharedLeaderboard;
use crate::store::CacheStore;
use log::{debug, error, info, warn};
use shared::{OutgoingMessage, ValidationInfo};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant};

/// Interval between leaderboard snapshots
pub const LEADERBOARD_PUSH_INTERVAL: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Frames longer than this many bytes are rejected
    pub max_payload: usize,
    /// Connections with no inbound frames for this long are closed
    pub activity_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_payload: 2048,
            activity_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// One newline-terminated frame read from a connection
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Text(String),
    /// The frame was not valid UTF-8
    NotUtf8,
    /// The frame ran past the payload limit and was discarded
    TooLong(usize),
}

/// Splits a byte stream into newline-terminated frames of bounded size
///
/// At most `max_payload` bytes of a frame are ever buffered. The rest of an
/// oversized frame is consumed and dropped up to its newline. All progress is
/// kept in the reader itself, so `next_frame` can be cancelled between
/// reads without losing bytes.
struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_payload: usize,
    /// Length of the oversized frame currently being discarded
    dropped: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(inner: R, max_payload: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            max_payload,
            dropped: 0,
        }
    }

    /// Returns the next frame, or `None` once the peer has closed the stream
    async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() && self.dropped == 0 {
                    return Ok(None);
                }
                // Unterminated final frame
                return Ok(Some(self.take_frame()));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk = match newline {
                Some(at) => &available[..at],
                None => available,
            };

            if self.dropped == 0 && self.buf.len() + chunk.len() <= self.max_payload {
                self.buf.extend_from_slice(chunk);
            } else {
                self.dropped += self.buf.len() + chunk.len();
                self.buf.clear();
            }

            let used = newline.map_or(chunk.len(), |at| at + 1);
            self.inner.consume(used);

            if newline.is_some() {
                return Ok(Some(self.take_frame()));
            }
        }
    }

    fn take_frame(&mut self) -> Frame {
        if self.dropped > 0 {
            return Frame::TooLong(std::mem::take(&mut self.dropped));
        }

        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }

        match String::from_utf8(bytes) {
            Ok(text) => Frame::Text(text),
            Err(_) => Frame::NotUtf8,
        }
    }
}

/// Accepts game connections and runs one task per connection
pub struct Server<S> {
    listener: TcpListener,
    handlers: GameServer<S>,
    limits: ConnectionLimits,
}

impl<S: CacheStore> Server<S> {
    pub async fn bind(addr: &str, handlers: GameServer<S>, limits: ConnectionLimits) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Game server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            handlers,
            limits,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            debug!("Accepted connection from {}", addr);

            let handlers = self.handlers.clone();
            let limits = self.limits;

            tokio::spawn(async move {
                if let Err(e) = serve_connection(handlers, stream, addr, limits).await {
                    warn!("Connection {} closed with error: {}", addr, e);
                }
            });
        }
    }
}

async fn serve_connection<S: CacheStore>(
    handlers: GameServer<S>,
    stream: TcpStream,
    addr: SocketAddr,
    limits: ConnectionLimits,
) -> Result<(), ServerError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut session = Session::new(addr, tx.clone());

    let result = connection_loop(&handlers, &mut session, stream, tx, rx, limits).await;

    // Persisted records stay put so the player can reconnect later
    handlers.disconnect(&session).await;
    info!("Connection {} closed", addr);

    result
}

async fn connection_loop<S: CacheStore>(
    handlers: &GameServer<S>,
    session: &mut Session,
    stream: TcpStream,
    tx: mpsc::UnboundedSender<OutgoingMessage>,
    mut rx: mpsc::UnboundedReceiver<OutgoingMessage>,
    limits: ConnectionLimits,
) -> Result<(), ServerError> {
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader, limits.max_payload);

    let idle = sleep(limits.activity_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            Some(message) = rx.recv() => {
                write_message(&mut writer, &message).await?;
            }

            frame = frames.next_frame() => {
                let Some(frame) = frame? else {
                    debug!("Peer {} closed the connection", session.addr());
                    break;
                };

                idle.as_mut().reset(Instant::now() + limits.activity_timeout);

                let line = match frame {
                    Frame::Text(line) => line,
                    Frame::TooLong(len) => {
                        warn!(
                            "Frame of {} bytes from {} exceeds the {} byte limit",
                            len,
                            session.addr(),
                            limits.max_payload
                        );
                        queue(&tx, OutgoingMessage::BadPayload(ValidationInfo::new(format!(
                            "payload exceeds {} bytes",
                            limits.max_payload
                        ))));
                        continue;
                    }
                    Frame::NotUtf8 => {
                        warn!("Frame from {} is not valid UTF-8", session.addr());
                        queue(&tx, OutgoingMessage::BadPayload(ValidationInfo::new(
                            "payload is not valid UTF-8",
                        )));
                        continue;
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }

                for reply in handlers.dispatch(session, &line).await {
                    queue(&tx, reply);
                }
            }

            _ = &mut idle => {
                info!(
                    "Closing connection {} after {:?} without activity",
                    session.addr(),
                    limits.activity_timeout
                );
                break;
            }
        }
    }

    // Deliver whatever was queued before the connection went away
    while let Ok(message) = rx.try_recv() {
        if write_message(&mut writer, &message).await.is_err() {
            break;
        }
    }

    Ok(())
}

fn queue(tx: &mpsc::UnboundedSender<OutgoingMessage>, message: OutgoingMessage) {
    if let Err(e) = tx.send(message) {
        error!("Failed to queue {} for sending", e.0.kind());
    }
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &OutgoingMessage) -> Result<(), ServerError> {
    let mut frame = serde_json::to_vec(message).map_err(std::io::Error::from)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read-only feed of the leaderboard
///
/// Each subscriber receives the current standings as a JSON array when it
/// connects and again every push interval. Subscribers are not expected to
/// send anything: any inbound data gets a notice and closes the connection.
pub struct LeaderboardFeed {
    listener: TcpListener,
    leaderboard: SharedLeaderboard,
    every: Duration,
}

impl LeaderboardFeed {
    pub async fn bind(addr: &str, leaderboard: SharedLeaderboard, every: Duration) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Leaderboard feed listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            leaderboard,
            every,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let leaderboard = SharedLeaderboard::clone(&self.leaderboard);
            let every = self.every;

            tokio::spawn(async move {
                if let Err(e) = feed_leaderboard(stream, leaderboard, every).await {
                    debug!("Leaderboard subscriber {} dropped: {}", addr, e);
                }
                debug!("Leaderboard subscriber {} disconnected", addr);
            });
        }
    }
}

async fn feed_leaderboard(stream: TcpStream, leaderboard: SharedLeaderboard, every: Duration) -> Result<(), ServerError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut ticker = interval(every);
    let mut buf = [0u8; 256];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = leaderboard
                    .read()
                    .await
                    .snapshot_json()
                    .map_err(std::io::Error::from)?;
                writer.write_all(snapshot.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }

            read = reader.read(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }

                writer
                    .write_all(b"{\"info\":\"the leaderboard feed does not accept messages\"}\n")
                    .await?;
                return Ok(());
            }
        }
    }
}
