// One network session: handshake, a single background read loop, command
// issuance with response correlation, and transparent heartbeat replies.
//
// The write side is a single shared resource guarded by a mutex; acked
// commands additionally hold the command lock across the send-then-wait
// sequence so no two acked commands can race on one connection. The read
// loop is the only reader of the socket and the only resolver of the
// pending-response cell.
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use quill_wire::{Command, Frame, HEARTBEAT, MAGIC, OK};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::frame_io::read_frame;
use crate::reader_conn::ReaderSink;
use crate::writer_conn::WriterSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// State shared between a connection handle, its read loop, and any
/// messages it delivered.
#[derive(Debug)]
pub(crate) struct ConnShared {
    addr: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    // Serializes acked commands: at most one unacknowledged command in
    // flight per connection.
    cmd_lock: tokio::sync::Mutex<()>,
    // Single-assignment cell for the response to the outstanding acked
    // command. Heartbeats never occupy this slot.
    pending: std::sync::Mutex<Option<oneshot::Sender<Result<Bytes>>>>,
    state: std::sync::Mutex<ConnState>,
    max_frame_bytes: usize,
}

impl ConnShared {
    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    /// Fire-and-forget write, used for credit updates and message-terminal
    /// commands that need no synchronous acknowledgement.
    pub(crate) async fn send_unacked(&self, command: &Command) -> Result<()> {
        if self.state() == ConnState::Closed {
            return Err(Error::Dropped(format!("{} is closed", self.addr)));
        }
        let encoded = command.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Send a command and wait for the next non-heartbeat response frame,
    /// failing if the payload does not match the expected literal.
    pub(crate) async fn issue_acked(&self, command: &Command, expect: &[u8]) -> Result<Bytes> {
        let _guard = self.cmd_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            *pending = Some(tx);
        }
        if let Err(err) = self.send_unacked(command).await {
            self.pending.lock().expect("pending lock poisoned").take();
            return Err(err);
        }
        let payload = rx
            .await
            .map_err(|_| Error::Dropped(format!("{} closed awaiting response", self.addr)))??;
        if payload.as_ref() != expect {
            return Err(Error::Protocol(format!(
                "unexpected {} response: {:?}",
                command.name(),
                String::from_utf8_lossy(&payload)
            )));
        }
        Ok(payload)
    }

    /// Resolve the pending acked-command cell, if any. Returns false when
    /// no command was waiting.
    pub(crate) fn resolve_pending(&self, result: Result<Bytes>) -> bool {
        let tx = self.pending.lock().expect("pending lock poisoned").take();
        match tx {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

/// Where a connection's inbound message frames and async errors go.
pub(crate) enum FrameSink {
    /// Base connections: message frames are unexpected.
    Discard,
    /// Consuming connections: deliver messages, drain on drop.
    Reader(ReaderSink),
    /// Publishing connections: latch async errors for deferred surfacing.
    Writer(WriterSink),
}

impl FrameSink {
    async fn deliver(&self, frame: quill_wire::MessageFrame, shared: &Arc<ConnShared>) -> bool {
        match self {
            FrameSink::Reader(sink) => sink.deliver(frame).await,
            _ => {
                warn!(addr = %shared.addr, id = %frame.id, "message frame on a non-subscribed connection");
                true
            }
        }
    }

    fn on_peer_error(&self, error: Error, shared: &ConnShared) {
        match self {
            FrameSink::Writer(sink) => sink.latch(error),
            _ => warn!(addr = %shared.addr, %error, "peer error with no pending command"),
        }
    }

    async fn on_drop(self, error: Error, shared: &Arc<ConnShared>) {
        match self {
            FrameSink::Discard => debug!(addr = %shared.addr, %error, "connection dropped"),
            FrameSink::Writer(sink) => sink.latch(error),
            FrameSink::Reader(sink) => sink.on_drop(error).await,
        }
    }
}

/// The per-connection read loop. Runs until the transport fails or the
/// owner aborts it; reports the terminal condition through the sink
/// exactly once.
pub(crate) async fn run_read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<ConnShared>,
    sink: FrameSink,
) {
    let mut scratch = BytesMut::with_capacity(64 * 1024);
    let error = loop {
        let frame = match read_frame(&mut reader, &mut scratch, shared.max_frame_bytes).await {
            Ok(frame) => frame,
            Err(err) => break err,
        };
        match frame {
            Frame::Response(payload) if payload.as_ref() == HEARTBEAT => {
                // Answered transparently; never resolves the pending cell.
                if let Err(err) = shared.send_unacked(&Command::Nop).await {
                    break err;
                }
            }
            Frame::Response(payload) => {
                if !shared.resolve_pending(Ok(payload)) {
                    debug!(addr = %shared.addr, "response frame with no pending command");
                }
            }
            Frame::Error(payload) => {
                let error = Error::RemotePeer(String::from_utf8_lossy(&payload).into_owned());
                if !shared.resolve_pending(Err(error.clone())) {
                    sink.on_peer_error(error, &shared);
                }
            }
            Frame::Message(frame) => {
                // May suspend when the delivery channel is full: a slow
                // consumer stalls this connection's read loop, not siblings.
                if !sink.deliver(frame, &shared).await {
                    break Error::Dropped("delivery channel closed".to_string());
                }
            }
        }
    };
    shared.set_state(ConnState::Closing);
    shared.resolve_pending(Err(error.clone()));
    sink.on_drop(error, &shared).await;
}

/// One network session against a single peer address.
#[derive(Debug)]
pub struct Connection {
    shared: Arc<ConnShared>,
    read_task: JoinHandle<()>,
}

impl Connection {
    /// Connect and perform the handshake with no message sink attached.
    pub async fn open(addr: &str, options: &ClientOptions) -> Result<Self> {
        let (conn, ()) = Self::establish(addr, options, |_| (FrameSink::Discard, ())).await?;
        Ok(conn)
    }

    /// Connect, attach a frame sink built around the shared connection
    /// state, and perform the handshake. The connection is torn down on
    /// every failure path, including a rejected handshake.
    pub(crate) async fn establish<T>(
        addr: &str,
        options: &ClientOptions,
        make_sink: impl FnOnce(&Arc<ConnShared>) -> (FrameSink, T),
    ) -> Result<(Self, T)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| Error::Dropped(format!("connect {addr}: {err}")))?;
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(ConnShared {
            addr: addr.to_string(),
            writer: tokio::sync::Mutex::new(write_half),
            cmd_lock: tokio::sync::Mutex::new(()),
            pending: std::sync::Mutex::new(None),
            state: std::sync::Mutex::new(ConnState::Handshaking),
            max_frame_bytes: options.max_frame_bytes,
        });
        let (sink, extra) = make_sink(&shared);
        let read_task = tokio::spawn(run_read_loop(read_half, Arc::clone(&shared), sink));
        let conn = Self {
            shared: Arc::clone(&shared),
            read_task,
        };
        if let Err(err) = conn.handshake(options).await {
            let _ = conn.close().await;
            return Err(err);
        }
        shared.set_state(ConnState::Open);
        debug!(%addr, "connection open");
        Ok((conn, extra))
    }

    async fn handshake(&self, options: &ClientOptions) -> Result<()> {
        {
            let mut writer = self.shared.writer.lock().await;
            writer.write_all(MAGIC).await?;
        }
        let body = options.identify().encode()?;
        match self
            .shared
            .issue_acked(&Command::Identify { body }, OK)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Protocol(msg)) => Err(Error::Protocol(format!("handshake failed: {msg}"))),
            Err(Error::RemotePeer(msg)) => {
                Err(Error::Protocol(format!("handshake rejected: {msg}")))
            }
            Err(other) => Err(other),
        }
    }

    pub fn addr(&self) -> &str {
        self.shared.addr()
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    pub(crate) fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }

    /// Issue a command and wait for its `OK` acknowledgement.
    pub async fn issue_acked(&self, command: &Command) -> Result<Bytes> {
        self.shared.issue_acked(command, OK).await
    }

    /// Fire-and-forget command write.
    pub async fn issue_unacked(&self, command: &Command) -> Result<()> {
        self.shared.send_unacked(command).await
    }

    /// Cancel and await the read loop, then release the socket. Guaranteed
    /// teardown on every exit path.
    pub async fn close(self) -> Result<()> {
        self.shared.set_state(ConnState::Closing);
        self.read_task.abort();
        let _ = self.read_task.await;
        self.shared.set_state(ConnState::Closed);
        debug!(addr = %self.shared.addr, "connection closed");
        Ok(())
    }
}
