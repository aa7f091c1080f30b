// One delivered unit of work and its finish/requeue/keepalive lifecycle.
//
// A message holds only a weak reference to the connection that delivered
// it, so connection teardown is never blocked by outstanding message
// handles. Taking that reference is the single authoritative release
// transition: whoever takes it first (finish, requeue, or the shutdown
// drain) owns the terminal command; everyone else gets AlreadyReleased.
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use quill_wire::{Command, MessageFrame, MessageId};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::reader_conn::ReaderShared;

#[derive(Debug)]
pub(crate) struct MessageState {
    id: MessageId,
    owner: Mutex<Option<Weak<ReaderShared>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl MessageState {
    /// Take the owner reference. `None` means the message was already
    /// finished, requeued, or drained.
    pub(crate) fn release(&self) -> Option<Weak<ReaderShared>> {
        self.owner.lock().expect("owner lock poisoned").take()
    }

    pub(crate) async fn cancel_keepalive(&self) {
        let handle = self.keepalive.lock().expect("keepalive lock poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// A message delivered to a subscriber, finished or requeued exactly once.
pub struct Message {
    id: MessageId,
    timestamp: i64,
    attempts: u16,
    body: Bytes,
    addr: String,
    state: Arc<MessageState>,
}

impl Message {
    /// Build a message from a parsed frame and register it in the owning
    /// connection's in-flight map, spawning its keepalive task.
    pub(crate) fn register(frame: MessageFrame, owner: &Arc<ReaderShared>) -> Self {
        let state = Arc::new(MessageState {
            id: frame.id,
            owner: Mutex::new(Some(Arc::downgrade(owner))),
            keepalive: Mutex::new(None),
        });
        let handle = spawn_keepalive(&state, owner);
        *state.keepalive.lock().expect("keepalive lock poisoned") = Some(handle);
        owner
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .insert(frame.id, Arc::clone(&state));
        Self {
            id: frame.id,
            timestamp: frame.timestamp,
            attempts: frame.attempts,
            body: frame.body,
            addr: owner.conn.addr().to_string(),
            state,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Peer-side enqueue time, nanoseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Address of the producer that delivered this message.
    pub fn producer_address(&self) -> &str {
        &self.addr
    }

    /// Mark the message successfully processed.
    pub async fn finish(&self) -> Result<()> {
        self.terminate(Command::Fin(self.id)).await
    }

    /// Hand the message back for redelivery after `delay`.
    pub async fn requeue(&self, delay: Duration) -> Result<()> {
        self.terminate(Command::Req {
            id: self.id,
            delay_ms: delay.as_millis() as u64,
        })
        .await
    }

    /// Extend the peer-side processing deadline without releasing.
    pub async fn touch(&self) -> Result<()> {
        let owner = self
            .state
            .owner
            .lock()
            .expect("owner lock poisoned")
            .clone()
            .ok_or(Error::AlreadyReleased)?;
        let owner = owner.upgrade().ok_or(Error::AlreadyReleased)?;
        owner.conn.send_unacked(&Command::Touch(self.id)).await
    }

    async fn terminate(&self, command: Command) -> Result<()> {
        let owner = self.state.release().ok_or(Error::AlreadyReleased)?;
        let owner = owner.upgrade().ok_or(Error::AlreadyReleased)?;
        let result = owner.conn.send_unacked(&command).await;
        owner
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(&self.id);
        self.state.cancel_keepalive().await;
        result
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id.to_string())
            .field("attempts", &self.attempts)
            .field("body_len", &self.body.len())
            .field("producer", &self.addr)
            .finish()
    }
}

fn spawn_keepalive(state: &Arc<MessageState>, owner: &Arc<ReaderShared>) -> JoinHandle<()> {
    let interval = owner.keepalive_interval;
    let state = Arc::downgrade(state);
    let owner = Arc::downgrade(owner);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(state) = state.upgrade() else { break };
            let Some(owner) = owner.upgrade() else { break };
            if state.owner.lock().expect("owner lock poisoned").is_none() {
                break;
            }
            if owner.conn.send_unacked(&Command::Touch(state.id)).await.is_err() {
                break;
            }
        }
    })
}
