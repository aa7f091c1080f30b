// A connection specialized for consumption: subscribe, credit management,
// in-flight message bookkeeping, and a graceful drain on shutdown.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use quill_wire::{Command, MessageFrame, MessageId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SubscribeOptions;
use crate::conn::{ConnShared, Connection, FrameSink};
use crate::error::{Error, Result};
use crate::message::{Message, MessageState};

/// What a reader connection pushes into its owner's merged channel.
pub enum ReaderEvent {
    Message(Message),
    /// The connection dropped and was drained. Only directly-configured
    /// connections report this; discovered drops are handled by the
    /// lookups manager.
    Disconnected { addr: String, error: Error },
}

/// How a dropped reader connection is reported upward.
pub(crate) enum DropReport {
    /// Terminal for the owning reader: pushed onto the delivery channel.
    Terminal,
    /// Owned by a lookups manager: logged, address queued for removal so
    /// the next refresh can reopen it.
    Discovered(mpsc::UnboundedSender<String>),
}

#[derive(Debug)]
pub(crate) struct ReaderShared {
    pub(crate) conn: Arc<ConnShared>,
    pub(crate) inflight: Mutex<HashMap<MessageId, Arc<MessageState>>>,
    pub(crate) subscribed: AtomicBool,
    pub(crate) keepalive_interval: Duration,
}

impl ReaderShared {
    /// Shutdown drain: best-effort CLS, then a best-effort REQ for every
    /// remaining in-flight message. Errors are ignored; the peer times
    /// unacknowledged messages out on its own.
    pub(crate) async fn drain(&self) {
        self.subscribed.store(false, Ordering::SeqCst);
        let _ = self.conn.send_unacked(&Command::Cls).await;
        let drained: Vec<(MessageId, Arc<MessageState>)> = self
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .drain()
            .collect();
        for (id, state) in drained {
            // A concurrent finish/requeue may have won the release; skip
            // those.
            if state.release().is_some() {
                let _ = self
                    .conn
                    .send_unacked(&Command::Req { id, delay_ms: 0 })
                    .await;
                state.cancel_keepalive().await;
            }
        }
    }
}

/// The read loop's view of a consuming connection.
pub(crate) struct ReaderSink {
    pub(crate) shared: Arc<ReaderShared>,
    pub(crate) delivery: mpsc::Sender<ReaderEvent>,
    pub(crate) report: DropReport,
}

impl ReaderSink {
    pub(crate) async fn deliver(&self, frame: MessageFrame) -> bool {
        let message = Message::register(frame, &self.shared);
        self.delivery.send(ReaderEvent::Message(message)).await.is_ok()
    }

    pub(crate) async fn on_drop(self, error: Error) {
        let addr = self.shared.conn.addr().to_string();
        self.shared.drain().await;
        match self.report {
            DropReport::Terminal => {
                let _ = self
                    .delivery
                    .send(ReaderEvent::Disconnected { addr, error })
                    .await;
            }
            DropReport::Discovered(removed) => {
                warn!(%addr, %error, "discovered connection dropped; self-heals on next refresh");
                let _ = removed.send(addr);
            }
        }
    }
}

/// Live reader connections sharing one credit discipline. Used by readers
/// that re-balance RDY across every underlying connection.
#[derive(Clone, Debug, Default)]
pub(crate) struct CreditPool {
    conns: Arc<Mutex<Vec<Weak<ReaderShared>>>>,
}

impl CreditPool {
    pub(crate) fn register(&self, shared: &Arc<ReaderShared>) {
        self.conns
            .lock()
            .expect("credit pool lock poisoned")
            .push(Arc::downgrade(shared));
    }

    pub(crate) async fn set_credit(&self, credit: u64) {
        let live: Vec<Arc<ReaderShared>> = {
            let mut conns = self.conns.lock().expect("credit pool lock poisoned");
            conns.retain(|conn| conn.strong_count() > 0);
            conns.iter().filter_map(Weak::upgrade).collect()
        };
        for shared in live {
            let _ = shared.conn.send_unacked(&Command::Rdy(credit)).await;
        }
    }
}

/// A consuming connection bound to one topic/channel on one peer.
#[derive(Debug)]
pub struct ReaderConnection {
    conn: Connection,
    shared: Arc<ReaderShared>,
}

impl ReaderConnection {
    /// Connect, handshake, and subscribe. Messages and the terminal drop
    /// report arrive on `delivery`.
    pub async fn connect(
        addr: &str,
        options: &SubscribeOptions,
        delivery: mpsc::Sender<ReaderEvent>,
    ) -> Result<Self> {
        Self::connect_with(addr, options, delivery, DropReport::Terminal, None).await
    }

    pub(crate) async fn connect_with(
        addr: &str,
        options: &SubscribeOptions,
        delivery: mpsc::Sender<ReaderEvent>,
        report: DropReport,
        pool: Option<&CreditPool>,
    ) -> Result<Self> {
        quill_wire::validate_name(&options.topic)?;
        quill_wire::validate_name(&options.channel)?;
        let keepalive_interval = options.client.keepalive_interval;
        let (conn, shared) =
            Connection::establish(addr, &options.client, move |conn_shared| {
                let shared = Arc::new(ReaderShared {
                    conn: Arc::clone(conn_shared),
                    inflight: Mutex::new(HashMap::new()),
                    subscribed: AtomicBool::new(false),
                    keepalive_interval,
                });
                let sink = FrameSink::Reader(ReaderSink {
                    shared: Arc::clone(&shared),
                    delivery,
                    report,
                });
                (sink, shared)
            })
            .await?;
        let reader = Self { conn, shared };
        if let Some(pool) = pool {
            pool.register(&reader.shared);
        }
        if let Err(err) = reader.subscribe(options).await {
            let _ = reader.close().await;
            return Err(err);
        }
        Ok(reader)
    }

    async fn subscribe(&self, options: &SubscribeOptions) -> Result<()> {
        self.conn
            .issue_acked(&Command::Sub {
                topic: options.topic.clone(),
                channel: options.channel.clone(),
            })
            .await?;
        self.shared.subscribed.store(true, Ordering::SeqCst);
        debug!(addr = %self.conn.addr(), topic = %options.topic, channel = %options.channel, "subscribed");
        self.conn
            .issue_unacked(&Command::Rdy(options.client.max_in_flight))
            .await
    }

    /// Update the flow-control credit granted to the peer.
    pub async fn set_credit(&self, credit: u64) -> Result<()> {
        self.conn.issue_unacked(&Command::Rdy(credit)).await
    }

    pub fn addr(&self) -> &str {
        self.conn.addr()
    }

    pub fn in_flight(&self) -> usize {
        self.shared
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .len()
    }

    /// Drain in-flight messages, then release the underlying connection.
    pub async fn close(self) -> Result<()> {
        self.shared.drain().await;
        self.conn.close().await
    }
}
