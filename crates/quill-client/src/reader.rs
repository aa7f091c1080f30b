// The top-level consumer: a set of subscribed connections (directly
// configured plus discovered) merged into one delivery channel.
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{
    ClientOptions, DEFAULT_QUEUE_CAPACITY, DEFAULT_REFRESH_INTERVAL, SubscribeOptions,
};
use crate::error::{Error, Result};
use crate::lookup::LookupsManager;
use crate::message::Message;
use crate::reader_conn::{CreditPool, DropReport, ReaderConnection, ReaderEvent};

/// Everything a reader needs: the subscription, where to find producers,
/// and the per-connection client options.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub topic: String,
    pub channel: String,
    /// Producer addresses to connect to directly. A drop here is terminal.
    pub addresses: Vec<String>,
    /// Discovery endpoints polled for producers. Drops among discovered
    /// connections self-heal on the next refresh.
    pub lookup_endpoints: Vec<String>,
    pub refresh_interval: Duration,
    pub queue_capacity: usize,
    pub client: ClientOptions,
}

impl ReaderOptions {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            addresses: Vec::new(),
            lookup_endpoints: Vec::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            client: ClientOptions::default(),
        }
    }

    pub fn addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn lookup_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.lookup_endpoints = endpoints;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn client(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }

    fn subscribe(&self) -> SubscribeOptions {
        SubscribeOptions {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
            client: self.client.clone(),
        }
    }
}

/// A subscribed consumer over any number of producer connections.
#[derive(Debug)]
pub struct Reader {
    events: mpsc::Receiver<ReaderEvent>,
    direct: Vec<ReaderConnection>,
    lookups: Option<LookupsManager>,
    pool: CreditPool,
}

impl Reader {
    pub async fn connect(options: &ReaderOptions) -> Result<Self> {
        quill_wire::validate_name(&options.topic)?;
        quill_wire::validate_name(&options.channel)?;
        let subscribe = options.subscribe();
        let (delivery, events) = mpsc::channel(options.queue_capacity.max(1));
        let pool = CreditPool::default();

        let mut direct: Vec<ReaderConnection> = Vec::with_capacity(options.addresses.len());
        for addr in &options.addresses {
            let conn = match ReaderConnection::connect_with(
                addr,
                &subscribe,
                delivery.clone(),
                DropReport::Terminal,
                Some(&pool),
            )
            .await
            {
                Ok(conn) => conn,
                Err(err) => {
                    for conn in direct {
                        let _ = conn.close().await;
                    }
                    return Err(err);
                }
            };
            direct.push(conn);
        }

        let lookups = if options.lookup_endpoints.is_empty() {
            None
        } else {
            Some(LookupsManager::spawn_with(
                options.lookup_endpoints.clone(),
                subscribe,
                options.refresh_interval,
                delivery,
                pool.clone(),
            ))
        };

        Ok(Self {
            events,
            direct,
            lookups,
            pool,
        })
    }

    /// Next message across every connection. `Ok(None)` means every
    /// connection is gone and no more messages can arrive; a drop of a
    /// directly-configured connection is a terminal error.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        match self.events.recv().await {
            None => Ok(None),
            Some(ReaderEvent::Message(message)) => Ok(Some(message)),
            Some(ReaderEvent::Disconnected { error, .. }) => Err(error),
        }
    }

    /// Re-grant flow-control credit on every live connection, discovered
    /// ones included.
    pub async fn set_credit(&self, credit: u64) {
        self.pool.set_credit(credit).await;
    }

    /// Force a discovery refresh now instead of waiting for the next poll.
    pub async fn refresh(&self) -> Result<()> {
        match &self.lookups {
            Some(lookups) => lookups.refresh().await,
            None => Ok(()),
        }
    }

    /// Drain and release every connection.
    pub async fn close(mut self) -> Result<()> {
        if let Some(lookups) = self.lookups.take() {
            lookups.close().await?;
        }
        for conn in self.direct.drain(..) {
            let _ = conn.close().await;
        }
        Ok(())
    }
}

/// A reader that holds credit at zero between calls, so at most one
/// message is in flight at a time.
///
/// Credit revocation races deliveries that were already on the wire, so
/// each call first requeues anything that arrived after the previous
/// revoke.
pub struct SingleMessageReader {
    reader: Reader,
}

impl SingleMessageReader {
    pub async fn connect(options: &ReaderOptions) -> Result<Self> {
        let mut options = options.clone();
        // Connections start with zero credit; it is granted one message at
        // a time inside `next`.
        options.client.max_in_flight = 0;
        let reader = Reader::connect(&options).await?;
        Ok(Self { reader })
    }

    pub async fn next(&mut self) -> Result<Option<Message>> {
        loop {
            match self.reader.events.try_recv() {
                Ok(ReaderEvent::Message(stale)) => {
                    // Arrived after the previous revoke; hand it back for
                    // immediate redelivery.
                    match stale.requeue(Duration::ZERO).await {
                        Ok(()) | Err(Error::AlreadyReleased) => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(ReaderEvent::Disconnected { error, .. }) => return Err(error),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(None),
            }
        }
        self.reader.set_credit(1).await;
        let result = self.reader.next().await;
        self.reader.set_credit(0).await;
        result
    }

    pub async fn refresh(&self) -> Result<()> {
        self.reader.refresh().await
    }

    pub async fn close(self) -> Result<()> {
        self.reader.close().await
    }
}
