// HTTP discovery: poll lookup endpoints for the producers currently
// serving a topic, and keep one subscribed connection per discovered
// address.
//
// All connection churn happens inside a single manager task, so a refresh
// can never interleave with another refresh or with a drop notification.
// Dropped discovered connections are only removed from the map here; the
// next refresh reopens them if the endpoint still lists the producer.
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::SubscribeOptions;
use crate::error::{Error, Result};
use crate::reader_conn::{CreditPool, DropReport, ReaderConnection, ReaderEvent};

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: Option<String>,
    address: Option<String>,
    tcp_port: u16,
}

impl Producer {
    fn tcp_addr(&self) -> Option<String> {
        let host = self.broadcast_address.as_deref().or(self.address.as_deref())?;
        Some(format!("{host}:{}", self.tcp_port))
    }
}

/// Query one lookup endpoint for the producers serving `topic`. A 404 is
/// the endpoint's way of saying "no producers", not a failure.
pub(crate) async fn lookup(
    http: &reqwest::Client,
    endpoint: &str,
    topic: &str,
) -> Result<Vec<String>> {
    let url = format!("{endpoint}/lookup");
    let response = http
        .get(&url)
        .query(&[("topic", topic)])
        .send()
        .await
        .map_err(|err| Error::Discovery(format!("{endpoint}: {err}")))?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(Vec::new());
    }
    if !response.status().is_success() {
        return Err(Error::Discovery(format!(
            "{endpoint}: unexpected status {}",
            response.status()
        )));
    }
    let body: LookupResponse = response
        .json()
        .await
        .map_err(|err| Error::Discovery(format!("{endpoint}: {err}")))?;
    Ok(body.producers.iter().filter_map(Producer::tcp_addr).collect())
}

enum ManagerCommand {
    Refresh(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Periodically reconciles the set of open discovered connections with the
/// union of producers reported by the lookup endpoints.
#[derive(Debug)]
pub struct LookupsManager {
    task: tokio::task::JoinHandle<()>,
    commands: mpsc::Sender<ManagerCommand>,
}

impl LookupsManager {
    /// Poll `endpoints` for producers serving the subscription's topic and
    /// keep one subscribed connection per listed address, delivering into
    /// `delivery`.
    pub fn spawn(
        endpoints: Vec<String>,
        options: SubscribeOptions,
        refresh_interval: Duration,
        delivery: mpsc::Sender<ReaderEvent>,
    ) -> Self {
        Self::spawn_with(
            endpoints,
            options,
            refresh_interval,
            delivery,
            CreditPool::default(),
        )
    }

    pub(crate) fn spawn_with(
        endpoints: Vec<String>,
        options: SubscribeOptions,
        refresh_interval: Duration,
        delivery: mpsc::Sender<ReaderEvent>,
        pool: CreditPool,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(8);
        let task = tokio::spawn(run_manager(
            endpoints,
            options,
            refresh_interval,
            delivery,
            pool,
            command_rx,
        ));
        Self { task, commands }
    }

    /// Trigger an out-of-band refresh and wait for it to complete.
    pub async fn refresh(&self) -> Result<()> {
        let (done, notified) = oneshot::channel();
        self.commands
            .send(ManagerCommand::Refresh(done))
            .await
            .map_err(|_| Error::Dropped("lookups manager stopped".to_string()))?;
        notified
            .await
            .map_err(|_| Error::Dropped("lookups manager stopped".to_string()))
    }

    /// Stop refreshing and close every discovered connection.
    pub async fn close(self) -> Result<()> {
        let (done, notified) = oneshot::channel();
        if self.commands.send(ManagerCommand::Shutdown(done)).await.is_ok() {
            let _ = notified.await;
        }
        self.task.abort();
        let _ = self.task.await;
        Ok(())
    }
}

async fn run_manager(
    endpoints: Vec<String>,
    options: SubscribeOptions,
    refresh_interval: Duration,
    delivery: mpsc::Sender<ReaderEvent>,
    pool: CreditPool,
    mut commands: mpsc::Receiver<ManagerCommand>,
) {
    let http = reqwest::Client::new();
    let mut conns: HashMap<String, ReaderConnection> = HashMap::new();
    let (dropped_tx, mut dropped) = mpsc::unbounded_channel::<String>();
    let mut had_connections = false;
    let mut ticker = tokio::time::interval(refresh_interval);
    // The first tick fires immediately: startup discovery.
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                refresh_once(&http, &endpoints, &options, &delivery, &pool, &dropped_tx, &mut conns).await;
            }
            Some(addr) = dropped.recv() => {
                // Already drained by its read loop; forget it so the next
                // refresh can reopen.
                conns.remove(&addr);
            }
            command = commands.recv() => {
                match command {
                    Some(ManagerCommand::Refresh(done)) => {
                        refresh_once(&http, &endpoints, &options, &delivery, &pool, &dropped_tx, &mut conns).await;
                        let _ = done.send(());
                    }
                    Some(ManagerCommand::Shutdown(done)) => {
                        for (_, conn) in conns.drain() {
                            let _ = conn.close().await;
                        }
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        for (_, conn) in conns.drain() {
                            let _ = conn.close().await;
                        }
                        return;
                    }
                }
            }
        }
        if !conns.is_empty() {
            had_connections = true;
        } else if had_connections {
            warn!(topic = %options.topic, "no producer connections remain");
            had_connections = false;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn refresh_once(
    http: &reqwest::Client,
    endpoints: &[String],
    options: &SubscribeOptions,
    delivery: &mpsc::Sender<ReaderEvent>,
    pool: &CreditPool,
    dropped: &mpsc::UnboundedSender<String>,
    conns: &mut HashMap<String, ReaderConnection>,
) {
    let mut desired = HashSet::new();
    for endpoint in endpoints {
        match lookup(http, endpoint, &options.topic).await {
            Ok(addrs) => desired.extend(addrs),
            Err(err) => warn!(%endpoint, %err, "lookup failed"),
        }
    }

    let stale: Vec<String> = conns
        .keys()
        .filter(|addr| !desired.contains(*addr))
        .cloned()
        .collect();
    for addr in stale {
        if let Some(conn) = conns.remove(&addr) {
            debug!(%addr, "producer no longer listed; closing");
            let _ = conn.close().await;
        }
    }

    for addr in desired {
        if conns.contains_key(&addr) {
            continue;
        }
        match ReaderConnection::connect_with(
            &addr,
            options,
            delivery.clone(),
            DropReport::Discovered(dropped.clone()),
            Some(pool),
        )
        .await
        {
            Ok(conn) => {
                debug!(%addr, topic = %options.topic, "discovered producer connected");
                conns.insert(addr, conn);
            }
            Err(err) => warn!(%addr, %err, "discovered producer connect failed"),
        }
    }
}
