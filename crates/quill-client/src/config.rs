// Client-side defaults and per-connection option templates.
use std::time::Duration;

use quill_wire::Identify;

/// Default credit granted to a subscribing connection.
pub const DEFAULT_MAX_IN_FLIGHT: u64 = 10;
/// Default cadence for per-message TOUCH keepalives.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Default capacity of a reader's merged delivery channel; a full channel
/// suspends the delivering connection's read loop (the backpressure point).
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default cadence for discovery refresh.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Hard safety cap for any single inbound frame.
///
/// The read loop allocates a buffer sized by the advertised length, so an
/// unchecked length from a buggy or hostile peer could trigger OOM.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Per-connection options: identity metadata sent at handshake plus the
/// knobs that shape delivery on that connection.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub max_in_flight: u64,
    pub keepalive_interval: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let client_id = hostname
            .split('.')
            .next()
            .unwrap_or(hostname.as_str())
            .to_string();
        Self {
            client_id,
            hostname,
            user_agent: concat!("quill-client/", env!("CARGO_PKG_VERSION")).to_string(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientOptions {
    pub(crate) fn identify(&self) -> Identify {
        Identify {
            client_id: self.client_id.clone(),
            hostname: self.hostname.clone(),
            user_agent: self.user_agent.clone(),
            feature_negotiation: false,
        }
    }
}

/// Subscription template applied to every connection a reader opens,
/// directly-configured and discovered alike.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub topic: String,
    pub channel: String,
    pub client: ClientOptions,
}
