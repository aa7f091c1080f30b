// Async client for the quill message-queue protocol.
//
// Layering, bottom up:
//
//   - `frame_io` / `conn`: one TCP session with a background read loop,
//     transparent heartbeat replies, and acked-command correlation.
//   - `reader_conn` / `writer_conn`: the consuming and publishing
//     specializations of a connection.
//   - `message`: delivered units of work with finish/requeue/touch and a
//     per-message keepalive task.
//   - `lookup`: HTTP discovery and the manager that reconciles discovered
//     connections.
//   - `reader`: the top-level consumer, merging every connection into one
//     channel, plus the one-at-a-time variant.
//
// Design notes:
//
//   - At most one acked command is outstanding per connection; the command
//     lock holds across send-then-wait, so responses correlate by order.
//   - Messages hold only weak references to their connection. Teardown is
//     never blocked by outstanding message handles, and a late finish on a
//     drained connection reports AlreadyReleased instead of hanging.
//   - Backpressure is the merged delivery channel: when it fills, each
//     delivering connection's read loop suspends independently.
//   - Every handle is released with an explicit async `close`; dropping
//     one leaks its background tasks until the runtime shuts down.

mod config;
mod conn;
mod error;
mod frame_io;
mod lookup;
mod message;
mod reader;
mod reader_conn;
#[cfg(test)]
mod test_support;
mod writer_conn;

pub use config::{
    ClientOptions, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_REFRESH_INTERVAL, SubscribeOptions,
};
pub use conn::{ConnState, Connection};
pub use error::{Error, Result};
pub use lookup::LookupsManager;
pub use message::Message;
pub use reader::{Reader, ReaderOptions, SingleMessageReader};
pub use reader_conn::{ReaderConnection, ReaderEvent};
pub use writer_conn::WriterConnection;
