// A connection specialized for publishing. Error frames that arrive with
// no command pending are latched rather than dropped, and surfaced when
// the connection is closed.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use quill_wire::Command;
use tracing::warn;

use crate::config::ClientOptions;
use crate::conn::{Connection, FrameSink};
use crate::error::{Error, Result};

/// The read loop's view of a publishing connection: a single-slot error
/// latch. The first async error wins; later ones are logged.
pub(crate) struct WriterSink {
    latch: Arc<Mutex<Option<Error>>>,
}

impl WriterSink {
    pub(crate) fn latch(&self, error: Error) {
        let mut slot = self.latch.lock().expect("latch lock poisoned");
        match &*slot {
            None => *slot = Some(error),
            Some(first) => {
                warn!(%error, %first, "async error after one was already latched")
            }
        }
    }
}

/// A publishing connection bound to one peer.
pub struct WriterConnection {
    conn: Connection,
    latch: Arc<Mutex<Option<Error>>>,
}

impl WriterConnection {
    pub async fn connect(addr: &str, options: &ClientOptions) -> Result<Self> {
        let (conn, latch) = Connection::establish(addr, options, |_| {
            let latch = Arc::new(Mutex::new(None));
            let sink = FrameSink::Writer(WriterSink {
                latch: Arc::clone(&latch),
            });
            (sink, latch)
        })
        .await?;
        Ok(Self { conn, latch })
    }

    /// Publish a message, waiting for the peer's acknowledgement.
    pub async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        quill_wire::validate_name(topic)?;
        self.conn
            .issue_acked(&Command::Pub {
                topic: topic.to_string(),
                body,
            })
            .await?;
        Ok(())
    }

    /// Publish a message the peer holds back for `delay` before queueing.
    pub async fn publish_delayed(&self, topic: &str, delay: Duration, body: Bytes) -> Result<()> {
        quill_wire::validate_name(topic)?;
        self.conn
            .issue_acked(&Command::Dpub {
                topic: topic.to_string(),
                delay_ms: delay.as_millis() as u64,
                body,
            })
            .await?;
        Ok(())
    }

    pub fn addr(&self) -> &str {
        self.conn.addr()
    }

    /// Release the connection, surfacing any latched async error.
    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        let latched = self.latch.lock().expect("latch lock poisoned").take();
        match latched {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedPeer, read_command_line};
    use anyhow::Result;

    #[tokio::test]
    async fn publish_sends_body_and_waits_for_ok() -> Result<()> {
        let peer = ScriptedPeer::spawn(|mut stream| async move {
            stream.accept_handshake().await?;
            let line = read_command_line(&mut stream.reader).await?;
            assert_eq!(line, "PUB events");
            assert_eq!(stream.read_body().await?, b"payload");
            stream.send_response(b"OK").await?;
            let line = read_command_line(&mut stream.reader).await?;
            assert_eq!(line, "DPUB events 1500");
            assert_eq!(stream.read_body().await?, b"later");
            stream.send_response(b"OK").await?;
            stream.expect_eof().await
        })
        .await?;

        let conn = WriterConnection::connect(&peer.addr(), &ClientOptions::default()).await?;
        conn.publish("events", Bytes::from_static(b"payload")).await?;
        conn.publish_delayed("events", Duration::from_millis(1500), Bytes::from_static(b"later"))
            .await?;
        conn.close().await?;
        peer.join().await
    }

    #[tokio::test]
    async fn rejected_publish_surfaces_the_peer_error() -> Result<()> {
        let peer = ScriptedPeer::spawn(|mut stream| async move {
            stream.accept_handshake().await?;
            let line = read_command_line(&mut stream.reader).await?;
            assert_eq!(line, "PUB events");
            stream.read_body().await?;
            stream.send_error(b"E_PUB_FAILED no such topic").await?;
            stream.expect_eof().await
        })
        .await?;

        let conn = WriterConnection::connect(&peer.addr(), &ClientOptions::default()).await?;
        let err = conn
            .publish("events", Bytes::from_static(b"payload"))
            .await
            .expect_err("peer rejected");
        assert!(matches!(err, Error::RemotePeer(_)), "got {err:?}");
        conn.close().await?;
        peer.join().await
    }

    #[tokio::test]
    async fn unsolicited_error_is_latched_and_raised_on_close() -> Result<()> {
        let peer = ScriptedPeer::spawn(|mut stream| async move {
            stream.accept_handshake().await?;
            stream.send_error(b"E_INVALID out of band").await?;
            stream.expect_eof().await
        })
        .await?;

        let conn = WriterConnection::connect(&peer.addr(), &ClientOptions::default()).await?;
        // Let the error frame arrive before closing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = conn.close().await.expect_err("latched error");
        assert_eq!(err, Error::RemotePeer("E_INVALID out of band".to_string()));
        peer.join().await
    }

    #[tokio::test]
    async fn invalid_topic_is_rejected_locally() -> Result<()> {
        let peer = ScriptedPeer::spawn(|mut stream| async move {
            stream.accept_handshake().await?;
            stream.expect_eof().await
        })
        .await?;

        let conn = WriterConnection::connect(&peer.addr(), &ClientOptions::default()).await?;
        let err = conn
            .publish("not a topic", Bytes::from_static(b"x"))
            .await
            .expect_err("invalid name");
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
        conn.close().await?;
        peer.join().await
    }
}
