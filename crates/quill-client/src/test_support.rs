// Scripted localhost peers for exercising the client against a real
// transport: a TCP peer that speaks the wire protocol and a canned-response
// HTTP fixture for discovery endpoints.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, ensure};
use quill_wire::{Frame, MessageFrame, MessageId};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A single-connection scripted peer. The script runs against the accepted
/// stream; `join` surfaces any assertion failure inside it.
pub(crate) struct ScriptedPeer {
    addr: SocketAddr,
    task: JoinHandle<Result<()>>,
}

impl ScriptedPeer {
    pub(crate) async fn spawn<F, Fut>(script: F) -> Result<Self>
    where
        F: FnOnce(PeerStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.context("accept")?;
            script(PeerStream {
                reader: BufReader::new(stream),
            })
            .await
        });
        Ok(Self { addr, task })
    }

    pub(crate) fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub(crate) async fn join(self) -> Result<()> {
        self.task.await.context("peer task panicked")?
    }
}

pub(crate) struct PeerStream {
    pub(crate) reader: BufReader<TcpStream>,
}

impl PeerStream {
    /// Consume the version marker and IDENTIFY command, returning the
    /// identify body for inspection. Does not acknowledge.
    pub(crate) async fn expect_handshake(&mut self) -> Result<Vec<u8>> {
        let mut magic = [0u8; 4];
        self.reader.read_exact(&mut magic).await?;
        ensure!(&magic == quill_wire::MAGIC, "bad version marker: {magic:?}");
        let line = read_command_line(&mut self.reader).await?;
        ensure!(line == "IDENTIFY", "expected IDENTIFY, got {line:?}");
        self.read_body().await
    }

    /// Shorthand for the common accept path: handshake then OK.
    pub(crate) async fn accept_handshake(&mut self) -> Result<()> {
        self.expect_handshake().await?;
        self.send_response(b"OK").await
    }

    /// Consume SUB + initial RDY from a subscribing connection.
    pub(crate) async fn expect_subscribe(&mut self, topic: &str, channel: &str) -> Result<u64> {
        let line = read_command_line(&mut self.reader).await?;
        ensure!(
            line == format!("SUB {topic} {channel}"),
            "unexpected subscribe: {line:?}"
        );
        self.send_response(b"OK").await?;
        let line = read_command_line(&mut self.reader).await?;
        let credit = line
            .strip_prefix("RDY ")
            .with_context(|| format!("expected RDY, got {line:?}"))?
            .parse()?;
        Ok(credit)
    }

    pub(crate) async fn read_body(&mut self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes).await?;
        let mut body = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
        self.reader.read_exact(&mut body).await?;
        Ok(body)
    }

    pub(crate) async fn send_response(&mut self, payload: &[u8]) -> Result<()> {
        let frame = Frame::Response(bytes::Bytes::copy_from_slice(payload));
        self.reader.get_mut().write_all(&frame.encode()?).await?;
        Ok(())
    }

    pub(crate) async fn send_error(&mut self, payload: &[u8]) -> Result<()> {
        let frame = Frame::Error(bytes::Bytes::copy_from_slice(payload));
        self.reader.get_mut().write_all(&frame.encode()?).await?;
        Ok(())
    }

    pub(crate) async fn send_message(
        &mut self,
        id: &[u8; quill_wire::MESSAGE_ID_LEN],
        attempts: u16,
        body: &[u8],
    ) -> Result<()> {
        let frame = Frame::Message(MessageFrame {
            timestamp: 1_700_000_000_000_000_000,
            attempts,
            id: MessageId(*id),
            body: bytes::Bytes::copy_from_slice(body),
        });
        self.reader.get_mut().write_all(&frame.encode()?).await?;
        Ok(())
    }

    pub(crate) async fn expect_eof(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        let n = self.reader.read(&mut byte).await?;
        ensure!(n == 0, "expected eof, got byte {:#04x}", byte[0]);
        Ok(())
    }
}

pub(crate) async fn read_command_line(reader: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    ensure!(n > 0, "unexpected eof while reading command line");
    Ok(line.trim_end_matches('\n').to_string())
}

/// Minimal HTTP fixture for discovery tests: serves the configured status
/// and body to every request, one connection at a time.
pub(crate) struct HttpFixture {
    addr: SocketAddr,
    state: Arc<Mutex<(u16, String)>>,
    task: JoinHandle<()>,
}

impl HttpFixture {
    pub(crate) async fn spawn(status: u16, body: &str) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new((status, body.to_string())));
        let serve_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (status, body) = serve_state.lock().expect("fixture lock").clone();
                let _ = serve_one(stream, status, &body).await;
            }
        });
        Ok(Self { addr, state, task })
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub(crate) fn set(&self, status: u16, body: &str) {
        *self.state.lock().expect("fixture lock") = (status, body.to_string());
    }
}

impl Drop for HttpFixture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(stream: TcpStream, status: u16, body: &str) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    reader.get_mut().write_all(response.as_bytes()).await?;
    reader.get_mut().flush().await?;
    Ok(())
}
