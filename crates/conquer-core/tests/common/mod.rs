//! Shared fixtures: an in-process coordinator and recording handlers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conquer_core::codec::{self, Envelope, MessageType};
use conquer_core::diagnostic::{Diagnostic, FatalHandler};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tracing_subscriber::fmt::MakeWriter;

pub const WAIT: Duration = Duration::from_secs(5);

// ── Mock coordinator ──────────────────────────────────────────────────

/// One accepted websocket connection.
pub struct ServerConn {
    /// Handshake headers, lowercase names.
    pub headers: BTreeMap<String, String>,
    ws: WebSocketStream<TcpStream>,
    next_num: i64,
}

impl ServerConn {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Send a message with the next server-side number.
    pub async fn push(&mut self, message_type: MessageType, payload: Value) {
        self.next_num += 1;
        let num = self.next_num;
        self.push_num(num, message_type, payload).await;
    }

    /// Send a message with an explicit number.
    pub async fn push_num(&mut self, num: i64, message_type: MessageType, payload: Value) {
        self.ws
            .send(Message::Text(codec::encode(num, message_type, payload).into()))
            .await
            .expect("server send");
    }

    /// Next decoded frame from the client, `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let message = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a client frame")?;
            match message.ok()? {
                Message::Text(text) => return Some(codec::decode(text.as_str()).expect("client frame decodes")),
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    /// Next frame of the given type, skipping others.
    pub async fn recv_type(&mut self, message_type: MessageType) -> Envelope {
        loop {
            let envelope = self.recv().await.expect("connection closed early");
            if envelope.message_type == message_type {
                return envelope;
            }
        }
    }

    /// Frames until the client closes the connection.
    pub async fn recv_all(&mut self) -> Vec<Envelope> {
        let mut frames = Vec::new();
        while let Some(envelope) = self.recv().await {
            frames.push(envelope);
        }
        frames
    }

    /// Drop the socket without a close handshake.
    pub fn kill(self) {
        drop(self.ws);
    }
}

/// A websocket coordinator on `127.0.0.1:0`.
pub struct MockServer {
    pub addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with_status(None).await
    }

    /// Every handshake is answered with `status` when given.
    pub async fn start_with_status(reject: Option<u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let headers = Arc::new(Mutex::new(BTreeMap::new()));
                    let captured = Arc::clone(&headers);
                    let callback = move |request: &Request, response: Response| {
                        let mut map = captured.lock().unwrap();
                        for (name, value) in request.headers() {
                            map.insert(
                                name.as_str().to_string(),
                                value.to_str().unwrap_or_default().to_string(),
                            );
                        }
                        match reject {
                            Some(status) => {
                                let error: ErrorResponse = http::Response::builder()
                                    .status(status)
                                    .body(None)
                                    .unwrap();
                                Err(error)
                            }
                            None => Ok(response),
                        }
                    };
                    if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                        let headers = headers.lock().unwrap().clone();
                        let _ = tx.send(ServerConn {
                            headers,
                            ws,
                            next_num: 0,
                        });
                    }
                });
            }
        });
        Self { addr, accepted }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped")
    }
}

/// A `ws://` URL nothing listens on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}")
}

// ── Fatal handler ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingFatal {
    pub diagnostics: Mutex<Vec<Diagnostic>>,
}

impl RecordingFatal {
    pub fn taken(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().unwrap().clone()
    }
}

impl FatalHandler for RecordingFatal {
    fn abort(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().unwrap().push(diagnostic.clone());
    }
}

// ── Log capture ───────────────────────────────────────────────────────

/// Collects formatted log lines for assertions.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Install as the default subscriber of the current thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    /// Lines at WARN level containing `needle`.
    pub fn warnings_containing(&self, needle: &str) -> usize {
        self.text()
            .lines()
            .filter(|line| line.contains(" WARN ") && line.contains(needle))
            .count()
    }
}

pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}
