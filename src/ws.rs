use std::{
    collections::BTreeMap,
    net::{SocketAddr, TcpListener},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use image::{DynamicImage, RgbaImage};
use serde_json::Value;
use tungstenite::{Error as WsError, Message, accept};

use crate::{
    capture::PreviewSink,
    error::UpliftResult,
    protocol::{ErrorPayload, GenerateRequestPayload, WSMessage, now_millis},
    transfer::{DEFAULT_MAX_MESSAGE_SIZE, PREVIEW_MAX_SIZE, TransferOptions, image_messages},
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

fn spawn_server_ping_loop(hub: WsHub) {
    thread::spawn(move || {
        loop {
            if let Ok(text) = serde_json::to_string(&WSMessage::<Value>::new("ping", None)) {
                hub.broadcast(text);
            }
            thread::sleep(HEARTBEAT_INTERVAL);
        }
    });
}

/// A client asked for a capture + generation round.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub parameters: BTreeMap<String, String>,
    pub request_id: Option<String>,
}

/// What the server does with one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Pong { request_id: Option<String> },
    Ignore,
    Generate(GenerateRequest),
    Error {
        request_id: Option<String>,
        code: &'static str,
        message: String,
    },
}

/// Fan-out of text messages to every connected client.
#[derive(Clone)]
pub struct WsHub {
    clients: Arc<Mutex<Vec<Sender<String>>>>,
    max_message_size: usize,
    preview_max_size: u32,
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE, PREVIEW_MAX_SIZE)
    }
}

impl WsHub {
    /// `preview_max_size` bounds the longest side of capture thumbnails; 0 sends them full size.
    pub fn new(max_message_size: usize, preview_max_size: u32) -> Self {
        Self {
            clients: Arc::new(Mutex::new(Vec::new())),
            max_message_size,
            preview_max_size,
        }
    }

    pub fn result_options(&self) -> TransferOptions {
        TransferOptions::result().with_max_message_size(self.max_message_size)
    }

    pub fn preview_options(&self, name: impl Into<String>) -> TransferOptions {
        TransferOptions::preview(name)
            .with_max_size(Some(self.preview_max_size))
            .with_max_message_size(self.max_message_size)
    }

    pub fn broadcast(&self, text: String) {
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        clients.retain(|tx| tx.send(text.clone()).is_ok());
    }

    pub fn register_client(&self, tx: Sender<String>) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.push(tx);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Broadcast an image as chunked transfer messages. Returns the number of parts sent.
    pub fn send_image(&self, image: &RgbaImage, opts: &TransferOptions) -> UpliftResult<usize> {
        let messages = image_messages(image, opts)?;
        let parts = messages.len();
        for msg in messages {
            let text = serde_json::to_string(&msg).map_err(anyhow::Error::from)?;
            self.broadcast(text);
        }
        tracing::debug!(event = %opts.event_type, parts, "image broadcast");
        Ok(parts)
    }
}

impl PreviewSink for WsHub {
    fn preview(&self, control_name: &str, image: &DynamicImage) {
        if let Err(e) = self.send_image(&image.to_rgba8(), &self.preview_options(control_name)) {
            tracing::warn!(control = control_name, error = %e, "preview transfer failed");
        }
    }
}

/// A running transfer server.
pub struct TransferServer {
    /// Bound address; differs from the requested one when port 0 was asked for.
    pub local_addr: SocketAddr,
    pub handle: thread::JoinHandle<()>,
}

/// Bind `addr` and serve clients on background threads.
///
/// Every client receives what is broadcast on `hub`. Inbound `generate_request`s go to
/// `request_tx`, keeping only the latest one the consumer has not taken yet.
pub fn spawn_transfer_server(
    addr: &str,
    request_tx: Sender<GenerateRequest>,
    request_drop_rx: Receiver<GenerateRequest>,
    hub: WsHub,
) -> Result<TransferServer> {
    let server =
        TcpListener::bind(addr).with_context(|| format!("failed to bind ws server at {addr}"))?;
    let local_addr = server
        .local_addr()
        .context("failed to read ws server address")?;

    spawn_server_ping_loop(hub.clone());

    let handle = thread::spawn(move || {
        if let Err(e) = run_server(server, local_addr, request_tx, request_drop_rx, hub) {
            tracing::error!(error = %format!("{e:#}"), "transfer server failed");
        }
    });
    Ok(TransferServer { local_addr, handle })
}

fn run_server(
    server: TcpListener,
    addr: SocketAddr,
    request_tx: Sender<GenerateRequest>,
    request_drop_rx: Receiver<GenerateRequest>,
    hub: WsHub,
) -> Result<()> {
    tracing::info!("listening on ws://{addr}");

    for stream in server.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "accept tcp failed");
                continue;
            }
        };

        let request_tx = request_tx.clone();
        let request_drop_rx = request_drop_rx.clone();
        let hub = hub.clone();

        thread::spawn(move || {
            if let Err(e) = handle_client(stream, request_tx, request_drop_rx, hub) {
                tracing::debug!(error = %format!("{e:#}"), "client ended");
            }
        });
    }

    Ok(())
}

fn handle_client(
    stream: std::net::TcpStream,
    request_tx: Sender<GenerateRequest>,
    request_drop_rx: Receiver<GenerateRequest>,
    hub: WsHub,
) -> Result<()> {
    // Handshake is easier with a blocking socket, switch to non-blocking afterwards.
    let mut ws = accept(stream).context("websocket handshake failed")?;
    ws.get_mut()
        .set_nonblocking(true)
        .context("failed to set tcp non-blocking")?;

    let (client_tx, client_rx) = crossbeam_channel::unbounded::<String>();
    hub.register_client(client_tx);

    loop {
        while let Ok(text) = client_rx.try_recv() {
            let _ = ws.send(Message::Text(text));
        }

        match ws.read() {
            Ok(Message::Text(text)) => match route_text_message(&text) {
                Inbound::Pong { request_id } => {
                    let mut pong = WSMessage::<Value>::new("pong", None);
                    pong.request_id = request_id;
                    let _ = ws.send(Message::Text(serde_json::to_string(&pong)?));
                }
                Inbound::Ignore => {}
                Inbound::Generate(request) => {
                    send_request(&request_tx, &request_drop_rx, request);
                }
                Inbound::Error {
                    request_id,
                    code,
                    message,
                } => {
                    tracing::warn!(code, %message, "rejected client message");
                    send_error(&mut ws, request_id, code, &message);
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = ws.send(Message::Pong(payload));
            }
            Ok(Message::Binary(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(WsError::Io(ref io)) if io.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(WsError::AlreadyClosed) | Err(WsError::ConnectionClosed) => break,
            Err(e) => return Err(e).context("websocket read failed"),
        }

        thread::sleep(Duration::from_millis(5));
    }

    Ok(())
}

pub fn route_text_message(text: &str) -> Inbound {
    let msg: WSMessage<Value> = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return Inbound::Error {
                request_id: None,
                code: "PARSE_ERROR",
                message: format!("invalid json: {e}"),
            };
        }
    };

    match msg.msg_type.as_str() {
        "ping" => Inbound::Pong {
            request_id: msg.request_id,
        },
        // Clients may auto-reply to server pings.
        "pong" | "heartbeat" => Inbound::Ignore,
        "generate_request" => {
            let payload = msg.payload.unwrap_or(Value::Null);
            let parsed = if payload.is_null() {
                Ok(GenerateRequestPayload::default())
            } else {
                serde_json::from_value::<GenerateRequestPayload>(payload)
            };
            match parsed {
                Ok(p) => Inbound::Generate(GenerateRequest {
                    parameters: p.parameters,
                    request_id: msg.request_id,
                }),
                Err(e) => Inbound::Error {
                    request_id: msg.request_id,
                    code: "PARSE_ERROR",
                    message: format!("invalid generate_request: {e}"),
                },
            }
        }
        other => Inbound::Error {
            request_id: msg.request_id,
            code: "PARSE_ERROR",
            message: format!("unknown message type: {other}"),
        },
    }
}

fn send_error(
    ws: &mut tungstenite::WebSocket<std::net::TcpStream>,
    request_id: Option<String>,
    code: &str,
    message: &str,
) {
    let err = WSMessage {
        msg_type: "error".to_string(),
        timestamp: now_millis(),
        request_id,
        payload: Some(ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        }),
    };

    if let Ok(text) = serde_json::to_string(&err) {
        let _ = ws.send(Message::Text(text));
    }
}

/// Keep only the latest request: bounded(1) plus dropping a stale one the session has not taken.
pub fn send_request(
    request_tx: &Sender<GenerateRequest>,
    request_drop_rx: &Receiver<GenerateRequest>,
    request: GenerateRequest,
) {
    if request_tx.try_send(request.clone()).is_err() {
        while request_drop_rx.try_recv().is_ok() {}
        let _ = request_tx.try_send(request);
    }
}
