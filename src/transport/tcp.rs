// Persistent TCP channel to the collector.
//
// One connection is shared by all calls. Frames are `[4-byte big-endian length][JSON]`.
// A background task owns the socket: it writes queued frames and routes each response
// to the waiting call by correlation id. When the socket fails or a call goes unanswered,
// every waiting call gets `Unavailable` and the next call reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Channel;
use super::protocol::{
    self, Request, RequestEnvelope, Response, ResponseEnvelope, ServerErrorKind,
};
use crate::error::CallError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Response, CallError>>>>>;

#[derive(Clone)]
struct ConnectionHandles {
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: PendingCalls,
    alive: CancellationToken,
}

pub(crate) fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

struct Connection {
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: PendingCalls,
    alive: CancellationToken,
    task: JoinHandle<()>,
}

impl Connection {
    fn handles(&self) -> ConnectionHandles {
        ConnectionHandles {
            outbound: self.outbound.clone(),
            pending: self.pending.clone(),
            alive: self.alive.clone(),
        }
    }
}

pub struct TcpChannel {
    addr: String,
    max_frame_bytes: usize,
    call_timeout: Duration,
    next_id: AtomicU64,
    connection: Mutex<Option<Connection>>,
    closed: AtomicBool,
}

impl TcpChannel {
    /// Does not connect; the first call does.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_frame_bytes: protocol::DEFAULT_MAX_FRAME_BYTES,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            next_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns the live connection's handles, connecting first if needed.
    async fn connection(&self) -> Result<ConnectionHandles, CallError> {
        let mut guard = self.connection.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::Closed);
        }
        if let Some(conn) = guard.as_ref()
            && !conn.alive.is_cancelled()
        {
            return Ok(conn.handles());
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| CallError::Unavailable(format!("connect to {} timed out", self.addr)))?
            .map_err(|e| CallError::Unavailable(format!("connect to {}: {}", self.addr, e)))?;
        let _ = stream.set_nodelay(true);
        debug!(suppress_forwarding = true, addr = %self.addr, "connected to collector");

        let framed = Framed::new(stream, frame_codec(self.max_frame_bytes));
        let (outbound, rx) = mpsc::unbounded_channel();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let alive = CancellationToken::new();
        let task = tokio::spawn(run_connection(framed, rx, pending.clone(), alive.clone()));
        let conn = Connection {
            outbound,
            pending,
            alive,
            task,
        };
        let handles = conn.handles();
        *guard = Some(conn);
        Ok(handles)
    }
}

impl Channel for TcpChannel {
    async fn call(&self, request: &Request) -> Result<Response, CallError> {
        let ConnectionHandles {
            outbound,
            pending,
            alive,
        } = self.connection().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = protocol::encode_frame(&RequestEnvelope {
            id,
            request: request.clone(),
        })
        .map_err(|e| CallError::Rejected(format!("encode {}: {}", request.name(), e)))?;
        // the codec refuses it on write, which would take the shared socket down
        if frame.len() > self.max_frame_bytes {
            return Err(CallError::Rejected(format!(
                "{} frame is {} bytes, limit {}",
                request.name(),
                frame.len(),
                self.max_frame_bytes
            )));
        }

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(id, tx);
        if outbound.send(frame).is_err() {
            pending.lock().await.remove(&id);
            return Err(CallError::Unavailable("connection closed".into()));
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Unavailable("connection lost".into())),
            Err(_) => {
                pending.lock().await.remove(&id);
                alive.cancel();
                Err(CallError::Unavailable(format!(
                    "no response within {:?}",
                    self.call_timeout
                )))
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let conn = self.connection.lock().await.take();
        if let Some(conn) = conn {
            conn.alive.cancel();
            let _ = conn.task.await;
        }
    }
}

async fn run_connection(
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    pending: PendingCalls,
    alive: CancellationToken,
) {
    let (mut sink, mut stream) = framed.split();
    let reason = loop {
        tokio::select! {
            _ = alive.cancelled() => break "closed".to_string(),
            frame = outbound.recv() => {
                let Some(frame) = frame else { break "channel dropped".to_string() };
                if let Err(e) = sink.send(frame).await {
                    break format!("write: {e}");
                }
            }
            incoming = stream.next() => {
                let frame = match incoming {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break format!("read: {e}"),
                    None => break "collector closed the connection".to_string(),
                };
                match protocol::decode_frame::<ResponseEnvelope>(&frame) {
                    Ok(env) => {
                        if let Some(tx) = pending.lock().await.remove(&env.id) {
                            let _ = tx.send(env.result.map_err(|e| match e.kind {
                                ServerErrorKind::Invalid => CallError::Rejected(e.message),
                                ServerErrorKind::Internal => CallError::Unavailable(e.message),
                            }));
                        }
                    }
                    Err(e) => break format!("undecodable response: {e}"),
                }
            }
        }
    };
    alive.cancel();
    debug!(suppress_forwarding = true, reason = %reason, "collector connection ended");
    let mut waiting = pending.lock().await;
    for (_, tx) in waiting.drain() {
        let _ = tx.send(Err(CallError::Unavailable(reason.clone())));
    }
}
