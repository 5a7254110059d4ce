// Collector-side ingest listener.
//
// One task per agent connection. Requests on a connection are applied in arrival order and
// answered with the request's correlation id. Shutdown stops accepting, cancels the
// connection tasks and waits for them up to a bound.

mod handler;

pub use handler::CollectorService;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::error::TransportError;
use crate::transport::protocol::{self, RequestEnvelope, ResponseEnvelope, ServerError};
use crate::transport::tcp::frame_codec;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct IngestServer {
    listener: TcpListener,
    service: CollectorService,
    max_frame_bytes: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl IngestServer {
    pub async fn bind(
        addr: &str,
        service: CollectorService,
        max_frame_bytes: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service,
            max_frame_bytes,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop and every connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accepts connections until the shutdown token fires, then drains connection tasks.
    pub async fn run(self) -> Result<(), TransportError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "ingest listener started");
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let service = self.service.clone();
                        let cancel = self.cancel.child_token();
                        let max_frame_bytes = self.max_frame_bytes;
                        self.tracker.spawn(async move {
                            serve_connection(stream, peer, service, max_frame_bytes, cancel).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            return Err(TransportError::DrainTimeout {
                resource: "ingest connections",
                timeout_secs: SHUTDOWN_TIMEOUT.as_secs(),
            });
        }
        info!("ingest listener stopped");
        Ok(())
    }
}

#[derive(Deserialize)]
struct EnvelopeId {
    id: u64,
}

#[instrument(skip(stream, peer, service, max_frame_bytes, cancel), fields(peer = %peer))]
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: CollectorService,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    debug!("agent connected");
    let mut framed = Framed::new(stream, frame_codec(max_frame_bytes));
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(error = %e, "connection read failed");
                break;
            }
            None => break,
        };

        let reply = match protocol::decode_frame::<RequestEnvelope>(&frame) {
            Ok(envelope) => ResponseEnvelope {
                id: envelope.id,
                result: service.handle(envelope.request).await,
            },
            Err(e) => match protocol::decode_frame::<EnvelopeId>(&frame) {
                // the id survived, so the caller can be told not to resend
                Ok(EnvelopeId { id }) => {
                    warn!(error = %e, "undecodable request");
                    ResponseEnvelope {
                        id,
                        result: Err(ServerError::invalid(format!("undecodable request: {e}"))),
                    }
                }
                Err(_) => {
                    warn!(error = %e, "undecodable frame, dropping connection");
                    break;
                }
            },
        };

        let bytes = match protocol::encode_frame(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode response");
                break;
            }
        };
        if let Err(e) = framed.send(bytes).await {
            debug!(error = %e, "connection write failed");
            break;
        }
    }
    debug!("agent disconnected");
}
