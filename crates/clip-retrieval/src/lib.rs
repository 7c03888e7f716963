//! TCP client for the similar-image server.
//!
//! One connection per request: connect, send the framed query, read up to the
//! requested number of length-prefixed images, close. Requests started through
//! [`RetrievalClient::submit`] run on the tokio runtime behind a small permit pool.

pub mod doctor;
mod wire;

use bytes::Bytes;
use clip_proto::{Endpoint, FrameError, RetrievalRequest};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use wire::Limits;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub endpoint: Endpoint,
    pub connect_timeout_ms: u64,
    /// Per-read deadline while receiving. 0 waits forever.
    pub read_timeout_ms: u64,
    pub max_message_bytes: usize,
    pub max_in_flight: usize,
    pub default_count: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            connect_timeout_ms: 1000,
            read_timeout_ms: 10_000,
            max_message_bytes: 32 * 1024 * 1024,
            max_in_flight: 4,
            default_count: 10,
        }
    }
}

impl RetrievalConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    fn limits(&self) -> Limits {
        Limits { max_message: self.max_message_bytes, read_timeout: self.read_timeout() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("sending request failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("receiving image {index} failed: {source}")]
    Receive {
        index: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("image {index} declares {declared} bytes, limit is {max}")]
    MessageTooLarge { index: u32, declared: usize, max: usize },
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("request dropped before it completed")]
    Cancelled,
}

/// One image blob as the server sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedImage {
    pub bytes: Bytes,
    /// Length from the wire prefix. Larger than `bytes.len()` if the stream ended early.
    pub declared_len: usize,
}

impl RetrievedImage {
    pub fn is_truncated(&self) -> bool {
        self.bytes.len() < self.declared_len
    }
}

pub type RetrievalResult = Result<Vec<RetrievedImage>, RetrievalError>;

#[derive(Clone)]
pub struct RetrievalClient {
    cfg: Arc<RetrievalConfig>,
    permits: Arc<Semaphore>,
}

impl RetrievalClient {
    pub fn new(cfg: RetrievalConfig) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_in_flight.max(1)));
        Self { cfg: Arc::new(cfg), permits }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.cfg
    }

    /// Run one request on the calling task. Does not take a pool permit.
    pub async fn retrieve(&self, req: RetrievalRequest) -> RetrievalResult {
        fetch(&self.cfg, req).await
    }

    /// Start a request in the background. At most `max_in_flight` run at once;
    /// the rest wait for a permit. The handle resolves exactly once.
    pub fn submit(&self, req: RetrievalRequest) -> RetrievalHandle {
        let (tx, rx) = oneshot::channel();
        let cfg = self.cfg.clone();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let res = match permits.acquire_owned().await {
                Ok(_permit) => fetch(&cfg, req).await,
                Err(_) => Err(RetrievalError::Cancelled),
            };
            if tx.send(res).is_err() {
                debug!("retrieval: result dropped, caller went away");
            }
        });
        RetrievalHandle { rx }
    }
}

/// Completion of a submitted request.
pub struct RetrievalHandle {
    rx: oneshot::Receiver<RetrievalResult>,
}

impl Future for RetrievalHandle {
    type Output = RetrievalResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(RetrievalError::Cancelled)))
    }
}

async fn fetch(cfg: &RetrievalConfig, req: RetrievalRequest) -> RetrievalResult {
    let start = Instant::now();
    let addr = cfg.endpoint.addr();
    let count = req.requested_count();

    debug!("retrieval: connecting to {}", addr);
    let mut stream = match tokio::time::timeout(cfg.connect_timeout(), TcpStream::connect(addr.as_str())).await {
        Ok(Ok(s)) => s,
        Ok(Err(source)) => {
            warn!("retrieval: connect to {} failed: {}", addr, source);
            return Err(RetrievalError::Connect { addr, source });
        }
        Err(_) => {
            warn!("retrieval: connect to {} timed out", addr);
            return Err(RetrievalError::ConnectTimeout { addr, timeout: cfg.connect_timeout() });
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("retrieval: set_nodelay: {}", e);
    }

    wire::send_request(&mut stream, &req).await.map_err(RetrievalError::Send)?;
    debug!("retrieval: sent {} byte query, asking for {}", req.query_image().len(), count);

    let images = wire::receive_images(&mut stream, count, cfg.limits()).await?;
    let total: usize = images.iter().map(|i| i.bytes.len()).sum();
    info!(
        "retrieval: {} -> {}/{} images, {} bytes in {}ms",
        addr,
        images.len(),
        count,
        total,
        start.elapsed().as_millis()
    );
    Ok(images)
}
