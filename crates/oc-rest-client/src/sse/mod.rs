//! Server-Sent Events (SSE) streaming support
//!
//! [`EventStreamClient`] owns at most one live connection to the server's
//! event feed. Decoded frames are pushed into a bounded event channel by a
//! background task; when that channel is full new frames are dropped rather
//! than queued. Stream failures land on a separate bounded error channel and
//! leave the client disconnected until the caller reconnects.
//!
//! The feed request goes through authentication but not through request
//! retry: reconnecting is governed by [`EventStreamClient::reconnect`] and its
//! own backoff.

mod codec;
mod state;

pub use codec::{Event, SseCodec, SseDecodeError};
pub use state::ConnectionState;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderValue, ACCEPT, CACHE_CONTROL};
use reqwest::{Method, Request, Response};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::AuthenticatingTransport;
use crate::backoff::ReconnectPolicy;
use crate::config::SseConfig;
use crate::error::{RestClientError, RestClientResult};
use crate::transport::{HttpTransport, Transport};
use state::StateCell;

type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;
type FrameStream = FramedRead<StreamReader<ByteStream, Bytes>, SseCodec>;

/// Receiving half of one of the client's bounded channels
#[derive(Debug)]
pub struct StreamReceiver<T> {
    receiver: mpsc::Receiver<T>,
}

/// Decoded frames, in network order within one connection
pub type EventReceiver = StreamReceiver<Event>;

/// Mid-session stream failures
pub type ErrorReceiver = StreamReceiver<RestClientError>;

impl<T> StreamReceiver<T> {
    /// Wait for the next item; `None` once the client has been disconnected
    /// and everything buffered has been read.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Number of items waiting to be read
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl<T> Stream for StreamReceiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

struct Channels {
    events: mpsc::Sender<Event>,
    errors: mpsc::Sender<RestClientError>,
}

struct Receivers {
    events: Option<EventReceiver>,
    errors: Option<ErrorReceiver>,
}

struct ActiveStream {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: SseConfig,
    url: Url,
    transport: Arc<dyn Transport>,
    state: Arc<StateCell>,
    /// Serializes connect/disconnect transitions; never held by status reads.
    active: tokio::sync::Mutex<Option<ActiveStream>>,
    channels: Mutex<Option<Channels>>,
    receivers: Mutex<Receivers>,
    /// Cancelled by `disconnect`; the client cannot connect again afterwards.
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client for the server's event feed
#[derive(Clone)]
pub struct EventStreamClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamClient")
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl EventStreamClient {
    /// Create a client talking to the configured server over HTTP
    pub fn new(config: SseConfig) -> RestClientResult<Self> {
        let config = config.normalized();
        let http = HttpTransport::for_streaming(config.timeout)?;
        Self::with_transport(config, Arc::new(http))
    }

    /// Create a client on top of a custom transport.
    ///
    /// The configured credential is still injected in front of `transport`.
    pub fn with_transport(config: SseConfig, transport: Arc<dyn Transport>) -> RestClientResult<Self> {
        let config = config.normalized();
        let url = config.event_url()?;
        let transport: Arc<dyn Transport> =
            Arc::new(AuthenticatingTransport::new(config.auth(), transport));

        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (error_tx, error_rx) = mpsc::channel(config.error_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                url,
                transport,
                state: Arc::new(StateCell::new()),
                active: tokio::sync::Mutex::new(None),
                channels: Mutex::new(Some(Channels {
                    events: event_tx,
                    errors: error_tx,
                })),
                receivers: Mutex::new(Receivers {
                    events: Some(StreamReceiver { receiver: event_rx }),
                    errors: Some(StreamReceiver { receiver: error_rx }),
                }),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &SseConfig {
        &self.inner.config
    }

    /// Take the event receiver. Only the first call gets it.
    pub fn events(&self) -> Option<EventReceiver> {
        lock(&self.inner.receivers).events.take()
    }

    /// Take the error receiver. Only the first call gets it.
    pub fn errors(&self) -> Option<ErrorReceiver> {
        lock(&self.inner.receivers).errors.take()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True once `disconnect` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Open the event feed and start delivering frames.
    ///
    /// `parent` governs the connection: cancelling it aborts the handshake or
    /// stops the processing task at its next await point.
    pub async fn connect(&self, parent: &CancellationToken) -> RestClientResult<()> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(RestClientError::Closed);
        }
        if parent.is_cancelled() {
            return Err(RestClientError::Cancelled);
        }

        // Claim the state before the lock so a concurrent handshake is
        // rejected without waiting for it.
        let epoch = inner
            .state
            .begin_connect()
            .map_err(|_| RestClientError::AlreadyConnected)?;
        let mut active = inner.active.lock().await;
        if inner.shutdown.is_cancelled() {
            inner.state.connect_failed(epoch);
            return Err(RestClientError::Closed);
        }

        let (events, errors) = match lock(&inner.channels).as_ref() {
            Some(channels) => (channels.events.clone(), channels.errors.clone()),
            None => {
                inner.state.connect_failed(epoch);
                return Err(RestClientError::Closed);
            }
        };

        // Previous epoch's task has already finished or is about to.
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
        }

        let cancel = parent.child_token();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RestClientError::Cancelled),
            _ = inner.shutdown.cancelled() => Err(RestClientError::Closed),
            result = tokio::time::timeout(inner.config.timeout, self.open_stream()) => {
                result.unwrap_or(Err(RestClientError::Timeout))
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                inner.state.connect_failed(epoch);
                return Err(e);
            }
        };

        let bytes: ByteStream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let frames = FramedRead::new(StreamReader::new(bytes), SseCodec::new());

        if !inner.state.mark_connected(epoch) {
            return Err(RestClientError::Closed);
        }
        info!(url = %inner.url, epoch, "SSE connection established");

        let task = tokio::spawn(process_events(
            frames,
            events,
            errors,
            Arc::clone(&inner.state),
            epoch,
            cancel.clone(),
            inner.shutdown.clone(),
        ));
        *active = Some(ActiveStream { cancel, task });

        Ok(())
    }

    /// Close the connection and both channels.
    ///
    /// Safe to call any number of times; the channels are closed by the first
    /// call only. The client cannot be connected again afterwards.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.state.disconnect();

        let active = inner.active.lock().await.take();
        if let Some(active) = active {
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                if e.is_panic() {
                    error!(error = %e, "SSE processing task panicked");
                }
            }
        }

        if lock(&inner.channels).take().is_some() {
            info!("SSE connection disconnected");
        }
    }

    /// Reconnect with exponential backoff.
    ///
    /// Returns immediately when already connected, and fails with
    /// [`RestClientError::AlreadyConnected`] while another handshake is still
    /// in flight. Waits between attempts start at the configured reconnect
    /// delay and double up to five minutes; cancelling `parent` aborts a wait
    /// at once.
    pub async fn reconnect(&self, parent: &CancellationToken) -> RestClientResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let inner = &self.inner;
        let mut policy = ReconnectPolicy::new(
            inner.config.reconnect_delay,
            inner.config.max_reconnect_attempts,
        );
        let mut last_error = None;

        while let Some(attempt) = policy.next_attempt() {
            info!(attempt, max_attempts = policy.max_attempts(), "attempting SSE reconnection");

            let error = match self.connect(parent).await {
                Ok(()) => {
                    info!(attempt, "SSE reconnection successful");
                    return Ok(());
                }
                Err(RestClientError::AlreadyConnected) if self.is_connected() => return Ok(()),
                Err(e @ RestClientError::AlreadyConnected) => return Err(e),
                Err(e @ (RestClientError::Cancelled | RestClientError::Closed)) => return Err(e),
                Err(e) => e,
            };
            warn!(attempt, error = %error, "SSE reconnection failed");
            last_error = Some(error);

            if policy.is_exhausted() {
                break;
            }

            let delay = policy.on_failure();
            tokio::select! {
                _ = parent.cancelled() => return Err(RestClientError::Cancelled),
                _ = inner.shutdown.cancelled() => return Err(RestClientError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let source = match last_error {
            Some(error) => error,
            None => RestClientError::InvalidConfig("no reconnect attempts configured".into()),
        };
        Err(RestClientError::ReconnectExhausted {
            attempts: policy.attempt(),
            source: Box::new(source),
        })
    }

    async fn open_stream(&self) -> RestClientResult<Response> {
        let mut request = Request::new(Method::GET, self.inner.url.clone());
        let headers = request.headers_mut();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let response = self.inner.transport.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "SSE handshake rejected");
            return Err(RestClientError::Status { status });
        }
        Ok(response)
    }
}

async fn process_events(
    mut frames: FrameStream,
    events: mpsc::Sender<Event>,
    errors: mpsc::Sender<RestClientError>,
    state: Arc<StateCell>,
    epoch: u64,
    cancel: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(event)) => match events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    warn!(event = %event.event, "event channel full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("event receiver dropped, stopping SSE processing");
                    break;
                }
            },
            Some(Err(e)) => {
                match errors.try_send(RestClientError::sse(e)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(e) | TrySendError::Closed(e)) => {
                        error!(error = %e, "SSE stream error");
                    }
                }
                break;
            }
            None => {
                info!(epoch, "SSE stream ended");
                break;
            }
        }
    }

    state.stream_ended(epoch);
}
