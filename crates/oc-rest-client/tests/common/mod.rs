//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use oc_rest_client::{ConnectionState, EventStreamClient, RestClientError, RestClientResult, Transport};
use reqwest::{Request, Response};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub type Chunk = Result<Bytes, std::io::Error>;

/// One canned reply of a [`ScriptedTransport`]
pub enum Reply {
    Status(u16),
    Stream(BoxStream<'static, Chunk>),
    Fail,
    /// Never answers
    Stall,
}

impl Reply {
    /// 200 whose body yields `frames` and then stays open
    pub fn open_stream(frames: &[&str]) -> Self {
        Reply::Stream(frame_chunks(frames).chain(stream::pending()).boxed())
    }

    /// 200 whose body yields `frames` and then ends cleanly
    pub fn finite_stream(frames: &[&str]) -> Self {
        Reply::Stream(frame_chunks(frames).boxed())
    }

    /// 200 whose body yields `frames` and then breaks with a read error
    pub fn broken_stream(frames: &[&str]) -> Self {
        let failure = stream::once(async {
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))
        });
        Reply::Stream(frame_chunks(frames).chain(failure).boxed())
    }
}

fn frame_chunks(frames: &[&str]) -> impl futures::Stream<Item = Chunk> {
    let chunks: Vec<Chunk> = frames
        .iter()
        .map(|data| Ok(Bytes::from(format!("data: {}\n\n", data))))
        .collect();
    stream::iter(chunks)
}

/// In-memory transport replaying a fixed list of replies.
///
/// Once the script runs out every call answers 503.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Value of `name` on the `index`-th request
    pub fn header(&self, index: usize, name: &str) -> Option<String> {
        let requests = self.requests.lock().unwrap();
        requests
            .get(index)?
            .1
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    pub fn url(&self, index: usize) -> Option<String> {
        self.requests.lock().unwrap().get(index).map(|(url, _)| url.clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: Request) -> RestClientResult<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let headers = request
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        self.requests
            .lock()
            .unwrap()
            .push((request.url().to_string(), headers));

        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Status(503));
        match reply {
            Reply::Status(status) => {
                let response = http::Response::builder().status(status).body("").unwrap();
                Ok(Response::from(response))
            }
            Reply::Stream(body) => {
                let response = http::Response::builder()
                    .status(200)
                    .header("content-type", "text/event-stream")
                    .body(reqwest::Body::wrap_stream(body))
                    .unwrap();
                Ok(Response::from(response))
            }
            Reply::Fail => Err(RestClientError::Timeout),
            Reply::Stall => {
                futures::future::pending::<()>().await;
                Err(RestClientError::Timeout)
            }
        }
    }
}

/// Yield until `client` reports `state`.
pub async fn wait_for_state(client: &EventStreamClient, state: ConnectionState) {
    while client.state() != state {
        tokio::task::yield_now().await;
    }
}

/// Wait (bounded) until the processing task has taken the client back to
/// `Disconnected`.
pub async fn wait_until_disconnected(client: &EventStreamClient) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream did not end in time");
}

/// SSE body made of `data:` frames
pub fn sse_body(frames: &[&str]) -> String {
    frames.iter().map(|data| format!("data: {}\n\n", data)).collect()
}
