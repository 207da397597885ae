// engine/transport.rs - Transport abstraction for the sync engine
//
// The engine only knows the three protocol exchanges; the HTTP flavor lives
// behind this trait so tests drive the state machine with an in-memory
// implementation.

use crate::codec::{decode_from_slice, encode_to_vec};
use crate::protocol::{
    ErrorResponse, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Wire content type for protocol bodies.
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse>;
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse>;
    async fn push(&self, request: &PushRequest) -> Result<PushResponse>;
}

/// HTTP transport speaking the binary map encoding against the coordinator.
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    auth_token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
            http_client,
        })
    }

    /// Attach a bearer token to every request.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    async fn post_cbor<Req, Resp>(&self, endpoint: &str, request: &Req) -> Result<Resp>
    where
        Req: crate::codec::WireMessage,
        Resp: crate::codec::WireMessage,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let body = encode_to_vec(request)?;

        let mut builder = self
            .http_client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_CBOR)
            .body(body);
        if let Some(ref token) = self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            // The server sends a typed ErrorResponse body where it can.
            if let Ok(err) = decode_from_slice::<ErrorResponse>(&bytes) {
                return Err(err.into_error());
            }
            return Err(match status.as_u16() {
                401 | 403 => Error::Auth(format!("{} rejected with {}", endpoint, status)),
                429 => Error::RateLimited(format!("{} rejected with {}", endpoint, status)),
                400 => Error::InvalidRequest(format!("{} rejected with {}", endpoint, status)),
                s if s >= 500 => Error::Internal(format!("{} failed with {}", endpoint, status)),
                _ => Error::Network(format!("{} failed with {}", endpoint, status)),
            });
        }

        decode_from_slice(&bytes)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        self.post_cbor("/v1/handshake", request).await
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        self.post_cbor("/v1/pull", request).await
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        self.post_cbor("/v1/push", request).await
    }
}

/// Scripted in-memory transport for engine tests.
#[derive(Default)]
pub struct MockTransport {
    handshake_response: parking_lot::Mutex<Option<Result<HandshakeResponse>>>,
    pull_responses: parking_lot::Mutex<std::collections::VecDeque<Result<PullResponse>>>,
    push_responses: parking_lot::Mutex<std::collections::VecDeque<Result<PushResponse>>>,
    pub pushed: parking_lot::Mutex<Vec<PushRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_handshake(&self, response: Result<HandshakeResponse>) {
        *self.handshake_response.lock() = Some(response);
    }

    pub fn queue_pull(&self, response: Result<PullResponse>) {
        self.pull_responses.lock().push_back(response);
    }

    pub fn queue_push(&self, response: Result<PushResponse>) {
        self.push_responses.lock().push_back(response);
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn handshake(&self, _request: &HandshakeRequest) -> Result<HandshakeResponse> {
        self.handshake_response
            .lock()
            .clone()
            .unwrap_or_else(|| Err(Error::Network("no scripted handshake".into())))
    }

    async fn pull(&self, _request: &PullRequest) -> Result<PullResponse> {
        self.pull_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Network("no scripted pull".into())))
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        self.pushed.lock().push(request.clone());
        self.push_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Network("no scripted push".into())))
    }
}
