//! In-process mock of the Yeti HTTP API.
//!
//! Responses are scripted per `"METHOD /path"` route. A route with several
//! scripted responses hands them out in order and repeats the last one.
//! Every request is recorded for later assertions.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use yeti::api::YetiApi;
use yeti::config::{ClientConfig, RetryConfig};

pub const FAKE_TOKEN: &str = "fake_token";
pub const FAKE_API_KEY: &str = "fake_apikey";
pub const TOKEN_ROUTE: &str = "POST /api/v2/auth/api-token";

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }

    pub fn ok(body: Value) -> Self {
        Self::json(200, body)
    }

    pub fn status(status: u16) -> Self {
        Self::json(status, json!({"detail": "mock error"}))
    }

    pub fn bytes(body: &[u8]) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/zip",
            body: body.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn route(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct MockState {
    routes: HashMap<String, VecDeque<MockResponse>>,
    requests: Vec<RecordedRequest>,
}

#[derive(Clone, Default)]
pub struct MockYeti {
    state: Arc<Mutex<MockState>>,
    addr: Option<SocketAddr>,
}

impl MockYeti {
    /// Start a server on an ephemeral port with a working token endpoint
    pub async fn start() -> Self {
        let mut mock = Self::default();
        mock.on(TOKEN_ROUTE, MockResponse::ok(json!({"access_token": FAKE_TOKEN})));

        let app = Router::new()
            .fallback(handle)
            .with_state(mock.state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        mock.addr = Some(listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        mock
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr.unwrap())
    }

    /// Script a single response for a route, replacing earlier ones
    pub fn on(&self, route: &str, response: MockResponse) -> &Self {
        self.on_sequence(route, vec![response])
    }

    pub fn on_sequence(&self, route: &str, responses: Vec<MockResponse>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(route.to_string(), responses.into());
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_to(&self, route: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.route() == route)
            .collect()
    }

    pub fn last_request(&self) -> RecordedRequest {
        self.requests().pop().expect("no request recorded")
    }

    /// A client without retry delays pointing at this server
    pub fn client(&self) -> YetiApi {
        let mut config = ClientConfig::new(self.url());
        config.retry = RetryConfig::none();
        YetiApi::with_config(config).unwrap()
    }

    pub async fn authenticated_client(&self) -> YetiApi {
        let api = self.client();
        api.auth_api_key(Some(FAKE_API_KEY)).await.unwrap();
        api
    }
}

async fn handle(
    State(state): State<Arc<Mutex<MockState>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    let request = RecordedRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body,
    };
    let route = request.route();
    state.requests.push(request);

    let response = match state.routes.get_mut(&route) {
        Some(queue) if queue.len() > 1 => queue.pop_front(),
        Some(queue) => queue.front().cloned(),
        None => None,
    };

    match response {
        Some(r) => (r.status, [(header::CONTENT_TYPE, r.content_type)], r.body).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"detail": format!("no mock for {}", route)}).to_string(),
        )
            .into_response(),
    }
}
