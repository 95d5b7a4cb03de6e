//! Async client for the Yeti v2 REST API

use crate::api::models::{
    object_id, object_root_type, object_ref, AccessTokenResponse, BloomHit, BulkAddResult,
    DfiqYamlRequest, GraphSearch, IndicatorQuery, NewObservable, YaraBundleRequest,
    YetiLinkObject, YetiObject,
};
use crate::config::{ClientConfig, RetryConfig};
use crate::error::{YetiError, YetiResult};
use bytes::Bytes;
use reqwest::{multipart, Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const API_TOKEN_ENDPOINT: &str = "/api/v2/auth/api-token";
pub const API_KEY_HEADER: &str = "x-yeti-apikey";

/// POST endpoints that only read, and so can be resent after a failure
const READ_ONLY_POST_SUFFIXES: &[&str] = &["/search", "/get/multiple", "/bundle", "/to_archive"];

/// Whether a request can be resent after a 5xx or a transport error
/// without risking a duplicate write.
pub(crate) fn is_retry_safe(method: &Method, path: &str) -> bool {
    method.is_idempotent()
        || (*method == Method::POST
            && READ_ONLY_POST_SUFFIXES
                .iter()
                .any(|suffix| path.ends_with(suffix)))
}

/// How the current session was authenticated, replayed on 401
#[derive(Clone, Default)]
enum AuthMethod {
    #[default]
    Unauthenticated,
    ApiKey(String),
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Unauthenticated => write!(f, "Unauthenticated"),
            AuthMethod::ApiKey(_) => write!(f, "ApiKey(<redacted>)"),
        }
    }
}

#[derive(Default)]
struct AuthState {
    access_token: Option<String>,
    method: AuthMethod,
}

/// Request payload. JSON and multipart bodies are mutually exclusive by construction.
#[derive(Debug, Clone)]
pub(crate) enum RequestBody {
    Empty,
    Json(Value),
    Multipart {
        field: &'static str,
        file_name: &'static str,
        mime: &'static str,
        data: Bytes,
    },
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("has_access_token", &self.access_token.is_some())
            .field("method", &self.method)
            .finish()
    }
}

impl RequestBody {
    fn apply(&self, request: RequestBuilder) -> Result<RequestBuilder, reqwest::Error> {
        Ok(match self {
            RequestBody::Empty => request,
            RequestBody::Json(value) => request.json(value),
            RequestBody::Multipart {
                field,
                file_name,
                mime,
                data,
            } => {
                let part = multipart::Part::bytes(data.to_vec())
                    .file_name(*file_name)
                    .mime_str(mime)?;
                request.multipart(multipart::Form::new().part(*field, part))
            }
        })
    }
}

/// API object to interact with the Yeti API.
///
/// Cloning is cheap; clones share the HTTP connection pool and the session token.
#[derive(Debug, Clone)]
pub struct YetiApi {
    /// Root URL of the Yeti deployment, without trailing slash
    url_root: String,
    client: Client,
    auth: Arc<RwLock<AuthState>>,
    retry_config: RetryConfig,
    /// Number of re-authentications attempted on 401 before failing
    auth_retries: u32,
}

impl YetiApi {
    /// Create a client with default timeouts and retry policy
    pub fn new<S: Into<String>>(url_root: S) -> YetiResult<Self> {
        Self::with_config(ClientConfig::new(url_root))
    }

    /// Create a client from a full configuration
    pub fn with_config(config: ClientConfig) -> YetiResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(YetiError::from)?;

        Ok(Self {
            url_root: config.endpoint.trim_end_matches('/').to_string(),
            client,
            auth: Arc::new(RwLock::new(AuthState::default())),
            retry_config: config.retry,
            auth_retries: config.auth_retries,
        })
    }

    pub fn url_root(&self) -> &str {
        &self.url_root
    }

    pub async fn is_authenticated(&self) -> bool {
        self.auth.read().await.access_token.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.url_root, path)
    }

    /// Authenticates the session using an API key.
    ///
    /// The key is remembered so that a later 401 can transparently fetch a
    /// fresh access token. Passing `None` reuses the remembered key.
    pub async fn auth_api_key(&self, apikey: Option<&str>) -> YetiResult<()> {
        let apikey = match apikey {
            Some(key) => key.to_string(),
            None => match &self.auth.read().await.method {
                AuthMethod::ApiKey(key) => key.clone(),
                AuthMethod::Unauthenticated => String::new(),
            },
        };

        if apikey.is_empty() {
            return Err(YetiError::invalid_argument("No API key provided."));
        }

        let access_token = self.exchange_api_key(&apikey).await?;

        let mut auth = self.auth.write().await;
        auth.access_token = Some(access_token);
        auth.method = AuthMethod::ApiKey(apikey);
        info!("Authenticated against {} with API key", self.url_root);
        Ok(())
    }

    /// Re-run the last successful authentication method
    pub async fn refresh_auth(&self) -> YetiResult<()> {
        let method = self.auth.read().await.method.clone();
        match method {
            AuthMethod::ApiKey(_) => self.auth_api_key(None).await,
            AuthMethod::Unauthenticated => {
                warn!("No auth function set, cannot refresh auth.");
                Ok(())
            }
        }
    }

    /// Trade a long-lived API key for a short-lived access token.
    ///
    /// Not routed through the 401 refresh loop.
    async fn exchange_api_key(&self, apikey: &str) -> YetiResult<String> {
        let url = self.url(API_TOKEN_ENDPOINT);
        let this = self;
        let url_ref = url.as_str();

        let response = self
            .execute_with_retry(true, move || {
                this.client
                    .post(url_ref)
                    .header(API_KEY_HEADER, apikey)
                    .send()
            })
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(YetiError::unauthorized(&url));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(YetiError::api(status.as_u16(), text));
        }

        let body = response.bytes().await?;
        let parsed: AccessTokenResponse = serde_json::from_slice(&body)?;
        match parsed.access_token.filter(|t| !t.is_empty()) {
            Some(token) => Ok(token),
            None => Err(YetiError::MissingAccessToken(
                String::from_utf8_lossy(&body).into_owned(),
            )),
        }
    }

    /// Issue one request carrying the current bearer token
    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: &RequestBody,
        query: &[(&str, &str)],
    ) -> Result<Response, reqwest::Error> {
        let mut request = self.client.request(method.clone(), url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = self.auth.read().await.access_token.as_deref() {
            request = request.bearer_auth(token);
        }
        body.apply(request)?.send().await
    }

    /// Issues a request to the given API path and returns the raw body.
    ///
    /// A 401 triggers `refresh_auth` and a new attempt, at most `auth_retries`
    /// times. Any other non-2xx status is surfaced as [`YetiError::Api`].
    /// Requests that write are sent once; see [`is_retry_safe`].
    pub(crate) async fn do_request(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        query: &[(&str, &str)],
    ) -> YetiResult<Bytes> {
        let url = self.url(path);
        let retry = is_retry_safe(&method, path);
        let mut refreshes_left = self.auth_retries;

        let this = self;
        let method_ref = &method;
        let url_ref = url.as_str();
        let body_ref = &body;

        loop {
            debug!("{} {}", method, url);
            let response = self
                .execute_with_retry(retry, move || {
                    this.send_once(method_ref, url_ref, body_ref, query)
                })
                .await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                if refreshes_left == 0 {
                    return Err(YetiError::unauthorized(response.url().as_str()));
                }
                refreshes_left -= 1;
                debug!(
                    "Got 401 from {}, refreshing auth ({} refreshes left)",
                    url, refreshes_left
                );
                self.refresh_auth().await?;
                continue;
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(YetiError::api(status.as_u16(), text));
            }

            return Ok(response.bytes().await?);
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> YetiResult<T> {
        let bytes = self
            .do_request(Method::GET, path, RequestBody::Empty, query)
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        payload: Value,
    ) -> YetiResult<T> {
        let bytes = self
            .do_request(method, path, RequestBody::Json(payload), &[])
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// POST a search body and unwrap the named result list
    async fn search_list(&self, path: &str, payload: Value, key: &str) -> YetiResult<Vec<YetiObject>> {
        let mut response: Value = self.send_json(Method::POST, path, payload).await?;
        let field = response.get_mut(key).map(Value::take).unwrap_or(Value::Null);
        Ok(serde_json::from_value(field)?)
    }

    /// GET a collection root by exact filters, mapping 404 to `None`
    async fn find(&self, path: &str, query: &[(&str, &str)]) -> YetiResult<Option<YetiObject>> {
        match self.get_json(path, query).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Finds an indicator in Yeti by name and type.
    pub async fn find_indicator(
        &self,
        name: &str,
        indicator_type: &str,
    ) -> YetiResult<Option<YetiObject>> {
        self.find(
            "/api/v2/indicators/",
            &[("name", name), ("type", indicator_type)],
        )
        .await
    }

    /// Searches for indicators. At least one filter must be set.
    pub async fn search_indicators(&self, query: &IndicatorQuery) -> YetiResult<Vec<YetiObject>> {
        if query.is_empty() {
            return Err(YetiError::invalid_argument(
                "You must provide one of name, indicator_type, pattern, description, or tags.",
            ));
        }

        let payload = json!({"query": query.to_query(), "count": 0});
        self.search_list("/api/v2/indicators/search", payload, "indicators")
            .await
    }

    /// Fetches several indicators by exact name in one request.
    pub async fn get_multiple_indicators(&self, names: &[&str]) -> YetiResult<Vec<YetiObject>> {
        let payload = json!({"names": names, "count": 0});
        self.search_list("/api/v2/indicators/get/multiple", payload, "indicators")
            .await
    }

    /// Finds an entity in Yeti by name and type.
    pub async fn find_entity(
        &self,
        name: &str,
        entity_type: &str,
    ) -> YetiResult<Option<YetiObject>> {
        self.find("/api/v2/entities/", &[("name", name), ("type", entity_type)])
            .await
    }

    pub async fn search_entities(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> YetiResult<Vec<YetiObject>> {
        let mut query = json!({"name": name});
        if let Some(description) = description {
            query["description"] = json!(description);
        }
        let payload = json!({"query": query, "count": 0});
        self.search_list("/api/v2/entities/search", payload, "entities")
            .await
    }

    /// Fetches several entities by exact name in one request.
    pub async fn get_multiple_entities(&self, names: &[&str]) -> YetiResult<Vec<YetiObject>> {
        let payload = json!({"names": names, "count": 0});
        self.search_list("/api/v2/entities/get/multiple", payload, "entities")
            .await
    }

    /// Finds an observable in Yeti by value and type.
    pub async fn find_observable(
        &self,
        value: &str,
        observable_type: &str,
    ) -> YetiResult<Option<YetiObject>> {
        self.find(
            "/api/v2/observables/",
            &[("value", value), ("type", observable_type)],
        )
        .await
    }

    pub async fn search_observables(&self, value: &str) -> YetiResult<Vec<YetiObject>> {
        let payload = json!({"query": {"value": value}, "count": 0});
        self.search_list("/api/v2/observables/search", payload, "observables")
            .await
    }

    /// Searches for a list of observable values in Yeti's bloom filters.
    pub async fn search_bloom(&self, values: &[&str]) -> YetiResult<Vec<BloomHit>> {
        self.send_json(
            Method::POST,
            "/api/v2/bloom/search",
            json!({"values": values}),
        )
        .await
    }

    /// Creates a new entity in Yeti.
    pub async fn new_entity(&self, entity: &Value, tags: &[&str]) -> YetiResult<YetiObject> {
        let mut payload = json!({"entity": entity});
        if !tags.is_empty() {
            payload["tags"] = json!(tags);
        }
        self.send_json(Method::POST, "/api/v2/entities/", payload)
            .await
    }

    /// Creates a new indicator, then tags it when tags are given.
    pub async fn new_indicator(&self, indicator: &Value, tags: &[&str]) -> YetiResult<YetiObject> {
        let created: YetiObject = self
            .send_json(
                Method::POST,
                "/api/v2/indicators/",
                json!({"indicator": indicator}),
            )
            .await?;

        if !tags.is_empty() {
            let payload = json!({"tags": tags, "ids": [object_id(&created)?]});
            self.do_request(
                Method::POST,
                "/api/v2/indicators/tag",
                RequestBody::Json(payload),
                &[],
            )
            .await?;
        }

        Ok(created)
    }

    pub async fn patch_indicator(&self, yeti_id: &str, indicator: &Value) -> YetiResult<YetiObject> {
        self.send_json(
            Method::PATCH,
            &format!("/api/v2/indicators/{}", yeti_id),
            json!({"indicator": indicator}),
        )
        .await
    }

    /// Gets a Yara bundle with overlays applied.
    pub async fn get_yara_bundle_with_overlays(
        &self,
        request: &YaraBundleRequest,
    ) -> YetiResult<YetiObject> {
        self.send_json(
            Method::POST,
            "/api/v2/indicators/yara/bundle",
            serde_json::to_value(request)?,
        )
        .await
    }

    /// Finds a DFIQ object in Yeti by name and type.
    pub async fn find_dfiq(&self, name: &str, dfiq_type: &str) -> YetiResult<Option<YetiObject>> {
        self.find("/api/v2/dfiq/", &[("name", name), ("type", dfiq_type)])
            .await
    }

    pub async fn search_dfiq(
        &self,
        name: &str,
        dfiq_type: Option<&str>,
    ) -> YetiResult<Vec<YetiObject>> {
        let mut query = json!({"name": name});
        if let Some(dfiq_type) = dfiq_type {
            query["type"] = json!(dfiq_type);
        }
        let payload = json!({"query": query, "count": 0});
        self.search_list("/api/v2/dfiq/search", payload, "dfiq").await
    }

    /// Creates a new DFIQ object from a YAML document.
    pub async fn new_dfiq_from_yaml(
        &self,
        dfiq_type: &str,
        dfiq_yaml: &str,
        update_indicators: bool,
    ) -> YetiResult<YetiObject> {
        let request = DfiqYamlRequest {
            dfiq_type,
            dfiq_yaml,
            update_indicators,
        };
        self.send_json(
            Method::POST,
            "/api/v2/dfiq/from_yaml",
            serde_json::to_value(request)?,
        )
        .await
    }

    /// Replaces a DFIQ object with a YAML document.
    pub async fn patch_dfiq_from_yaml(
        &self,
        dfiq_type: &str,
        dfiq_yaml: &str,
        yeti_id: &str,
        update_indicators: bool,
    ) -> YetiResult<YetiObject> {
        let request = DfiqYamlRequest {
            dfiq_type,
            dfiq_yaml,
            update_indicators,
        };
        self.send_json(
            Method::PATCH,
            &format!("/api/v2/dfiq/{}", yeti_id),
            serde_json::to_value(request)?,
        )
        .await
    }

    /// Patches a DFIQ object in place; `type` and `id` are read from the object.
    pub async fn patch_dfiq(&self, dfiq_object: &YetiObject) -> YetiResult<YetiObject> {
        let dfiq_type = dfiq_object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| YetiError::invalid_argument("DFIQ object has no 'type' field"))?;
        let yeti_id = object_id(dfiq_object)?;

        self.send_json(
            Method::PATCH,
            &format!("/api/v2/dfiq/{}", yeti_id),
            json!({"dfiq_type": dfiq_type, "dfiq_object": dfiq_object}),
        )
        .await
    }

    /// Downloads a ZIP archive of all DFIQ YAML, optionally restricted to one type.
    pub async fn download_dfiq_archive(&self, dfiq_type: Option<&str>) -> YetiResult<Bytes> {
        let mut payload = json!({"count": 0});
        if let Some(dfiq_type) = dfiq_type {
            payload["query"] = json!({"type": dfiq_type});
        }
        self.do_request(
            Method::POST,
            "/api/v2/dfiq/to_archive",
            RequestBody::Json(payload),
            &[],
        )
        .await
    }

    /// Uploads a ZIP archive of DFIQ YAML; returns per-kind upload counts.
    pub async fn upload_dfiq_archive<P: AsRef<Path>>(
        &self,
        archive_path: P,
    ) -> YetiResult<HashMap<String, u64>> {
        let data = tokio::fs::read(archive_path.as_ref()).await?;
        debug!(
            "Uploading DFIQ archive {} ({} bytes)",
            archive_path.as_ref().display(),
            data.len()
        );

        let body = RequestBody::Multipart {
            field: "archive",
            file_name: "archive.zip",
            mime: "application/zip",
            data: Bytes::from(data),
        };
        let bytes = self
            .do_request(Method::POST, "/api/v2/dfiq/from_archive", body, &[])
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Adds a single observable. `tags` is sent as `null` when absent.
    pub async fn add_observable(
        &self,
        value: &str,
        observable_type: &str,
        tags: Option<&[&str]>,
    ) -> YetiResult<YetiObject> {
        self.send_json(
            Method::POST,
            "/api/v2/observables/",
            json!({"value": value, "type": observable_type, "tags": tags}),
        )
        .await
    }

    /// Bulk-adds observables; `tags` are applied to every one of them.
    pub async fn add_observables_bulk(
        &self,
        mut observables: Vec<NewObservable>,
        tags: &[&str],
    ) -> YetiResult<BulkAddResult> {
        if !tags.is_empty() {
            for observable in &mut observables {
                observable.tags = tags.iter().map(|t| t.to_string()).collect();
            }
        }
        self.send_json(
            Method::POST,
            "/api/v2/observables/bulk",
            json!({"observables": observables}),
        )
        .await
    }

    /// Tags an object; the endpoint is chosen from its `root_type`.
    pub async fn tag_object(&self, yeti_object: &YetiObject, tags: &[&str]) -> YetiResult<YetiObject> {
        let endpoint = object_root_type(yeti_object)?.endpoint();
        let payload = json!({"tags": tags, "ids": [object_id(yeti_object)?]});
        self.send_json(Method::POST, &format!("{}/tag", endpoint), payload)
            .await
    }

    /// Links two objects in the graph.
    pub async fn link_objects(
        &self,
        source: &YetiObject,
        target: &YetiObject,
        link_type: &str,
        description: Option<&str>,
    ) -> YetiResult<YetiLinkObject> {
        let payload = json!({
            "source": object_ref(source)?,
            "target": object_ref(target)?,
            "link_type": link_type,
            "description": description,
        });
        self.send_json(Method::POST, "/api/v2/graph/add", payload)
            .await
    }

    /// Searches the graph for objects related to a given object.
    pub async fn search_graph(&self, search: &GraphSearch) -> YetiResult<YetiObject> {
        self.send_json(
            Method::POST,
            "/api/v2/graph/search",
            serde_json::to_value(search)?,
        )
        .await
    }

    pub async fn new_tag(&self, name: &str, description: Option<&str>) -> YetiResult<YetiObject> {
        let mut payload = json!({"name": name});
        if let Some(description) = description {
            payload["description"] = json!(description);
        }
        self.send_json(Method::POST, "/api/v2/tags/", payload).await
    }

    pub async fn search_tags(&self, name: &str) -> YetiResult<Vec<YetiObject>> {
        let payload = json!({"name": name, "count": 0});
        self.search_list("/api/v2/tags/search", payload, "tags").await
    }

    /// Execute HTTP request with retry logic.
    ///
    /// When `retry` is set, transport errors and 5xx responses are retried
    /// with backoff; otherwise the request is sent exactly once. Every other
    /// response is handed back to the caller untouched.
    async fn execute_with_retry<F, Fut>(&self, retry: bool, request_fn: F) -> YetiResult<Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Response, reqwest::Error>>,
    {
        let max_attempts = if retry {
            self.retry_config.max_attempts.max(1)
        } else {
            1
        };

        for attempt in 1..=max_attempts {
            match request_fn().await {
                Ok(response) => {
                    if !response.status().is_server_error() {
                        return Ok(response);
                    }

                    if attempt == max_attempts {
                        let status = response.status().as_u16();
                        let error_text = response.text().await.unwrap_or_default();
                        return Err(YetiError::api(status, error_text));
                    }

                    warn!(
                        "HTTP request failed with status {}, retrying (attempt {}/{})",
                        response.status(),
                        attempt,
                        max_attempts
                    );
                }
                Err(e) => {
                    if attempt == max_attempts {
                        if max_attempts == 1 {
                            return Err(YetiError::from(e));
                        }
                        warn!("HTTP request failed: {}", e);
                        return Err(YetiError::retry_limit_exceeded(
                            max_attempts,
                            format!("HTTP request: {}", e),
                        ));
                    }

                    warn!(
                        "HTTP request failed: {}, retrying (attempt {}/{})",
                        e, attempt, max_attempts
                    );
                }
            }

            sleep(self.retry_config.delay_for(attempt)).await;
        }

        Err(YetiError::retry_limit_exceeded(max_attempts, "HTTP request"))
    }
}
