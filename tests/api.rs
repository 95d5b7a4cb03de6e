mod common;

use common::{MockResponse, MockYeti, FAKE_API_KEY, FAKE_TOKEN, TOKEN_ROUTE};
use serde_json::{json, Map, Value};
use std::io::Write;
use yeti::api::{GraphSearch, IndicatorQuery, NewObservable, YaraBundleRequest, YetiObject};
use yeti::config::{ClientConfig, RetryConfig};
use yeti::{YetiApi, YetiError};

fn object(value: Value) -> YetiObject {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[tokio::test]
async fn test_auth_api_key() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/indicators/search",
        MockResponse::ok(json!({"indicators": []})),
    );

    let api = mock.client();
    assert!(!api.is_authenticated().await);
    api.auth_api_key(Some(FAKE_API_KEY)).await.unwrap();
    assert!(api.is_authenticated().await);

    let token_request = mock.requests_to(TOKEN_ROUTE).pop().unwrap();
    assert_eq!(token_request.header("x-yeti-apikey"), Some(FAKE_API_KEY));

    api.search_indicators(&IndicatorQuery::by_name("test"))
        .await
        .unwrap();
    let expected = format!("Bearer {}", FAKE_TOKEN);
    assert_eq!(
        mock.last_request().header("authorization"),
        Some(expected.as_str())
    );
}

#[tokio::test]
async fn test_auth_without_access_token_in_response() {
    let mock = MockYeti::start().await;
    mock.on(TOKEN_ROUTE, MockResponse::ok(json!({"detail": "nope"})));

    let err = mock.client().auth_api_key(Some(FAKE_API_KEY)).await.unwrap_err();
    assert!(matches!(err, YetiError::MissingAccessToken(_)));
}

#[tokio::test]
async fn test_rejected_api_key_is_an_auth_error() {
    let mock = MockYeti::start().await;
    mock.on(TOKEN_ROUTE, MockResponse::status(401));

    let err = mock.client().auth_api_key(Some("bad")).await.unwrap_err();
    assert!(matches!(err, YetiError::Auth(_)));
    assert_eq!(mock.requests_to(TOKEN_ROUTE).len(), 1);
}

#[tokio::test]
async fn test_search_indicators() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/indicators/search",
        MockResponse::ok(json!({"indicators": [{"name": "test"}]})),
    );
    let api = mock.authenticated_client().await;

    let result = api
        .search_indicators(&IndicatorQuery::by_name("test"))
        .await
        .unwrap();

    assert_eq!(result, vec![object(json!({"name": "test"}))]);
    assert_eq!(
        mock.last_request().json(),
        json!({"query": {"name": "test"}, "count": 0})
    );
}

#[tokio::test]
async fn test_search_indicators_requires_a_filter() {
    let mock = MockYeti::start().await;
    let api = mock.client();

    let err = api
        .search_indicators(&IndicatorQuery::default())
        .await
        .unwrap_err();
    assert!(matches!(err, YetiError::InvalidArgument(_)));
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_search_entities() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/entities/search",
        MockResponse::ok(json!({"entities": [{"name": "test_entity"}]})),
    );
    let api = mock.authenticated_client().await;

    let result = api.search_entities("test_entity", None).await.unwrap();
    assert_eq!(result, vec![object(json!({"name": "test_entity"}))]);
    assert_eq!(
        mock.last_request().json(),
        json!({"query": {"name": "test_entity"}, "count": 0})
    );
}

#[tokio::test]
async fn test_search_observables() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/observables/search",
        MockResponse::ok(json!({"observables": [{"value": "test_value"}]})),
    );
    let api = mock.authenticated_client().await;

    let result = api.search_observables("test_value").await.unwrap();
    assert_eq!(result, vec![object(json!({"value": "test_value"}))]);
    assert_eq!(
        mock.last_request().json(),
        json!({"query": {"value": "test_value"}, "count": 0})
    );
}

#[tokio::test]
async fn test_get_multiple_indicators() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/indicators/get/multiple",
        MockResponse::ok(json!({"indicators": [{"name": "a"}, {"name": "b"}], "total": 2})),
    );
    let api = mock.authenticated_client().await;

    let result = api.get_multiple_indicators(&["a", "b"]).await.unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(
        mock.last_request().json(),
        json!({"names": ["a", "b"], "count": 0})
    );
}

#[tokio::test]
async fn test_new_entity() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/entities/",
        MockResponse::ok(json!({"id": "new_entity"})),
    );
    let api = mock.authenticated_client().await;

    let result = api
        .new_entity(&json!({"name": "test_entity"}), &[])
        .await
        .unwrap();
    assert_eq!(result, object(json!({"id": "new_entity"})));
    assert_eq!(
        mock.last_request().json(),
        json!({"entity": {"name": "test_entity"}})
    );
}

#[tokio::test]
async fn test_new_indicator() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/indicators/",
        MockResponse::ok(json!({"id": "new_indicator"})),
    );
    let api = mock.authenticated_client().await;

    let result = api
        .new_indicator(&json!({"name": "test_indicator"}), &[])
        .await
        .unwrap();
    assert_eq!(result, object(json!({"id": "new_indicator"})));
    assert_eq!(
        mock.last_request().json(),
        json!({"indicator": {"name": "test_indicator"}})
    );
    assert!(mock.requests_to("POST /api/v2/indicators/tag").is_empty());
}

#[tokio::test]
async fn test_new_indicator_with_tags_tags_the_created_object() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/indicators/",
        MockResponse::ok(json!({"id": "42", "root_type": "indicator"})),
    );
    mock.on(
        "POST /api/v2/indicators/tag",
        MockResponse::ok(json!({"tagged": 1})),
    );
    let api = mock.authenticated_client().await;

    api.new_indicator(&json!({"name": "tagged"}), &["testtag"])
        .await
        .unwrap();

    let tag_request = mock.requests_to("POST /api/v2/indicators/tag").pop().unwrap();
    assert_eq!(tag_request.json(), json!({"tags": ["testtag"], "ids": ["42"]}));
}

#[tokio::test]
async fn test_patch_indicator() {
    let mock = MockYeti::start().await;
    mock.on(
        "PATCH /api/v2/indicators/1",
        MockResponse::ok(json!({"id": "patched_indicator"})),
    );
    let api = mock.authenticated_client().await;

    let result = api
        .patch_indicator("1", &json!({"name": "patched_indicator"}))
        .await
        .unwrap();
    assert_eq!(result, object(json!({"id": "patched_indicator"})));
    assert_eq!(
        mock.last_request().json(),
        json!({"indicator": {"name": "patched_indicator"}})
    );
}

#[tokio::test]
async fn test_find_indicator() {
    let mock = MockYeti::start().await;
    mock.on(
        "GET /api/v2/indicators/",
        MockResponse::ok(json!({"name": "testGet", "type": "regex"})),
    );
    let api = mock.authenticated_client().await;

    let indicator = api.find_indicator("testGet", "regex").await.unwrap().unwrap();
    assert_eq!(indicator["name"], "testGet");

    let query = mock.last_request().query.unwrap();
    assert!(query.contains("name=testGet"));
    assert!(query.contains("type=regex"));
}

#[tokio::test]
async fn test_find_returns_none_on_404() {
    let mock = MockYeti::start().await;
    mock.on("GET /api/v2/indicators/", MockResponse::status(404));
    mock.on("GET /api/v2/entities/", MockResponse::status(404));
    mock.on("GET /api/v2/observables/", MockResponse::status(404));
    mock.on("GET /api/v2/dfiq/", MockResponse::status(404));
    let api = mock.authenticated_client().await;

    assert!(api.find_indicator("missing", "regex").await.unwrap().is_none());
    assert!(api.find_entity("missing", "malware").await.unwrap().is_none());
    assert!(api
        .find_observable("missing.com", "hostname")
        .await
        .unwrap()
        .is_none());
    assert!(api.find_dfiq("missing", "question").await.unwrap().is_none());
}

#[tokio::test]
async fn test_find_propagates_other_errors() {
    let mock = MockYeti::start().await;
    mock.on("GET /api/v2/indicators/", MockResponse::status(422));
    let api = mock.authenticated_client().await;

    let err = api.find_indicator("x", "regex").await.unwrap_err();
    assert!(matches!(err, YetiError::Api { status: 422, .. }));
}

#[tokio::test]
async fn test_get_yara_bundle_with_overlays() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/indicators/yara/bundle",
        MockResponse::ok(json!({"bundle": "rule a {}"})),
    );
    let api = mock.authenticated_client().await;

    let request = YaraBundleRequest {
        tags: vec!["apt".to_string()],
        overlays: vec!["overlay".to_string()],
        ..YaraBundleRequest::default()
    };
    let result = api.get_yara_bundle_with_overlays(&request).await.unwrap();

    assert_eq!(result["bundle"], "rule a {}");
    assert_eq!(
        mock.last_request().json(),
        json!({"ids": [], "tags": ["apt"], "exclude_tags": [], "overlays": ["overlay"]})
    );
}

#[tokio::test]
async fn test_search_dfiq() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/dfiq/search",
        MockResponse::ok(json!({"dfiq": [{"name": "test_dfiq"}]})),
    );
    let api = mock.authenticated_client().await;

    let result = api.search_dfiq("test_dfiq", None).await.unwrap();
    assert_eq!(result, vec![object(json!({"name": "test_dfiq"}))]);
    assert_eq!(
        mock.last_request().json(),
        json!({"query": {"name": "test_dfiq"}, "count": 0})
    );
}

#[tokio::test]
async fn test_new_dfiq_from_yaml() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/dfiq/from_yaml",
        MockResponse::ok(json!({"id": "new_dfiq"})),
    );
    let api = mock.authenticated_client().await;

    let result = api
        .new_dfiq_from_yaml("type", "yaml_content", true)
        .await
        .unwrap();
    assert_eq!(result, object(json!({"id": "new_dfiq"})));
    assert_eq!(
        mock.last_request().json(),
        json!({
            "dfiq_type": "type",
            "dfiq_yaml": "yaml_content",
            "update_indicators": true,
        })
    );
}

#[tokio::test]
async fn test_patch_dfiq_from_yaml() {
    let mock = MockYeti::start().await;
    mock.on(
        "PATCH /api/v2/dfiq/1",
        MockResponse::ok(json!({"id": "patched_dfiq"})),
    );
    let api = mock.authenticated_client().await;

    let result = api
        .patch_dfiq_from_yaml("type", "yaml_content", "1", true)
        .await
        .unwrap();
    assert_eq!(result, object(json!({"id": "patched_dfiq"})));
    assert_eq!(
        mock.last_request().json(),
        json!({
            "dfiq_type": "type",
            "dfiq_yaml": "yaml_content",
            "update_indicators": true,
        })
    );
}

#[tokio::test]
async fn test_patch_dfiq_reads_type_and_id_from_object() {
    let mock = MockYeti::start().await;
    mock.on("PATCH /api/v2/dfiq/7", MockResponse::ok(json!({"id": "7"})));
    let api = mock.authenticated_client().await;

    let dfiq = object(json!({"id": 7, "type": "question", "name": "q"}));
    api.patch_dfiq(&dfiq).await.unwrap();

    let body = mock.last_request().json();
    assert_eq!(body["dfiq_type"], "question");
    assert_eq!(body["dfiq_object"]["name"], "q");
}

#[tokio::test]
async fn test_download_dfiq_archive() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/dfiq/to_archive",
        MockResponse::bytes(b"archive_content"),
    );
    let api = mock.authenticated_client().await;

    let result = api.download_dfiq_archive(None).await.unwrap();
    assert_eq!(&result[..], b"archive_content");
    assert_eq!(mock.last_request().json(), json!({"count": 0}));

    api.download_dfiq_archive(Some("scenario")).await.unwrap();
    assert_eq!(
        mock.last_request().json(),
        json!({"count": 0, "query": {"type": "scenario"}})
    );
}

#[tokio::test]
async fn test_upload_dfiq_archive() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/dfiq/from_archive",
        MockResponse::ok(json!({"uploaded": 1})),
    );
    let api = mock.authenticated_client().await;

    let mut archive = tempfile::NamedTempFile::new().unwrap();
    archive.write_all(b"data").unwrap();

    let result = api.upload_dfiq_archive(archive.path()).await.unwrap();
    assert_eq!(result.get("uploaded"), Some(&1));

    let request = mock.last_request();
    assert_eq!(request.path, "/api/v2/dfiq/from_archive");
    let content_type = request.header("content-type").unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    let body = String::from_utf8_lossy(&request.body);
    assert!(body.contains("name=\"archive\""));
    assert!(body.contains("filename=\"archive.zip\""));
    assert!(body.contains("data"));
}

#[tokio::test]
async fn test_add_observable() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/observables/",
        MockResponse::ok(json!({"id": "new_observable"})),
    );
    let api = mock.authenticated_client().await;

    let result = api.add_observable("value", "type", None).await.unwrap();
    assert_eq!(result, object(json!({"id": "new_observable"})));
    assert_eq!(
        mock.last_request().json(),
        json!({"value": "value", "type": "type", "tags": null})
    );
}

#[tokio::test]
async fn test_add_observables_bulk() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/observables/bulk",
        MockResponse::ok(json!({"added": [], "failed": []})),
    );
    let api = mock.authenticated_client().await;

    let result = api
        .add_observables_bulk(vec![NewObservable::new("value", "type")], &[])
        .await
        .unwrap();
    assert!(result.added.is_empty());
    assert!(result.failed.is_empty());
    assert_eq!(
        mock.last_request().json(),
        json!({"observables": [{"value": "value", "type": "type"}]})
    );

    api.add_observables_bulk(vec![NewObservable::new("value", "type")], &["t1"])
        .await
        .unwrap();
    assert_eq!(
        mock.last_request().json(),
        json!({"observables": [{"value": "value", "type": "type", "tags": ["t1"]}]})
    );
}

#[tokio::test]
async fn test_tag_object() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/indicators/tag",
        MockResponse::ok(json!({"id": "tagged_object"})),
    );
    let api = mock.authenticated_client().await;

    let target = object(json!({"id": "1", "root_type": "indicator"}));
    let result = api.tag_object(&target, &["tag1"]).await.unwrap();
    assert_eq!(result, object(json!({"id": "tagged_object"})));
    assert_eq!(
        mock.last_request().json(),
        json!({"tags": ["tag1"], "ids": ["1"]})
    );
}

#[tokio::test]
async fn test_tag_object_with_unknown_root_type_is_rejected() {
    let mock = MockYeti::start().await;
    let api = mock.authenticated_client().await;

    let target = object(json!({"id": "1", "root_type": "user"}));
    let err = api.tag_object(&target, &["tag1"]).await.unwrap_err();
    assert!(matches!(err, YetiError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_link_objects() {
    let mock = MockYeti::start().await;
    mock.on("POST /api/v2/graph/add", MockResponse::ok(json!({"id": "link"})));
    let api = mock.authenticated_client().await;

    let source = object(json!({"id": "1", "root_type": "indicator"}));
    let target = object(json!({"id": "2", "root_type": "entity"}));
    let result = api
        .link_objects(&source, &target, "link_type", None)
        .await
        .unwrap();

    assert_eq!(result, object(json!({"id": "link"})));
    assert_eq!(
        mock.last_request().json(),
        json!({
            "source": "indicator/1",
            "target": "entity/2",
            "link_type": "link_type",
            "description": null,
        })
    );
}

#[tokio::test]
async fn test_search_graph() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/graph/search",
        MockResponse::ok(json!({"graph": "data"})),
    );
    let api = mock.authenticated_client().await;

    let search = GraphSearch::new("source")
        .graph("graph")
        .target_types(["type"]);
    let result = api.search_graph(&search).await.unwrap();

    assert_eq!(result, object(json!({"graph": "data"})));
    assert_eq!(
        mock.last_request().json(),
        json!({
            "count": 0,
            "source": "source",
            "graph": "graph",
            "min_hops": 1,
            "max_hops": 1,
            "direction": "outbound",
            "include_original": true,
            "target_types": ["type"],
        })
    );
}

#[tokio::test]
async fn test_search_bloom() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/bloom/search",
        MockResponse::ok(json!([{"value": "evil.com", "hits": ["feed1"]}])),
    );
    let api = mock.authenticated_client().await;

    let hits = api.search_bloom(&["evil.com", "good.com"]).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].value, "evil.com");
    assert_eq!(hits[0].hits, vec!["feed1".to_string()]);
    assert_eq!(
        mock.last_request().json(),
        json!({"values": ["evil.com", "good.com"]})
    );
}

#[tokio::test]
async fn test_tags() {
    let mock = MockYeti::start().await;
    mock.on(
        "POST /api/v2/tags/",
        MockResponse::ok(json!({"name": "testTag", "description": "test"})),
    );
    mock.on(
        "POST /api/v2/tags/search",
        MockResponse::ok(json!({"tags": [{"name": "testTag"}], "total": 1})),
    );
    let api = mock.authenticated_client().await;

    let tag = api.new_tag("testTag", Some("test")).await.unwrap();
    assert_eq!(tag["description"], "test");
    assert_eq!(
        mock.last_request().json(),
        json!({"name": "testTag", "description": "test"})
    );

    let tags = api.search_tags("testT").await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(
        mock.last_request().json(),
        json!({"name": "testT", "count": 0})
    );
}

#[tokio::test]
async fn test_401_triggers_refresh_and_retry() {
    let mock = MockYeti::start().await;
    mock.on_sequence(
        "POST /api/v2/indicators/search",
        vec![
            MockResponse::status(401),
            MockResponse::ok(json!({"indicators": [{"name": "test"}]})),
        ],
    );
    let api = mock.authenticated_client().await;

    let result = api
        .search_indicators(&IndicatorQuery::by_name("test"))
        .await
        .unwrap();
    assert_eq!(result.len(), 1);

    let routes: Vec<String> = mock.requests().iter().map(|r| r.route()).collect();
    assert_eq!(
        routes,
        vec![
            TOKEN_ROUTE,
            "POST /api/v2/indicators/search",
            TOKEN_ROUTE,
            "POST /api/v2/indicators/search",
        ]
    );
}

#[tokio::test]
async fn test_persistent_401_exhausts_refreshes() {
    let mock = MockYeti::start().await;
    mock.on("POST /api/v2/indicators/search", MockResponse::status(401));
    let api = mock.authenticated_client().await;

    let err = api
        .search_indicators(&IndicatorQuery::by_name("test"))
        .await
        .unwrap_err();

    assert!(matches!(err, YetiError::Auth(_)));
    assert!(err
        .to_string()
        .starts_with("401 Client Error: Unauthorized for url: "));
    assert!(err.to_string().ends_with("/api/v2/indicators/search"));

    // one initial authentication plus three refreshes
    assert_eq!(mock.requests_to(TOKEN_ROUTE).len(), 4);
    assert_eq!(
        mock.requests_to("POST /api/v2/indicators/search").len(),
        4
    );
}

#[tokio::test]
async fn test_unauthenticated_request_fails_with_auth_error() {
    let mock = MockYeti::start().await;
    mock.on("POST /api/v2/indicators/search", MockResponse::status(401));

    let err = mock
        .client()
        .search_indicators(&IndicatorQuery::by_name("test"))
        .await
        .unwrap_err();

    assert!(err
        .to_string()
        .contains("401 Client Error: Unauthorized for url: "));
    assert!(mock.requests_to(TOKEN_ROUTE).is_empty());
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let mock = MockYeti::start().await;
    mock.on_sequence(
        "POST /api/v2/observables/search",
        vec![
            MockResponse::status(503),
            MockResponse::ok(json!({"observables": []})),
        ],
    );

    let mut config = ClientConfig::new(mock.url());
    config.retry = RetryConfig::fixed_delay(3, 10);
    let api = YetiApi::with_config(config).unwrap();

    let result = api.search_observables("x").await.unwrap();
    assert!(result.is_empty());
    assert_eq!(
        mock.requests_to("POST /api/v2/observables/search").len(),
        2
    );
}

#[tokio::test]
async fn test_writes_are_not_resent_after_server_errors() {
    let mock = MockYeti::start().await;
    mock.on_sequence(
        "POST /api/v2/indicators/",
        vec![
            MockResponse::status(503),
            MockResponse::ok(json!({"id": "1", "name": "test"})),
        ],
    );

    let mut config = ClientConfig::new(mock.url());
    config.retry = RetryConfig::fixed_delay(3, 10);
    let api = YetiApi::with_config(config).unwrap();

    let err = api
        .new_indicator(&json!({"name": "test", "type": "regex"}), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, YetiError::Api { status: 503, .. }), "{:?}", err);
    assert_eq!(mock.requests_to("POST /api/v2/indicators/").len(), 1);
}

#[tokio::test]
async fn test_server_error_without_retries_is_an_api_error() {
    let mock = MockYeti::start().await;
    mock.on("POST /api/v2/observables/search", MockResponse::status(500));

    let err = mock.client().search_observables("x").await.unwrap_err();
    assert!(matches!(err, YetiError::Api { status: 500, .. }));
}

#[tokio::test]
async fn test_clones_share_the_session() {
    let mock = MockYeti::start().await;
    let api = mock.client();
    let clone = api.clone();

    api.auth_api_key(Some(FAKE_API_KEY)).await.unwrap();
    assert!(clone.is_authenticated().await);
}
