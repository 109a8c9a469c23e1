//! Cloud Datastore REST wire format tests against a mock server.

use chrono::{TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sentinel_acme_datastore::backend::{Document, DocumentKey, KeyQuery};
use sentinel_acme_datastore::error::DocumentStoreError;
use sentinel_acme_datastore::{CloudDatastore, DocumentStore, EntityKind};

const PROJECT: &str = "test-project";

fn site_key() -> DocumentKey {
    DocumentKey::new(EntityKind::Site, "caddytls/ca.test/sites/tls.test.com")
}

fn entity_key(kind: &str, name: &str) -> serde_json::Value {
    json!({
        "partitionId": {"projectId": PROJECT},
        "path": [{"kind": kind, "name": name}]
    })
}

#[tokio::test]
async fn test_lookup_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:lookup")))
        .and(body_partial_json(json!({
            "keys": [entity_key("caddytlsSiteRecord", "caddytls/ca.test/sites/tls.test.com")]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "found": [{
                "entity": {
                    "key": entity_key("caddytlsSiteRecord", "caddytls/ca.test/sites/tls.test.com"),
                    "properties": {
                        "Value": {"blobValue": "YmxvYg==", "excludeFromIndexes": true},
                        "Modified": {"timestampValue": "2024-05-01T10:00:00Z"},
                        "Lock": {"timestampValue": "2099-01-01T00:00:00Z"}
                    }
                },
                "version": "1"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT);
    let doc = store.get(&site_key()).await.unwrap();

    assert_eq!(doc.value, b"blob");
    assert_eq!(doc.modified, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    assert_eq!(doc.lease, Some(Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap()));
}

#[tokio::test]
async fn test_lookup_missing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:lookup")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "missing": [{"entity": {"key": entity_key("caddytlsSiteRecord", "x")}}]
        })))
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT);
    assert_eq!(store.get(&site_key()).await.unwrap_err(), DocumentStoreError::NotFound);
}

#[tokio::test]
async fn test_lookup_deferred_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:lookup")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "deferred": [entity_key("caddytlsSiteRecord", "caddytls/ca.test/sites/tls.test.com")]
        })))
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT);
    assert!(matches!(
        store.get(&site_key()).await,
        Err(DocumentStoreError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_lookup_empty_response_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:lookup")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT);
    assert!(matches!(
        store.get(&site_key()).await,
        Err(DocumentStoreError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend down"))
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT);
    let err = store.get(&site_key()).await.unwrap_err();
    let DocumentStoreError::Unavailable(reason) = err else {
        panic!("expected unavailable");
    };
    assert!(reason.contains("503"));
    assert!(reason.contains("backend down"));
}

#[tokio::test]
async fn test_upsert_with_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:commit")))
        .and(header("authorization", "Bearer secret-token"))
        .and(body_partial_json(json!({
            "mode": "NON_TRANSACTIONAL",
            "mutations": [{
                "upsert": {
                    "key": entity_key("caddytlsSiteRecord", "caddytls/ca.test/sites/tls.test.com"),
                    "properties": {
                        "Value": {"blobValue": "YmxvYg==", "excludeFromIndexes": true},
                        "Lock": {"timestampValue": "0001-01-01T00:00:00Z"}
                    }
                }
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "mutationResults": [{"version": "2"}],
            "indexUpdates": 1
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT).with_access_token("secret-token");
    store
        .put(&site_key(), Document::new(b"blob".to_vec()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:commit")))
        .and(body_partial_json(json!({
            "mutations": [{
                "delete": entity_key("caddytlsSiteRecord", "caddytls/ca.test/sites/tls.test.com")
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT);
    store.delete(&site_key()).await.unwrap();
}

#[tokio::test]
async fn test_query_filters_prefix_and_pages() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:runQuery")))
        .and(body_partial_json(json!({"query": {"startCursor": "page2"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {
                "entityResultType": "KEY_ONLY",
                "entityResults": [
                    {"entity": {"key": entity_key("caddytlsUserRecord", "caddytls/ca.test/users/b@test.com")}}
                ],
                "endCursor": "page3",
                "moreResults": "NO_MORE_RESULTS"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:runQuery")))
        .and(body_partial_json(json!({
            "query": {
                "kind": [{"name": "caddytlsUserRecord"}],
                "projection": [{"property": {"name": "__key__"}}],
                "order": [{"property": {"name": "Modified"}, "direction": "DESCENDING"}]
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {
                "entityResultType": "KEY_ONLY",
                "entityResults": [
                    {"entity": {"key": entity_key("caddytlsUserRecord", "caddytls/other.ca/users/a@test.com")}}
                ],
                "endCursor": "page2",
                "moreResults": "NOT_FINISHED"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT);
    let query = KeyQuery::new(EntityKind::User)
        .with_name_prefix("caddytls/ca.test/users/")
        .newest_first()
        .with_limit(1);

    let names = store.query_keys(&query).await.unwrap();
    assert_eq!(names, vec!["caddytls/ca.test/users/b@test.com"]);
}

#[tokio::test]
async fn test_query_empty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:runQuery")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {
                "entityResultType": "KEY_ONLY",
                "moreResults": "NO_MORE_RESULTS"
            }
        })))
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT);
    let names = store
        .query_keys(&KeyQuery::new(EntityKind::User).newest_first().with_limit(1))
        .await
        .unwrap();
    assert!(names.is_empty());
}

#[tokio::test]
async fn test_query_zero_limit_returns_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/{PROJECT}:runQuery")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {
                "entityResultType": "KEY_ONLY",
                "entityResults": [
                    {"entity": {"key": entity_key("caddytlsUserRecord", "caddytls/ca.test/users/a@test.com")}}
                ],
                "moreResults": "NO_MORE_RESULTS"
            }
        })))
        .expect(0)
        .mount(&server)
        .await;

    let store = CloudDatastore::new(server.uri(), PROJECT);
    let query = KeyQuery::new(EntityKind::User)
        .with_name_prefix("caddytls/ca.test/users/")
        .with_limit(0);
    assert!(store.query_keys(&query).await.unwrap().is_empty());
}
