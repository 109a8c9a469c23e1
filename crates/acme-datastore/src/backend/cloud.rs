//! Google Cloud Datastore backend over the v1 REST API.
//!
//! Documents are entities named after their logical key with the
//! properties `Value` (blob, unindexed), `Modified` (timestamp) and, for
//! site records, `Lock` (timestamp). An unset lease is stored as the zero
//! timestamp `0001-01-01T00:00:00Z`.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Document, DocumentKey, DocumentStore, KeyQuery};
use crate::error::DocumentStoreError;
use crate::record::EntityKind;

/// Production Datastore endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://datastore.googleapis.com";

const PROP_VALUE: &str = "Value";
const PROP_MODIFIED: &str = "Modified";
const PROP_LOCK: &str = "Lock";

const ZERO_TIMESTAMP: &str = "0001-01-01T00:00:00Z";

/// Page size used when key names have to be filtered client-side.
const QUERY_PAGE_SIZE: usize = 100;

/// Cloud Datastore client for one project.
#[derive(Debug, Clone)]
pub struct CloudDatastore {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    access_token: Option<String>,
}

impl CloudDatastore {
    /// Create a client for `project_id` talking to `base_url`
    /// (e.g. [`DEFAULT_ENDPOINT`] or `http://localhost:8081` for the emulator).
    pub fn new(base_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            access_token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` on every request.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn api_key(&self, key: &DocumentKey) -> ApiKey {
        ApiKey {
            partition_id: self.partition(),
            path: vec![PathElement {
                kind: key.kind.store_kind().to_string(),
                name: Some(key.name.clone()),
            }],
        }
    }

    fn partition(&self) -> PartitionId {
        PartitionId {
            project_id: self.project_id.clone(),
        }
    }

    async fn call<Req, Resp>(&self, method: &str, body: &Req) -> Result<Resp, DocumentStoreError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/v1/projects/{}:{}", self.base_url, self.project_id, method);
        trace!(url = %url, "Datastore request");

        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DocumentStoreError::Unavailable(format!("{method} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DocumentStoreError::Unavailable(format!(
                "{method} returned {status}: {body}"
            )));
        }

        response.json::<Resp>().await.map_err(|e| {
            DocumentStoreError::Unavailable(format!("{method} returned an invalid response: {e}"))
        })
    }

    async fn commit(&self, mutation: Mutation) -> Result<(), DocumentStoreError> {
        let request = CommitRequest {
            mode: "NON_TRANSACTIONAL",
            mutations: vec![mutation],
        };
        let _: serde_json::Value = self.call("commit", &request).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for CloudDatastore {
    async fn get(&self, key: &DocumentKey) -> Result<Document, DocumentStoreError> {
        let request = LookupRequest {
            keys: vec![self.api_key(key)],
        };
        let response: LookupResponse = self.call("lookup", &request).await?;

        if let Some(found) = response.found.into_iter().next() {
            return entity_to_document(found.entity);
        }
        if !response.deferred.is_empty() {
            return Err(DocumentStoreError::Unavailable(
                "lookup deferred the key".to_string(),
            ));
        }
        if response.missing.is_empty() {
            return Err(DocumentStoreError::Unavailable(
                "lookup returned neither found nor missing".to_string(),
            ));
        }
        Err(DocumentStoreError::NotFound)
    }

    async fn put(&self, key: &DocumentKey, document: Document) -> Result<(), DocumentStoreError> {
        let entity = Entity {
            key: self.api_key(key),
            properties: document_properties(key.kind, &document),
        };
        self.commit(Mutation::Upsert(entity)).await?;
        debug!(kind = %key.kind, name = %key.name, "Upserted datastore entity");
        Ok(())
    }

    async fn delete(&self, key: &DocumentKey) -> Result<(), DocumentStoreError> {
        self.commit(Mutation::Delete(self.api_key(key))).await?;
        debug!(kind = %key.kind, name = %key.name, "Deleted datastore entity");
        Ok(())
    }

    async fn query_keys(&self, query: &KeyQuery) -> Result<Vec<String>, DocumentStoreError> {
        let limit = query.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }
        // Name prefixes are filtered locally, so the server limit only
        // applies when every returned key counts.
        let page_size = match query.name_prefix {
            Some(_) => QUERY_PAGE_SIZE,
            None => limit.min(QUERY_PAGE_SIZE),
        };

        let mut names = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let request = RunQueryRequest {
                partition_id: self.partition(),
                query: ApiQuery {
                    kind: vec![KindExpression {
                        name: query.kind.store_kind().to_string(),
                    }],
                    projection: vec![Projection {
                        property: PropertyReference {
                            name: "__key__".to_string(),
                        },
                    }],
                    order: if query.newest_first {
                        vec![PropertyOrder {
                            property: PropertyReference {
                                name: PROP_MODIFIED.to_string(),
                            },
                            direction: "DESCENDING",
                        }]
                    } else {
                        Vec::new()
                    },
                    limit: Some(page_size),
                    start_cursor: cursor.take(),
                },
            };

            let response: RunQueryResponse = self.call("runQuery", &request).await?;
            let batch = response.batch;
            let page_len = batch.entity_results.len();

            for result in batch.entity_results {
                let Some(name) = result.entity.key.path.last().and_then(|p| p.name.clone()) else {
                    continue;
                };
                if query.matches(&name) {
                    names.push(name);
                    if names.len() >= limit {
                        return Ok(names);
                    }
                }
            }

            match batch.end_cursor {
                Some(next) if page_len > 0 && batch.more_results != "NO_MORE_RESULTS" => {
                    cursor = Some(next);
                }
                _ => return Ok(names),
            }
        }
    }
}

fn document_properties(kind: EntityKind, document: &Document) -> HashMap<String, PropertyValue> {
    let mut properties = HashMap::new();
    properties.insert(
        PROP_VALUE.to_string(),
        PropertyValue {
            blob_value: Some(STANDARD.encode(&document.value)),
            exclude_from_indexes: true,
            ..PropertyValue::default()
        },
    );
    properties.insert(
        PROP_MODIFIED.to_string(),
        PropertyValue::timestamp(format_timestamp(document.modified)),
    );
    if kind == EntityKind::Site {
        let lease = document
            .lease
            .map_or_else(|| ZERO_TIMESTAMP.to_string(), format_timestamp);
        properties.insert(PROP_LOCK.to_string(), PropertyValue::timestamp(lease));
    }
    properties
}

fn entity_to_document(mut entity: Entity) -> Result<Document, DocumentStoreError> {
    let value = match entity.properties.remove(PROP_VALUE).and_then(|p| p.blob_value) {
        Some(encoded) => STANDARD.decode(encoded.as_bytes()).map_err(|e| {
            DocumentStoreError::Unavailable(format!("entity has an invalid blob value: {e}"))
        })?,
        None => Vec::new(),
    };

    let modified = match entity.properties.remove(PROP_MODIFIED).and_then(|p| p.timestamp_value) {
        Some(ts) => parse_timestamp(&ts)?,
        None => DateTime::UNIX_EPOCH,
    };

    let lease = match entity.properties.remove(PROP_LOCK).and_then(|p| p.timestamp_value) {
        Some(ts) => Some(parse_timestamp(&ts)?).filter(|t| *t > DateTime::UNIX_EPOCH),
        None => None,
    };

    Ok(Document {
        value,
        modified,
        lease,
    })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>, DocumentStoreError> {
    DateTime::parse_from_rfc3339(ts)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DocumentStoreError::Unavailable(format!("invalid timestamp {ts:?}: {e}")))
}

// =========================================================================
// Wire types
// =========================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKey {
    partition_id: PartitionId,
    path: Vec<PathElement>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionId {
    project_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PathElement {
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Entity {
    key: ApiKey,
    #[serde(default)]
    properties: HashMap<String, PropertyValue>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blob_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp_value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    exclude_from_indexes: bool,
}

impl PropertyValue {
    fn timestamp(ts: String) -> Self {
        Self {
            timestamp_value: Some(ts),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct LookupRequest {
    keys: Vec<ApiKey>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    found: Vec<EntityResult>,
    #[serde(default)]
    missing: Vec<IgnoredAny>,
    /// Keys the server did not process this time; must be retried.
    #[serde(default)]
    deferred: Vec<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct EntityResult {
    entity: Entity,
}

#[derive(Debug, Serialize)]
struct CommitRequest {
    mode: &'static str,
    mutations: Vec<Mutation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Mutation {
    Upsert(Entity),
    Delete(ApiKey),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunQueryRequest {
    partition_id: PartitionId,
    query: ApiQuery,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiQuery {
    kind: Vec<KindExpression>,
    projection: Vec<Projection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    order: Vec<PropertyOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct KindExpression {
    name: String,
}

#[derive(Debug, Serialize)]
struct Projection {
    property: PropertyReference,
}

#[derive(Debug, Serialize)]
struct PropertyReference {
    name: String,
}

#[derive(Debug, Serialize)]
struct PropertyOrder {
    property: PropertyReference,
    direction: &'static str,
}

#[derive(Debug, Deserialize)]
struct RunQueryResponse {
    batch: QueryResultBatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultBatch {
    #[serde(default)]
    entity_results: Vec<EntityResult>,
    #[serde(default)]
    end_cursor: Option<String>,
    #[serde(default)]
    more_results: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_site_properties_carry_zero_lock() {
        let doc = Document::new(b"blob".to_vec());
        let props = document_properties(EntityKind::Site, &doc);

        assert_eq!(props[PROP_VALUE].blob_value.as_deref(), Some("YmxvYg=="));
        assert!(props[PROP_VALUE].exclude_from_indexes);
        assert_eq!(props[PROP_LOCK].timestamp_value.as_deref(), Some(ZERO_TIMESTAMP));
    }

    #[test]
    fn test_user_properties_have_no_lock() {
        let props = document_properties(EntityKind::User, &Document::new(Vec::new()));
        assert!(!props.contains_key(PROP_LOCK));
        assert!(props.contains_key(PROP_MODIFIED));
    }

    #[test]
    fn test_entity_zero_lock_reads_as_unset() {
        let json = serde_json::json!({
            "key": {"partitionId": {"projectId": "p"}, "path": [{"kind": "caddytlsSiteRecord", "name": "k"}]},
            "properties": {
                "Value": {"blobValue": "YmxvYg==", "excludeFromIndexes": true},
                "Modified": {"timestampValue": "2024-05-01T10:00:00.123456Z"},
                "Lock": {"timestampValue": ZERO_TIMESTAMP}
            }
        });
        let entity: Entity = serde_json::from_value(json).unwrap();
        let doc = entity_to_document(entity).unwrap();

        assert_eq!(doc.value, b"blob");
        assert_eq!(doc.lease, None);
        assert_eq!(
            doc.modified,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::microseconds(123_456)
        );
    }

    #[test]
    fn test_entity_future_lock_is_kept() {
        let until = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let doc = Document {
            value: Vec::new(),
            modified: Utc::now(),
            lease: Some(until),
        };
        let entity = Entity {
            key: ApiKey {
                partition_id: PartitionId {
                    project_id: "p".to_string(),
                },
                path: Vec::new(),
            },
            properties: document_properties(EntityKind::Site, &doc),
        };
        assert_eq!(entity_to_document(entity).unwrap().lease, Some(until));
    }

    #[test]
    fn test_mutation_wire_shape() {
        let key = ApiKey {
            partition_id: PartitionId {
                project_id: "p".to_string(),
            },
            path: vec![PathElement {
                kind: "caddytlsSiteRecord".to_string(),
                name: Some("k".to_string()),
            }],
        };
        let json = serde_json::to_value(Mutation::Delete(key)).unwrap();
        assert_eq!(json["delete"]["partitionId"]["projectId"], "p");
        assert_eq!(json["delete"]["path"][0]["name"], "k");
    }
}
