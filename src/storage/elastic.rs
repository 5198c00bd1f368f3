//! Elasticsearch-backed weight store.
//!
//! The weights live in a single document (`{index}/_doc/{doc_id}`) that the
//! serving layer polls. Concurrency control uses the document `_version`:
//! the publisher re-reads the document, checks the version it expects, and
//! writes with `version_type=external` so Elasticsearch itself rejects the
//! write (HTTP 409) if another run got there first.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{VariantEntry, WeightSink, WeightsDocument};
use crate::{BanditError, PageType};

// ── Default value functions ──────────────────────────────────────────────

/// Default Elasticsearch endpoint.
fn default_base_url() -> String {
    "http://localhost:9200".to_string()
}

/// Default index holding the weights document.
fn default_index() -> String {
    "bandit_ml_recs".to_string()
}

/// Default id of the weights document.
fn default_doc_id() -> String {
    "0".to_string()
}

/// Default per-request timeout: 10 seconds.
fn default_timeout_ms() -> u64 {
    10_000
}

/// Connection settings for [`ElasticWeightStore`].
///
/// Immutable once constructed; passed by value to the store.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ElasticConfig {
    /// Base URL of the cluster, e.g. `http://es01:9200`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Index holding the weights document.
    #[serde(default = "default_index")]
    pub index: String,
    /// Id of the weights document.
    #[serde(default = "default_doc_id")]
    pub doc_id: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            index: default_index(),
            doc_id: default_doc_id(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ElasticConfig {
    /// Full URL of the weights document.
    pub fn document_url(&self) -> String {
        format!(
            "{}/{}/_doc/{}",
            self.base_url.trim_end_matches('/'),
            self.index,
            self.doc_id
        )
    }
}

/// `GET _doc` response.
#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_version", default)]
    version: u64,
    #[serde(rename = "_source")]
    source: Option<WeightsDocument>,
}

/// `PUT _doc` response.
#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(rename = "_version")]
    version: u64,
}

/// Weight store talking to Elasticsearch over its REST API.
///
/// ## Example
///
/// ```no_run
/// use traffic_bandit::{ElasticConfig, ElasticWeightStore};
///
/// let store = ElasticWeightStore::new(ElasticConfig {
///     base_url: "http://es01:9200".to_string(),
///     ..ElasticConfig::default()
/// });
/// ```
pub struct ElasticWeightStore {
    client: reqwest::Client,
    config: ElasticConfig,
    timeout: Duration,
}

impl ElasticWeightStore {
    /// Create a store for `config`.
    pub fn new(config: ElasticConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(config.timeout_ms),
            config,
        }
    }

    /// The connection settings.
    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    async fn fetch_document(&self) -> Result<WeightsDocument, BanditError> {
        let url = self.config.document_url();
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| BanditError::Storage(format!("GET {url} failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BanditError::DocumentNotFound(url));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BanditError::Storage(format!(
                "GET {url} returned {status}: {body}"
            )));
        }

        let parsed: GetResponse = response
            .json()
            .await
            .map_err(|e| BanditError::Storage(format!("cannot parse {url}: {e}")))?;

        match (parsed.found, parsed.source) {
            (true, Some(mut doc)) => {
                doc.version = parsed.version;
                Ok(doc)
            }
            _ => Err(BanditError::DocumentNotFound(url)),
        }
    }
}

#[async_trait]
impl WeightSink for ElasticWeightStore {
    async fn read_latest(&self) -> Result<WeightsDocument, BanditError> {
        self.fetch_document().await
    }

    async fn publish(
        &self,
        page_type: &PageType,
        variants: BTreeMap<String, VariantEntry>,
        expected_version: u64,
    ) -> Result<u64, BanditError> {
        let publish_failed = |reason: String| BanditError::PublishFailed {
            page_type: page_type.to_string(),
            reason,
        };

        let mut doc = self
            .fetch_document()
            .await
            .map_err(|e| publish_failed(format!("cannot read document before write: {e}")))?;
        if doc.version != expected_version {
            return Err(BanditError::ConcurrentModification {
                page_type: page_type.to_string(),
                expected: expected_version,
                found: doc.version,
            });
        }

        doc.apply(page_type, variants);
        let next_version = expected_version + 1;
        let url = self.config.document_url();
        debug!(url = %url, version = next_version, page_type = %page_type, "writing weights document");

        let response = self
            .client
            .put(&url)
            .query(&[
                ("version", next_version.to_string()),
                ("version_type", "external".to_string()),
            ])
            .timeout(self.timeout)
            .json(&doc)
            .send()
            .await
            .map_err(|e| publish_failed(format!("PUT {url} failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            let found = self
                .fetch_document()
                .await
                .map(|d| d.version)
                .unwrap_or(next_version);
            return Err(BanditError::ConcurrentModification {
                page_type: page_type.to_string(),
                expected: expected_version,
                found,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(publish_failed(format!("PUT {url} returned {status}: {body}")));
        }

        let indexed: IndexResponse = response
            .json()
            .await
            .map_err(|e| publish_failed(format!("cannot parse index response: {e}")))?;

        if indexed.version <= expected_version {
            return Err(BanditError::ConcurrentModification {
                page_type: page_type.to_string(),
                expected: expected_version,
                found: indexed.version,
            });
        }
        Ok(indexed.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOC_PATH: &str = "/bandit_ml_recs/_doc/0";

    fn store(server: &MockServer) -> ElasticWeightStore {
        ElasticWeightStore::new(ElasticConfig {
            base_url: server.uri(),
            ..ElasticConfig::default()
        })
    }

    fn existing_doc(version: u64) -> serde_json::Value {
        json!({
            "_index": "bandit_ml_recs",
            "_id": "0",
            "_version": version,
            "found": true,
            "_source": {
                "page_types": {
                    "mobile": {"updated": "2017-12-04 03:10:47", "variants": {}},
                    "desktop": {
                        "updated": "2017-12-04 03:10:47",
                        "variants": {
                            "7": {"prob": 0.51, "parameters": {"item_boost": 1.0}},
                            "8": {"prob": 0.49}
                        }
                    }
                }
            }
        })
    }

    fn entries() -> BTreeMap<String, VariantEntry> {
        BTreeMap::from([
            (
                "7".to_string(),
                VariantEntry {
                    prob: 0.3,
                    conversion: Some(0.02),
                    parameters: json!({"item_boost": 1.0}),
                },
            ),
            (
                "8".to_string(),
                VariantEntry {
                    prob: 0.7,
                    conversion: Some(0.03),
                    parameters: serde_json::Value::Null,
                },
            ),
        ])
    }

    #[test]
    fn test_default_config_values() {
        let cfg = ElasticConfig::default();
        assert_eq!(cfg.index, "bandit_ml_recs");
        assert_eq!(cfg.doc_id, "0");
        assert_eq!(cfg.timeout_ms, 10_000);
    }

    #[test]
    fn test_document_url_trims_trailing_slash() {
        let cfg = ElasticConfig {
            base_url: "http://es01:9200/".to_string(),
            ..ElasticConfig::default()
        };
        assert_eq!(cfg.document_url(), "http://es01:9200/bandit_ml_recs/_doc/0");
    }

    #[tokio::test]
    async fn test_read_latest_parses_document_and_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(existing_doc(3)))
            .mount(&server)
            .await;

        let doc = store(&server).read_latest().await.expect("test: read");
        assert_eq!(doc.version, 3);
        let desktop = doc.weights("desktop").unwrap_or_default();
        assert!((desktop["7"] - 0.51).abs() < f64::EPSILON);
        assert!(doc.page_types.contains_key("mobile"));
    }

    #[tokio::test]
    async fn test_read_latest_404_is_document_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"_id": "0", "found": false})),
            )
            .mount(&server)
            .await;

        assert!(matches!(
            store(&server).read_latest().await,
            Err(BanditError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_latest_server_error_is_storage_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        match store(&server).read_latest().await {
            Err(BanditError::Storage(msg)) => assert!(msg.contains("500"), "got: {msg}"),
            other => std::panic::panic_any(format!("expected Storage, got {other:?}")),
        }
    }

    #[tokio::test]
    async fn test_publish_writes_with_external_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(existing_doc(3)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .and(query_param("version", "4"))
            .and(query_param("version_type", "external"))
            .and(body_partial_json(json!({
                "page_types": {
                    "mobile": {"variants": {}},
                    "desktop": {"variants": {"8": {"prob": 0.7}}}
                }
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"_version": 4, "result": "updated"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let version = store(&server)
            .publish(&PageType::new("desktop"), entries(), 3)
            .await
            .expect("test: publish");
        assert_eq!(version, 4);
    }

    #[tokio::test]
    async fn test_publish_stale_expected_version_skips_write() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(existing_doc(5)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let result = store(&server)
            .publish(&PageType::new("desktop"), entries(), 3)
            .await;
        assert!(matches!(
            result,
            Err(BanditError::ConcurrentModification { expected: 3, found: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_409_is_concurrent_modification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(existing_doc(3)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(409).set_body_json(
                json!({"error": {"type": "version_conflict_engine_exception"}, "status": 409}),
            ))
            .mount(&server)
            .await;

        let result = store(&server)
            .publish(&PageType::new("desktop"), entries(), 3)
            .await;
        assert!(matches!(
            result,
            Err(BanditError::ConcurrentModification { expected: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_unchanged_version_is_concurrent_modification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(existing_doc(3)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_version": 3})))
            .mount(&server)
            .await;

        let result = store(&server)
            .publish(&PageType::new("desktop"), entries(), 3)
            .await;
        assert!(matches!(
            result,
            Err(BanditError::ConcurrentModification { found: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_server_error_is_publish_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(existing_doc(3)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        match store(&server)
            .publish(&PageType::new("desktop"), entries(), 3)
            .await
        {
            Err(BanditError::PublishFailed { page_type, reason }) => {
                assert_eq!(page_type, "desktop");
                assert!(reason.contains("503"), "got: {reason}");
            }
            other => std::panic::panic_any(format!("expected PublishFailed, got {other:?}")),
        }
    }

    #[tokio::test]
    async fn test_publish_timeout_is_publish_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DOC_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(existing_doc(3)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(DOC_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"_version": 4}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let store = ElasticWeightStore::new(ElasticConfig {
            base_url: server.uri(),
            timeout_ms: 200,
            ..ElasticConfig::default()
        });
        let result = store.publish(&PageType::new("desktop"), entries(), 3).await;
        assert!(matches!(result, Err(BanditError::PublishFailed { .. })));
    }
}
