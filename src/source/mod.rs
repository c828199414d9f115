//! Source adapters and the ingestion orchestrator.
//!
//! Each external data source implements [`SourceAdapter`]; the orchestrator
//! drives any adapter through the same fetch / load-raw / transform loop and
//! isolates failures to the resource that produced them.

pub mod quest;
pub mod whoop;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::Value;
use std::pin::Pin;

use crate::error::{IngestError, Result};

/// Lazy stream of raw records for one resource.
pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = Result<Value>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Success,
    Error,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Success => "success",
            IngestStatus::Error => "error",
        }
    }
}

/// Outcome of ingesting one resource in one run.
#[derive(Debug, Clone)]
pub struct IngestResult {
    pub resource: String,
    pub records_fetched: u64,
    pub records_loaded: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: IngestStatus,
    pub error: Option<String>,
}

/// A pluggable data source.
///
/// `fetch` yields verbatim records; `load_raw` persists one record into the
/// raw capture layer; `transform_and_load` optionally projects it into the
/// unified schema. Adapters that only capture raw data keep the default
/// no-op transform.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_system(&self) -> &'static str;

    /// Ensure the adapter can talk to its source (e.g. a usable token).
    async fn authenticate(&self) -> Result<()>;

    fn list_resources(&self) -> Vec<&'static str>;

    fn fetch<'a>(
        &'a self,
        resource: &'a str,
        since: Option<&'a str>,
        until: Option<&'a str>,
    ) -> RecordStream<'a>;

    fn load_raw(&self, resource: &str, record: &Value) -> Result<()>;

    fn transform_and_load(&self, _resource: &str, _record: &Value) -> Result<()> {
        Ok(())
    }
}

/// Run one ingestion pass over the given resources.
///
/// Resources are processed in order; an error inside one resource stops
/// that resource and is recorded on its result, but the remaining
/// resources still run.
pub async fn ingest(
    adapter: &dyn SourceAdapter,
    resources: &[&str],
    since: Option<&str>,
    until: Option<&str>,
    canonical: bool,
) -> Vec<IngestResult> {
    let mut results = Vec::with_capacity(resources.len());

    for &resource in resources {
        let started_at = Utc::now();
        let mut fetched = 0u64;
        let mut loaded = 0u64;
        let mut error: Option<IngestError> = None;

        let mut stream = adapter.fetch(resource, since, until);
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => {
                    fetched += 1;
                    if let Err(e) = adapter.load_raw(resource, &record) {
                        error = Some(e);
                        break;
                    }
                    loaded += 1;
                    if canonical {
                        if let Err(e) = adapter.transform_and_load(resource, &record) {
                            error = Some(e);
                            break;
                        }
                    }
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        drop(stream);

        let status = if error.is_some() {
            tracing::warn!(
                source = adapter.source_system(),
                resource,
                error = %error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "resource ingestion stopped on error"
            );
            IngestStatus::Error
        } else {
            tracing::info!(
                source = adapter.source_system(),
                resource,
                fetched,
                loaded,
                "resource ingested"
            );
            IngestStatus::Success
        };

        results.push(IngestResult {
            resource: resource.to_string(),
            records_fetched: fetched,
            records_loaded: loaded,
            started_at,
            finished_at: Utc::now(),
            status,
            error: error.map(|e| e.to_string()),
        });
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted adapter: per-resource record sequences, optional failure
    /// points for load_raw and transform_and_load.
    struct MockAdapter {
        records: Vec<(&'static str, Vec<Result<Value>>)>,
        fail_load_on: Option<&'static str>,
        fail_transform_on: Option<&'static str>,
        loads: Mutex<Vec<String>>,
        transforms: Mutex<Vec<String>>,
    }

    impl MockAdapter {
        fn new(records: Vec<(&'static str, Vec<Result<Value>>)>) -> Self {
            Self {
                records,
                fail_load_on: None,
                fail_transform_on: None,
                loads: Mutex::new(Vec::new()),
                transforms: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for MockAdapter {
        fn source_system(&self) -> &'static str {
            "mock"
        }

        async fn authenticate(&self) -> Result<()> {
            Ok(())
        }

        fn list_resources(&self) -> Vec<&'static str> {
            self.records.iter().map(|(r, _)| *r).collect()
        }

        fn fetch<'a>(
            &'a self,
            resource: &'a str,
            _since: Option<&'a str>,
            _until: Option<&'a str>,
        ) -> RecordStream<'a> {
            let items: Vec<Result<Value>> = self
                .records
                .iter()
                .find(|(r, _)| *r == resource)
                .map(|(_, items)| {
                    items
                        .iter()
                        .map(|i| match i {
                            Ok(v) => Ok(v.clone()),
                            Err(e) => Err(IngestError::Auth(e.to_string())),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Box::pin(futures::stream::iter(items))
        }

        fn load_raw(&self, resource: &str, record: &Value) -> Result<()> {
            if self.fail_load_on == Some(resource) {
                return Err(IngestError::Other(anyhow!("load failed")));
            }
            self.loads
                .lock()
                .unwrap()
                .push(format!("{resource}:{record}"));
            Ok(())
        }

        fn transform_and_load(&self, resource: &str, record: &Value) -> Result<()> {
            if self.fail_transform_on == Some(resource) {
                return Err(IngestError::Other(anyhow!("transform failed")));
            }
            self.transforms
                .lock()
                .unwrap()
                .push(format!("{resource}:{record}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn counts_fetched_and_loaded() {
        let adapter = MockAdapter::new(vec![(
            "sleeps",
            vec![Ok(json!({"id": 1})), Ok(json!({"id": 2}))],
        )]);

        let results = ingest(&adapter, &["sleeps"], None, None, false).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].records_fetched, 2);
        assert_eq!(results[0].records_loaded, 2);
        assert_eq!(results[0].status, IngestStatus::Success);
        assert!(results[0].error.is_none());
        assert!(adapter.transforms.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_resource_does_not_stop_siblings() {
        let adapter = MockAdapter {
            fail_load_on: Some("cycles"),
            ..MockAdapter::new(vec![
                ("cycles", vec![Ok(json!({"id": 1}))]),
                ("sleeps", vec![Ok(json!({"id": 2}))]),
            ])
        };

        let results = ingest(&adapter, &["cycles", "sleeps"], None, None, false).await;
        assert_eq!(results[0].status, IngestStatus::Error);
        assert!(results[0].error.as_deref().unwrap().contains("load failed"));
        assert_eq!(results[1].status, IngestStatus::Success);
        assert_eq!(results[1].records_loaded, 1);
    }

    #[tokio::test]
    async fn fetch_error_truncates_resource() {
        let adapter = MockAdapter::new(vec![(
            "workouts",
            vec![
                Ok(json!({"id": 1})),
                Err(IngestError::Auth("boom".into())),
                Ok(json!({"id": 3})),
            ],
        )]);

        let results = ingest(&adapter, &["workouts"], None, None, false).await;
        assert_eq!(results[0].records_fetched, 1);
        assert_eq!(results[0].records_loaded, 1);
        assert_eq!(results[0].status, IngestStatus::Error);
    }

    #[tokio::test]
    async fn transform_failure_counts_record_as_loaded() {
        let adapter = MockAdapter {
            fail_transform_on: Some("sleeps"),
            ..MockAdapter::new(vec![("sleeps", vec![Ok(json!({"id": 1}))])])
        };

        let results = ingest(&adapter, &["sleeps"], None, None, true).await;
        assert_eq!(results[0].records_fetched, 1);
        assert_eq!(results[0].records_loaded, 1, "raw write preceded the failure");
        assert_eq!(results[0].status, IngestStatus::Error);
    }
}
