//! WHOOP source adapter: OAuth-protected polled API.

pub mod api;
pub mod auth;

use anyhow::anyhow;
use async_stream::try_stream;
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::source::{RecordStream, SourceAdapter};
use crate::store::HealthStore;
use crate::unified;
use api::WhoopClient;
use auth::TokenManager;
use async_trait::async_trait;

pub const SOURCE_SYSTEM: &str = "whoop";

pub const RESOURCES: &[&str] = &["profile", "body", "cycles", "sleeps", "recoveries", "workouts"];

/// Resources whose records carry their own event time; these are the ones
/// a daily refresh re-ingests.
pub const ACTIVITY_RESOURCES: &[&str] = &["cycles", "sleeps", "recoveries", "workouts"];

fn endpoint(resource: &str) -> Option<(&'static str, bool)> {
    // (path, paginated)
    match resource {
        "profile" => Some(("/v2/user/profile/basic", false)),
        "body" => Some(("/v2/user/measurement/body", false)),
        "cycles" => Some(("/v2/cycle", true)),
        "sleeps" => Some(("/v2/activity/sleep", true)),
        "recoveries" => Some(("/v2/recovery", true)),
        "workouts" => Some(("/v2/activity/workout", true)),
        _ => None,
    }
}

pub struct WhoopAdapter {
    client: WhoopClient,
    tokens: Arc<TokenManager>,
    store: HealthStore,
    page_size: u32,
}

impl WhoopAdapter {
    pub fn new(
        client: WhoopClient,
        tokens: Arc<TokenManager>,
        store: HealthStore,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            tokens,
            store,
            page_size,
        }
    }

    /// Natural key of a record within its resource. Recoveries are keyed
    /// by their cycle; profile by the user; body measurement is a
    /// singleton per user.
    fn natural_key(resource: &str, record: &Value) -> Option<String> {
        match resource {
            "cycles" | "sleeps" | "workouts" => unified::key_string(record.get("id")?),
            "recoveries" => unified::key_string(record.get("cycle_id")?),
            "profile" => unified::key_string(record.get("user_id")?),
            "body" => Some("body".to_string()),
            _ => None,
        }
    }

    fn record_start(record: &Value) -> Option<String> {
        record
            .get("start")
            .or_else(|| record.get("created_at"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl SourceAdapter for WhoopAdapter {
    fn source_system(&self) -> &'static str {
        SOURCE_SYSTEM
    }

    async fn authenticate(&self) -> Result<()> {
        self.tokens.get_access_token().await?;
        Ok(())
    }

    fn list_resources(&self) -> Vec<&'static str> {
        RESOURCES.to_vec()
    }

    fn fetch<'a>(
        &'a self,
        resource: &'a str,
        since: Option<&'a str>,
        until: Option<&'a str>,
    ) -> RecordStream<'a> {
        let Some((path, paginated)) = endpoint(resource) else {
            let err = crate::error::IngestError::Other(anyhow!("unknown whoop resource: {resource}"));
            return Box::pin(futures::stream::once(async move { Err(err) }));
        };

        if paginated {
            self.client.fetch_paginated(
                path,
                since.map(str::to_string),
                until.map(str::to_string),
                self.page_size,
            )
        } else {
            Box::pin(try_stream! {
                let record = self.client.get(path).await?;
                yield record;
            })
        }
    }

    fn load_raw(&self, resource: &str, record: &Value) -> Result<()> {
        let key = Self::natural_key(resource, record)
            .ok_or_else(|| anyhow!("{resource} record has no natural key: {record}"))?;
        let user_id = record.get("user_id").and_then(unified::key_string);
        self.store.upsert_raw(
            SOURCE_SYSTEM,
            resource,
            &key,
            user_id.as_deref(),
            Self::record_start(record).as_deref(),
            record,
        )?;
        Ok(())
    }

    fn transform_and_load(&self, resource: &str, record: &Value) -> Result<()> {
        unified::transform_record(&self.store, resource, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn natural_keys_per_resource() {
        assert_eq!(
            WhoopAdapter::natural_key("sleeps", &json!({"id": "uuid-1"})),
            Some("uuid-1".to_string())
        );
        assert_eq!(
            WhoopAdapter::natural_key("cycles", &json!({"id": 93845})),
            Some("93845".to_string())
        );
        assert_eq!(
            WhoopAdapter::natural_key("recoveries", &json!({"cycle_id": 93845, "score": {}})),
            Some("93845".to_string())
        );
        assert_eq!(
            WhoopAdapter::natural_key("profile", &json!({"user_id": 10129})),
            Some("10129".to_string())
        );
        assert_eq!(
            WhoopAdapter::natural_key("body", &json!({"height_meter": 1.8})),
            Some("body".to_string())
        );
        assert_eq!(WhoopAdapter::natural_key("sleeps", &json!({"no_id": 1})), None);
    }

    #[test]
    fn record_start_prefers_event_start() {
        assert_eq!(
            WhoopAdapter::record_start(&json!({
                "start": "2024-01-01T00:00:00Z",
                "created_at": "2024-01-02T00:00:00Z"
            })),
            Some("2024-01-01T00:00:00Z".to_string())
        );
        assert_eq!(
            WhoopAdapter::record_start(&json!({"created_at": "2024-01-02T00:00:00Z"})),
            Some("2024-01-02T00:00:00Z".to_string())
        );
        assert_eq!(WhoopAdapter::record_start(&json!({})), None);
    }
}
