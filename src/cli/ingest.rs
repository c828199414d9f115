//! Ingestion and auth commands.

use anyhow::{bail, Result};
use chrono::{Days, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::source::quest::QuestAdapter;
use crate::source::whoop::api::{RetryPolicy, WhoopClient};
use crate::source::whoop::auth::TokenManager;
use crate::source::whoop::{WhoopAdapter, ACTIVITY_RESOURCES, RESOURCES, SOURCE_SYSTEM};
use crate::source::{ingest, IngestResult, IngestStatus, SourceAdapter};
use crate::store::HealthStore;

#[derive(Debug, Clone, Default)]
pub struct WhoopArgs {
    pub resources: Vec<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub canonical: bool,
    pub daily_refresh: bool,
}

#[derive(Debug, Clone)]
pub struct QuestArgs {
    pub path: Option<PathBuf>,
    pub patient_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub canonical: bool,
}

fn build_whoop(config: &Config, store: &HealthStore) -> (Arc<TokenManager>, WhoopAdapter) {
    let tokens = Arc::new(TokenManager::new(
        store.clone(),
        config.whoop.oauth_settings(),
        SOURCE_SYSTEM,
    ));
    let client = WhoopClient::new(
        config.whoop.api_base_url.clone(),
        tokens.clone(),
        RetryPolicy::default(),
    );
    let adapter = WhoopAdapter::new(client, tokens.clone(), store.clone(), config.whoop.page_size);
    (tokens, adapter)
}

fn report(results: &[IngestResult]) {
    for result in results {
        println!(
            "{}: fetched={} stored={} status={}",
            result.resource,
            result.records_fetched,
            result.records_loaded,
            result.status.as_str()
        );
        if let Some(error) = &result.error {
            eprintln!("  Error: {error}");
        }
    }
}

/// Run the interactive authorization flow and persist the credential.
pub async fn run_whoop_auth(config: &Config) -> Result<()> {
    let store = HealthStore::open(&config.database_path())?;
    let (tokens, _) = build_whoop(config, &store);
    tokens.get_access_token().await?;
    println!("whoop: authorized");
    Ok(())
}

pub async fn run_whoop_ingest(config: &Config, args: WhoopArgs) -> Result<()> {
    let store = HealthStore::open(&config.database_path())?;
    let (_, adapter) = build_whoop(config, &store);

    let mut resources: Vec<&str> = if args.resources.is_empty() {
        if args.daily_refresh {
            ACTIVITY_RESOURCES.to_vec()
        } else {
            RESOURCES.to_vec()
        }
    } else {
        args.resources.iter().map(String::as_str).collect()
    };
    for resource in &resources {
        if !RESOURCES.contains(resource) {
            bail!("unknown whoop resource: {resource} (expected one of {RESOURCES:?})");
        }
    }

    let (mut since, mut until) = (args.since.clone(), args.until.clone());
    if args.daily_refresh {
        // Re-ingest yesterday (UTC) from scratch.
        let today = Utc::now().date_naive();
        let yesterday = today
            .checked_sub_days(Days::new(1))
            .unwrap_or(today);
        let start = format!("{yesterday}T00:00:00Z");
        let end = format!("{today}T00:00:00Z");

        resources.retain(|r| ACTIVITY_RESOURCES.contains(r));
        let deleted = store.delete_raw_in_window(SOURCE_SYSTEM, &resources, &start, &end)?;
        println!("daily refresh: window {start}..{end}, {deleted} raw rows cleared");
        since = Some(start);
        until = Some(end);
    }

    adapter.authenticate().await?;
    let results = ingest(
        &adapter,
        &resources,
        since.as_deref(),
        until.as_deref(),
        args.canonical,
    )
    .await;
    report(&results);

    if results.iter().any(|r| r.status == IngestStatus::Error) {
        bail!("one or more resources failed");
    }
    Ok(())
}

pub async fn run_quest_ingest(config: &Config, args: QuestArgs) -> Result<()> {
    let store = HealthStore::open(&config.database_path())?;

    let path = args
        .path
        .or_else(|| config.quest.path.as_ref().map(|p| {
            PathBuf::from(shellexpand::tilde(p).into_owned())
        }));
    let Some(path) = path else {
        bail!("no quest path given (pass --path or set quest.path in the config)");
    };
    let patient_id = args.patient_id.or_else(|| config.quest.patient_id.clone());

    let adapter = QuestAdapter::new(store, path, patient_id);
    let resources = adapter.list_resources();
    let results = ingest(
        &adapter,
        &resources,
        args.since.as_deref(),
        args.until.as_deref(),
        args.canonical,
    )
    .await;
    report(&results);

    if results.iter().any(|r| r.status == IngestStatus::Error) {
        bail!("one or more resources failed");
    }
    Ok(())
}
