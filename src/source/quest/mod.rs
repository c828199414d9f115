//! Quest lab-report source adapter.
//!
//! Reads exported FHIR resources from local files instead of polling an
//! API: plain or line-delimited JSON is parsed directly, PDFs are handed
//! to a pluggable extractor.

use anyhow::{anyhow, Context};
use async_stream::stream;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};
use crate::source::{RecordStream, SourceAdapter};
use crate::store::HealthStore;
use crate::unified;

pub const SOURCE_SYSTEM: &str = "quest";

pub const RESOURCES: &[&str] = &["patient", "observations"];

/// Turns a PDF lab report into FHIR Observation values. Extraction itself
/// lives outside this crate; callers inject an implementation.
pub trait LabReportExtractor: Send + Sync {
    fn extract(&self, data: &[u8], filename: &str) -> anyhow::Result<Vec<Value>>;
}

pub struct QuestAdapter {
    store: HealthStore,
    path: PathBuf,
    patient_id_override: Option<String>,
    extractor: Option<Box<dyn LabReportExtractor>>,
}

impl QuestAdapter {
    pub fn new(store: HealthStore, path: PathBuf, patient_id_override: Option<String>) -> Self {
        Self {
            store,
            path,
            patient_id_override,
            extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Box<dyn LabReportExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    fn input_files(&self) -> Result<Vec<PathBuf>> {
        if self.path.is_file() {
            return Ok(vec![self.path.clone()]);
        }
        if !self.path.is_dir() {
            return Err(IngestError::Other(anyhow!(
                "quest path does not exist: {}",
                self.path.display()
            )));
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("json") | Some("ndjson") | Some("pdf")
                )
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Parse one file into FHIR resources. JSON files may hold a single
    /// resource, an array, or NDJSON lines; PDFs need the extractor.
    fn parse_file(&self, path: &Path) -> Result<Vec<Value>> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext == "pdf" {
            let extractor = self.extractor.as_ref().ok_or_else(|| {
                anyhow!(
                    "no lab report extractor configured for {}",
                    path.display()
                )
            })?;
            let data = std::fs::read(path)?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("report.pdf");
            return Ok(extractor.extract(&data, filename)?);
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;

        // Whole-file JSON first; fall back to one resource per line.
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(value) => Ok(vec![value]),
            Err(_) => {
                let mut records = Vec::new();
                for (lineno, line) in text.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: Value = serde_json::from_str(line).with_context(|| {
                        format!("{} line {}", path.display(), lineno + 1)
                    })?;
                    records.push(value);
                }
                Ok(records)
            }
        }
    }

    fn wanted(resource: &str, record: &Value) -> bool {
        let rtype = record.get("resourceType").and_then(Value::as_str);
        match resource {
            "patient" => rtype == Some("Patient"),
            "observations" => rtype == Some("Observation"),
            _ => false,
        }
    }

    /// Client-side [since, until) filter on the observation's own time.
    /// Records without a timestamp always pass.
    fn in_window(record: &Value, since: Option<&str>, until: Option<&str>) -> bool {
        let ts = record
            .get("effectiveDateTime")
            .or_else(|| record.get("issued"))
            .and_then(Value::as_str);
        let Some(ts) = ts else { return true };
        if let Some(since) = since {
            if ts < since {
                return false;
            }
        }
        if let Some(until) = until {
            if ts >= until {
                return false;
            }
        }
        true
    }

}

/// Force the subject reference (and Patient id) to the configured patient.
fn apply_patient_override(record: &mut Value, patient_id: &str) {
    match record.get("resourceType").and_then(Value::as_str) {
        Some("Patient") => {
            record["id"] = Value::String(patient_id.to_string());
        }
        Some("Observation") => {
            record["subject"] =
                serde_json::json!({"reference": format!("Patient/{patient_id}")});
        }
        _ => {}
    }
}

#[async_trait]
impl SourceAdapter for QuestAdapter {
    fn source_system(&self) -> &'static str {
        SOURCE_SYSTEM
    }

    async fn authenticate(&self) -> Result<()> {
        // Local files, nothing to authenticate.
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
        // One file is read per poll step; records stream out as files parse.
        Box::pin(stream! {
            let files = match self.input_files() {
                Ok(files) => files,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for file in files {
                match self.parse_file(&file) {
                    Ok(records) => {
                        for mut record in records {
                            if !Self::wanted(resource, &record) {
                                continue;
                            }
                            if !Self::in_window(&record, since, until) {
                                continue;
                            }
                            if let Some(patient_id) = &self.patient_id_override {
                                apply_patient_override(&mut record, patient_id);
                            }
                            yield Ok(record);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    }

    fn load_raw(&self, resource: &str, record: &Value) -> Result<()> {
        let key = record
            .get("id")
            .and_then(unified::key_string)
            .ok_or_else(|| anyhow!("{resource} record has no id: {record}"))?;
        let user_id = match resource {
            "patient" => Some(key.clone()),
            _ => record
                .get("subject")
                .and_then(|s| s.get("reference"))
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("Patient/"))
                .map(str::to_string),
        };
        let record_start = record
            .get("effectiveDateTime")
            .or_else(|| record.get("issued"))
            .and_then(Value::as_str)
            .map(str::to_string);
        self.store.upsert_raw(
            SOURCE_SYSTEM,
            resource,
            &key,
            user_id.as_deref(),
            record_start.as_deref(),
            record,
        )?;
        Ok(())
    }

    fn transform_and_load(&self, resource: &str, record: &Value) -> Result<()> {
        match resource {
            "observations" => unified::transform_record(&self.store, "quest_observation", record),
            "patient" => unified::transform_record(&self.store, "quest_patient", record),
            _ => Ok(()),
        }
    }
}
