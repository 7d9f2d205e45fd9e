//! Schedule store.
//!
//! Persisted schedule records live behind a small trait so the HTTP layer
//! and Scheduler don't depend on a particular storage backend. This module
//! supplies one concrete implementation — a JSON file on disk, serialized
//! as a flat array — so the crate runs end to end.

use crate::config::Viewport;
use crate::error::EngineError;
use crate::request::{CropRegion, DitheringOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A persisted schedule record. Fields mirror Screenshot Request where
/// applicable.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub cron: String,
    pub dashboard_path: String,
    pub viewport: Option<Viewport>,
    pub zoom: Option<f64>,
    pub format: Option<String>,
    pub dark: Option<bool>,
    pub lang: Option<String>,
    pub theme: Option<String>,
    pub invert: Option<bool>,
    pub rotate: Option<i64>,
    pub crop: Option<ScheduleCrop>,
    pub dithering: Option<ScheduleDithering>,
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: HashMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Mirrors `CropRegion` but carries its own `enabled` flag, since a
/// schedule's crop only propagates into the built request when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ScheduleCrop {
    pub enabled: bool,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<ScheduleCrop> for CropRegion {
    fn from(c: ScheduleCrop) -> Self {
        CropRegion { x: c.x, y: c.y, width: c.width, height: c.height }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScheduleDithering {
    pub enabled: bool,
    #[serde(flatten)]
    pub options: DitheringOptions,
}

/// Fields a caller may patch via `PUT /api/schedules/{id}`. `None` means
/// "leave unchanged".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleCreate {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub cron: String,
    pub dashboard_path: String,
    pub viewport: Option<Viewport>,
    pub zoom: Option<f64>,
    pub format: Option<String>,
    pub dark: Option<bool>,
    pub lang: Option<String>,
    pub theme: Option<String>,
    pub invert: Option<bool>,
    pub rotate: Option<i64>,
    pub crop: Option<ScheduleCrop>,
    pub dithering: Option<ScheduleDithering>,
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

pub type SchedulePatch = serde_json::Value;

/// Contract consumed by the Scheduler and the HTTP layer. The default impl
/// below (a JSON file on disk) is one valid realization; any storage
/// backend implementing this trait can stand in for it.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Schedule>, EngineError>;
    async fn get(&self, id: &str) -> Result<Option<Schedule>, EngineError>;
    async fn create(&self, record: ScheduleCreate) -> Result<Schedule, EngineError>;
    async fn update(&self, id: &str, patch: SchedulePatch) -> Result<Option<Schedule>, EngineError>;
    async fn delete(&self, id: &str) -> Result<bool, EngineError>;
}

/// JSON-file-backed store. All mutations go through a single in-process
/// `RwLock` and are flushed to disk synchronously; there is no
/// cross-process coordination, so only one engine instance should point at
/// a given file at a time.
pub struct JsonFileScheduleStore {
    path: PathBuf,
    records: RwLock<Vec<Schedule>>,
}

impl JsonFileScheduleStore {
    pub async fn open(path: PathBuf) -> Result<Arc<Self>, EngineError> {
        let records = if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Vec::new()
        };
        Ok(Arc::new(Self { path, records: RwLock::new(records) }))
    }

    async fn flush(&self, records: &[Schedule]) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(records)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    fn now_iso() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

#[async_trait]
impl ScheduleStore for JsonFileScheduleStore {
    async fn list(&self) -> Result<Vec<Schedule>, EngineError> {
        Ok(self.records.read().await.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Schedule>, EngineError> {
        Ok(self.records.read().await.iter().find(|s| s.id == id).cloned())
    }

    async fn create(&self, record: ScheduleCreate) -> Result<Schedule, EngineError> {
        let now = Self::now_iso();
        let schedule = Schedule {
            id: uuid::Uuid::new_v4().to_string(),
            name: record.name,
            enabled: record.enabled,
            cron: record.cron,
            dashboard_path: record.dashboard_path,
            viewport: record.viewport,
            zoom: record.zoom,
            format: record.format,
            dark: record.dark,
            lang: record.lang,
            theme: record.theme,
            invert: record.invert,
            rotate: record.rotate,
            crop: record.crop,
            dithering: record.dithering,
            webhook_url: record.webhook_url,
            webhook_headers: record.webhook_headers,
            created_at: now.clone(),
            updated_at: now,
        };

        let mut records = self.records.write().await;
        records.push(schedule.clone());
        self.flush(&records).await?;
        Ok(schedule)
    }

    async fn update(&self, id: &str, patch: SchedulePatch) -> Result<Option<Schedule>, EngineError> {
        let mut records = self.records.write().await;
        let Some(existing) = records.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };

        let mut value = serde_json::to_value(&*existing)?;
        if let (Some(target), Some(patch_obj)) = (value.as_object_mut(), patch.as_object()) {
            for (key, val) in patch_obj {
                target.insert(key.clone(), val.clone());
            }
        }
        let mut merged: Schedule = serde_json::from_value(value)?;
        merged.updated_at = Self::now_iso();
        *existing = merged.clone();

        self.flush(&records).await?;
        Ok(Some(merged))
    }

    async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|s| s.id != id);
        let removed = records.len() != before;
        if removed {
            self.flush(&records).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ScheduleCreate {
        ScheduleCreate {
            name: "s1".into(),
            enabled: true,
            cron: "* * * * *".into(),
            dashboard_path: "/lovelace/0".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileScheduleStore::open(dir.path().join("schedules.json")).await.unwrap();
        let created = store.create(sample()).await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created.id);
    }

    #[tokio::test]
    async fn update_merges_patch_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileScheduleStore::open(dir.path().join("schedules.json")).await.unwrap();
        let created = store.create(sample()).await.unwrap();

        let patch = serde_json::json!({ "enabled": false });
        let updated = store.update(&created.id, patch).await.unwrap().unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.name, "s1");
    }

    #[tokio::test]
    async fn delete_removes_and_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileScheduleStore::open(dir.path().join("schedules.json")).await.unwrap();
        let created = store.create(sample()).await.unwrap();
        assert!(store.delete(&created.id).await.unwrap());
        assert!(!store.delete(&created.id).await.unwrap());
        assert!(store.get(&created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reopen_reloads_persisted_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        {
            let store = JsonFileScheduleStore::open(path.clone()).await.unwrap();
            store.create(sample()).await.unwrap();
        }
        let reopened = JsonFileScheduleStore::open(path).await.unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }
}
