//! File-backed store standing in for the orchestrator's storage.
//!
//! Layout:
//! - `<root>/index.json`: job records and restore objects
//! - `<root>/<job id>/<item name>`: bytes of every streamed item

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::PathBuf;

use crate::checkpoint::RestoreObject;
use crate::job::Level;
use crate::utils::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: u32,
    pub level: Level,
    pub vm_name: String,
    /// Streamed item names, in backup order
    pub files: Vec<String>,
    pub bytes: u64,
    pub status: JobStatus,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogIndex {
    jobs: Vec<JobRecord>,
    restore_objects: Vec<RestoreObject>,
}

pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    /// Open (and create if needed) a catalog directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn load_index(&self) -> Result<CatalogIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(CatalogIndex::default());
        }
        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(CatalogIndex::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save_index(&self, index: &CatalogIndex) -> Result<()> {
        let json = serde_json::to_string_pretty(index)?;
        let tmp = self.root.join("index.json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.index_path())?;
        Ok(())
    }

    /// Where the bytes of item `fname` of `job_id` live
    pub fn item_path(&self, job_id: u32, fname: &str) -> PathBuf {
        self.root
            .join(job_id.to_string())
            .join(fname.trim_start_matches('/'))
    }

    pub fn create_item(&self, job_id: u32, fname: &str) -> Result<File> {
        let path = self.item_path(job_id, fname);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(File::create(path)?)
    }

    pub fn open_item(&self, job_id: u32, fname: &str) -> Result<File> {
        Ok(File::open(self.item_path(job_id, fname))?)
    }

    /// Record a finished job together with the restore objects it produced
    pub fn record_job(&self, record: JobRecord, objects: Vec<RestoreObject>) -> Result<()> {
        let mut index = self.load_index()?;
        index.jobs.retain(|j| j.job_id != record.job_id);
        index.restore_objects.retain(|o| o.job_id != record.job_id);
        index.jobs.push(record);
        index.jobs.sort_by_key(|j| j.job_id);
        index.restore_objects.extend(objects);
        self.save_index(&index)
    }

    pub fn jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.load_index()?.jobs)
    }

    pub fn job(&self, job_id: u32) -> Result<Option<JobRecord>> {
        Ok(self.jobs()?.into_iter().find(|j| j.job_id == job_id))
    }

    /// Completed jobs of `vm_name` from the last full backup up to `upto`
    /// (inclusive, latest job if `None`).
    pub fn chain(&self, vm_name: &str, upto: Option<u32>) -> Result<Vec<JobRecord>> {
        let candidates: Vec<JobRecord> = self
            .jobs()?
            .into_iter()
            .filter(|j| j.vm_name == vm_name && j.status == JobStatus::Completed)
            .filter(|j| upto.map_or(true, |limit| j.job_id <= limit))
            .collect();

        let start = candidates
            .iter()
            .rposition(|j| j.level == Level::Full)
            .unwrap_or(candidates.len());
        Ok(candidates[start..].to_vec())
    }

    /// Restore objects produced by the jobs of a chain, oldest first
    pub fn restore_objects_for(&self, chain: &[JobRecord]) -> Result<Vec<RestoreObject>> {
        let index = self.load_index()?;
        let mut objects: Vec<RestoreObject> = index
            .restore_objects
            .into_iter()
            .filter(|o| chain.iter().any(|j| j.job_id == o.job_id))
            .collect();
        objects.sort_by_key(|o| (o.job_id, o.index));
        Ok(objects)
    }
}
