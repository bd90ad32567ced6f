//! Directory-backed sample source and result sink for running the worker
//! against files on disk.
//!
//! Samples are read from `<root>/<group>/<analysis_minute>.json` (a
//! [`WindowSamples`] document); reports are written to
//! `<root>/<group>/<analysis_minute>-<task_id>.json`.

use super::runner::{ResultSink, SampleSource};
use super::types::AnalysisTask;
use crate::services::metrics::{BucketWindow, VerificationRiskReport, WindowSamples};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

fn group_dir(root: &Path, group_key: &str) -> PathBuf {
    let safe: String = group_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    let safe = safe.trim_start_matches('.');
    root.join(if safe.is_empty() { "_" } else { safe })
}

#[derive(Debug, Clone)]
pub struct DirectorySampleSource {
    root: PathBuf,
}

impl DirectorySampleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn window_path(&self, group_key: &str, analysis_minute: i64) -> PathBuf {
        group_dir(&self.root, group_key).join(format!("{analysis_minute}.json"))
    }
}

#[async_trait]
impl SampleSource for DirectorySampleSource {
    async fn fetch(&self, task: &AnalysisTask, window: BucketWindow) -> Result<WindowSamples> {
        let path = self.window_path(&task.group_key, window.start_minute);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read samples at {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse samples at {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryResultSink {
    root: PathBuf,
}

impl DirectoryResultSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn report_path(&self, task: &AnalysisTask) -> PathBuf {
        group_dir(&self.root, &task.group_key)
            .join(format!("{}-{}.json", task.analysis_minute, task.id))
    }
}

#[async_trait]
impl ResultSink for DirectoryResultSink {
    async fn save(&self, task: &AnalysisTask, report: &VerificationRiskReport) -> Result<()> {
        let path = self.report_path(task);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create report directory {}", parent.display()))?;
        }
        let payload = serde_json::to_vec_pretty(report).context("failed to serialize report")?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, payload)
            .await
            .with_context(|| format!("failed to write report temp file {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("failed to replace report file {}", path.display()))?;
        Ok(())
    }
}
