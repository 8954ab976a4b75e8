// 该文件是 Jianshi （监视） 项目的一部分。
// src/training/tracking.rs - 基于文件的实验记录
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 目录结构：`<tracking_dir>/<experiment>/<run_id>/`
//! 下有 `meta.json`、`params.json`、`metrics.json` 和 `artifacts/`。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use super::notify::NotificationError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
  Running,
  Finished,
  Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunMeta {
  pub run_id: String,
  pub experiment: String,
  pub status: RunStatus,
  pub start_time: DateTime<Local>,
  pub end_time: Option<DateTime<Local>>,
}

#[derive(Debug, Clone)]
pub struct ExperimentTracker {
  root: PathBuf,
  experiment: String,
}

impl ExperimentTracker {
  pub fn new(tracking_dir: impl AsRef<Path>, experiment: impl Into<String>) -> Self {
    let experiment = experiment.into();
    Self {
      root: tracking_dir.as_ref().join(&experiment),
      experiment,
    }
  }

  pub fn experiment_dir(&self) -> &Path {
    &self.root
  }

  pub async fn start_run(&self, run_id: &str) -> Result<TrackedRun, NotificationError> {
    let dir = self.root.join(run_id);
    fs::create_dir_all(dir.join("artifacts")).await?;
    let run = TrackedRun {
      dir,
      meta: RunMeta {
        run_id: run_id.to_string(),
        experiment: self.experiment.clone(),
        status: RunStatus::Running,
        start_time: Local::now(),
        end_time: None,
      },
      params: BTreeMap::new(),
      metrics: BTreeMap::new(),
    };
    run.write_json("meta.json", &run.meta).await?;
    debug!("实验记录目录: {}", run.dir.display());
    Ok(run)
  }
}

#[derive(Debug)]
pub struct TrackedRun {
  dir: PathBuf,
  meta: RunMeta,
  params: BTreeMap<String, String>,
  metrics: BTreeMap<String, f64>,
}

impl TrackedRun {
  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub async fn log_params<I, K, V>(&mut self, params: I) -> Result<(), NotificationError>
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
  {
    for (key, value) in params {
      self.params.insert(key.into(), value.to_string());
    }
    self.write_json("params.json", &self.params).await
  }

  pub async fn log_metrics<I, K>(&mut self, metrics: I) -> Result<(), NotificationError>
  where
    I: IntoIterator<Item = (K, f64)>,
    K: Into<String>,
  {
    for (key, value) in metrics {
      self.metrics.insert(key.into(), value);
    }
    self.write_json("metrics.json", &self.metrics).await
  }

  /// 复制到 `artifacts/<subdir>/`，返回记录中的路径
  pub async fn log_artifact(&self, path: &Path, subdir: &str) -> Result<PathBuf, NotificationError> {
    let target_dir = self.dir.join("artifacts").join(subdir);
    fs::create_dir_all(&target_dir).await?;
    let file_name = path
      .file_name()
      .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "产物路径没有文件名"))?;
    let target = target_dir.join(file_name);
    fs::copy(path, &target).await?;
    Ok(target)
  }

  pub async fn finish(&mut self, status: RunStatus) -> Result<(), NotificationError> {
    self.meta.status = status;
    self.meta.end_time = Some(Local::now());
    self.write_json("meta.json", &self.meta).await
  }

  async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), NotificationError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(self.dir.join(name), json).await?;
    Ok(())
  }
}
