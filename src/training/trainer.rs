// 该文件是 Jianshi （监视） 项目的一部分。
// src/training/trainer.rs - 训练执行
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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, TimeDelta};
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{error, info, warn};

use super::notify::{Notifier, notify_logged};
use super::tracking::{ExperimentTracker, RunStatus, TrackedRun};

pub const START_SUBJECT: &str = "YOLO Training Started";
pub const COMPLETE_SUBJECT: &str = "YOLO Training Completed";
pub const ERROR_SUBJECT: &str = "YOLO Training Error";

const STDERR_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum TrainingError {
  #[error("无法启动训练程序 {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },
  #[error("训练程序退出失败 ({status}): {stderr}")]
  Failed { status: String, stderr: String },
  #[error("训练结果中没有权重文件: {0}")]
  MissingWeights(PathBuf),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 训练超参数
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingParams {
  pub model_path: PathBuf,
  pub dataset_path: PathBuf,
  pub epochs: u32,
  pub batch_size: u32,
  pub image_size: u32,
  pub patience: u32,
  pub save_period: u32,
}

impl TrainingParams {
  pub fn new(model_path: impl Into<PathBuf>, dataset_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      dataset_path: dataset_path.into(),
      epochs: 50,
      batch_size: 16,
      image_size: 640,
      patience: 10,
      save_period: 5,
    }
  }

  /// 写入实验记录的参数
  pub fn tracked(&self) -> Vec<(&'static str, String)> {
    vec![
      ("model_path", self.model_path.display().to_string()),
      ("dataset", self.dataset_path.display().to_string()),
      ("epochs", self.epochs.to_string()),
      ("batch_size", self.batch_size.to_string()),
      ("image_size", self.image_size.to_string()),
    ]
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainingMetrics {
  pub map50: f64,
  pub map50_95: f64,
  pub precision: f64,
  pub recall: f64,
}

impl TrainingMetrics {
  pub fn pairs(&self) -> [(&'static str, f64); 4] {
    [
      ("mAP50", self.map50),
      ("mAP50-95", self.map50_95),
      ("precision", self.precision),
      ("recall", self.recall),
    ]
  }
}

/// 取 `results.csv` 最后一行的指标，缺失的列记为 0
pub fn parse_results_csv(text: &str) -> TrainingMetrics {
  let mut lines = text.lines().filter(|line| !line.trim().is_empty());
  let Some(header) = lines.next() else {
    return TrainingMetrics::default();
  };
  let Some(last) = lines.last() else {
    return TrainingMetrics::default();
  };

  let columns: Vec<&str> = header.split(',').map(str::trim).collect();
  let values: Vec<&str> = last.split(',').map(str::trim).collect();
  // 列名形如 `metrics/mAP50(B)`
  let metric = |name: &str| -> f64 {
    columns
      .iter()
      .position(|col| {
        *col == name
          || col
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with('('))
      })
      .and_then(|idx| values.get(idx))
      .and_then(|value| value.parse().ok())
      .unwrap_or(0.0)
  };

  TrainingMetrics {
    map50: metric("metrics/mAP50"),
    map50_95: metric("metrics/mAP50-95"),
    precision: metric("metrics/precision"),
    recall: metric("metrics/recall"),
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutput {
  pub weights: PathBuf,
  pub metrics: TrainingMetrics,
}

/// 执行一次训练
pub trait TrainingBackend: Send + Sync {
  fn train<'a>(
    &'a self,
    params: &'a TrainingParams,
    run_id: &'a str,
  ) -> BoxFuture<'a, Result<TrainingOutput, TrainingError>>;
}

/// 调用 Ultralytics `yolo` 命令行训练
#[derive(Debug, Clone)]
pub struct YoloCli {
  program: String,
  runs_dir: PathBuf,
}

impl YoloCli {
  pub fn new(program: impl Into<String>, runs_dir: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      runs_dir: runs_dir.into(),
    }
  }

  pub fn arguments(&self, params: &TrainingParams, run_id: &str) -> Vec<String> {
    vec![
      "detect".to_string(),
      "train".to_string(),
      format!("model={}", params.model_path.display()),
      format!("data={}", params.dataset_path.display()),
      format!("epochs={}", params.epochs),
      format!("batch={}", params.batch_size),
      format!("imgsz={}", params.image_size),
      format!("patience={}", params.patience),
      format!("save_period={}", params.save_period),
      format!("project={}", self.runs_dir.display()),
      format!("name={run_id}"),
      "exist_ok=True".to_string(),
    ]
  }

  async fn collect(&self, run_dir: &Path) -> Result<TrainingOutput, TrainingError> {
    let metrics = match tokio::fs::read_to_string(run_dir.join("results.csv")).await {
      Ok(text) => parse_results_csv(&text),
      Err(e) => {
        warn!("无法读取训练指标: {}", e);
        TrainingMetrics::default()
      }
    };

    let weights_dir = run_dir.join("weights");
    for name in ["best.pt", "last.pt"] {
      let candidate = weights_dir.join(name);
      if tokio::fs::try_exists(&candidate).await? {
        return Ok(TrainingOutput {
          weights: candidate,
          metrics,
        });
      }
    }
    Err(TrainingError::MissingWeights(weights_dir))
  }
}

impl TrainingBackend for YoloCli {
  fn train<'a>(
    &'a self,
    params: &'a TrainingParams,
    run_id: &'a str,
  ) -> BoxFuture<'a, Result<TrainingOutput, TrainingError>> {
    Box::pin(async move {
      let args = self.arguments(params, run_id);
      info!("执行训练命令: {} {}", self.program, args.join(" "));
      let output = tokio::process::Command::new(&self.program)
        .args(&args)
        .output()
        .await
        .map_err(|source| TrainingError::Spawn {
          program: self.program.clone(),
          source,
        })?;

      if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        return Err(TrainingError::Failed {
          status: output.status.to_string(),
          stderr: tail,
        });
      }

      self.collect(&self.runs_dir.join(run_id)).await
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
  pub run_id: String,
  pub start_time: DateTime<Local>,
  pub end_time: DateTime<Local>,
  pub metrics: TrainingMetrics,
  pub saved_model: PathBuf,
}

impl RunReport {
  pub fn completion_body(&self) -> String {
    let m = &self.metrics;
    format!(
      "Training completed:\n\
       - Start time: {}\n\
       - End time: {}\n\
       - Duration: {}\n\
       - Metrics:\n  \
       * mAP50: {}\n  \
       * mAP50-95: {}\n  \
       * Precision: {}\n  \
       * Recall: {}\n\
       Model saved to: {}\n",
      self.start_time.format("%Y-%m-%d %H:%M:%S"),
      self.end_time.format("%Y-%m-%d %H:%M:%S"),
      format_duration(self.end_time - self.start_time),
      m.map50,
      m.map50_95,
      m.precision,
      m.recall,
      self.saved_model.display()
    )
  }
}

fn format_duration(delta: TimeDelta) -> String {
  let secs = delta.num_seconds().max(0);
  format!("{}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

/// 一次完整的训练：通知、记录、保存权重
pub struct TrainingRunner {
  backend: Arc<dyn TrainingBackend>,
  notifier: Arc<dyn Notifier>,
  tracker: ExperimentTracker,
  params: TrainingParams,
  model_save_dir: PathBuf,
}

impl TrainingRunner {
  pub fn new(
    backend: Arc<dyn TrainingBackend>,
    notifier: Arc<dyn Notifier>,
    tracker: ExperimentTracker,
    params: TrainingParams,
    model_save_dir: impl Into<PathBuf>,
  ) -> Self {
    Self {
      backend,
      notifier,
      tracker,
      params,
      model_save_dir: model_save_dir.into(),
    }
  }

  /// 错误已记录并通过邮件报告，调用方只需决定是否继续
  pub async fn run_once(&self) -> Result<RunReport, TrainingError> {
    let start = Local::now();
    let run_id = start.format("run_%Y%m%d_%H%M%S").to_string();
    info!("开始训练: {}", run_id);
    notify_logged(
      &*self.notifier,
      START_SUBJECT,
      &format!("Training started at {}", start.format("%Y-%m-%d %H:%M:%S")),
    )
    .await;

    let mut run = match self.tracker.start_run(&run_id).await {
      Ok(run) => Some(run),
      Err(e) => {
        warn!("无法创建实验记录: {}", e);
        None
      }
    };
    if let Some(run) = run.as_mut() {
      tracked("参数", run.log_params(self.params.tracked()).await);
    }

    match self.train(&run_id, start, run.as_mut()).await {
      Ok(report) => {
        if let Some(run) = run.as_mut() {
          tracked("状态", run.finish(RunStatus::Finished).await);
        }
        info!("训练完成: {}", report.saved_model.display());
        notify_logged(&*self.notifier, COMPLETE_SUBJECT, &report.completion_body()).await;
        Ok(report)
      }
      Err(e) => {
        error!("训练失败: {}", e);
        if let Some(run) = run.as_mut() {
          tracked("状态", run.finish(RunStatus::Failed).await);
        }
        notify_logged(
          &*self.notifier,
          ERROR_SUBJECT,
          &format!("Error during training: {e}"),
        )
        .await;
        Err(e)
      }
    }
  }

  async fn train(
    &self,
    run_id: &str,
    start: DateTime<Local>,
    run: Option<&mut TrackedRun>,
  ) -> Result<RunReport, TrainingError> {
    let output = self.backend.train(&self.params, run_id).await?;
    let end = Local::now();

    tokio::fs::create_dir_all(&self.model_save_dir).await?;
    let saved_model = self
      .model_save_dir
      .join(end.format("yolo_model_%Y%m%d_%H%M%S.pt").to_string());
    tokio::fs::copy(&output.weights, &saved_model).await?;

    if let Some(run) = run {
      tracked("指标", run.log_metrics(output.metrics.pairs()).await);
      tracked(
        "模型",
        run.log_artifact(&saved_model, "trained_models").await.map(|_| ()),
      );
    }

    Ok(RunReport {
      run_id: run_id.to_string(),
      start_time: start,
      end_time: end,
      metrics: output.metrics,
      saved_model,
    })
  }
}

/// 实验记录失败不影响训练
fn tracked<E: std::fmt::Display>(what: &str, result: Result<(), E>) {
  if let Err(e) = result {
    warn!("实验记录{}写入失败: {}", what, e);
  }
}
