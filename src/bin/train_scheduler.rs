// 该文件是 Jianshi （监视） 项目的一部分。
// src/bin/train_scheduler.rs - YOLO 定时训练
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

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use jianshi::{
  args::TrainArgs,
  training::{
    EmailNotifier, ExperimentTracker, TrainingRunner, TrainingSchedule, TrainingScheduler, YoloCli,
    service::render_systemd_unit,
  },
};

/// 按计划重新训练 YOLO 模型，并通过邮件报告结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  #[command(flatten)]
  train: TrainArgs,

  /// 启动时立即训练一次
  #[arg(long)]
  run_now: bool,

  /// 输出 systemd 服务单元后退出
  #[arg(long)]
  print_systemd_unit: bool,
}

fn init_logging(log_dir: Option<&Path>) -> Result<()> {
  let file_layer = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .with_context(|| format!("无法创建日志目录: {}", dir.display()))?;
      let path = dir.join(
        Local::now()
          .format("training_log_%Y%m%d_%H%M%S.log")
          .to_string(),
      );
      let file =
        File::create(&path).with_context(|| format!("无法创建日志文件: {}", path.display()))?;
      Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
    }
    None => None,
  };

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(fmt::layer())
    .with(file_layer)
    .init();
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("无法监听停止信号: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到停止信号");
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  if args.print_systemd_unit {
    let exec = std::env::current_exe()?;
    let forwarded: Vec<String> = std::env::args()
      .skip(1)
      .filter(|arg| arg != "--print-systemd-unit" && arg != "--run-now")
      .collect();
    let user = std::env::var("USER").ok();
    let working_dir = std::env::current_dir()?;
    print!(
      "{}",
      render_systemd_unit(&exec, &forwarded, user.as_deref(), &working_dir)
    );
    return Ok(());
  }

  init_logging(args.train.log_dir.as_deref())?;

  let train = &args.train;
  let schedule = TrainingSchedule::from_config(&train.daily_time, &train.weekly_day, train.monthly_date)?;
  let notifier = Arc::new(EmailNotifier::new(&train.smtp()).context("邮件配置无效")?);
  let backend = Arc::new(YoloCli::new(train.trainer.clone(), train.runs_dir.clone()));
  let tracker = ExperimentTracker::new(&train.tracking_dir, train.experiment_name.clone());
  let runner = TrainingRunner::new(
    backend,
    notifier,
    tracker,
    train.params(),
    train.model_save_dir.clone(),
  );

  info!("模型: {}", train.model_path.display());
  info!("数据集: {}", train.dataset_path.display());
  info!(
    "训练计划: 每日 {}，每周 {}，每月 {} 日",
    train.daily_time, train.weekly_day, train.monthly_date
  );

  let scheduler = TrainingScheduler::new(schedule, runner, Local::now().naive_local());
  if args.run_now {
    // 失败已记录并通知，调度继续
    let _ = scheduler.run_now().await;
  }
  if let Some(next) = scheduler.next_run() {
    info!("下一次训练: {}", next);
  }
  scheduler.run(shutdown_signal()).await;
  Ok(())
}
