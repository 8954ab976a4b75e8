// 该文件是 Jianshi （监视） 项目的一部分。
// src/training.rs - 定时训练
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

use std::future::Future;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tracing::{info, warn};

pub mod notify;
pub mod schedule;
pub mod service;
pub mod tracking;
pub mod trainer;

pub use self::notify::{EmailNotifier, NotificationError, Notifier, SmtpConfig};
pub use self::schedule::{Recurrence, ScheduleError, TrainingSchedule};
pub use self::tracking::{ExperimentTracker, RunStatus};
pub use self::trainer::{
  RunReport, TrainingBackend, TrainingError, TrainingMetrics, TrainingOutput, TrainingParams,
  TrainingRunner, YoloCli,
};

/// 单次休眠上限，系统时间调整后也能及时触发
const MAX_SLEEP: Duration = Duration::from_secs(60);

pub struct TrainingScheduler {
  schedule: TrainingSchedule,
  runner: TrainingRunner,
  next: Option<NaiveDateTime>,
}

impl TrainingScheduler {
  pub fn new(schedule: TrainingSchedule, runner: TrainingRunner, now: NaiveDateTime) -> Self {
    let next = schedule.next_after(now);
    Self {
      schedule,
      runner,
      next,
    }
  }

  pub fn next_run(&self) -> Option<NaiveDateTime> {
    self.next
  }

  /// 立即运行一次，不影响计划
  pub async fn run_now(&self) -> Result<RunReport, TrainingError> {
    self.runner.run_once().await
  }

  /// 到期则运行一次并重新排期，返回是否运行了训练
  pub async fn tick(&mut self, now: NaiveDateTime) -> bool {
    match self.next {
      Some(next) if now >= next => {
        info!("计划训练到期: {}", next);
        // 失败已在 run_once 中记录并通知
        let _ = self.runner.run_once().await;
        self.next = self.schedule.next_after(now);
        true
      }
      _ => false,
    }
  }

  /// 训练耗时超过下一次计划时，跳过错过的计划
  fn skip_missed(&mut self, now: NaiveDateTime) {
    match self.next {
      Some(next) if next <= now => {
        warn!("训练耗时过长，跳过计划: {}", next);
        self.next = self.schedule.next_after(now);
      }
      _ => {}
    }
  }

  pub async fn run<F>(mut self, shutdown: F)
  where
    F: Future<Output = ()>,
  {
    tokio::pin!(shutdown);
    loop {
      let now = Local::now().naive_local();
      let Some(next) = self.next else {
        warn!("没有可用的训练计划");
        shutdown.await;
        return;
      };

      if next <= now {
        self.tick(now).await;
        self.skip_missed(Local::now().naive_local());
        if let Some(next) = self.next {
          info!("下一次训练: {}", next);
        }
        continue;
      }

      let wait = (next - now).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP);
      tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = &mut shutdown => {
          info!("训练调度器停止");
          return;
        }
      }
    }
  }
}
