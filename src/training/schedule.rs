// 该文件是 Jianshi （监视） 项目的一部分。
// src/training/schedule.rs - 训练计划
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

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, PartialEq)]
pub enum ScheduleError {
  #[error("无效的训练时间 '{0}'，应为 HH:MM")]
  InvalidTime(String),
}

/// 重复规则，均在同一时刻触发
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
  Daily,
  Weekly(Weekday),
  Monthly(u32),
}

impl Recurrence {
  /// 严格晚于 `after` 的下一次触发时间
  pub fn next_after(&self, after: NaiveDateTime, at: NaiveTime) -> Option<NaiveDateTime> {
    let today = after.date();
    match *self {
      Recurrence::Daily => (0..=1)
        .filter_map(|d| today.checked_add_days(Days::new(d)))
        .map(|date| date.and_time(at))
        .find(|candidate| *candidate > after),
      Recurrence::Weekly(weekday) => (0..=7)
        .filter_map(|d| today.checked_add_days(Days::new(d)))
        .filter(|date| date.weekday() == weekday)
        .map(|date| date.and_time(at))
        .find(|candidate| *candidate > after),
      Recurrence::Monthly(day) => {
        let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
        // 没有该日期的月份（如 2 月 30 日）跳过
        (0..=12)
          .filter_map(|m| first.checked_add_months(Months::new(m)))
          .filter_map(|month| month.with_day(day))
          .map(|date| date.and_time(at))
          .find(|candidate| *candidate > after)
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSchedule {
  at: NaiveTime,
  recurrences: Vec<Recurrence>,
}

impl TrainingSchedule {
  pub fn new(at: NaiveTime, recurrences: Vec<Recurrence>) -> Self {
    Self { at, recurrences }
  }

  /// 每日、每周、每月三个计划；无效的星期或日期只告警并跳过
  pub fn from_config(
    daily_time: &str,
    weekly_day: &str,
    monthly_date: u32,
  ) -> Result<Self, ScheduleError> {
    let at = parse_time(daily_time)?;
    let mut recurrences = vec![Recurrence::Daily];

    match weekly_day.parse::<Weekday>() {
      Ok(weekday) => recurrences.push(Recurrence::Weekly(weekday)),
      Err(_) => warn!("无效的星期 '{}'，忽略每周训练", weekly_day),
    }
    if (1..=31).contains(&monthly_date) {
      recurrences.push(Recurrence::Monthly(monthly_date));
    } else {
      warn!("无效的日期 {}，忽略每月训练", monthly_date);
    }

    Ok(Self::new(at, recurrences))
  }

  pub fn at(&self) -> NaiveTime {
    self.at
  }

  pub fn recurrences(&self) -> &[Recurrence] {
    &self.recurrences
  }

  /// 所有计划中最早的下一次触发；同一时刻到期的计划只算一次
  pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
    self
      .recurrences
      .iter()
      .filter_map(|r| r.next_after(after, self.at))
      .min()
  }
}

fn parse_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
  NaiveTime::parse_from_str(raw.trim(), "%H:%M")
    .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
    .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
      .unwrap()
      .and_hms_opt(h, min, 0)
      .unwrap()
  }

  fn two_am() -> NaiveTime {
    NaiveTime::from_hms_opt(2, 0, 0).unwrap()
  }

  #[test]
  fn daily_fires_today_or_tomorrow() {
    let daily = Recurrence::Daily;
    assert_eq!(
      daily.next_after(dt(2026, 3, 10, 1, 0), two_am()),
      Some(dt(2026, 3, 10, 2, 0))
    );
    assert_eq!(
      daily.next_after(dt(2026, 3, 10, 2, 0), two_am()),
      Some(dt(2026, 3, 11, 2, 0))
    );
  }

  #[test]
  fn weekly_finds_next_matching_weekday() {
    // 2026-03-10 是星期二
    let weekly = Recurrence::Weekly(Weekday::Mon);
    assert_eq!(
      weekly.next_after(dt(2026, 3, 10, 12, 0), two_am()),
      Some(dt(2026, 3, 16, 2, 0))
    );
    assert_eq!(
      weekly.next_after(dt(2026, 3, 16, 3, 0), two_am()),
      Some(dt(2026, 3, 23, 2, 0))
    );
  }

  #[test]
  fn monthly_skips_short_months() {
    let monthly = Recurrence::Monthly(31);
    assert_eq!(
      monthly.next_after(dt(2026, 1, 31, 3, 0), two_am()),
      Some(dt(2026, 3, 31, 2, 0))
    );
  }

  #[test]
  fn coinciding_schedules_yield_a_single_time() {
    let schedule = TrainingSchedule::from_config("02:00", "Monday", 1).unwrap();
    assert_eq!(schedule.recurrences().len(), 3);
    // 2026-06-01 是星期一，三个计划同时到期
    let next = schedule.next_after(dt(2026, 5, 31, 12, 0)).unwrap();
    assert_eq!(next, dt(2026, 6, 1, 2, 0));
    assert_eq!(schedule.next_after(next), Some(dt(2026, 6, 2, 2, 0)));
  }

  #[test]
  fn invalid_weekday_and_date_are_skipped() {
    let schedule = TrainingSchedule::from_config("23:30", "Someday", 42).unwrap();
    assert_eq!(schedule.recurrences(), [Recurrence::Daily]);
    assert_eq!(schedule.at(), NaiveTime::from_hms_opt(23, 30, 0).unwrap());
  }

  #[test]
  fn invalid_time_is_an_error() {
    assert_eq!(
      TrainingSchedule::from_config("25:99", "Monday", 1),
      Err(ScheduleError::InvalidTime("25:99".to_string()))
    );
  }
}
