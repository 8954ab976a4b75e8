// 该文件是 Jianshi （监视） 项目的一部分。
// src/output/summary.rs - 检测结果摘要
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

use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  dispatch::Kind,
  model::{Detection, DetectionSet},
};

pub const DEFAULT_FATIGUE_STATUS: &str = "alert";

/// 按位置序列化为 `[x1, y1, x2, y2, confidence, label]`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DetectionRow(pub f32, pub f32, pub f32, pub f32, pub f32, pub String);

impl From<&Detection> for DetectionRow {
  fn from(det: &Detection) -> Self {
    let [x1, y1, x2, y2] = det.bbox;
    DetectionRow(x1, y1, x2, y2, det.confidence, det.label.clone())
  }
}

/// 一次周期的结果记录
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ResultRecord {
  Crowd {
    num_people: usize,
    detections: Vec<DetectionRow>,
  },
  Fatigue {
    status: String,
    detections: Vec<DetectionRow>,
  },
}

impl ResultRecord {
  pub fn kind(&self) -> Kind {
    match self {
      ResultRecord::Crowd { .. } => Kind::Crowd,
      ResultRecord::Fatigue { .. } => Kind::Fatigue,
    }
  }

  pub fn detections(&self) -> &[DetectionRow] {
    match self {
      ResultRecord::Crowd { detections, .. } | ResultRecord::Fatigue { detections, .. } => {
        detections
      }
    }
  }
}

#[derive(Error, Debug, PartialEq)]
#[error("疲劳规则格式应为 label=status: {0}")]
pub struct FatigueRuleError(String);

/// 标签到疲劳状态的映射
#[derive(Debug, Clone, PartialEq)]
pub struct FatigueRule {
  pub label: String,
  pub status: String,
}

impl FromStr for FatigueRule {
  type Err = FatigueRuleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (label, status) = s
      .split_once('=')
      .map(|(label, status)| (label.trim(), status.trim()))
      .filter(|(label, status)| !label.is_empty() && !status.is_empty())
      .ok_or_else(|| FatigueRuleError(s.to_string()))?;
    Ok(Self {
      label: label.to_string(),
      status: status.to_string(),
    })
  }
}

/// 按规则顺序匹配，第一条命中的规则决定状态
#[derive(Debug, Clone, PartialEq)]
pub struct FatigueClassifier {
  rules: Vec<FatigueRule>,
  default_status: String,
}

impl Default for FatigueClassifier {
  fn default() -> Self {
    let rule = |label: &str| FatigueRule {
      label: label.to_string(),
      status: "drowsy".to_string(),
    };
    Self::new(vec![rule("drowsy"), rule("yawn")], DEFAULT_FATIGUE_STATUS)
  }
}

impl FatigueClassifier {
  pub fn new(rules: Vec<FatigueRule>, default_status: impl Into<String>) -> Self {
    Self {
      rules,
      default_status: default_status.into(),
    }
  }

  pub fn classify(&self, detections: &DetectionSet) -> &str {
    self
      .rules
      .iter()
      .find(|rule| {
        detections
          .iter()
          .any(|det| det.label.eq_ignore_ascii_case(&rule.label))
      })
      .map_or(&self.default_status, |rule| &rule.status)
  }
}

#[derive(Debug, Clone, Default)]
pub struct ResultShaper {
  classifier: FatigueClassifier,
}

impl ResultShaper {
  pub fn new(classifier: FatigueClassifier) -> Self {
    Self { classifier }
  }

  pub fn summarize(&self, detections: &DetectionSet, kind: Kind) -> ResultRecord {
    let rows = detections.iter().map(DetectionRow::from).collect();
    match kind {
      Kind::Crowd => ResultRecord::Crowd {
        num_people: detections.len(),
        detections: rows,
      },
      Kind::Fatigue => ResultRecord::Fatigue {
        status: self.classifier.classify(detections).to_string(),
        detections: rows,
      },
    }
  }
}

/// `mqtt-crowd-result` 与 `mqtt-fatigue-result` 的消息体，检测列表的键为 `detection`
#[derive(Serialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum KindResultMessage<'a> {
  Crowd {
    num_people: usize,
    detection: &'a [DetectionRow],
  },
  Fatigue {
    status: &'a str,
    detection: &'a [DetectionRow],
  },
}

impl<'a> From<&'a ResultRecord> for KindResultMessage<'a> {
  fn from(record: &'a ResultRecord) -> Self {
    match record {
      ResultRecord::Crowd {
        num_people,
        detections,
      } => KindResultMessage::Crowd {
        num_people: *num_people,
        detection: detections,
      },
      ResultRecord::Fatigue { status, detections } => KindResultMessage::Fatigue {
        status,
        detection: detections,
      },
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
  Success,
  Error,
}

/// `video/analysis` 的消息体
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnalysisMessage {
  pub status: AnalysisStatus,
  pub timestamp: String,
  pub num_people: usize,
  pub detections: Vec<DetectionRow>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl AnalysisMessage {
  pub fn success(record: &ResultRecord, at: DateTime<Local>) -> Self {
    let num_people = match record {
      ResultRecord::Crowd { num_people, .. } => *num_people,
      ResultRecord::Fatigue { detections, .. } => detections.len(),
    };
    Self {
      status: AnalysisStatus::Success,
      timestamp: at.to_rfc3339(),
      num_people,
      detections: record.detections().to_vec(),
      message: None,
    }
  }

  pub fn error(message: impl Into<String>, at: DateTime<Local>) -> Self {
    Self {
      status: AnalysisStatus::Error,
      timestamp: at.to_rfc3339(),
      num_people: 0,
      detections: Vec::new(),
      message: Some(message.into()),
    }
  }
}
