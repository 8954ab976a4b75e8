// 该文件是 Jianshi （监视） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 检测后端
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

//! 适用于 Ultralytics 导出的 YOLOv8/YOLO11 检测模型，输出形状 `[1, 4 + nc, N]`。

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use tracing::{debug, warn};

use super::letterbox::Letterbox;
use super::nms::nms;
use super::{Detection, Detector, InferenceError, InitializationError};
use crate::frame::Frame;

/// 推理前的最低分数，正式阈值由句柄过滤
const CANDIDATE_THRESHOLD: f32 = 0.25;

pub struct OnnxDetector {
  session: Mutex<Session>,
  input_size: u32,
  nms_threshold: f32,
  labels: Vec<String>,
}

impl OnnxDetector {
  pub fn load(path: &Path, input_size: u32, nms_threshold: f32) -> Result<Self, InitializationError> {
    let session = Session::builder()
      .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
      .and_then(|builder| builder.commit_from_file(path))
      .map_err(|e| InitializationError::Backend(e.to_string()))?;

    let labels = session
      .metadata()
      .ok()
      .and_then(|meta| meta.custom("names").ok().flatten())
      .map(|names| parse_names(&names))
      .unwrap_or_default();
    if labels.is_empty() {
      warn!("模型未携带类别名称，使用类别编号");
    } else {
      debug!("模型类别数量: {}", labels.len());
    }

    Ok(Self {
      session: Mutex::new(session),
      input_size,
      nms_threshold,
      labels,
    })
  }

  fn label(&self, class_id: usize) -> String {
    self
      .labels
      .get(class_id)
      .cloned()
      .unwrap_or_else(|| format!("class{class_id}"))
  }

  /// NCHW，归一化到 [0, 1]
  fn preprocess(&self, frame: &Frame) -> (Vec<f32>, Letterbox) {
    let letterbox = Letterbox::new(frame.width(), frame.height(), self.input_size);
    let image = letterbox.apply(&frame.to_rgb_image());
    let plane = (self.input_size * self.input_size) as usize;
    let mut data = vec![0f32; plane * 3];
    for (idx, pixel) in image.pixels().enumerate() {
      data[idx] = pixel[0] as f32 / 255.0;
      data[plane + idx] = pixel[1] as f32 / 255.0;
      data[2 * plane + idx] = pixel[2] as f32 / 255.0;
    }
    (data, letterbox)
  }
}

impl Detector for OnnxDetector {
  fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
    let (input, letterbox) = self.preprocess(frame);
    let size = self.input_size as usize;
    let tensor = Tensor::from_array(([1usize, 3, size, size], input.into_boxed_slice()))
      .map_err(|e| InferenceError::Runtime(e.to_string()))?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| InferenceError::Runtime("推理会话锁已损坏".to_string()))?;
    let outputs = session
      .run(ort::inputs![tensor])
      .map_err(|e| InferenceError::Runtime(e.to_string()))?;
    let (shape, data) = outputs[0]
      .try_extract_tensor::<f32>()
      .map_err(|e| InferenceError::Runtime(e.to_string()))?;

    if shape.len() != 3 || shape[1] < 5 {
      return Err(InferenceError::Runtime(format!("意外的输出形状: {shape:?}")));
    }
    let rows = shape[1] as usize;
    let proposals = shape[2] as usize;
    let num_classes = rows - 4;

    let mut candidates = Vec::new();
    for i in 0..proposals {
      let (mut best_class, mut best_score) = (0usize, 0f32);
      for c in 0..num_classes {
        let score = data[(4 + c) * proposals + i];
        if score > best_score {
          best_class = c;
          best_score = score;
        }
      }
      if best_score < CANDIDATE_THRESHOLD {
        continue;
      }

      let cx = data[i];
      let cy = data[proposals + i];
      let w = data[2 * proposals + i];
      let h = data[3 * proposals + i];
      let bbox = letterbox.unmap([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);

      candidates.push(Detection {
        bbox,
        confidence: best_score,
        class_id: best_class as u32,
        label: self.label(best_class),
      });
    }

    Ok(nms(candidates, self.nms_threshold))
  }
}

/// 解析 `{0: 'person', 1: 'bicycle'}` 形式的类别表
fn parse_names(raw: &str) -> Vec<String> {
  let mut names: Vec<(usize, String)> = raw
    .trim()
    .trim_start_matches('{')
    .trim_end_matches('}')
    .split(',')
    .filter_map(|entry| {
      let (id, name) = entry.split_once(':')?;
      let id = id.trim().parse().ok()?;
      let name = name.trim().trim_matches(|c| c == '\'' || c == '"');
      Some((id, name.to_string()))
    })
    .collect();
  names.sort_by_key(|(id, _)| *id);
  names.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
  use super::parse_names;

  #[test]
  fn names_metadata_is_parsed_in_id_order() {
    let names = parse_names("{1: 'drowsy', 0: 'awake'}");
    assert_eq!(names, ["awake", "drowsy"]);
  }
}
