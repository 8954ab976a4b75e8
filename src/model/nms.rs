// 该文件是 Jianshi （监视） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use std::cmp::Ordering;

use super::Detection;

/// 按类别做 NMS，结果按置信度降序
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  detections.sort_by(|a, b| {
    b.confidence
      .partial_cmp(&a.confidence)
      .unwrap_or(Ordering::Equal)
  });

  let mut result: Vec<Detection> = Vec::new();
  for det in detections {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == det.class_id && iou(&kept.bbox, &det.bbox) >= iou_threshold);
    if !suppressed {
      result.push(det);
    }
  }
  result
}

/// 计算两个边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn det(bbox: [f32; 4], confidence: f32, class_id: u32) -> Detection {
    Detection {
      bbox,
      confidence,
      class_id,
      label: format!("class{class_id}"),
    }
  }

  #[test]
  fn overlapping_boxes_of_same_class_are_suppressed() {
    let kept = nms(
      vec![
        det([0.0, 0.0, 10.0, 10.0], 0.6, 0),
        det([1.0, 1.0, 11.0, 11.0], 0.9, 0),
        det([50.0, 50.0, 60.0, 60.0], 0.7, 0),
      ],
      0.45,
    );
    let scores: Vec<_> = kept.iter().map(|d| d.confidence).collect();
    assert_eq!(scores, [0.9, 0.7]);
  }

  #[test]
  fn different_classes_do_not_suppress_each_other() {
    let kept = nms(
      vec![det([0.0, 0.0, 10.0, 10.0], 0.9, 0), det([0.0, 0.0, 10.0, 10.0], 0.8, 1)],
      0.45,
    );
    assert_eq!(kept.len(), 2);
  }

  #[test]
  fn iou_of_disjoint_and_identical_boxes() {
    let a = [0.0, 0.0, 10.0, 10.0];
    assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    assert_eq!(iou(&a, &a), 1.0);
  }
}
