// 该文件是 Jianshi （监视） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_polygon_mut, draw_text_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::warn;

use crate::{
  frame::Frame,
  model::{Detection, DetectionSet},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const COUNT_FONT_SIZE: f32 = 48.0;
const BOX_THICKNESS: i32 = 2;
const ZONE_COLOR: [u8; 3] = [255, 0, 0]; // 红色
const PALETTE_SIZE: usize = 20;

static DEFAULT_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

#[derive(Error, Debug)]
pub enum AnnotatorError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体无效: {0}")]
  InvalidFont(String),
}

/// 多边形区域，顶点为归一化坐标
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
  points: Vec<[f32; 2]>,
}

impl Zone {
  /// 覆盖整个画面
  pub fn full_frame() -> Self {
    Self {
      points: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
    }
  }

  /// 少于三个顶点时返回 None
  pub fn from_normalized(points: Vec<[f32; 2]>) -> Option<Self> {
    (points.len() >= 3).then_some(Self { points })
  }

  pub fn to_pixels(&self, width: u32, height: u32) -> Vec<(f32, f32)> {
    self
      .points
      .iter()
      .map(|[x, y]| (x * width as f32, y * height as f32))
      .collect()
  }

  /// 以检测框底边中点为锚点统计区域内数量
  pub fn count(&self, width: u32, height: u32, detections: &[Detection]) -> usize {
    let polygon = self.to_pixels(width, height);
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    detections
      .iter()
      .filter(|det| {
        let x = ((det.bbox[0] + det.bbox[2]) / 2.0).clamp(0.0, max_x);
        let y = det.bbox[3].clamp(0.0, max_y);
        contains(&polygon, (x, y))
      })
      .count()
  }

  fn centroid(&self, width: u32, height: u32) -> (i32, i32) {
    let pixels = self.to_pixels(width, height);
    let n = pixels.len() as f32;
    let (sx, sy) = pixels
      .iter()
      .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
    ((sx / n) as i32, (sy / n) as i32)
  }
}

/// 射线法，边上的点计为在内
fn contains(polygon: &[(f32, f32)], (px, py): (f32, f32)) -> bool {
  let mut inside = false;
  let mut j = polygon.len() - 1;
  for i in 0..polygon.len() {
    let (xi, yi) = polygon[i];
    let (xj, yj) = polygon[j];

    let cross = (xj - xi) * (py - yi) - (yj - yi) * (px - xi);
    let within_x = px >= xi.min(xj) && px <= xi.max(xj);
    let within_y = py >= yi.min(yj) && py <= yi.max(yj);
    if cross.abs() <= f32::EPSILON && within_x && within_y {
      return true;
    }

    if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
      inside = !inside;
    }
    j = i;
  }
  inside
}

/// 检测框、标签与区域叠加绘制
#[derive(Clone)]
pub struct Annotator {
  font: Option<FontArc>,
  font_scale: PxScale,
  zone: Option<Zone>,
  colors: Vec<Rgb<u8>>,
}

impl Default for Annotator {
  fn default() -> Self {
    Self::new()
  }
}

impl Annotator {
  pub fn new() -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb((i as f32 / PALETTE_SIZE as f32) * 360.0, 0.8, 0.9))
      .collect();

    let font = match FontArc::try_from_slice(DEFAULT_FONT) {
      Ok(font) => Some(font),
      Err(e) => {
        warn!("无法加载内置字体，不绘制文字: {}", e);
        None
      }
    };

    Self {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      zone: None,
      colors,
    }
  }

  /// 替换内置字体
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file(self, path: &Path) -> Result<Self, AnnotatorError> {
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data).map_err(|e| AnnotatorError::InvalidFont(e.to_string()))?;
    Ok(self.with_font(font))
  }

  pub fn with_zone(mut self, zone: Zone) -> Self {
    self.zone = Some(zone);
    self
  }

  pub fn zone(&self) -> Option<&Zone> {
    self.zone.as_ref()
  }

  /// 在副本上绘制；绘制失败时返回原始帧
  pub fn annotate(&self, frame: &Frame, detections: &DetectionSet) -> Frame {
    let drawn = panic::catch_unwind(AssertUnwindSafe(|| {
      let mut image = frame.to_rgb_image();
      self.draw(&mut image, detections.as_slice());
      image
    }));

    match drawn {
      Ok(image) => Frame::from_rgb_image(image).with_order(frame.order()),
      Err(_) => {
        warn!("标注失败，返回原始帧");
        frame.clone()
      }
    }
  }

  fn draw(&self, image: &mut RgbImage, detections: &[Detection]) {
    for det in detections {
      let color = self.colors[det.class_id as usize % self.colors.len()];
      self.draw_bbox_with_label(image, det, color);
    }
    if let Some(zone) = &self.zone {
      self.draw_zone(image, zone, detections);
    }
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, det: &Detection, color: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (det.bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (det.bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (det.bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (det.bbox[3].ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 边框加粗
    for t in 0..BOX_THICKNESS {
      let (left, top, right, bottom) = (x_min + t, y_min + t, x_max - t, y_max - t);
      if left >= right || top >= bottom {
        break;
      }
      for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
      }
      for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
      }
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!("{} {:.2}", det.label, det.confidence);
    let text_width = (label.chars().count() as f32 * LABEL_CHAR_WIDTH) as i32;
    let label_x = x_min;
    let label_y = (y_min - LABEL_TEXT_HEIGHT).max(0);
    let label_width = text_width.min(w - label_x).max(0) as u32;

    if label_width > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_width, LABEL_TEXT_HEIGHT as u32);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb([255, 255, 255]),
        label_x,
        label_y + LABEL_TEXT_VERTICAL_PADDING,
        self.font_scale,
        font,
        &label,
      );
    }
  }

  fn draw_zone(&self, image: &mut RgbImage, zone: &Zone, detections: &[Detection]) {
    let (w, h) = image.dimensions();
    let max_x = w.saturating_sub(1) as f32;
    let max_y = h.saturating_sub(1) as f32;
    let points: Vec<Point<f32>> = zone
      .to_pixels(w, h)
      .into_iter()
      .map(|(x, y)| Point::new(x.clamp(0.0, max_x), y.clamp(0.0, max_y)))
      .collect();

    let color = Rgb(ZONE_COLOR);
    draw_hollow_polygon_mut(image, &points, color);
    // 第二道线，保证 2 像素宽
    let inner: Vec<Point<f32>> = points
      .iter()
      .map(|p| Point::new((p.x + 1.0).min(max_x), (p.y + 1.0).min(max_y)))
      .collect();
    draw_hollow_polygon_mut(image, &inner, color);

    let Some(font) = &self.font else {
      return;
    };
    let count = zone.count(w, h, detections);
    let (cx, cy) = zone.centroid(w, h);
    draw_text_mut(
      image,
      color,
      cx,
      cy,
      PxScale::from(COUNT_FONT_SIZE),
      font,
      &count.to_string(),
    );
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::ChannelOrder;

  fn det(bbox: [f32; 4]) -> Detection {
    Detection {
      bbox,
      confidence: 0.9,
      class_id: 0,
      label: "person".to_string(),
    }
  }

  #[test]
  fn annotate_leaves_input_untouched_and_draws_boxes() {
    let frame = Frame::black(64, 64, ChannelOrder::Bgr);
    let set = DetectionSet::filtered(vec![det([10.0, 30.0, 50.0, 60.0])], 0.5);
    let out = Annotator::new().annotate(&frame, &set);

    assert!(frame.as_nhwc().iter().all(|&v| v == 0));
    assert_eq!(out.order(), ChannelOrder::Bgr);
    assert_eq!((out.width(), out.height()), (64, 64));
    assert_ne!(out.to_rgb_image().get_pixel(10, 30), &Rgb([0, 0, 0]));
    assert_eq!(out.to_rgb_image().get_pixel(30, 45), &Rgb([0, 0, 0]));
  }

  #[test]
  fn labels_are_drawn_with_the_builtin_font() {
    let frame = Frame::black(200, 120, ChannelOrder::Rgb);
    let set = DetectionSet::filtered(vec![det([20.0, 60.0, 180.0, 110.0])], 0.5);
    let out = Annotator::new().annotate(&frame, &set).to_rgb_image();

    let color = Annotator::new().colors[0];
    // 标签底色在框的上方，白色文字压在底色上
    assert_eq!(out.get_pixel(21, 37), &color);
    let white_text = (20..140)
      .flat_map(|x| (36..60).map(move |y| (x, y)))
      .filter(|&(x, y)| out.get_pixel(x, y).0.iter().all(|&c| c > 200))
      .count();
    assert!(white_text > 0);
  }

  #[test]
  fn zone_count_is_overlaid_at_centroid() {
    let frame = Frame::black(200, 200, ChannelOrder::Rgb);
    let out = Annotator::new()
      .with_zone(Zone::full_frame())
      .annotate(&frame, &DetectionSet::default())
      .to_rgb_image();

    // 数字 "0" 从区域中心 (100, 100) 开始绘制
    let red = (100..140)
      .flat_map(|x| (100..150).map(move |y| (x, y)))
      .filter(|&(x, y)| {
        let [r, g, b] = out.get_pixel(x, y).0;
        r > 128 && g < 64 && b < 64
      })
      .count();
    assert!(red > 0);
  }

  #[test]
  fn degenerate_boxes_are_skipped() {
    let frame = Frame::black(16, 16, ChannelOrder::Bgr);
    let set = DetectionSet::filtered(
      vec![det([5.0, 5.0, 5.0, 5.0]), det([-50.0, -50.0, -10.0, -10.0]), det([f32::NAN; 4])],
      0.5,
    );
    let out = Annotator::new().annotate(&frame, &set);
    assert_eq!(out, frame);
  }

  #[test]
  fn zone_outline_follows_frame_border() {
    let frame = Frame::black(40, 30, ChannelOrder::Bgr);
    let out = Annotator::new()
      .with_zone(Zone::full_frame())
      .annotate(&frame, &DetectionSet::default());
    assert_eq!(out.to_rgb_image().get_pixel(0, 0), &Rgb(ZONE_COLOR));
  }

  #[test]
  fn zone_counts_bottom_center_anchors() {
    let left_half =
      Zone::from_normalized(vec![[0.0, 0.0], [0.5, 0.0], [0.5, 1.0], [0.0, 1.0]]).unwrap();
    let detections = [
      det([10.0, 10.0, 50.0, 100.0]),   // 锚点 (30, 100)
      det([400.0, 10.0, 500.0, 100.0]), // 锚点 (450, 100)
      det([0.0, 400.0, 100.0, 480.0]),  // 锚点在底边，裁剪后仍在区域内
    ];
    assert_eq!(left_half.count(640, 480, &detections), 2);
    assert_eq!(Zone::full_frame().count(640, 480, &detections), 3);
  }

  #[test]
  fn zone_needs_three_points() {
    assert!(Zone::from_normalized(vec![[0.0, 0.0], [1.0, 1.0]]).is_none());
  }
}
