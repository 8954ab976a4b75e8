// 该文件是 Jianshi （监视） 项目的一部分。
// src/model/letterbox.rs - 输入缩放
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

//! 固定的 letterbox 策略：等比缩放到正方形输入，居中，灰色 (114) 填充。

use image::{Rgb, RgbImage, imageops};

pub const PAD_VALUE: u8 = 114;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: f32,
  pub pad_y: f32,
  pub size: u32,
  pub source_width: u32,
  pub source_height: u32,
}

impl Letterbox {
  pub fn new(source_width: u32, source_height: u32, size: u32) -> Self {
    let scale = (size as f32 / source_width as f32).min(size as f32 / source_height as f32);
    let resized_w = (source_width as f32 * scale).round();
    let resized_h = (source_height as f32 * scale).round();
    Self {
      scale,
      pad_x: ((size as f32 - resized_w) / 2.0).floor(),
      pad_y: ((size as f32 - resized_h) / 2.0).floor(),
      size,
      source_width,
      source_height,
    }
  }

  /// 缩放并填充
  pub fn apply(&self, image: &RgbImage) -> RgbImage {
    let resized_w = ((self.source_width as f32 * self.scale).round() as u32).clamp(1, self.size);
    let resized_h = ((self.source_height as f32 * self.scale).round() as u32).clamp(1, self.size);
    let resized = imageops::resize(image, resized_w, resized_h, imageops::FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([PAD_VALUE; 3]));
    imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
    canvas
  }

  /// 模型坐标映射回原图坐标，并裁剪到图像范围
  pub fn unmap(&self, bbox: [f32; 4]) -> [f32; 4] {
    let w = self.source_width as f32;
    let h = self.source_height as f32;
    [
      ((bbox[0] - self.pad_x) / self.scale).clamp(0.0, w),
      ((bbox[1] - self.pad_y) / self.scale).clamp(0.0, h),
      ((bbox[2] - self.pad_x) / self.scale).clamp(0.0, w),
      ((bbox[3] - self.pad_y) / self.scale).clamp(0.0, h),
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn landscape_frame_is_padded_vertically() {
    let lb = Letterbox::new(640, 480, 640);
    assert_eq!(lb.scale, 1.0);
    assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));

    let image = RgbImage::from_pixel(640, 480, Rgb([0, 0, 0]));
    let out = lb.apply(&image);
    assert_eq!(out.dimensions(), (640, 640));
    assert_eq!(out.get_pixel(0, 0), &Rgb([PAD_VALUE; 3]));
    assert_eq!(out.get_pixel(320, 320), &Rgb([0, 0, 0]));
  }

  #[test]
  fn unmap_inverts_the_transform() {
    let lb = Letterbox::new(1280, 720, 640);
    assert_eq!(lb.scale, 0.5);
    let model_box = [100.0, 140.0 + lb.pad_y, 200.0, 240.0 + lb.pad_y];
    assert_eq!(lb.unmap(model_box), [200.0, 280.0, 400.0, 480.0]);
  }

  #[test]
  fn unmap_clamps_to_frame() {
    let lb = Letterbox::new(640, 480, 640);
    assert_eq!(lb.unmap([-10.0, 0.0, 700.0, 640.0]), [0.0, 0.0, 640.0, 480.0]);
  }
}
