// 该文件是 Jianshi （监视） 项目的一部分。
// src/frame.rs - NHWC 帧定义
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

use image::{ImageBuffer, Rgb, RgbImage};

const CHANNELS: usize = 3;

/// 像素通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
  Rgb,
  /// 检测器期望的顺序
  Bgr,
}

/// 单次流水线调用持有的帧，NHWC 交错存储
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
  width: u32,
  height: u32,
  order: ChannelOrder,
  data: Box<[u8]>,
}

impl Frame {
  /// 由原始数据创建，长度不匹配时返回 None
  pub fn from_raw(width: u32, height: u32, order: ChannelOrder, data: Vec<u8>) -> Option<Self> {
    if data.len() != CHANNELS * width as usize * height as usize {
      return None;
    }
    Some(Self {
      width,
      height,
      order,
      data: data.into_boxed_slice(),
    })
  }

  pub fn from_rgb_image(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      order: ChannelOrder::Rgb,
      data: image.into_raw().into_boxed_slice(),
    }
  }

  /// 全黑帧
  pub fn black(width: u32, height: u32, order: ChannelOrder) -> Self {
    let size = CHANNELS * width as usize * height as usize;
    Self {
      width,
      height,
      order,
      data: vec![0u8; size].into_boxed_slice(),
    }
  }

  /// 转换到目标通道顺序
  pub fn with_order(mut self, order: ChannelOrder) -> Self {
    if self.order != order {
      for pixel in self.data.chunks_exact_mut(CHANNELS) {
        pixel.swap(0, 2);
      }
      self.order = order;
    }
    self
  }

  /// 复制为 RGB 图像，用于绘制和编码
  pub fn to_rgb_image(&self) -> RgbImage {
    let data = &self.data;
    let swap = self.order == ChannelOrder::Bgr;
    ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
      let (a, b, c) = (data[idx], data[idx + 1], data[idx + 2]);
      if swap { Rgb([c, b, a]) } else { Rgb([a, b, c]) }
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    CHANNELS
  }

  pub fn order(&self) -> ChannelOrder {
    self.order
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn order_conversion_swaps_red_and_blue() {
    let frame = Frame::from_raw(1, 1, ChannelOrder::Rgb, vec![10, 20, 30]).unwrap();
    let bgr = frame.with_order(ChannelOrder::Bgr);
    assert_eq!(bgr.as_nhwc(), &[30, 20, 10]);
    assert_eq!(bgr.order(), ChannelOrder::Bgr);
    // 转回 RGB 图像时颜色不变
    assert_eq!(bgr.to_rgb_image().get_pixel(0, 0), &Rgb([10, 20, 30]));
  }

  #[test]
  fn raw_length_mismatch_is_rejected() {
    assert!(Frame::from_raw(2, 2, ChannelOrder::Rgb, vec![0; 11]).is_none());
  }

  #[test]
  fn zero_sized_frame_is_empty() {
    assert!(Frame::black(0, 0, ChannelOrder::Bgr).is_empty());
    assert!(!Frame::black(4, 4, ChannelOrder::Bgr).is_empty());
  }
}
