// 该文件是 Jianshi （监视） 项目的一部分。
// src/input/v4l_input.rs - V4L2 摄像头输入
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

use std::pin::Pin;

use image::RgbImage;
use thiserror::Error;
use tracing::{error, info};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use super::CameraSource;
use crate::{FromUrl, FromUrlWithScheme, decode::DecodeError};

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("参数无效: {0}")]
  InvalidParameter(String),
  #[error("不支持的像素格式: {0}")]
  UnsupportedPixelFormat(String),
}

const V4L_SCHEME: &str = "v4l";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const BUFFER_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
  Yuyv,
  Mjpg,
}

/// V4L2 摄像头
///
/// v4l 的 Stream 需要引用 Device，用 Pin<Box<Device>> 保证设备地址稳定。
pub struct V4lInput {
  device: Pin<Box<Device>>,
  stream: Option<Stream<'static>>,
  format: PixelFormat,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = V4L_SCHEME;
}

impl FromUrl for V4lInput {
  type Error = V4lInputError;

  /// `v4l:///dev/video0?width=640&height=480`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != V4L_SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}'，实际 '{}'",
        V4L_SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    let mut width = DEFAULT_WIDTH;
    let mut height = DEFAULT_HEIGHT;
    for (key, value) in url.query_pairs() {
      let parsed = || {
        value
          .parse::<u32>()
          .map_err(|_| V4lInputError::InvalidParameter(format!("{key}={value}")))
      };
      match key.as_ref() {
        "width" => width = parsed()?,
        "height" => height = parsed()?,
        _ => {}
      }
    }

    Self::open(url.path(), width, height)
  }
}

impl V4lInput {
  pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, V4lInputError> {
    let device = Box::pin(Device::with_path(device_path)?);

    let mut format = device.format()?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format)?;

    // 设备不支持 YUYV 时会返回自己的格式
    let pixel_format = match &format.fourcc.repr {
      b"YUYV" => PixelFormat::Yuyv,
      b"MJPG" => PixelFormat::Mjpg,
      other => {
        return Err(V4lInputError::UnsupportedPixelFormat(
          String::from_utf8_lossy(other).into_owned(),
        ));
      }
    };
    info!(
      "打开摄像头 {}: {}x{} {:?}",
      device_path, format.width, format.height, pixel_format
    );

    let mut input = Self {
      device,
      stream: None,
      format: pixel_format,
      width: format.width,
      height: format.height,
    };

    // SAFETY: device 被 Pin<Box> 固定在堆上不会移动；stream 在 Drop 中先于 device 释放
    let device_ref: &Device = &input.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, BUFFER_COUNT)?
    };
    input.stream = Some(stream);
    Ok(input)
  }

  fn convert(&self, buffer: &[u8]) -> Result<RgbImage, DecodeError> {
    match self.format {
      PixelFormat::Yuyv => {
        let rgb = yuyv_to_rgb(buffer, self.width, self.height);
        RgbImage::from_raw(self.width, self.height, rgb)
          .ok_or_else(|| DecodeError::Camera("YUYV 缓冲区长度不足".to_string()))
      }
      PixelFormat::Mjpg => Ok(image::load_from_memory(buffer)?.into_rgb8()),
    }
  }
}

impl Drop for V4lInput {
  fn drop(&mut self) {
    // stream 必须先于 device 释放
    self.stream.take();
  }
}

impl CameraSource for V4lInput {
  fn read_frame(&mut self) -> Result<Option<RgbImage>, DecodeError> {
    let Some(stream) = self.stream.as_mut() else {
      return Ok(None);
    };
    let (buffer, _meta) = stream
      .next()
      .map_err(|e| DecodeError::Camera(format!("无法捕获帧: {e}")))?;
    let buffer = buffer.to_vec();
    self.convert(&buffer).map(Some)
  }
}

/// YUYV 转 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);
  let pixel = |y: f32, u: f32, v: f32| {
    [
      (y + 1.402 * v).clamp(0.0, 255.0) as u8,
      (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8,
      (y + 1.772 * u).clamp(0.0, 255.0) as u8,
    ]
  };

  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    rgb.extend_from_slice(&pixel(chunk[0] as f32, u, v));
    rgb.extend_from_slice(&pixel(chunk[2] as f32, u, v));
  }
  rgb
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn neutral_chroma_yields_gray() {
    let rgb = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1);
    assert_eq!(rgb, [100, 100, 100, 200, 200, 200]);
  }
}
