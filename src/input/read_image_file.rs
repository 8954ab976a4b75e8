// 该文件是 Jianshi （监视） 项目的一部分。
// src/input/read_image_file.rs - 静态图像作为摄像头
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

//! `image:///path/frame.jpg?fps=10&count=100`：按帧率重复输出同一张图像，
//! 给定 `count` 时输出指定帧数后关闭。

use std::time::{Duration, Instant};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::error;
use url::Url;

use super::CameraSource;
use crate::{FromUrl, FromUrlWithScheme, decode::DecodeError};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("参数无效: {0}")]
  InvalidParameter(String),
}

const READ_IMAGE_FILE_SCHEME: &str = "image";
const DEFAULT_FPS: f64 = 10.0;

pub struct ImageFileInput {
  image: RgbImage,
  interval: Duration,
  remaining: Option<u64>,
  last_read: Option<Instant>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}'，实际 '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let mut fps = DEFAULT_FPS;
    let mut remaining = None;
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "fps" => {
          fps = value
            .parse()
            .ok()
            .filter(|fps: &f64| *fps > 0.0)
            .ok_or_else(|| ImageFileInputError::InvalidParameter(format!("fps={value}")))?;
        }
        "count" => {
          remaining = Some(
            value
              .parse()
              .map_err(|_| ImageFileInputError::InvalidParameter(format!("count={value}")))?,
          );
        }
        _ => {}
      }
    }

    let image = ImageReader::open(url.path())?.decode()?.into_rgb8();
    Ok(Self {
      image,
      interval: Duration::from_secs_f64(1.0 / fps),
      remaining,
      last_read: None,
    })
  }
}

impl CameraSource for ImageFileInput {
  fn read_frame(&mut self) -> Result<Option<RgbImage>, DecodeError> {
    if let Some(remaining) = self.remaining.as_mut() {
      if *remaining == 0 {
        return Ok(None);
      }
      *remaining -= 1;
    }

    // 模拟摄像头帧率
    if let Some(last) = self.last_read {
      let elapsed = last.elapsed();
      if elapsed < self.interval {
        std::thread::sleep(self.interval - elapsed);
      }
    }
    self.last_read = Some(Instant::now());
    Ok(Some(self.image.clone()))
  }
}
