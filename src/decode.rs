// 该文件是 Jianshi （监视） 项目的一部分。
// src/decode.rs - 帧解码
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

//! 把 base64 负载或摄像头画面解码为检测器使用的 BGR [`Frame`]。
//!
//! 所有失败都以 [`DecodeError`] 返回，调用方据此跳过当前周期。

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::RgbImage;
use serde::Deserialize;
use thiserror::Error;

use crate::frame::{ChannelOrder, Frame};

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("base64 解码失败: {0}")]
  Base64(#[from] base64::DecodeError),
  #[error("图像数据损坏: {0}")]
  Image(#[from] image::ImageError),
  #[error("消息负载无效: {0}")]
  Payload(String),
  #[error("摄像头读取失败: {0}")]
  Camera(String),
  #[error("图像为空")]
  Empty,
}

/// 消息负载，既可以是 JSON 字符串，也可以是带图像字段的对象
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum FramePayload {
  Encoded(String),
  Object {
    #[serde(alias = "image", alias = "data")]
    frame: String,
  },
}

/// 去掉 `data:image/jpeg;base64,` 之类的前缀
pub fn strip_data_uri(raw: &str) -> &str {
  match raw.split_once(',') {
    Some((_, body)) => body,
    None => raw,
  }
}

/// 解码 base64 图像（可带 data URI 前缀）
pub fn decode_base64(raw: &str) -> Result<Frame, DecodeError> {
  let body = strip_data_uri(raw.trim());
  let bytes = STANDARD.decode(body.trim())?;
  if bytes.is_empty() {
    return Err(DecodeError::Empty);
  }
  let image = image::load_from_memory(&bytes)?.into_rgb8();
  from_capture(image)
}

/// 解码消息总线上的 JSON 负载
pub fn decode_payload(payload: &[u8]) -> Result<Frame, DecodeError> {
  let text = std::str::from_utf8(payload).map_err(|e| DecodeError::Payload(e.to_string()))?;
  let payload: FramePayload =
    serde_json::from_str(text).map_err(|e| DecodeError::Payload(e.to_string()))?;
  match payload {
    FramePayload::Encoded(data) | FramePayload::Object { frame: data } => decode_base64(&data),
  }
}

/// 摄像头画面转为检测器通道顺序
pub fn from_capture(image: RgbImage) -> Result<Frame, DecodeError> {
  if image.width() == 0 || image.height() == 0 {
    return Err(DecodeError::Empty);
  }
  Ok(Frame::from_rgb_image(image).with_order(ChannelOrder::Bgr))
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{ImageFormat, Rgb};
  use std::io::Cursor;

  fn encode(width: u32, height: u32, format: ImageFormat) -> String {
    let image = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    STANDARD.encode(buf.into_inner())
  }

  #[test]
  fn png_keeps_dimensions_and_becomes_bgr() {
    let frame = decode_base64(&encode(64, 48, ImageFormat::Png)).unwrap();
    assert_eq!((frame.width(), frame.height()), (64, 48));
    assert_eq!(frame.order(), ChannelOrder::Bgr);
    assert_eq!(&frame.as_nhwc()[..3], &[50, 100, 200]);
  }

  #[test]
  fn jpeg_with_data_uri_prefix_round_trips_dimensions() {
    let raw = format!("data:image/jpeg;base64,{}", encode(640, 480, ImageFormat::Jpeg));
    let frame = decode_base64(&raw).unwrap();

    let mut buf = Cursor::new(Vec::new());
    frame.to_rgb_image().write_to(&mut buf, ImageFormat::Jpeg).unwrap();
    let again = decode_base64(&STANDARD.encode(buf.into_inner())).unwrap();
    assert_eq!((again.width(), again.height()), (640, 480));
  }

  #[test]
  fn malformed_base64_is_an_error() {
    for raw in ["!!!not base64!!!", "data:image/png;base64,@@@@", "abc"] {
      assert!(matches!(decode_base64(raw), Err(DecodeError::Base64(_))), "{raw}");
    }
  }

  #[test]
  fn valid_base64_of_garbage_is_an_image_error() {
    let raw = STANDARD.encode(b"definitely not an image");
    assert!(matches!(decode_base64(&raw), Err(DecodeError::Image(_))));
  }

  #[test]
  fn truncated_png_is_an_error() {
    let full = STANDARD.decode(encode(32, 32, ImageFormat::Png)).unwrap();
    let raw = STANDARD.encode(&full[..full.len() / 2]);
    assert!(decode_base64(&raw).is_err());
  }

  #[test]
  fn empty_payload_is_an_error() {
    assert!(matches!(decode_base64(""), Err(DecodeError::Empty)));
  }

  #[test]
  fn payload_accepts_string_and_object_forms() {
    let b64 = encode(8, 8, ImageFormat::Png);
    let as_string = serde_json::to_vec(&b64).unwrap();
    assert!(decode_payload(&as_string).is_ok());

    for field in ["frame", "image", "data"] {
      let object = serde_json::to_vec(&serde_json::json!({ field: b64 })).unwrap();
      assert!(decode_payload(&object).is_ok(), "{field}");
    }
  }

  #[test]
  fn payload_without_image_field_is_rejected() {
    let object = br#"{"camera": 1}"#;
    assert!(matches!(decode_payload(object), Err(DecodeError::Payload(_))));
    assert!(matches!(decode_payload(b"\xff\xfe"), Err(DecodeError::Payload(_))));
  }
}
