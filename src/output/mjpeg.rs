// 该文件是 Jianshi （监视） 项目的一部分。
// src/output/mjpeg.rs - MJPEG 分块输出
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

use std::iter::FusedIterator;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use tracing::{debug, error, info, warn};

use crate::{
  decode::from_capture, dispatch::Pipeline, frame::Frame, input::CameraLease,
};

pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
/// 连续读取失败达到该次数后结束视频流
pub const MAX_CONSECUTIVE_FAILURES: u32 = 30;

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, image::ImageError> {
  let image = frame.to_rgb_image();
  let mut jpeg = Vec::new();
  JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&image)?;
  Ok(jpeg)
}

/// 一个 multipart 分块
pub fn part(jpeg: &[u8]) -> Vec<u8> {
  const HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
  let mut chunk = Vec::with_capacity(HEADER.len() + jpeg.len() + 2);
  chunk.extend_from_slice(HEADER);
  chunk.extend_from_slice(jpeg);
  chunk.extend_from_slice(b"\r\n");
  chunk
}

/// 摄像头帧经流水线后编码的分块序列，设备关闭后结束且不可重启
pub struct FrameChunks {
  lease: Option<CameraLease>,
  pipeline: Arc<Pipeline>,
  quality: u8,
  failures: u32,
  emitted: u64,
}

impl FrameChunks {
  pub fn new(lease: CameraLease, pipeline: Arc<Pipeline>, quality: u8) -> Self {
    Self {
      lease: Some(lease),
      pipeline,
      quality,
      failures: 0,
      emitted: 0,
    }
  }

  fn finish(&mut self) {
    if self.lease.take().is_some() {
      info!(kind = %self.pipeline.kind(), "视频流结束，共输出 {} 帧", self.emitted);
    }
  }

  /// 返回 false 表示应结束视频流
  fn note_failure(&mut self) -> bool {
    self.failures += 1;
    if self.failures >= MAX_CONSECUTIVE_FAILURES {
      error!(
        kind = %self.pipeline.kind(),
        "摄像头连续 {} 次读取失败", self.failures
      );
      return false;
    }
    true
  }
}

impl Iterator for FrameChunks {
  type Item = Vec<u8>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let read = self.lease.as_ref()?.read();
      let image = match read {
        Ok(Some(image)) => image,
        Ok(None) => {
          info!("摄像头已关闭");
          self.finish();
          return None;
        }
        Err(e) => {
          warn!("摄像头读取失败: {}", e);
          if !self.note_failure() {
            self.finish();
            return None;
          }
          continue;
        }
      };

      let frame = match from_capture(image) {
        Ok(frame) => frame,
        Err(e) => {
          warn!("摄像头画面无效: {}", e);
          if !self.note_failure() {
            self.finish();
            return None;
          }
          continue;
        }
      };
      self.failures = 0;

      let outcome = self.pipeline.stream_cycle(frame);
      if let Some(record) = &outcome.record {
        debug!(kind = %self.pipeline.kind(), "检测到 {} 个目标", record.detections().len());
      }
      match encode_jpeg(&outcome.frame, self.quality) {
        Ok(jpeg) => {
          self.emitted += 1;
          return Some(part(&jpeg));
        }
        Err(e) => warn!("JPEG 编码失败: {}", e),
      }
    }
  }
}

impl FusedIterator for FrameChunks {}

impl Drop for FrameChunks {
  fn drop(&mut self) {
    self.finish();
  }
}
