// 该文件是 Jianshi （监视） 项目的一部分。
// src/model.rs - 模型与检测调用
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

pub mod letterbox;
pub mod nms;

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::OnnxDetector;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
pub const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，帧像素坐标
  pub confidence: f32,
  pub class_id: u32,
  pub label: String,
}

/// 一次调用的检测结果，成员置信度均大于阈值，保持模型输出顺序
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionSet {
  items: Box<[Detection]>,
}

impl DetectionSet {
  pub fn filtered(raw: Vec<Detection>, threshold: f32) -> Self {
    let items: Vec<Detection> = raw
      .into_iter()
      .filter(|det| det.confidence > threshold)
      .collect();
    Self {
      items: items.into_boxed_slice(),
    }
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn as_slice(&self) -> &[Detection] {
    &self.items
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("uninitialized")]
  Uninitialized,
  #[error("空帧")]
  EmptyFrame,
  #[error("{0}")]
  Runtime(String),
}

impl InferenceError {
  pub fn reason(&self) -> String {
    self.to_string()
  }
}

#[derive(Error, Debug)]
pub enum InitializationError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("不支持的模型方案: {0}")]
  UnsupportedScheme(String),
  #[error("后端未编译: {0}")]
  BackendUnavailable(&'static str),
  #[error("模型加载失败: {0}")]
  Backend(String),
}

/// 外部检测能力：前向推理加 NMS，返回未经阈值过滤的检测
pub trait Detector: Send + Sync {
  fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError>;
}

/// 进程内共享、初始化后只读的检测器句柄
pub struct DetectorHandle {
  detector: Box<dyn Detector>,
  confidence_threshold: f32,
}

impl std::fmt::Debug for DetectorHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DetectorHandle")
      .field("confidence_threshold", &self.confidence_threshold)
      .finish_non_exhaustive()
  }
}

impl DetectorHandle {
  pub fn new(detector: Box<dyn Detector>, confidence_threshold: f32) -> Self {
    Self {
      detector,
      confidence_threshold,
    }
  }

  pub fn confidence_threshold(&self) -> f32 {
    self.confidence_threshold
  }
}

/// 运行检测并按阈值过滤
pub fn infer(handle: Option<&DetectorHandle>, frame: &Frame) -> Result<DetectionSet, InferenceError> {
  let handle = handle.ok_or(InferenceError::Uninitialized)?;
  if frame.is_empty() {
    return Err(InferenceError::EmptyFrame);
  }
  let now = std::time::Instant::now();
  let raw = handle.detector.detect(frame)?;
  let total = raw.len();
  let set = DetectionSet::filtered(raw, handle.confidence_threshold);
  debug!(
    "推理完成，耗时: {:.2?}，候选 {} 个，保留 {} 个",
    now.elapsed(),
    total,
    set.len()
  );
  Ok(set)
}

const ONNX_SCHEME: &str = "onnx";

/// 从 URL 构建检测器句柄，例如 `onnx:///opt/models/crowd.onnx`
#[derive(Debug, Clone)]
pub struct DetectorBuilder {
  model_path: PathBuf,
  confidence_threshold: f32,
  nms_threshold: f32,
  input_size: u32,
}

impl FromUrlWithScheme for DetectorBuilder {
  const SCHEME: &'static str = ONNX_SCHEME;
}

impl FromUrl for DetectorBuilder {
  type Error = InitializationError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InitializationError::UnsupportedScheme(
        url.scheme().to_string(),
      ));
    }

    Ok(DetectorBuilder {
      model_path: PathBuf::from(url.path()),
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
      input_size: DEFAULT_INPUT_SIZE,
    })
  }
}

impl DetectorBuilder {
  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn nms_threshold(mut self, threshold: f32) -> Self {
    self.nms_threshold = threshold;
    self
  }

  pub fn input_size(mut self, size: u32) -> Self {
    self.input_size = size;
    self
  }

  pub fn model_path(&self) -> &std::path::Path {
    &self.model_path
  }

  pub fn build(self) -> Result<DetectorHandle, InitializationError> {
    if !self.model_path.is_file() {
      return Err(InitializationError::ModelNotFound(self.model_path));
    }
    info!("加载模型文件: {}", self.model_path.display());
    let detector = self.build_backend()?;
    info!("模型加载完成: {}", self.model_path.display());
    Ok(DetectorHandle::new(detector, self.confidence_threshold))
  }

  #[cfg(feature = "onnx")]
  fn build_backend(&self) -> Result<Box<dyn Detector>, InitializationError> {
    let detector = OnnxDetector::load(&self.model_path, self.input_size, self.nms_threshold)?;
    Ok(Box::new(detector))
  }

  #[cfg(not(feature = "onnx"))]
  fn build_backend(&self) -> Result<Box<dyn Detector>, InitializationError> {
    let _ = (self.input_size, self.nms_threshold);
    Err(InitializationError::BackendUnavailable("onnx"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::ChannelOrder;

  struct Fixed(Vec<Detection>);

  impl Detector for Fixed {
    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
      Ok(self.0.clone())
    }
  }

  fn det(label: &str, confidence: f32) -> Detection {
    Detection {
      bbox: [1.0, 2.0, 3.0, 4.0],
      confidence,
      class_id: 0,
      label: label.to_string(),
    }
  }

  #[test]
  fn threshold_is_strict_and_order_is_kept() {
    let raw = vec![det("a", 0.9), det("b", 0.5), det("c", 0.51), det("d", 0.2)];
    let handle = DetectorHandle::new(Box::new(Fixed(raw)), 0.5);
    let frame = Frame::black(640, 480, ChannelOrder::Bgr);
    let set = infer(Some(&handle), &frame).unwrap();
    let labels: Vec<_> = set.iter().map(|d| d.label.as_str()).collect();
    assert_eq!(labels, ["a", "c"]);
    assert!(set.iter().all(|d| d.confidence > handle.confidence_threshold()));
  }

  #[test]
  fn missing_handle_is_uninitialized() {
    let frame = Frame::black(8, 8, ChannelOrder::Bgr);
    let err = infer(None, &frame).unwrap_err();
    assert_eq!(err, InferenceError::Uninitialized);
    assert_eq!(err.reason(), "uninitialized");
  }

  #[test]
  fn empty_frame_is_rejected() {
    let handle = DetectorHandle::new(Box::new(Fixed(vec![])), 0.5);
    let frame = Frame::black(0, 0, ChannelOrder::Bgr);
    assert_eq!(infer(Some(&handle), &frame), Err(InferenceError::EmptyFrame));
  }

  #[test]
  fn builder_rejects_other_schemes_and_missing_files() {
    let url = Url::parse("tflite:///tmp/model.tflite").unwrap();
    assert!(matches!(
      DetectorBuilder::from_url(&url),
      Err(InitializationError::UnsupportedScheme(_))
    ));

    let url = Url::parse("onnx:///definitely/missing/model.onnx").unwrap();
    let builder = DetectorBuilder::from_url(&url).unwrap();
    assert!(matches!(
      builder.build(),
      Err(InitializationError::ModelNotFound(_))
    ));
  }

  #[cfg(feature = "onnx")]
  #[test]
  fn onnx_backend_is_compiled_in() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.onnx");
    std::fs::write(&path, b"not a model").unwrap();
    let url = Url::parse(&format!("onnx://{}", path.display())).unwrap();
    assert!(matches!(
      DetectorBuilder::from_url(&url).unwrap().build(),
      Err(InitializationError::Backend(_))
    ));
  }
}
