// 该文件是 Jianshi （监视） 项目的一部分。
// src/dispatch.rs - 检测流水线调度
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

//! 每种检测（人群、疲劳）一条流水线：解码 → 推理 → 摘要 → 发布。
//!
//! 检测器在启动时初始化，失败的种类进入 [`PipelineState::Failed`]，
//! 之后的每个周期都直接跳过，只记录一次日志。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl,
  decode::{DecodeError, decode_payload},
  frame::Frame,
  model::{DetectorBuilder, DetectorHandle, InferenceError, InitializationError, infer},
  output::{Annotator, ResultRecord, ResultShaper},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
  Crowd,
  Fatigue,
}

impl Kind {
  pub const ALL: [Kind; 2] = [Kind::Crowd, Kind::Fatigue];

  pub fn as_str(&self) -> &'static str {
    match self {
      Kind::Crowd => "crowd",
      Kind::Fatigue => "fatigue",
    }
  }
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug, PartialEq)]
#[error("未知的检测种类: {0}")]
pub struct UnknownKind(String);

impl FromStr for Kind {
  type Err = UnknownKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "crowd" => Ok(Kind::Crowd),
      "fatigue" => Ok(Kind::Fatigue),
      other => Err(UnknownKind(other.to_string())),
    }
  }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
  Uninitialized,
  Ready,
  Failed,
}

/// 周期被跳过的原因
#[derive(Error, Debug)]
pub enum SkipReason {
  #[error("帧解码失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("推理失败: {0}")]
  Inference(#[from] InferenceError),
  #[error("检测器不可用")]
  Unavailable,
  #[error("推理超时")]
  Timeout,
}

#[derive(Debug)]
pub enum CycleOutcome {
  Shaped(ResultRecord),
  Skipped(SkipReason),
}

/// 视频流周期的产物；推理失败时 `frame` 为原始帧，`record` 为 None
#[derive(Debug)]
pub struct StreamOutcome {
  pub frame: Frame,
  pub record: Option<ResultRecord>,
}

pub struct Pipeline {
  kind: Kind,
  state: PipelineState,
  handle: Option<DetectorHandle>,
  annotator: Annotator,
  shaper: ResultShaper,
  unavailable_logged: AtomicBool,
  inference_slot: Arc<Semaphore>,
}

impl Pipeline {
  pub fn new(kind: Kind, annotator: Annotator, shaper: ResultShaper) -> Self {
    Self {
      kind,
      state: PipelineState::Uninitialized,
      handle: None,
      annotator,
      shaper,
      unavailable_logged: AtomicBool::new(false),
      inference_slot: Arc::new(Semaphore::new(1)),
    }
  }

  /// 记录初始化结果
  pub fn with_handle(mut self, handle: Result<DetectorHandle, InitializationError>) -> Self {
    match handle {
      Ok(handle) => {
        self.handle = Some(handle);
        self.state = PipelineState::Ready;
      }
      Err(e) => {
        error!(kind = %self.kind, "检测器初始化失败: {}", e);
        self.handle = None;
        self.state = PipelineState::Failed;
      }
    }
    self
  }

  pub fn kind(&self) -> Kind {
    self.kind
  }

  pub fn state(&self) -> PipelineState {
    self.state
  }

  pub fn is_ready(&self) -> bool {
    self.state == PipelineState::Ready
  }

  /// 同一时刻只允许一次后台推理，超时的推理结束前一直占用
  pub fn inference_slot(&self) -> Arc<Semaphore> {
    Arc::clone(&self.inference_slot)
  }

  /// 检测器不可用，只在第一次记录日志
  pub fn note_unavailable(&self) {
    if !self.unavailable_logged.swap(true, Ordering::Relaxed) {
      warn!(kind = %self.kind, "检测器不可用，丢弃该种类的帧");
    }
  }

  /// 消息总线周期：解码 → 推理 → 摘要
  pub fn message_cycle(&self, payload: &[u8]) -> CycleOutcome {
    if !self.is_ready() {
      self.note_unavailable();
      return CycleOutcome::Skipped(SkipReason::Unavailable);
    }

    let frame = match decode_payload(payload) {
      Ok(frame) => frame,
      Err(e) => {
        warn!(kind = %self.kind, "帧解码失败: {}", e);
        return CycleOutcome::Skipped(e.into());
      }
    };

    match infer(self.handle.as_ref(), &frame) {
      Ok(detections) => {
        debug!(kind = %self.kind, "检测到 {} 个目标", detections.len());
        CycleOutcome::Shaped(self.shaper.summarize(&detections, self.kind))
      }
      Err(e) => {
        warn!(kind = %self.kind, "推理失败: {}", e);
        CycleOutcome::Skipped(e.into())
      }
    }
  }

  /// 视频流周期：推理失败时仍返回未标注的原始帧
  pub fn stream_cycle(&self, frame: Frame) -> StreamOutcome {
    match infer(self.handle.as_ref(), &frame) {
      Ok(detections) => StreamOutcome {
        frame: self.annotator.annotate(&frame, &detections),
        record: Some(self.shaper.summarize(&detections, self.kind)),
      },
      Err(e) => {
        warn!(kind = %self.kind, "推理失败，输出原始帧: {}", e);
        StreamOutcome {
          frame,
          record: None,
        }
      }
    }
  }
}

/// 一种检测的初始化参数
#[derive(Clone)]
pub struct PipelineConfig {
  pub model: Url,
  pub confidence_threshold: f32,
  pub nms_threshold: f32,
  pub annotator: Annotator,
  pub shaper: ResultShaper,
}

impl PipelineConfig {
  /// 按模型 URL 加载检测器
  pub fn build_handle(&self) -> Result<DetectorHandle, InitializationError> {
    DetectorBuilder::from_url(&self.model)?
      .confidence_threshold(self.confidence_threshold)
      .nms_threshold(self.nms_threshold)
      .build()
  }
}

/// 持有两种检测的流水线
pub struct Dispatcher {
  crowd: Arc<Pipeline>,
  fatigue: Arc<Pipeline>,
}

impl Dispatcher {
  pub fn new(crowd: Pipeline, fatigue: Pipeline) -> Self {
    Self {
      crowd: Arc::new(crowd),
      fatigue: Arc::new(fatigue),
    }
  }

  /// 并发初始化两种检测器，一种失败不影响另一种
  pub async fn initialize(crowd: PipelineConfig, fatigue: PipelineConfig) -> Self {
    Self::initialize_with(crowd, fatigue, PipelineConfig::build_handle).await
  }

  /// 用 `build` 创建检测器句柄，在阻塞线程池中运行
  pub async fn initialize_with<B>(crowd: PipelineConfig, fatigue: PipelineConfig, build: B) -> Self
  where
    B: Fn(&PipelineConfig) -> Result<DetectorHandle, InitializationError> + Send + Sync + 'static,
  {
    let build = Arc::new(build);
    let (crowd, fatigue) = tokio::join!(
      load_pipeline(Kind::Crowd, crowd, Arc::clone(&build)),
      load_pipeline(Kind::Fatigue, fatigue, build)
    );

    let unavailable: Vec<&str> = [&crowd, &fatigue]
      .iter()
      .filter(|pipeline| !pipeline.is_ready())
      .map(|pipeline| pipeline.kind().as_str())
      .collect();
    if unavailable.is_empty() {
      info!("所有检测器初始化完成");
    } else {
      warn!("以下检测不可用: {}", unavailable.join(", "));
    }

    Self::new(crowd, fatigue)
  }

  pub fn pipeline(&self, kind: Kind) -> &Arc<Pipeline> {
    match kind {
      Kind::Crowd => &self.crowd,
      Kind::Fatigue => &self.fatigue,
    }
  }
}

async fn load_pipeline<B>(kind: Kind, config: PipelineConfig, build: Arc<B>) -> Pipeline
where
  B: Fn(&PipelineConfig) -> Result<DetectorHandle, InitializationError> + Send + Sync + 'static,
{
  let pipeline = Pipeline::new(kind, config.annotator.clone(), config.shaper.clone());
  info!(kind = %kind, "初始化检测器: {}", config.model);
  let handle = match tokio::task::spawn_blocking(move || build(&config)).await {
    Ok(handle) => handle,
    Err(e) => Err(InitializationError::Backend(e.to_string())),
  };
  if handle.is_ok() {
    info!(kind = %kind, "检测器就绪");
  }
  pipeline.with_handle(handle)
}

#[derive(Error, Debug)]
pub enum PublishError {
  #[error("序列化失败: {0}")]
  Serialize(#[from] serde_json::Error),
  #[error("发布失败: {0}")]
  Client(String),
}

/// 结果的一个去向
pub trait RecordSink: Send + Sync {
  fn name(&self) -> &str;

  fn publish<'a>(&'a self, record: &'a ResultRecord) -> BoxFuture<'a, Result<(), PublishError>>;

  /// 周期被跳过时调用，默认什么也不做
  fn publish_failure<'a>(
    &'a self,
    _reason: &'a SkipReason,
  ) -> BoxFuture<'a, Result<(), PublishError>> {
    Box::pin(async { Ok(()) })
  }
}

/// 发布到所有去向，互不影响；返回成功数量
pub async fn publish_all(sinks: &[Arc<dyn RecordSink>], record: &ResultRecord) -> usize {
  let results = join_all(sinks.iter().map(|sink| async move {
    let result = sink.publish(record).await;
    if let Err(e) = &result {
      warn!(sink = sink.name(), "结果发布失败: {}", e);
    }
    result.is_ok()
  }))
  .await;
  results.into_iter().filter(|ok| *ok).count()
}

/// 向所有去向报告跳过的周期
pub async fn publish_failure_all(sinks: &[Arc<dyn RecordSink>], reason: &SkipReason) -> usize {
  let results = join_all(sinks.iter().map(|sink| async move {
    let result = sink.publish_failure(reason).await;
    if let Err(e) = &result {
      warn!(sink = sink.name(), "失败状态发布失败: {}", e);
    }
    result.is_ok()
  }))
  .await;
  results.into_iter().filter(|ok| *ok).count()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::ChannelOrder;
  use crate::model::{Detection, Detector};
  use base64::Engine;
  use base64::engine::general_purpose::STANDARD;
  use std::sync::Mutex;

  struct Fixed(Vec<Detection>);

  impl Detector for Fixed {
    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
      Ok(self.0.clone())
    }
  }

  struct Broken;

  impl Detector for Broken {
    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
      Err(InferenceError::Runtime("device lost".to_string()))
    }
  }

  fn pipeline(kind: Kind, detector: Box<dyn Detector>) -> Pipeline {
    Pipeline::new(kind, Annotator::new(), ResultShaper::default())
      .with_handle(Ok(DetectorHandle::new(detector, 0.5)))
  }

  fn payload() -> Vec<u8> {
    let image = image::RgbImage::new(32, 24);
    let mut buf = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    serde_json::to_vec(&STANDARD.encode(buf.into_inner())).unwrap()
  }

  #[test]
  fn kind_parses_and_displays() {
    assert_eq!("fatigue".parse::<Kind>().unwrap(), Kind::Fatigue);
    assert_eq!(Kind::Crowd.to_string(), "crowd");
    assert!("pose".parse::<Kind>().is_err());
  }

  #[test]
  fn message_cycle_shapes_result() {
    let det = Detection {
      bbox: [0.0, 0.0, 5.0, 5.0],
      confidence: 0.9,
      class_id: 0,
      label: "person".to_string(),
    };
    let pipeline = pipeline(Kind::Crowd, Box::new(Fixed(vec![det])));
    match pipeline.message_cycle(&payload()) {
      CycleOutcome::Shaped(ResultRecord::Crowd { num_people, .. }) => assert_eq!(num_people, 1),
      other => panic!("unexpected outcome: {other:?}"),
    }
  }

  #[test]
  fn bad_payload_is_skipped() {
    let pipeline = pipeline(Kind::Crowd, Box::new(Fixed(vec![])));
    assert!(matches!(
      pipeline.message_cycle(b"\"not-base64!\""),
      CycleOutcome::Skipped(SkipReason::Decode(_))
    ));
  }

  #[test]
  fn failed_pipeline_skips_every_cycle() {
    let pipeline = Pipeline::new(Kind::Fatigue, Annotator::new(), ResultShaper::default())
      .with_handle(Err(InitializationError::ModelNotFound("/missing.onnx".into())));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    for _ in 0..3 {
      assert!(matches!(
        pipeline.message_cycle(&payload()),
        CycleOutcome::Skipped(SkipReason::Unavailable)
      ));
    }
  }

  #[test]
  fn stream_cycle_returns_raw_frame_on_inference_error() {
    let pipeline = pipeline(Kind::Crowd, Box::new(Broken));
    let frame = Frame::black(16, 16, ChannelOrder::Bgr);
    let outcome = pipeline.stream_cycle(frame.clone());
    assert_eq!(outcome.frame, frame);
    assert!(outcome.record.is_none());
  }

  struct Recording {
    name: &'static str,
    fail: bool,
    seen: Mutex<Vec<ResultRecord>>,
  }

  impl RecordSink for Recording {
    fn name(&self) -> &str {
      self.name
    }

    fn publish<'a>(&'a self, record: &'a ResultRecord) -> BoxFuture<'a, Result<(), PublishError>> {
      Box::pin(async move {
        if self.fail {
          return Err(PublishError::Client("broker gone".to_string()));
        }
        self.seen.lock().unwrap().push(record.clone());
        Ok(())
      })
    }
  }

  #[tokio::test]
  async fn one_failing_sink_does_not_block_the_other() {
    let good = Arc::new(Recording {
      name: "good",
      fail: false,
      seen: Mutex::new(Vec::new()),
    });
    let bad = Arc::new(Recording {
      name: "bad",
      fail: true,
      seen: Mutex::new(Vec::new()),
    });
    let sinks: Vec<Arc<dyn RecordSink>> = vec![bad, good.clone()];
    let record = ResultShaper::default().summarize(&Default::default(), Kind::Crowd);

    assert_eq!(publish_all(&sinks, &record).await, 1);
    assert_eq!(good.seen.lock().unwrap().as_slice(), [record]);
  }

  fn config(model: &str) -> PipelineConfig {
    PipelineConfig {
      model: Url::parse(model).unwrap(),
      confidence_threshold: 0.5,
      nms_threshold: 0.45,
      annotator: Annotator::new(),
      shaper: ResultShaper::default(),
    }
  }

  #[tokio::test]
  async fn missing_model_files_fail_both_kinds() {
    let dispatcher = Dispatcher::initialize(
      config("onnx:///missing/crowd.onnx"),
      config("onnx:///missing/fatigue.onnx"),
    )
    .await;
    assert_eq!(dispatcher.pipeline(Kind::Crowd).state(), PipelineState::Failed);
    assert_eq!(dispatcher.pipeline(Kind::Fatigue).state(), PipelineState::Failed);
  }

  #[tokio::test]
  async fn failing_kind_does_not_affect_the_other() {
    let build = |config: &PipelineConfig| -> Result<DetectorHandle, InitializationError> {
      if config.model.path().contains("fatigue") {
        std::thread::sleep(std::time::Duration::from_millis(50));
        return Err(InitializationError::ModelNotFound(config.model.path().into()));
      }
      Ok(DetectorHandle::new(Box::new(Fixed(vec![])), 0.5))
    };
    let dispatcher = Dispatcher::initialize_with(
      config("onnx:///models/crowd.onnx"),
      config("onnx:///models/fatigue.onnx"),
      build,
    )
    .await;
    assert_eq!(dispatcher.pipeline(Kind::Crowd).state(), PipelineState::Ready);
    assert_eq!(dispatcher.pipeline(Kind::Fatigue).state(), PipelineState::Failed);
    assert!(matches!(
      dispatcher.pipeline(Kind::Crowd).message_cycle(&payload()),
      CycleOutcome::Shaped(_)
    ));
  }

  #[tokio::test]
  async fn panicking_loader_only_fails_its_own_kind() {
    let build = |config: &PipelineConfig| -> Result<DetectorHandle, InitializationError> {
      if config.model.path().contains("crowd") {
        panic!("loader crashed");
      }
      Ok(DetectorHandle::new(Box::new(Fixed(vec![])), 0.5))
    };
    let dispatcher = Dispatcher::initialize_with(
      config("onnx:///models/crowd.onnx"),
      config("onnx:///models/fatigue.onnx"),
      build,
    )
    .await;
    assert_eq!(dispatcher.pipeline(Kind::Crowd).state(), PipelineState::Failed);
    assert_eq!(dispatcher.pipeline(Kind::Fatigue).state(), PipelineState::Ready);
  }
}
