// 该文件是 Jianshi （监视） 项目的一部分。
// tests/pipeline.rs - 消息流水线测试
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

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::BoxFuture;
use image::{ImageFormat, RgbImage};
use serde_json::json;

use jianshi::{
  bridge::{Route, process_message},
  dispatch::{CycleOutcome, Kind, Pipeline, PublishError, RecordSink, SkipReason},
  frame::Frame,
  model::{Detection, Detector, DetectorHandle, InferenceError, InitializationError},
  output::{Annotator, FatigueClassifier, ResultRecord, ResultShaper},
};

/// 对黑色画面不输出任何目标，其余画面输出固定检测
struct Scripted(Vec<Detection>);

impl Detector for Scripted {
  fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
    if frame.as_nhwc().iter().all(|&v| v == 0) {
      return Ok(Vec::new());
    }
    Ok(self.0.clone())
  }
}

struct AlwaysDrowsy;

impl Detector for AlwaysDrowsy {
  fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
    Ok(vec![
      Detection {
        bbox: [100.0, 80.0, 300.0, 260.0],
        confidence: 0.9,
        class_id: 1,
        label: "drowsy".to_string(),
      },
      Detection {
        bbox: [0.0, 0.0, 10.0, 10.0],
        confidence: 0.3,
        class_id: 0,
        label: "awake".to_string(),
      },
    ])
  }
}

#[derive(Default)]
struct Collect(Mutex<Vec<ResultRecord>>);

impl RecordSink for Collect {
  fn name(&self) -> &str {
    "collect"
  }

  fn publish<'a>(&'a self, record: &'a ResultRecord) -> BoxFuture<'a, Result<(), PublishError>> {
    Box::pin(async move {
      self.0.lock().unwrap().push(record.clone());
      Ok(())
    })
  }
}

fn payload(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
  let mut buf = Cursor::new(Vec::new());
  image.write_to(&mut buf, format).unwrap();
  let encoded = format!("data:image/jpeg;base64,{}", STANDARD.encode(buf.into_inner()));
  serde_json::to_vec(&json!({ "frame": encoded })).unwrap()
}

fn pipeline(kind: Kind, detector: Box<dyn Detector>, shaper: ResultShaper) -> Arc<Pipeline> {
  Arc::new(
    Pipeline::new(kind, Annotator::new(), shaper)
      .with_handle(Ok(DetectorHandle::new(detector, 0.5))),
  )
}

fn shaped(outcome: CycleOutcome) -> ResultRecord {
  match outcome {
    CycleOutcome::Shaped(record) => record,
    CycleOutcome::Skipped(reason) => panic!("cycle skipped: {reason}"),
  }
}

#[test]
fn black_frame_yields_empty_crowd_summary() {
  let pipeline = pipeline(
    Kind::Crowd,
    Box::new(Scripted(Vec::new())),
    ResultShaper::default(),
  );
  let record = shaped(pipeline.message_cycle(&payload(&RgbImage::new(640, 480), ImageFormat::Png)));
  assert_eq!(
    serde_json::to_value(&record).unwrap(),
    json!({"num_people": 0, "detections": []})
  );
}

#[test]
fn drowsy_detection_yields_drowsy_status() {
  let pipeline = pipeline(Kind::Fatigue, Box::new(AlwaysDrowsy), ResultShaper::default());
  let record = shaped(pipeline.message_cycle(&payload(&RgbImage::new(320, 240), ImageFormat::Jpeg)));
  match &record {
    ResultRecord::Fatigue { status, detections } => {
      assert_eq!(status, "drowsy");
      // 0.3 的检测低于阈值
      assert_eq!(detections.len(), 1);
      assert_eq!(detections[0].5, "drowsy");
    }
    other => panic!("unexpected record: {other:?}"),
  }
}

#[test]
fn custom_fatigue_table_is_honoured() {
  let shaper = ResultShaper::new(FatigueClassifier::new(
    vec!["drowsy=sleepy".parse().unwrap()],
    "fine",
  ));
  let pipeline = pipeline(Kind::Fatigue, Box::new(AlwaysDrowsy), shaper);
  let record = shaped(pipeline.message_cycle(&payload(&RgbImage::new(32, 32), ImageFormat::Png)));
  assert!(matches!(record, ResultRecord::Fatigue { ref status, .. } if status == "sleepy"));
}

#[test]
fn same_payload_gives_identical_serialized_records() {
  let pipeline = pipeline(Kind::Fatigue, Box::new(AlwaysDrowsy), ResultShaper::default());
  let input = payload(&RgbImage::new(64, 64), ImageFormat::Png);
  let a = serde_json::to_string(&shaped(pipeline.message_cycle(&input))).unwrap();
  let b = serde_json::to_string(&shaped(pipeline.message_cycle(&input))).unwrap();
  assert_eq!(a, b);
}

#[test]
fn malformed_payloads_are_skipped_without_panicking() {
  let pipeline = pipeline(
    Kind::Crowd,
    Box::new(Scripted(Vec::new())),
    ResultShaper::default(),
  );
  for bad in [
    &b"not json"[..],
    &b"\"%%%\""[..],
    &b"{\"frame\": \"aGVsbG8=\"}"[..],
    &b"{\"other\": 1}"[..],
  ] {
    assert!(matches!(
      pipeline.message_cycle(bad),
      CycleOutcome::Skipped(SkipReason::Decode(_))
    ));
  }
}

#[tokio::test]
async fn failed_kind_drops_frames_while_other_kind_publishes() {
  let crowd_sink = Arc::new(Collect::default());
  let fatigue_sink = Arc::new(Collect::default());
  let crowd = pipeline(
    Kind::Crowd,
    Box::new(Scripted(Vec::new())),
    ResultShaper::default(),
  );
  let fatigue = Arc::new(
    Pipeline::new(Kind::Fatigue, Annotator::new(), ResultShaper::default()).with_handle(Err(
      InitializationError::ModelNotFound("/missing/fatigue.onnx".into()),
    )),
  );
  let crowd_route = Route {
    input_topic: "mqtt-crowd-frame".to_string(),
    kind: Kind::Crowd,
    sinks: vec![crowd_sink.clone() as Arc<dyn RecordSink>],
  };
  let fatigue_route = Route {
    input_topic: "mqtt-fatigue-frame".to_string(),
    kind: Kind::Fatigue,
    sinks: vec![fatigue_sink.clone() as Arc<dyn RecordSink>],
  };
  let frame: Arc<[u8]> = Arc::from(payload(&RgbImage::new(16, 16), ImageFormat::Png));
  let limit = Duration::from_secs(5);

  for _ in 0..3 {
    let outcome = process_message(&fatigue_route, &fatigue, frame.clone(), limit).await;
    assert!(matches!(outcome, CycleOutcome::Skipped(SkipReason::Unavailable)));
  }
  let outcome = process_message(&crowd_route, &crowd, frame, limit).await;
  assert!(matches!(outcome, CycleOutcome::Shaped(_)));

  assert!(fatigue_sink.0.lock().unwrap().is_empty());
  assert_eq!(crowd_sink.0.lock().unwrap().len(), 1);
}
