// 该文件是 Jianshi （监视） 项目的一部分。
// src/server.rs - MJPEG 视频流服务
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

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
  Json, Router,
  body::Body,
  extract::{Path, State},
  http::{StatusCode, header},
  response::{IntoResponse, Response},
  routing::get,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::{
  dispatch::{Dispatcher, Kind, PipelineState},
  input::SharedCamera,
  output::mjpeg::{self, FrameChunks},
};

/// 相机线程与响应体之间的缓冲帧数
pub const STREAM_CHANNEL_CAPACITY: usize = 2;

#[derive(Clone)]
pub struct AppState {
  pub dispatcher: Arc<Dispatcher>,
  pub camera: Arc<SharedCamera>,
  pub jpeg_quality: u8,
}

impl AppState {
  pub fn new(dispatcher: Arc<Dispatcher>, camera: Arc<SharedCamera>) -> Self {
    Self {
      dispatcher,
      camera,
      jpeg_quality: mjpeg::DEFAULT_JPEG_QUALITY,
    }
  }
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/video_feed", get(crowd_feed))
    .route("/video_feed/:kind", get(kind_feed))
    .route("/healthz", get(health_check))
    .with_state(state)
}

async fn crowd_feed(State(state): State<AppState>) -> Response {
  video_feed(state, Kind::Crowd)
}

async fn kind_feed(State(state): State<AppState>, Path(kind): Path<String>) -> Response {
  match kind.parse::<Kind>() {
    Ok(kind) => video_feed(state, kind),
    Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
  }
}

#[derive(Serialize)]
struct HealthResponse {
  status: &'static str,
  crowd: PipelineState,
  fatigue: PipelineState,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
  let dispatcher = &state.dispatcher;
  Json(HealthResponse {
    status: "ok",
    crowd: dispatcher.pipeline(Kind::Crowd).state(),
    fatigue: dispatcher.pipeline(Kind::Fatigue).state(),
  })
}

fn multipart(body: Body) -> Response {
  ([(header::CONTENT_TYPE, mjpeg::CONTENT_TYPE)], body).into_response()
}

/// 检测器不可用时返回空的 multipart 响应，不打开摄像头
fn video_feed(state: AppState, kind: Kind) -> Response {
  let pipeline = Arc::clone(state.dispatcher.pipeline(kind));
  if !pipeline.is_ready() {
    pipeline.note_unavailable();
    return multipart(Body::empty());
  }

  let (tx, mut rx) = mpsc::channel::<Vec<u8>>(STREAM_CHANNEL_CAPACITY);
  let camera = state.camera;
  let quality = state.jpeg_quality;

  // 相机读取与推理都是阻塞操作
  tokio::task::spawn_blocking(move || {
    let lease = match camera.lease() {
      Ok(lease) => lease,
      Err(e) => {
        error!(kind = %kind, "无法打开摄像头: {}", e);
        return;
      }
    };
    info!(kind = %kind, "开始推送视频流");
    for chunk in FrameChunks::new(lease, pipeline, quality) {
      if tx.blocking_send(chunk).is_err() {
        debug!(kind = %kind, "客户端已断开");
        break;
      }
    }
  });

  let stream = async_stream::stream! {
    while let Some(chunk) = rx.recv().await {
      yield Ok::<_, Infallible>(chunk);
    }
  };
  multipart(Body::from_stream(stream))
}
