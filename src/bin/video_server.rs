// 该文件是 Jianshi （监视） 项目的一部分。
// src/bin/video_server.rs - MJPEG 视频流服务
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

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jianshi::{
  args::{CameraArgs, DetectorArgs, ServerArgs},
  dispatch::Dispatcher,
  input::SharedCamera,
  server::{AppState, router},
};

/// 人群与疲劳检测的 MJPEG 视频流服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  #[command(flatten)]
  detector: DetectorArgs,
  #[command(flatten)]
  camera: CameraArgs,
  #[command(flatten)]
  server: ServerArgs,
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("无法监听停止信号: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到停止信号");
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  let source = args.camera.source().context("摄像头地址无效")?;
  info!("人群检测模型: {}", args.detector.crowd_model);
  info!("疲劳检测模型: {}", args.detector.fatigue_model);
  info!("摄像头: {}", source);
  info!("置信度阈值: {}", args.detector.confidence_threshold);

  let (crowd, fatigue) = args.detector.pipeline_configs()?;
  let dispatcher = Arc::new(Dispatcher::initialize(crowd, fatigue).await);
  let camera = Arc::new(SharedCamera::from_url(source));

  let mut state = AppState::new(dispatcher, camera);
  state.jpeg_quality = args.server.jpeg_quality;

  let listener = tokio::net::TcpListener::bind(args.server.bind)
    .await
    .with_context(|| format!("无法监听 {}", args.server.bind))?;
  info!("视频流服务已启动: http://{}/video_feed", args.server.bind);

  // 视频流不会自行结束，收到信号后直接退出
  tokio::select! {
    result = axum::serve(listener, router(state)) => result?,
    _ = shutdown_signal() => {}
  }
  info!("视频流服务已停止");
  Ok(())
}
