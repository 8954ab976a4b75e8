// 该文件是 Jianshi （监视） 项目的一部分。
// src/bin/mqtt_bridge.rs - MQTT 检测消息桥
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
  args::{DetectorArgs, MqttArgs},
  bridge::Bridge,
  dispatch::Dispatcher,
};

/// 订阅帧主题并发布人群与疲劳检测结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  #[command(flatten)]
  detector: DetectorArgs,
  #[command(flatten)]
  mqtt: MqttArgs,
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
  let options = args.mqtt.bridge_options().context("MQTT 代理地址无效")?;
  info!("MQTT 代理: {}:{}", options.broker_host, options.broker_port);
  info!("队列长度: {}，推理超时: {:?}", options.queue_capacity, options.inference_timeout);

  let (crowd, fatigue) = args.detector.pipeline_configs()?;
  let dispatcher = Arc::new(Dispatcher::initialize(crowd, fatigue).await);

  Bridge::new(options, dispatcher)
    .run(shutdown_signal())
    .await;
  Ok(())
}
