// 该文件是 Jianshi （监视） 项目的一部分。
// src/bridge.rs - MQTT 消息桥
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

//! 订阅帧主题，经流水线处理后把结果发布到对应的结果主题。
//!
//! 每个订阅主题一个有界队列，由单独的任务消费；队列满时丢弃最旧的帧。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::future::{BoxFuture, join_all};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::{
  dispatch::{
    CycleOutcome, Dispatcher, Kind, Pipeline, PublishError, RecordSink, SkipReason, publish_all,
    publish_failure_all,
  },
  model::InferenceError,
  output::{AnalysisMessage, KindResultMessage, ResultRecord},
};

pub const CROWD_FRAME_TOPIC: &str = "mqtt-crowd-frame";
pub const CROWD_RESULT_TOPIC: &str = "mqtt-crowd-result";
pub const FATIGUE_FRAME_TOPIC: &str = "mqtt-fatigue-frame";
pub const FATIGUE_RESULT_TOPIC: &str = "mqtt-fatigue-result";
pub const VIDEO_FRAME_TOPIC: &str = "video/frames";
pub const VIDEO_ANALYSIS_TOPIC: &str = "video/analysis";

pub const DEFAULT_QUEUE_CAPACITY: usize = 8;
pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(10);
/// base64 图像帧较大
const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;
const REQUEST_CHANNEL_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Payload = Arc<[u8]>;

/// 结果消息格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
  /// `{"num_people"|"status": .., "detection": [..]}`
  KindResult,
  /// `{"status": "success"|"error", "timestamp": .., ..}`
  Analysis,
}

/// 发布到一个 MQTT 主题
pub struct MqttSink {
  client: AsyncClient,
  topic: String,
  envelope: Envelope,
}

impl MqttSink {
  pub fn new(client: AsyncClient, topic: impl Into<String>, envelope: Envelope) -> Self {
    Self {
      client,
      topic: topic.into(),
      envelope,
    }
  }

  pub fn encode(&self, record: &ResultRecord) -> Result<Vec<u8>, PublishError> {
    let payload = match self.envelope {
      Envelope::KindResult => serde_json::to_vec(&KindResultMessage::from(record))?,
      Envelope::Analysis => serde_json::to_vec(&AnalysisMessage::success(record, Local::now()))?,
    };
    Ok(payload)
  }

  /// 只有 Analysis 格式报告失败
  pub fn encode_failure(&self, reason: &SkipReason) -> Result<Option<Vec<u8>>, PublishError> {
    match self.envelope {
      Envelope::KindResult => Ok(None),
      Envelope::Analysis => {
        let message = AnalysisMessage::error(reason.to_string(), Local::now());
        Ok(Some(serde_json::to_vec(&message)?))
      }
    }
  }

  async fn send(&self, payload: Vec<u8>) -> Result<(), PublishError> {
    self
      .client
      .publish(&self.topic, QoS::AtMostOnce, false, payload)
      .await
      .map_err(|e| PublishError::Client(e.to_string()))
  }
}

impl RecordSink for MqttSink {
  fn name(&self) -> &str {
    &self.topic
  }

  fn publish<'a>(&'a self, record: &'a ResultRecord) -> BoxFuture<'a, Result<(), PublishError>> {
    Box::pin(async move {
      let payload = self.encode(record)?;
      self.send(payload).await
    })
  }

  fn publish_failure<'a>(
    &'a self,
    reason: &'a SkipReason,
  ) -> BoxFuture<'a, Result<(), PublishError>> {
    Box::pin(async move {
      match self.encode_failure(reason)? {
        Some(payload) => self.send(payload).await,
        None => Ok(()),
      }
    })
  }
}

/// 一个订阅主题及其结果去向
pub struct Route {
  pub input_topic: String,
  pub kind: Kind,
  pub sinks: Vec<Arc<dyn RecordSink>>,
}

pub fn default_routes(client: &AsyncClient) -> Vec<Route> {
  let sink = |topic: &str, envelope| -> Vec<Arc<dyn RecordSink>> {
    vec![Arc::new(MqttSink::new(client.clone(), topic, envelope))]
  };
  vec![
    Route {
      input_topic: CROWD_FRAME_TOPIC.to_string(),
      kind: Kind::Crowd,
      sinks: sink(CROWD_RESULT_TOPIC, Envelope::KindResult),
    },
    Route {
      input_topic: FATIGUE_FRAME_TOPIC.to_string(),
      kind: Kind::Fatigue,
      sinks: sink(FATIGUE_RESULT_TOPIC, Envelope::KindResult),
    },
    Route {
      input_topic: VIDEO_FRAME_TOPIC.to_string(),
      kind: Kind::Crowd,
      sinks: sink(VIDEO_ANALYSIS_TOPIC, Envelope::Analysis),
    },
  ]
}

/// 各订阅主题的工作队列
#[derive(Default)]
pub struct Intake {
  queues: HashMap<String, broadcast::Sender<Payload>>,
}

impl Intake {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, topic: &str, capacity: usize) -> broadcast::Receiver<Payload> {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    self.queues.insert(topic.to_string(), tx);
    rx
  }

  pub fn topics(&self) -> Vec<String> {
    self.queues.keys().cloned().collect()
  }

  /// 入队，队列满时覆盖最旧的帧
  pub fn enqueue(&self, topic: &str, payload: Payload) -> bool {
    match self.queues.get(topic) {
      Some(tx) => tx.send(payload).is_ok(),
      None => {
        debug!("忽略未订阅主题的消息: {}", topic);
        false
      }
    }
  }
}

/// 处理一条消息并发布结果
pub async fn process_message(
  route: &Route,
  pipeline: &Arc<Pipeline>,
  payload: Payload,
  limit: Duration,
) -> CycleOutcome {
  if !pipeline.is_ready() {
    pipeline.note_unavailable();
    return CycleOutcome::Skipped(SkipReason::Unavailable);
  }

  // 等待上一次推理结束也计入超时，超时的推理仍占用推理槽
  let worker = Arc::clone(pipeline);
  let slot = pipeline.inference_slot();
  let cycle = async move {
    let permit = slot
      .acquire_owned()
      .await
      .map_err(|e| InferenceError::Runtime(e.to_string()))?;
    tokio::task::spawn_blocking(move || {
      let _permit = permit;
      worker.message_cycle(&payload)
    })
    .await
    .map_err(|e| InferenceError::Runtime(e.to_string()))
  };
  let outcome = match tokio::time::timeout(limit, cycle).await {
    Ok(Ok(outcome)) => outcome,
    Ok(Err(e)) => {
      error!(topic = %route.input_topic, "推理任务异常: {}", e);
      CycleOutcome::Skipped(SkipReason::Inference(e))
    }
    Err(_) => {
      warn!(topic = %route.input_topic, "推理超时 ({:?})，跳过该帧", limit);
      CycleOutcome::Skipped(SkipReason::Timeout)
    }
  };

  match &outcome {
    CycleOutcome::Shaped(record) => {
      publish_all(&route.sinks, record).await;
    }
    CycleOutcome::Skipped(SkipReason::Unavailable) => {}
    CycleOutcome::Skipped(reason) => {
      publish_failure_all(&route.sinks, reason).await;
    }
  }
  outcome
}

/// 消费一个主题的队列，队列关闭后返回已处理的消息数
pub async fn worker(
  route: Arc<Route>,
  pipeline: Arc<Pipeline>,
  mut queue: broadcast::Receiver<Payload>,
  limit: Duration,
) -> u64 {
  let mut processed = 0;
  loop {
    match queue.recv().await {
      Ok(payload) => {
        process_message(&route, &pipeline, payload, limit).await;
        processed += 1;
      }
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        warn!(topic = %route.input_topic, "处理过慢，丢弃最旧的 {} 帧", skipped);
      }
      Err(broadcast::error::RecvError::Closed) => break,
    }
  }
  debug!(topic = %route.input_topic, "工作任务退出，共处理 {} 条消息", processed);
  processed
}

async fn poll_events(
  mut eventloop: EventLoop,
  client: AsyncClient,
  intake: Intake,
  mut stop: watch::Receiver<bool>,
) {
  let topics = intake.topics();
  let mut intake = Some(intake);

  loop {
    tokio::select! {
      _ = stop.changed(), if intake.is_some() => {
        for topic in &topics {
          if let Err(e) = client.try_unsubscribe(topic) {
            warn!("取消订阅 {} 失败: {}", topic, e);
          }
        }
        // 关闭队列，工作任务处理完剩余消息后退出
        intake = None;
        info!("已取消订阅，等待处理中的消息");
      }
      event = eventloop.poll() => match event {
        Ok(Event::Incoming(Packet::ConnAck(_))) => {
          info!("已连接到 MQTT 代理");
          if intake.is_some() {
            for topic in &topics {
              match client.try_subscribe(topic, QoS::AtMostOnce) {
                Ok(()) => info!("订阅主题: {}", topic),
                Err(e) => error!("订阅 {} 失败: {}", topic, e),
              }
            }
          }
        }
        Ok(Event::Incoming(Packet::Publish(publish))) => {
          if let Some(intake) = &intake {
            intake.enqueue(&publish.topic, Arc::from(publish.payload.as_ref()));
          }
        }
        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
          info!("已断开 MQTT 连接");
          break;
        }
        Ok(_) => {}
        Err(e) => {
          warn!("MQTT 连接错误: {}，稍后重连", e);
          tokio::time::sleep(RECONNECT_DELAY).await;
        }
      }
    }
  }
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
  pub broker_host: String,
  pub broker_port: u16,
  pub client_id: String,
  pub keep_alive: Duration,
  pub queue_capacity: usize,
  pub inference_timeout: Duration,
}

impl BridgeOptions {
  pub fn new(broker_host: impl Into<String>, broker_port: u16) -> Self {
    Self {
      broker_host: broker_host.into(),
      broker_port,
      client_id: format!("jianshi-bridge-{}", std::process::id()),
      keep_alive: Duration::from_secs(30),
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
    }
  }
}

pub struct Bridge {
  client: AsyncClient,
  eventloop: EventLoop,
  routes: Vec<Route>,
  dispatcher: Arc<Dispatcher>,
  options: BridgeOptions,
}

impl Bridge {
  pub fn new(options: BridgeOptions, dispatcher: Arc<Dispatcher>) -> Self {
    let mut mqtt = MqttOptions::new(
      options.client_id.clone(),
      options.broker_host.clone(),
      options.broker_port,
    );
    mqtt.set_keep_alive(options.keep_alive);
    mqtt.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_CHANNEL_CAPACITY);
    let routes = default_routes(&client);
    Self {
      client,
      eventloop,
      routes,
      dispatcher,
      options,
    }
  }

  pub fn client(&self) -> &AsyncClient {
    &self.client
  }

  /// 运行到 `shutdown` 完成；停止时取消订阅并等待处理中的消息
  pub async fn run<F>(self, shutdown: F)
  where
    F: Future<Output = ()>,
  {
    let Bridge {
      client,
      eventloop,
      routes,
      dispatcher,
      options,
    } = self;
    info!(
      "连接 MQTT 代理 {}:{}",
      options.broker_host, options.broker_port
    );

    let mut intake = Intake::new();
    let mut workers = Vec::with_capacity(routes.len());
    for route in routes {
      let queue = intake.register(&route.input_topic, options.queue_capacity);
      let pipeline = Arc::clone(dispatcher.pipeline(route.kind));
      workers.push(tokio::spawn(worker(
        Arc::new(route),
        pipeline,
        queue,
        options.inference_timeout,
      )));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = tokio::spawn(poll_events(eventloop, client.clone(), intake, stop_rx));

    shutdown.await;
    info!("停止消息桥");
    let _ = stop_tx.send(true);

    let drain = options.inference_timeout + DISCONNECT_TIMEOUT;
    if tokio::time::timeout(drain, join_all(workers)).await.is_err() {
      warn!("等待处理中的消息超时");
    }

    if let Err(e) = client.disconnect().await {
      warn!("断开 MQTT 连接失败: {}", e);
    }
    match tokio::time::timeout(DISCONNECT_TIMEOUT, poller).await {
      Ok(_) => info!("消息桥已停止"),
      Err(_) => warn!("等待 MQTT 断开超时"),
    }
  }
}
