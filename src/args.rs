// 该文件是 Jianshi （监视） 项目的一部分。
// src/args.rs - 项目参数配置
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

//! 各个程序共用的参数，均可通过环境变量设置。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use url::Url;

use crate::{
  bridge::{BridgeOptions, DEFAULT_QUEUE_CAPACITY},
  dispatch::PipelineConfig,
  input::camera_url_for_index,
  model::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_NMS_THRESHOLD},
  output::{
    Annotator, AnnotatorError, FatigueClassifier, FatigueRule, ResultShaper, Zone,
    mjpeg::DEFAULT_JPEG_QUALITY, summary::DEFAULT_FATIGUE_STATUS,
  },
  training::{SmtpConfig, TrainingParams},
};

/// 检测器参数
#[derive(Args, Debug, Clone)]
pub struct DetectorArgs {
  /// 人群检测模型，例如 onnx:///opt/jianshi/models/crowd.onnx
  #[arg(
    long,
    env = "CROWD_MODEL",
    value_name = "MODEL",
    default_value = "onnx:///opt/jianshi/models/crowd.onnx"
  )]
  pub crowd_model: Url,

  /// 疲劳检测模型
  #[arg(
    long,
    env = "FATIGUE_MODEL",
    value_name = "MODEL",
    default_value = "onnx:///opt/jianshi/models/fatigue.onnx"
  )]
  pub fatigue_model: Url,

  /// 置信度阈值 (0.0 - 1.0)，严格大于才保留
  #[arg(long, env = "CONFIDENCE_THRESHOLD", default_value_t = DEFAULT_CONFIDENCE_THRESHOLD, value_name = "THRESHOLD")]
  pub confidence_threshold: f32,

  /// 疲劳检测的置信度阈值，缺省与人群检测相同
  #[arg(long, env = "FATIGUE_CONFIDENCE_THRESHOLD", value_name = "THRESHOLD")]
  pub fatigue_confidence_threshold: Option<f32>,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, env = "NMS_THRESHOLD", default_value_t = DEFAULT_NMS_THRESHOLD, value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 标签字体（TrueType），不设置时使用内置字体
  #[arg(long, env = "FONT_PATH", value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 人群计数区域，归一化顶点 `x,y;x,y;x,y`，缺省为整个画面
  #[arg(long, env = "ZONE", value_name = "POINTS", value_parser = parse_zone)]
  pub zone: Option<Zone>,

  /// 疲劳状态规则 `label=status`，按顺序匹配
  #[arg(
    long = "fatigue-rule",
    env = "FATIGUE_RULES",
    value_name = "RULE",
    value_delimiter = ','
  )]
  pub fatigue_rules: Vec<FatigueRule>,

  /// 没有规则匹配时的疲劳状态
  #[arg(long, env = "FATIGUE_DEFAULT_STATUS", default_value = DEFAULT_FATIGUE_STATUS)]
  pub fatigue_default_status: String,
}

impl DetectorArgs {
  /// 疲劳检测只绘制检测框与标签
  pub fn annotator(&self) -> Result<Annotator, AnnotatorError> {
    match &self.font {
      Some(font) => Annotator::new().with_font_file(font),
      None => Ok(Annotator::new()),
    }
  }

  /// 人群检测另外绘制计数区域
  pub fn crowd_annotator(&self) -> Result<Annotator, AnnotatorError> {
    let zone = self.zone.clone().unwrap_or_else(Zone::full_frame);
    Ok(self.annotator()?.with_zone(zone))
  }

  pub fn shaper(&self) -> ResultShaper {
    if self.fatigue_rules.is_empty() {
      return ResultShaper::default();
    }
    ResultShaper::new(FatigueClassifier::new(
      self.fatigue_rules.clone(),
      self.fatigue_default_status.clone(),
    ))
  }

  /// 人群与疲劳两条流水线的配置
  pub fn pipeline_configs(&self) -> Result<(PipelineConfig, PipelineConfig), AnnotatorError> {
    let annotator = self.annotator()?;
    let crowd_annotator = self.crowd_annotator()?;
    let shaper = self.shaper();
    let crowd = PipelineConfig {
      model: self.crowd_model.clone(),
      confidence_threshold: self.confidence_threshold,
      nms_threshold: self.nms_threshold,
      annotator: crowd_annotator,
      shaper: shaper.clone(),
    };
    let fatigue = PipelineConfig {
      model: self.fatigue_model.clone(),
      confidence_threshold: self
        .fatigue_confidence_threshold
        .unwrap_or(self.confidence_threshold),
      nms_threshold: self.nms_threshold,
      annotator,
      shaper,
    };
    Ok((crowd, fatigue))
  }
}

fn parse_zone(raw: &str) -> Result<Zone, String> {
  let points = raw
    .split(';')
    .filter(|p| !p.trim().is_empty())
    .map(|point| {
      let (x, y) = point
        .split_once(',')
        .ok_or_else(|| format!("顶点格式应为 x,y: {point}"))?;
      let x: f32 = x.trim().parse().map_err(|e| format!("{x}: {e}"))?;
      let y: f32 = y.trim().parse().map_err(|e| format!("{y}: {e}"))?;
      Ok([x, y])
    })
    .collect::<Result<Vec<_>, String>>()?;
  Zone::from_normalized(points).ok_or_else(|| "区域至少需要三个顶点".to_string())
}

/// 摄像头参数
#[derive(Args, Debug, Clone)]
pub struct CameraArgs {
  /// 摄像头编号，对应 /dev/videoN
  #[arg(long, env = "CAMERA_ID", default_value_t = 0)]
  pub camera_id: u32,

  /// 摄像头 URL，设置后忽略编号，例如 image:///tmp/frame.jpg?fps=5
  #[arg(long, env = "CAMERA_URL", value_name = "SOURCE")]
  pub camera_url: Option<Url>,
}

impl CameraArgs {
  pub fn source(&self) -> Result<Url, url::ParseError> {
    match &self.camera_url {
      Some(url) => Ok(url.clone()),
      None => camera_url_for_index(self.camera_id),
    }
  }
}

/// HTTP 服务参数
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
  /// 监听地址
  #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:5000")]
  pub bind: SocketAddr,

  /// JPEG 质量 (1 - 100)
  #[arg(long, env = "JPEG_QUALITY", default_value_t = DEFAULT_JPEG_QUALITY, value_parser = clap::value_parser!(u8).range(1..=100))]
  pub jpeg_quality: u8,
}

/// MQTT 参数
#[derive(Args, Debug, Clone)]
pub struct MqttArgs {
  /// MQTT 代理地址，主机名或 mqtt://host:port
  #[arg(long, env = "MQTT_BROKER_URL", default_value = "localhost")]
  pub mqtt_broker_url: String,

  /// MQTT 代理端口，URL 中带端口时以 URL 为准
  #[arg(long, env = "MQTT_BROKER_PORT", default_value_t = 1883)]
  pub mqtt_broker_port: u16,

  /// 客户端标识
  #[arg(long, env = "MQTT_CLIENT_ID")]
  pub mqtt_client_id: Option<String>,

  /// 每个订阅主题的队列长度，满时丢弃最旧的帧
  #[arg(long, env = "MQTT_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
  pub queue_capacity: usize,

  /// 单帧推理超时（秒）
  #[arg(long, env = "INFERENCE_TIMEOUT", default_value_t = 10)]
  pub inference_timeout: u64,
}

impl MqttArgs {
  pub fn broker(&self) -> Result<(String, u16), url::ParseError> {
    if !self.mqtt_broker_url.contains("://") {
      return Ok((self.mqtt_broker_url.clone(), self.mqtt_broker_port));
    }
    let url = Url::parse(&self.mqtt_broker_url)?;
    let host = url
      .host_str()
      .ok_or(url::ParseError::EmptyHost)?
      .to_string();
    Ok((host, url.port().unwrap_or(self.mqtt_broker_port)))
  }

  pub fn bridge_options(&self) -> Result<BridgeOptions, url::ParseError> {
    let (host, port) = self.broker()?;
    let mut options = BridgeOptions::new(host, port);
    if let Some(client_id) = &self.mqtt_client_id {
      options.client_id = client_id.clone();
    }
    options.queue_capacity = self.queue_capacity;
    options.inference_timeout = Duration::from_secs(self.inference_timeout);
    Ok(options)
  }
}

/// 训练调度参数
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
  #[arg(long, env = "SMTP_SERVER", default_value = "smtp.gmail.com")]
  pub smtp_server: String,

  #[arg(long, env = "SMTP_PORT", default_value_t = 587)]
  pub smtp_port: u16,

  #[arg(long, env = "SENDER_EMAIL")]
  pub sender_email: String,

  #[arg(long, env = "SENDER_PASSWORD", hide_env_values = true)]
  pub sender_password: String,

  #[arg(long, env = "RECIPIENT_EMAIL")]
  pub recipient_email: String,

  /// 初始模型
  #[arg(long, env = "MODEL_PATH", default_value = "yolov11.pt")]
  pub model_path: PathBuf,

  /// 数据集配置
  #[arg(long, env = "DATASET_PATH", default_value = "dataset.yaml")]
  pub dataset_path: PathBuf,

  /// 每日训练时间 HH:MM（本地时间）
  #[arg(long, env = "DAILY_TIME", default_value = "02:00")]
  pub daily_time: String,

  /// 每周训练的星期
  #[arg(long, env = "WEEKLY_DAY", default_value = "Monday")]
  pub weekly_day: String,

  /// 每月训练的日期
  #[arg(long, env = "MONTHLY_DATE", default_value_t = 1)]
  pub monthly_date: u32,

  /// 实验名称
  #[arg(long, env = "EXPERIMENT_NAME", default_value = "yolo_automated_training")]
  pub experiment_name: String,

  /// 实验记录目录
  #[arg(long, env = "TRACKING_DIR", default_value = "mlruns")]
  pub tracking_dir: PathBuf,

  /// 训练好的模型保存目录
  #[arg(long, env = "MODEL_SAVE_DIR", default_value = "trained_models")]
  pub model_save_dir: PathBuf,

  /// 训练程序的输出目录
  #[arg(long, env = "RUNS_DIR", default_value = "runs/train")]
  pub runs_dir: PathBuf,

  /// 训练程序
  #[arg(long, env = "TRAINER", default_value = "yolo")]
  pub trainer: String,

  /// 日志文件目录，设置后同时写入 training_log_<时间>.log
  #[arg(long, env = "LOG_DIR", value_name = "DIR")]
  pub log_dir: Option<PathBuf>,
}

impl TrainArgs {
  pub fn smtp(&self) -> SmtpConfig {
    SmtpConfig {
      server: self.smtp_server.clone(),
      port: self.smtp_port,
      sender_email: self.sender_email.clone(),
      sender_password: self.sender_password.clone(),
      recipient_email: self.recipient_email.clone(),
    }
  }

  pub fn params(&self) -> TrainingParams {
    TrainingParams::new(&self.model_path, &self.dataset_path)
  }
}
