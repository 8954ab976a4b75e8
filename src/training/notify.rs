// 该文件是 Jianshi （监视） 项目的一部分。
// src/training/notify.rs - 邮件通知
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

use futures::future::BoxFuture;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::{error, info};

/// 通知与实验记录失败，只记录日志，不影响被报告的操作
#[derive(Error, Debug)]
pub enum NotificationError {
  #[error("邮件地址无效: {0}")]
  Address(#[from] lettre::address::AddressError),
  #[error("邮件构建失败: {0}")]
  Message(#[from] lettre::error::Error),
  #[error("SMTP 发送失败: {0}")]
  Smtp(#[from] lettre::transport::smtp::Error),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
}

pub trait Notifier: Send + Sync {
  fn notify<'a>(&'a self, subject: &'a str, body: &'a str)
  -> BoxFuture<'a, Result<(), NotificationError>>;
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
  pub server: String,
  pub port: u16,
  pub sender_email: String,
  pub sender_password: String,
  pub recipient_email: String,
}

/// STARTTLS 加登录的 SMTP 邮件
pub struct EmailNotifier {
  transport: AsyncSmtpTransport<Tokio1Executor>,
  from: Mailbox,
  to: Mailbox,
}

impl EmailNotifier {
  pub fn new(config: &SmtpConfig) -> Result<Self, NotificationError> {
    let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)?
      .port(config.port)
      .credentials(Credentials::new(
        config.sender_email.clone(),
        config.sender_password.clone(),
      ))
      .build();

    Ok(Self {
      transport,
      from: config.sender_email.parse()?,
      to: config.recipient_email.parse()?,
    })
  }

  pub fn message(&self, subject: &str, body: &str) -> Result<Message, NotificationError> {
    let message = Message::builder()
      .from(self.from.clone())
      .to(self.to.clone())
      .subject(subject)
      .header(ContentType::TEXT_PLAIN)
      .body(body.to_string())?;
    Ok(message)
  }
}

impl Notifier for EmailNotifier {
  fn notify<'a>(
    &'a self,
    subject: &'a str,
    body: &'a str,
  ) -> BoxFuture<'a, Result<(), NotificationError>> {
    Box::pin(async move {
      let message = self.message(subject, body)?;
      self.transport.send(message).await?;
      Ok(())
    })
  }
}

/// 发送通知，失败只记录日志
pub async fn notify_logged(notifier: &dyn Notifier, subject: &str, body: &str) {
  match notifier.notify(subject, body).await {
    Ok(()) => info!("邮件通知已发送: {}", subject),
    Err(e) => error!("邮件通知发送失败 ({}): {}", subject, e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(sender: &str) -> SmtpConfig {
    SmtpConfig {
      server: "smtp.example.com".to_string(),
      port: 587,
      sender_email: sender.to_string(),
      sender_password: "secret".to_string(),
      recipient_email: "ops@example.com".to_string(),
    }
  }

  #[tokio::test]
  async fn message_has_subject_and_plain_text_body() {
    let notifier = EmailNotifier::new(&config("trainer@example.com")).unwrap();
    let message = notifier.message("YOLO Training Error", "boom").unwrap();
    let raw = String::from_utf8(message.formatted()).unwrap();
    assert!(raw.contains("Subject: YOLO Training Error"));
    assert!(raw.contains("text/plain"));
    assert!(raw.contains("boom"));
  }

  #[tokio::test]
  async fn invalid_sender_is_rejected() {
    assert!(matches!(
      EmailNotifier::new(&config("not an address")),
      Err(NotificationError::Address(_))
    ));
  }
}
