// 该文件是 Jianshi （监视） 项目的一部分。
// src/input.rs - 摄像头输入
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

use std::sync::{Arc, Mutex};

use image::RgbImage;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::decode::DecodeError;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "v4l_camera")]
mod v4l_input;
#[cfg(feature = "v4l_camera")]
pub use self::v4l_input::{V4lInput, V4lInputError};

/// 一次读取一帧的画面来源
pub trait CameraSource: Send {
  /// `Ok(None)` 表示设备已关闭，不会再有画面
  fn read_frame(&mut self) -> Result<Option<RgbImage>, DecodeError>;
}

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "v4l_camera")]
  #[error("V4L 输入错误: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[error("不支持的摄像头方案: {0}")]
  SchemeMismatch(String),
  #[error("摄像头状态锁已损坏")]
  Poisoned,
}

/// 按 URL 方案打开摄像头
pub fn open_camera(url: &Url) -> Result<Box<dyn CameraSource>, InputError> {
  #[cfg(feature = "v4l_camera")]
  {
    use crate::{FromUrl, FromUrlWithScheme};

    if url.scheme() == V4lInput::SCHEME {
      return Ok(Box::new(V4lInput::from_url(url)?));
    }
  }
  #[cfg(feature = "read_image_file")]
  {
    use crate::{FromUrl, FromUrlWithScheme};

    if url.scheme() == ImageFileInput::SCHEME {
      return Ok(Box::new(ImageFileInput::from_url(url)?));
    }
  }
  Err(InputError::SchemeMismatch(url.scheme().to_string()))
}

/// 摄像头编号对应的设备 URL
pub fn camera_url_for_index(camera_id: u32) -> Result<Url, url::ParseError> {
  Url::parse(&format!("v4l:///dev/video{camera_id}"))
}

type Opener = Box<dyn Fn() -> Result<Box<dyn CameraSource>, InputError> + Send + Sync>;

struct CameraSlot {
  camera: Option<Box<dyn CameraSource>>,
  leases: usize,
}

/// 多个视频流共享的摄像头，同一时刻只有一个读者；最后一个租约释放时关闭设备
pub struct SharedCamera {
  slot: Mutex<CameraSlot>,
  opener: Opener,
}

impl SharedCamera {
  pub fn new<F>(opener: F) -> Self
  where
    F: Fn() -> Result<Box<dyn CameraSource>, InputError> + Send + Sync + 'static,
  {
    Self {
      slot: Mutex::new(CameraSlot {
        camera: None,
        leases: 0,
      }),
      opener: Box::new(opener),
    }
  }

  pub fn from_url(url: Url) -> Self {
    Self::new(move || open_camera(&url))
  }

  /// 取得租约，必要时打开设备
  pub fn lease(self: &Arc<Self>) -> Result<CameraLease, InputError> {
    let mut slot = self.slot.lock().map_err(|_| InputError::Poisoned)?;
    if slot.camera.is_none() {
      let camera = (self.opener)()?;
      info!("摄像头已打开");
      slot.camera = Some(camera);
    }
    slot.leases += 1;
    Ok(CameraLease {
      camera: Arc::clone(self),
    })
  }

  pub fn is_open(&self) -> bool {
    self
      .slot
      .lock()
      .map(|slot| slot.camera.is_some())
      .unwrap_or(false)
  }

  pub fn leases(&self) -> usize {
    self.slot.lock().map(|slot| slot.leases).unwrap_or(0)
  }
}

/// 摄像头租约，读取在共享锁内串行进行
pub struct CameraLease {
  camera: Arc<SharedCamera>,
}

impl CameraLease {
  pub fn read(&self) -> Result<Option<RgbImage>, DecodeError> {
    let mut slot = self
      .camera
      .slot
      .lock()
      .map_err(|_| DecodeError::Camera("摄像头状态锁已损坏".to_string()))?;
    match slot.camera.as_mut() {
      Some(camera) => camera.read_frame(),
      None => Ok(None),
    }
  }
}

impl Drop for CameraLease {
  fn drop(&mut self) {
    let Ok(mut slot) = self.camera.slot.lock() else {
      warn!("摄像头状态锁已损坏，无法释放租约");
      return;
    };
    slot.leases = slot.leases.saturating_sub(1);
    if slot.leases == 0 && slot.camera.take().is_some() {
      info!("摄像头已释放");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Counting(u32);

  impl CameraSource for Counting {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, DecodeError> {
      if self.0 == 0 {
        return Ok(None);
      }
      self.0 -= 1;
      Ok(Some(RgbImage::new(4, 4)))
    }
  }

  #[test]
  fn camera_opens_once_and_closes_with_last_lease() {
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&opened);
    let shared = Arc::new(SharedCamera::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(Box::new(Counting(2)) as Box<dyn CameraSource>)
    }));

    let first = shared.lease().unwrap();
    let second = shared.lease().unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(shared.leases(), 2);

    assert!(first.read().unwrap().is_some());
    assert!(second.read().unwrap().is_some());
    assert!(first.read().unwrap().is_none());

    drop(first);
    assert!(shared.is_open());
    drop(second);
    assert!(!shared.is_open());

    let _third = shared.lease().unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn failed_open_does_not_take_a_lease() {
    let shared = Arc::new(SharedCamera::new(|| {
      Err(InputError::SchemeMismatch("rtsp".to_string()))
    }));
    assert!(shared.lease().is_err());
    assert_eq!(shared.leases(), 0);
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://camera.local/stream").unwrap();
    assert!(matches!(
      open_camera(&url),
      Err(InputError::SchemeMismatch(scheme)) if scheme == "rtsp"
    ));
  }

  #[test]
  fn camera_index_maps_to_device_path() {
    assert_eq!(camera_url_for_index(2).unwrap().path(), "/dev/video2");
  }

  #[cfg(feature = "v4l_camera")]
  #[test]
  fn default_camera_url_is_opened_by_v4l_input() {
    let url = camera_url_for_index(99).unwrap();
    assert!(matches!(open_camera(&url), Err(InputError::V4lInputError(_))));
  }
}
