// 该文件是 Yuanwang （远望） 项目的一部分。
// src/input.rs - 帧源
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

use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, transport::TransportError};

#[cfg(feature = "camera_v4l2")]
mod camera;
mod image_file;
mod remote;

#[cfg(feature = "camera_v4l2")]
pub use self::camera::{CameraConfig, CameraError, CameraFormat, CameraInput};
pub use self::image_file::{ImageFileInput, ImageFileInputError};
pub use self::remote::RemoteInput;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("远程帧源错误: {0}")]
  TransportError(#[from] TransportError),
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "camera_v4l2")]
  #[error("摄像头输入错误: {0}")]
  CameraError(#[from] CameraError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

/// 按 URL scheme 选择的帧源
///
/// - `tcp://` 远程帧服务
/// - `image://` 静态图像文件
/// - `v4l2://` 本地摄像头（需要 `camera_v4l2` 特性）
pub enum InputWrapper {
  Remote(RemoteInput),
  ImageFile(ImageFileInput),
  #[cfg(feature = "camera_v4l2")]
  Camera(CameraInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() == RemoteInput::SCHEME {
      return Ok(InputWrapper::Remote(RemoteInput::from_url(url)?));
    }
    if url.scheme() == ImageFileInput::SCHEME {
      return Ok(InputWrapper::ImageFile(ImageFileInput::from_url(url)?));
    }
    #[cfg(feature = "camera_v4l2")]
    {
      if url.scheme() == CameraConfig::SCHEME {
        let input = CameraConfig::from_url(url)?.open()?;
        return Ok(InputWrapper::Camera(input));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl InputWrapper {
  pub fn describe(&self) -> String {
    match self {
      InputWrapper::Remote(input) => format!("remote {}", input.server()),
      InputWrapper::ImageFile(input) => format!("image {}", input.path().display()),
      #[cfg(feature = "camera_v4l2")]
      InputWrapper::Camera(input) => format!("camera {}", input.device()),
    }
  }
}

impl Iterator for InputWrapper {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapper::Remote(input) => input.next().map(|r| r.map_err(InputError::from)),
      InputWrapper::ImageFile(input) => input.next().map(|r| r.map_err(InputError::from)),
      #[cfg(feature = "camera_v4l2")]
      InputWrapper::Camera(input) => input.next().map(|r| r.map_err(InputError::from)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://camera.local/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch)
    ));
  }

  #[test]
  fn remote_scheme_selects_remote_input() {
    let url = Url::parse("tcp://127.0.0.1:25661?name=front").unwrap();
    let input = InputWrapper::from_url(&url).unwrap();
    assert!(matches!(input, InputWrapper::Remote(_)));
    assert_eq!(input.describe(), "remote 127.0.0.1:25661");
  }
}
