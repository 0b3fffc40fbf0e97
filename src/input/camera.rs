// 该文件是 Yuanwang （远望） 项目的一部分。
// src/input/camera.rs - V4L2 摄像头输入
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

use std::{pin::Pin, str::FromStr, time::Instant};

use image::ImageFormat;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;
use v4l::{
  FourCC,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  prelude::*,
  video::{Capture, capture::Parameters},
};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameError, PixelOrder},
  query_value,
};

#[derive(Error, Debug)]
pub enum CameraError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("无效的配置: {0}")]
  InvalidConfig(String),
  #[error("无法打开设备 {device}: {source}")]
  OpenFailed {
    device: String,
    source: std::io::Error,
  },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("设备不支持请求的像素格式 {0}")]
  UnsupportedFormat(String),
  #[error("MJPG 解码失败: {0}")]
  DecodeError(#[from] image::ImageError),
  #[error("帧数据错误: {0}")]
  FrameError(#[from] FrameError),
}

/// 摄像头输出的像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFormat {
  Yuyv,
  Mjpg,
}

impl CameraFormat {
  fn fourcc(self) -> FourCC {
    match self {
      CameraFormat::Yuyv => FourCC::new(b"YUYV"),
      CameraFormat::Mjpg => FourCC::new(b"MJPG"),
    }
  }
}

impl FromStr for CameraFormat {
  type Err = CameraError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "YUYV" => Ok(CameraFormat::Yuyv),
      "MJPG" | "MJPEG" => Ok(CameraFormat::Mjpg),
      other => Err(CameraError::UnsupportedFormat(other.to_string())),
    }
  }
}

/// `v4l2:///dev/video1?width=1856&height=800&fps=30&format=YUYV`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
  pub device: String,
  pub width: u32,
  pub height: u32,
  pub fps: Option<u32>,
  pub format: CameraFormat,
}

impl Default for CameraConfig {
  fn default() -> Self {
    Self {
      device: "/dev/video0".into(),
      width: 640,
      height: 480,
      fps: None,
      format: CameraFormat::Yuyv,
    }
  }
}

impl FromUrlWithScheme for CameraConfig {
  const SCHEME: &'static str = "v4l2";
}

impl FromUrl for CameraConfig {
  type Error = CameraError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CameraError::SchemeMismatch);
    }
    let default = Self::default();
    let device = match url.path() {
      "" | "/" => default.device,
      path => path.to_string(),
    };
    let width = query_value::<u32>(url, "width").map_err(CameraError::InvalidConfig)?;
    let height = query_value::<u32>(url, "height").map_err(CameraError::InvalidConfig)?;
    let fps = query_value::<u32>(url, "fps").map_err(CameraError::InvalidConfig)?;
    let format = query_value::<String>(url, "format")
      .map_err(CameraError::InvalidConfig)?
      .map(|f| f.parse())
      .transpose()?;

    Ok(Self {
      device,
      width: width.unwrap_or(default.width),
      height: height.unwrap_or(default.height),
      fps: fps.filter(|&f| f > 0),
      format: format.unwrap_or(default.format),
    })
  }
}

impl CameraConfig {
  /// 设备可以写成路径，也可以只写编号
  pub fn with_device(mut self, device: &str) -> Self {
    self.device = match device.parse::<u32>() {
      Ok(index) => format!("/dev/video{}", index),
      Err(_) => device.to_string(),
    };
    self
  }

  pub fn with_size(mut self, width: u32, height: u32) -> Self {
    self.width = width;
    self.height = height;
    self
  }

  pub fn with_fps(mut self, fps: Option<u32>) -> Self {
    self.fps = fps.filter(|&f| f > 0);
    self
  }

  /// 打开设备并开始采集；设备无法打开属于致命错误
  pub fn open(self) -> Result<CameraInput, CameraError> {
    let device = Device::with_path(&self.device).map_err(|source| CameraError::OpenFailed {
      device: self.device.clone(),
      source,
    })?;
    let device = Box::pin(device);

    let mut format = device.format()?;
    format.width = self.width;
    format.height = self.height;
    format.fourcc = self.format.fourcc();
    let format = device.set_format(&format)?;
    if format.fourcc != self.format.fourcc() {
      return Err(CameraError::UnsupportedFormat(format.fourcc.to_string()));
    }
    if format.width != self.width || format.height != self.height {
      warn!(
        "设备 {} 不支持 {}x{}，实际使用 {}x{}",
        self.device, self.width, self.height, format.width, format.height
      );
    }

    if let Some(fps) = self.fps {
      let params = device.set_params(&Parameters::with_fps(fps))?;
      info!(
        "设备 {} 帧间隔: {}/{} 秒",
        self.device, params.interval.numerator, params.interval.denominator
      );
    }

    let mut input = CameraInput {
      device,
      stream: None,
      path: self.device,
      width: format.width,
      height: format.height,
      format: self.format,
      started: Instant::now(),
    };

    // SAFETY: device 被 Pin<Box> 固定在堆上不会移动；stream 与 device 存放在同一结构体，
    // Drop 时先取出 stream，引用不会悬垂
    let device_ref: &Device = &input.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, 4)?
    };
    input.stream = Some(stream);

    info!(
      "已打开摄像头 {} ({}x{}, {:?})",
      input.path, input.width, input.height, input.format
    );
    Ok(input)
  }
}

/// V4L2 摄像头帧源，每次 `next` 阻塞到驱动交付下一帧
pub struct CameraInput {
  device: Pin<Box<Device>>,
  stream: Option<Stream<'static>>,
  path: String,
  width: u32,
  height: u32,
  format: CameraFormat,
  started: Instant,
}

impl CameraInput {
  pub fn device(&self) -> &str {
    &self.path
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  fn convert(&self, buffer: &[u8]) -> Result<Frame, CameraError> {
    let frame = match self.format {
      CameraFormat::Yuyv => Frame::new(
        self.width,
        self.height,
        PixelOrder::Rgb,
        yuyv_to_rgb(buffer),
      )?,
      CameraFormat::Mjpg => {
        Frame::from(image::load_from_memory_with_format(buffer, ImageFormat::Jpeg)?.to_rgb8())
      }
    };
    Ok(frame.with_timestamp(self.started.elapsed()))
  }
}

impl Drop for CameraInput {
  fn drop(&mut self) {
    self.stream.take();
  }
}

impl Iterator for CameraInput {
  type Item = Result<Frame, CameraError>;

  fn next(&mut self) -> Option<Self::Item> {
    let stream = self.stream.as_mut()?;
    let buffer = match stream.next() {
      Ok((buffer, meta)) => {
        let used = (meta.bytesused as usize).min(buffer.len());
        let used = if used == 0 { buffer.len() } else { used };
        buffer[..used].to_vec()
      }
      Err(e) => return Some(Err(CameraError::IoError(e))),
    };
    Some(self.convert(&buffer))
  }
}

/// YUYV 4:2:2 转 RGB，每 4 字节给出两个像素
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
  fn pixel(y: f32, u: f32, v: f32) -> [u8; 3] {
    [
      (y + 1.402 * v).clamp(0.0, 255.0) as u8,
      (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8,
      (y + 1.772 * u).clamp(0.0, 255.0) as u8,
    ]
  }

  let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);
  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    rgb.extend_from_slice(&pixel(chunk[0] as f32, u, v));
    rgb.extend_from_slice(&pixel(chunk[2] as f32, u, v));
  }
  rgb
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn config_from_url() {
    let url = Url::parse("v4l2:///dev/video1?width=1856&height=800&fps=30&format=mjpg").unwrap();
    let config = CameraConfig::from_url(&url).unwrap();
    assert_eq!(config.device, "/dev/video1");
    assert_eq!((config.width, config.height), (1856, 800));
    assert_eq!(config.fps, Some(30));
    assert_eq!(config.format, CameraFormat::Mjpg);

    let url = Url::parse("v4l2://").unwrap();
    assert_eq!(CameraConfig::from_url(&url).unwrap(), CameraConfig::default());
  }

  #[test]
  fn device_index_expands_to_path() {
    assert_eq!(CameraConfig::default().with_device("1").device, "/dev/video1");
    assert_eq!(
      CameraConfig::default().with_device("/dev/cam").device,
      "/dev/cam"
    );
  }

  #[test]
  fn yuyv_gray_converts_to_gray() {
    let rgb = yuyv_to_rgb(&[128, 128, 64, 128]);
    assert_eq!(rgb, vec![128, 128, 128, 64, 64, 64]);
  }

  #[test]
  fn unsupported_format_is_rejected() {
    assert!("H264".parse::<CameraFormat>().is_err());
  }
}
