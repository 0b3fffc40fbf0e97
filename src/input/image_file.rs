// 该文件是 Yuanwang （远望） 项目的一部分。
// src/input/image_file.rs - 图像文件输入
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

use std::{
  path::{Path, PathBuf},
  thread,
  time::{Duration, Instant},
};

use image::ImageReader;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, query_flag, query_value};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("无效的配置: {0}")]
  InvalidConfig(String),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 静态图像帧源：`image:///path/to/file.jpg?repeat&interval_ms=33`
///
/// 默认只产生一帧；`repeat` 打开后无限重复同一帧，`interval_ms` 控制帧间隔，
/// 用来在没有摄像头的环境下模拟采集。
pub struct ImageFileInput {
  path: PathBuf,
  frame: Frame,
  repeat: bool,
  interval: Duration,
  emitted: u64,
  started: Instant,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let interval_ms =
      query_value::<u64>(url, "interval_ms").map_err(ImageFileInputError::InvalidConfig)?;
    Ok(
      Self::open(url.path())?
        .with_repeat(query_flag(url, "repeat"))
        .with_interval(Duration::from_millis(interval_ms.unwrap_or(0))),
    )
  }
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref().to_path_buf();
    let image = ImageReader::open(&path)?.with_guessed_format()?.decode()?;
    let frame = Frame::from(image.to_rgb8());
    info!(
      "已加载图像 {} ({}x{})",
      path.display(),
      frame.width(),
      frame.height()
    );
    Ok(Self {
      path,
      frame,
      repeat: false,
      interval: Duration::ZERO,
      emitted: 0,
      started: Instant::now(),
    })
  }

  pub fn with_repeat(mut self, repeat: bool) -> Self {
    self.repeat = repeat;
    self
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Iterator for ImageFileInput {
  type Item = Result<Frame, ImageFileInputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.emitted > 0 {
      if !self.repeat {
        return None;
      }
      if !self.interval.is_zero() {
        thread::sleep(self.interval);
      }
    }
    self.emitted += 1;
    Some(Ok(self.frame.clone().with_timestamp(self.started.elapsed())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbImage;

  fn write_sample(dir: &Path) -> PathBuf {
    let path = dir.join("sample.png");
    RgbImage::from_pixel(32, 24, image::Rgb([10, 20, 30]))
      .save(&path)
      .unwrap();
    path
  }

  #[test]
  fn single_shot_yields_one_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path());
    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&url.as_str().replacen("file:", "image:", 1)).unwrap();

    let mut input = ImageFileInput::from_url(&url).unwrap();
    let frame = input.next().unwrap().unwrap();
    assert_eq!((frame.width(), frame.height()), (32, 24));
    assert_eq!(frame.rgb_at(0, 0), [10, 20, 30]);
    assert!(input.next().is_none());
  }

  #[test]
  fn repeat_keeps_yielding() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path());
    let input = ImageFileInput::open(&path).unwrap().with_repeat(true);
    assert_eq!(input.take(5).filter(|f| f.is_ok()).count(), 5);
  }

  #[test]
  fn missing_file_fails() {
    assert!(ImageFileInput::open("/nonexistent/yuanwang.png").is_err());
  }
}
