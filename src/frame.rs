// 该文件是 Yuanwang （远望） 项目的一部分。
// src/frame.rs - 帧定义
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

use std::{str::FromStr, time::Duration};

use image::{Rgb, RgbImage, imageops::FilterType};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("行跨度 {stride} 小于一行像素所需的 {row} 字节")]
  StrideTooSmall { stride: usize, row: usize },
  #[error("裁剪区域 {region} 超出帧范围 {width}x{height}")]
  RegionOutOfBounds {
    region: Region,
    width: u32,
    height: u32,
  },
  #[error("无效的缩放系数: {0}")]
  InvalidScale(f32),
}

/// 像素通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOrder {
  Rgb,
  Bgr,
  Gray,
}

impl PixelOrder {
  pub fn channels(self) -> usize {
    match self {
      PixelOrder::Rgb | PixelOrder::Bgr => 3,
      PixelOrder::Gray => 1,
    }
  }
}

/// 解码后的像素缓冲区
///
/// 每一行占 `stride` 字节，行内像素按 `order` 交错存放。帧在流水线各阶段之间
/// 按所有权移交，不在并发检测之间共享。
#[derive(Debug, Clone)]
pub struct Frame {
  width: u32,
  height: u32,
  order: PixelOrder,
  stride: usize,
  data: Box<[u8]>,
  timestamp: Option<Duration>,
}

impl Frame {
  pub fn new(width: u32, height: u32, order: PixelOrder, data: Vec<u8>) -> Result<Self, FrameError> {
    let stride = width as usize * order.channels();
    Self::with_stride(width, height, order, stride, data)
  }

  pub fn with_stride(
    width: u32,
    height: u32,
    order: PixelOrder,
    stride: usize,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    let row = width as usize * order.channels();
    if stride < row {
      return Err(FrameError::StrideTooSmall { stride, row });
    }
    let expected = if height == 0 {
      0
    } else {
      stride * (height as usize - 1) + row
    };
    if data.len() < expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      order,
      stride,
      data: data.into_boxed_slice(),
      timestamp: None,
    })
  }

  pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
    self.timestamp = Some(timestamp);
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    self.order.channels()
  }

  pub fn stride(&self) -> usize {
    self.stride
  }

  pub fn order(&self) -> PixelOrder {
    self.order
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn timestamp(&self) -> Option<Duration> {
    self.timestamp
  }

  pub fn is_empty(&self) -> bool {
    self.width == 0 || self.height == 0
  }

  /// 读取 (x, y) 处的像素，统一返回 RGB 顺序
  pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
    let offset = y as usize * self.stride + x as usize * self.channels();
    let px = &self.data[offset..offset + self.channels()];
    match self.order {
      PixelOrder::Rgb => [px[0], px[1], px[2]],
      PixelOrder::Bgr => [px[2], px[1], px[0]],
      PixelOrder::Gray => [px[0], px[0], px[0]],
    }
  }

  /// 转换为紧凑排列的 RGB 图像，不修改原帧
  pub fn to_rgb_image(&self) -> RgbImage {
    if self.order == PixelOrder::Rgb && self.stride == self.width as usize * 3 {
      let len = self.width as usize * self.height as usize * 3;
      if let Some(image) = RgbImage::from_raw(self.width, self.height, self.data[..len].to_vec()) {
        return image;
      }
    }
    RgbImage::from_fn(self.width, self.height, |x, y| Rgb(self.rgb_at(x, y)))
  }

  /// 裁剪出一个区域，时间戳保持不变
  pub fn crop(&self, region: Region) -> Result<Frame, FrameError> {
    let fits = region.x.checked_add(region.width).is_some_and(|r| r <= self.width)
      && region.y.checked_add(region.height).is_some_and(|b| b <= self.height);
    if !fits {
      return Err(FrameError::RegionOutOfBounds {
        region,
        width: self.width,
        height: self.height,
      });
    }

    let channels = self.channels();
    let row = region.width as usize * channels;
    let mut data = Vec::with_capacity(row * region.height as usize);
    for y in region.y..region.y + region.height {
      let start = y as usize * self.stride + region.x as usize * channels;
      data.extend_from_slice(&self.data[start..start + row]);
    }

    let mut frame = Frame::new(region.width, region.height, self.order, data)?;
    frame.timestamp = self.timestamp;
    Ok(frame)
  }

  /// 取左右拼接（双目）帧的一半
  pub fn half(&self, half: Half) -> Result<Frame, FrameError> {
    let half_width = self.width / 2;
    let x = match half {
      Half::Left => 0,
      Half::Right => self.width - half_width,
    };
    self.crop(Region {
      x,
      y: 0,
      width: half_width,
      height: self.height,
    })
  }

  /// 按比例缩放，输出为 RGB 帧
  pub fn scale(&self, factor: f32) -> Result<Frame, FrameError> {
    if !(factor.is_finite() && factor > 0.0) {
      return Err(FrameError::InvalidScale(factor));
    }
    let width = ((self.width as f32 * factor).round() as u32).max(1);
    let height = ((self.height as f32 * factor).round() as u32).max(1);
    let resized = image::imageops::resize(&self.to_rgb_image(), width, height, FilterType::Triangle);
    let mut frame = Frame::from(resized);
    frame.timestamp = self.timestamp;
    Ok(frame)
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      order: PixelOrder::Rgb,
      stride: width as usize * 3,
      data: image.into_raw().into_boxed_slice(),
      timestamp: None,
    }
  }
}

/// 帧上的矩形区域，像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl std::fmt::Display for Region {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
  }
}

impl FromStr for Region {
  type Err = String;

  /// 格式为 `x,y,w,h`
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts = s
      .split(',')
      .map(|p| p.trim().parse::<u32>())
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| format!("无效的区域 '{}': {}", s, e))?;
    match parts.as_slice() {
      [x, y, width, height] if *width > 0 && *height > 0 => Ok(Region {
        x: *x,
        y: *y,
        width: *width,
        height: *height,
      }),
      _ => Err(format!("区域格式应为 x,y,w,h 且宽高大于 0: '{}'", s)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Half {
  Left,
  Right,
}

impl FromStr for Half {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "left" => Ok(Half::Left),
      "right" => Ok(Half::Right),
      other => Err(format!("未知的半幅选择: {}", other)),
    }
  }
}

/// 压缩后的图像字节，在传输协议中原样收发
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
  bytes: Box<[u8]>,
}

impl EncodedFrame {
  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

impl From<Vec<u8>> for EncodedFrame {
  fn from(bytes: Vec<u8>) -> Self {
    Self {
      bytes: bytes.into_boxed_slice(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn gradient(width: u32, height: u32, order: PixelOrder) -> Frame {
    let channels = order.channels();
    let mut data = Vec::new();
    for y in 0..height {
      for x in 0..width {
        for c in 0..channels {
          data.push((x * 10 + y + c as u32) as u8);
        }
      }
    }
    Frame::new(width, height, order, data).unwrap()
  }

  #[test]
  fn rejects_short_buffers() {
    let err = Frame::new(4, 4, PixelOrder::Rgb, vec![0; 10]).unwrap_err();
    assert_eq!(
      err,
      FrameError::LengthMismatch {
        expected: 48,
        actual: 10
      }
    );
  }

  #[test]
  fn padded_stride_is_honoured() {
    // 两个像素宽，每行填充到 8 字节
    let data = vec![1, 2, 3, 4, 5, 6, 0, 0, 7, 8, 9, 10, 11, 12];
    let frame = Frame::with_stride(2, 2, PixelOrder::Rgb, 8, data).unwrap();
    assert_eq!(frame.rgb_at(1, 1), [10, 11, 12]);
    let image = frame.to_rgb_image();
    assert_eq!(image.get_pixel(0, 1).0, [7, 8, 9]);
  }

  #[test]
  fn bgr_is_swapped_to_rgb() {
    let frame = Frame::new(1, 1, PixelOrder::Bgr, vec![1, 2, 3]).unwrap();
    assert_eq!(frame.rgb_at(0, 0), [3, 2, 1]);
    assert_eq!(frame.to_rgb_image().get_pixel(0, 0).0, [3, 2, 1]);
    // 原帧保持不变
    assert_eq!(frame.data(), &[1, 2, 3]);
  }

  #[test]
  fn crop_and_half() {
    let frame = gradient(8, 4, PixelOrder::Rgb).with_timestamp(Duration::from_millis(5));
    let cropped = frame
      .crop(Region {
        x: 2,
        y: 1,
        width: 3,
        height: 2,
      })
      .unwrap();
    assert_eq!((cropped.width(), cropped.height()), (3, 2));
    assert_eq!(cropped.rgb_at(0, 0), frame.rgb_at(2, 1));
    assert_eq!(cropped.timestamp(), Some(Duration::from_millis(5)));

    let right = frame.half(Half::Right).unwrap();
    assert_eq!(right.width(), 4);
    assert_eq!(right.rgb_at(0, 0), frame.rgb_at(4, 0));

    assert!(
      frame
        .crop(Region {
          x: 6,
          y: 0,
          width: 4,
          height: 1
        })
        .is_err()
    );
  }

  #[test]
  fn scale_halves_dimensions() {
    let frame = gradient(10, 6, PixelOrder::Gray);
    let scaled = frame.scale(0.5).unwrap();
    assert_eq!((scaled.width(), scaled.height()), (5, 3));
    assert_eq!(scaled.order(), PixelOrder::Rgb);
    assert!(frame.scale(0.0).is_err());
  }

  #[test]
  fn region_parses() {
    assert_eq!(
      "100,70,730,730".parse::<Region>().unwrap(),
      Region {
        x: 100,
        y: 70,
        width: 730,
        height: 730
      }
    );
    assert!("1,2,3".parse::<Region>().is_err());
    assert!("1,2,0,4".parse::<Region>().is_err());
  }
}
