// 该文件是 Yuanwang （远望） 项目的一部分。
// src/codec.rs - 帧编解码
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

use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;

use crate::frame::{EncodedFrame, Frame};

pub const DEFAULT_JPEG_QUALITY: u8 = 92;

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("空的负载")]
  EmptyPayload,
  #[error("解码得到空图像")]
  EmptyImage,
}

/// 字节与像素缓冲区之间的编解码能力
pub trait FrameCodec {
  fn encode(&self, frame: &Frame) -> Result<EncodedFrame, CodecError>;
  fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError>;
}

#[derive(Debug, Clone, Copy)]
pub struct JpegCodec {
  quality: u8,
}

impl Default for JpegCodec {
  fn default() -> Self {
    Self {
      quality: DEFAULT_JPEG_QUALITY,
    }
  }
}

impl JpegCodec {
  pub fn with_quality(quality: u8) -> Self {
    Self {
      quality: quality.clamp(1, 100),
    }
  }

  pub fn quality(&self) -> u8 {
    self.quality
  }
}

impl FrameCodec for JpegCodec {
  fn encode(&self, frame: &Frame) -> Result<EncodedFrame, CodecError> {
    if frame.is_empty() {
      return Err(CodecError::EmptyImage);
    }
    let image = frame.to_rgb_image();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, self.quality).encode_image(&image)?;
    if buffer.is_empty() {
      return Err(CodecError::EmptyPayload);
    }
    Ok(EncodedFrame::from(buffer))
  }

  /// 解码任意 `image` 支持的格式，结果统一为 RGB 帧
  fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.is_empty() {
      return Err(CodecError::EmptyPayload);
    }
    let image = image::load_from_memory(bytes)?.to_rgb8();
    let frame = Frame::from(image);
    if frame.is_empty() {
      return Err(CodecError::EmptyImage);
    }
    Ok(frame)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::PixelOrder;

  #[test]
  fn encode_then_decode_keeps_dimensions() {
    let data = (0..(100 * 60 * 3)).map(|i| (i % 251) as u8).collect();
    let frame = Frame::new(100, 60, PixelOrder::Bgr, data).unwrap();
    let codec = JpegCodec::default();
    let encoded = codec.encode(&frame).unwrap();
    assert!(!encoded.is_empty());

    let decoded = codec.decode(encoded.as_bytes()).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (100, 60));
    assert_eq!(decoded.order(), PixelOrder::Rgb);
  }

  #[test]
  fn garbage_and_empty_payloads_fail() {
    let codec = JpegCodec::default();
    assert!(matches!(codec.decode(&[]), Err(CodecError::EmptyPayload)));
    assert!(matches!(
      codec.decode(b"Hello\0"),
      Err(CodecError::ImageError(_))
    ));
  }

  #[test]
  fn refuses_to_encode_empty_frame() {
    let frame = Frame::new(0, 0, PixelOrder::Rgb, Vec::new()).unwrap();
    assert!(matches!(
      JpegCodec::default().encode(&frame),
      Err(CodecError::EmptyImage)
    ));
  }
}
