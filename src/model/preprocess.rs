// 该文件是 Yuanwang （远望） 项目的一部分。
// src/model/preprocess.rs - letterbox 预处理
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

use image::imageops::{self, FilterType};

use super::{BBox, InputTensor, ModelError};
use crate::frame::Frame;

/// 填充区域的取值
pub const LETTERBOX_FILL: f32 = 0.5;

/// 保持宽高比缩放后居中放入网络输入的几何关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
  pub net_width: u32,
  pub net_height: u32,
  pub new_width: u32,
  pub new_height: u32,
}

impl Letterbox {
  pub fn new(src_width: u32, src_height: u32, net_width: u32, net_height: u32) -> Self {
    let (src_w, src_h) = (src_width.max(1) as u64, src_height.max(1) as u64);
    let (net_w, net_h) = (net_width as u64, net_height as u64);

    // 较紧的一边贴满，另一边按比例取整
    let (new_w, new_h) = if (net_w as f32 / src_w as f32) < (net_h as f32 / src_h as f32) {
      (net_w, src_h * net_w / src_w)
    } else {
      (src_w * net_h / src_h, net_h)
    };

    Self {
      net_width,
      net_height,
      new_width: (new_w as u32).clamp(1, net_width.max(1)),
      new_height: (new_h as u32).clamp(1, net_height.max(1)),
    }
  }

  /// 缩放后图像在网络输入中的左上角位置
  pub fn offset(&self) -> (u32, u32) {
    (
      (self.net_width - self.new_width) / 2,
      (self.net_height - self.new_height) / 2,
    )
  }

  /// 把网络输入坐标系下的归一化框换算回原始帧的归一化坐标，并裁剪到 [0,1]
  pub fn invert(&self, bbox: BBox) -> BBox {
    let net_w = self.net_width as f32;
    let net_h = self.net_height as f32;
    let new_w = self.new_width as f32;
    let new_h = self.new_height as f32;

    // 偏移按浮点计算，与 offset() 的整数偏移在奇数填充时相差半个像素，和 darknet 一致
    BBox {
      center_x: (bbox.center_x - (net_w - new_w) / 2.0 / net_w) / (new_w / net_w),
      center_y: (bbox.center_y - (net_h - new_h) / 2.0 / net_h) / (new_h / net_h),
      width: bbox.width * net_w / new_w,
      height: bbox.height * net_h / new_h,
    }
    .clamp_unit()
  }
}

/// 生成网络输入张量
///
/// 按像素顺序转成 RGB，取值缩放到 [0,1]，双线性缩放后居中，四周以 0.5 填充。
/// 纯函数，不修改输入帧。
pub fn letterbox(
  frame: &Frame,
  net_width: u32,
  net_height: u32,
) -> Result<(InputTensor, Letterbox), ModelError> {
  if frame.is_empty() {
    return Err(ModelError::EmptyFrame);
  }

  let geometry = Letterbox::new(frame.width(), frame.height(), net_width, net_height);
  let image = frame.to_rgb_image();
  let resized = if image.dimensions() == (geometry.new_width, geometry.new_height) {
    image
  } else {
    imageops::resize(
      &image,
      geometry.new_width,
      geometry.new_height,
      FilterType::Triangle,
    )
  };

  let mut tensor = InputTensor::filled(net_width, net_height, LETTERBOX_FILL);
  let (dx, dy) = geometry.offset();
  for (x, y, pixel) in resized.enumerate_pixels() {
    for c in 0..InputTensor::CHANNELS {
      tensor.set(c, y + dy, x + dx, pixel[c] as f32 / 255.0);
    }
  }

  Ok((tensor, geometry))
}
