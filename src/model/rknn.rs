// 该文件是 Yuanwang （远望） 项目的一部分。
// src/model/rknn.rs - RKNN 推理后端
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

use std::path::Path;

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use super::{BBox, BackendError, Candidate, InferenceBackend, InputTensor};

const NUM_INPUTS: u32 = 1;
const NUM_OUTPUTS: u32 = 6;
const STRIDES: [u32; 3] = [8, 16, 32];

/// 三个检测头、回归与分类分开输出的 RKNN 模型
///
/// 输入为 NHWC 排列的 u8 图像；每个检测头给出 `4 x H x W` 的距离回归和
/// `C x H x W` 的分类 logit。
pub struct RknnBackend {
  context: Context,
  width: u32,
  height: u32,
  /// sigmoid 之后最大类别得分不超过该值的格点直接跳过
  prefilter: f32,
  nhwc: Vec<u8>,
}

// SAFETY: Context 只在持有 &mut self 时使用，跨线程共享时外层有互斥锁串行化
unsafe impl Send for RknnBackend {}

fn rknn_error(msg: &str, e: rknpu::Error) -> BackendError {
  error!("{}: {}", msg, e);
  BackendError::Load(format!("{}: {}", msg, e))
}

impl RknnBackend {
  pub fn load(
    path: impl AsRef<Path>,
    width: u32,
    height: u32,
    prefilter: f32,
  ) -> Result<Self, BackendError> {
    let path = path.as_ref();
    info!("加载模型文件: {}", path.display());
    let model_data = std::fs::read(path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let context = Context::new(&model_data, InitFlags::default())
      .map_err(|e| rknn_error("创建 RKNN 推理上下文失败", e))?;

    let version = context
      .sdk_version()
      .map_err(|e| rknn_error("无法查询 SDK 版本", e))?;
    if let Ok(api) = version.api_version() {
      debug!("模型 API 版本: {}", api);
    }
    if let Ok(driver) = version.driver_version() {
      debug!("模型驱动版本: {}", driver);
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| rknn_error("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| rknn_error("无法获取输出数量", e))?;
    if num_inputs != NUM_INPUTS || num_outputs != NUM_OUTPUTS {
      return Err(BackendError::Load(format!(
        "预期 {} 个输入、{} 个输出，实际为 {} 个输入、{} 个输出",
        NUM_INPUTS, NUM_OUTPUTS, num_inputs, num_outputs
      )));
    }
    info!("模型加载完成");

    Ok(Self {
      context,
      width,
      height,
      prefilter,
      nhwc: vec![0; (width * height * 3) as usize],
    })
  }

  fn fill_nhwc(&mut self, input: &InputTensor) {
    let mut idx = 0;
    for y in 0..input.height() {
      for x in 0..input.width() {
        for c in 0..InputTensor::CHANNELS {
          self.nhwc[idx] = (input.at(c, y, x) * 255.0).round().clamp(0.0, 255.0) as u8;
          idx += 1;
        }
      }
    }
  }
}

impl InferenceBackend for RknnBackend {
  fn name(&self) -> &str {
    "rknn"
  }

  fn predict(&mut self, input: &InputTensor) -> Result<Vec<Candidate>, BackendError> {
    if (input.width(), input.height()) != (self.width, self.height) {
      return Err(BackendError::Inference(format!(
        "输入尺寸 {}x{} 与模型 {}x{} 不一致",
        input.width(),
        input.height(),
        self.width,
        self.height
      )));
    }
    self.fill_nhwc(input);

    let infer = |e: rknpu::Error| BackendError::Inference(e.to_string());
    self
      .context
      .set_input(0, &self.nhwc, TensorFormat::NHWC, TensorType::UInt8)
      .map_err(infer)?;
    self.context.run().map_err(infer)?;
    let output = self.context.get_outputs().map_err(infer)?;

    let mut candidates = Vec::new();
    for (head, stride) in STRIDES.into_iter().enumerate() {
      let (map_w, map_h) = (
        (self.width / stride) as usize,
        (self.height / stride) as usize,
      );
      let first = output.get_f32(head * 2).map_err(infer)?;
      let second = output.get_f32(head * 2 + 1).map_err(infer)?;
      let (reg, cls) = split_head(first, second, map_w * map_h)?;
      decode_head(
        reg,
        cls,
        (map_w, map_h),
        stride as f32,
        (self.width as f32, self.height as f32),
        self.prefilter,
        &mut candidates,
      );
    }
    debug!("RKNN 解码得到 {} 个候选框", candidates.len());
    Ok(candidates)
  }
}

/// 输出顺序不固定，按长度区分回归 (`4 x spatial`) 与分类 (`C x spatial`)
fn split_head<'a>(
  first: &'a [f32],
  second: &'a [f32],
  spatial: usize,
) -> Result<(&'a [f32], &'a [f32]), BackendError> {
  let reg_len = 4 * spatial;
  let is_cls = |t: &[f32]| !t.is_empty() && t.len() % spatial == 0;
  if first.len() == reg_len && is_cls(second) {
    Ok((first, second))
  } else if second.len() == reg_len && is_cls(first) {
    Ok((second, first))
  } else {
    Err(BackendError::InvalidOutput(format!(
      "检测头输出大小不匹配: {} / {}，空间大小 {}",
      first.len(),
      second.len(),
      spatial
    )))
  }
}

fn decode_head(
  reg: &[f32],
  cls: &[f32],
  (map_w, map_h): (usize, usize),
  stride: f32,
  (net_w, net_h): (f32, f32),
  prefilter: f32,
  candidates: &mut Vec<Candidate>,
) {
  let spatial = map_w * map_h;
  let classes = cls.len() / spatial;

  for h in 0..map_h {
    for w in 0..map_w {
      let idx = h * map_w + w;
      let scores: Vec<f32> = (0..classes)
        .map(|c| sigmoid(cls[c * spatial + idx]))
        .collect();
      if scores.iter().all(|&s| s <= prefilter) {
        continue;
      }

      let grid_x = w as f32 + 0.5;
      let grid_y = h as f32 + 0.5;
      let left = ((grid_x - reg[idx]) * stride).clamp(0.0, net_w);
      let top = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, net_h);
      let right = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, net_w);
      let bottom = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, net_h);

      candidates.push(Candidate::new(
        BBox::from_corners(left / net_w, top / net_h, right / net_w, bottom / net_h),
        scores,
      ));
    }
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
