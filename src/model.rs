// 该文件是 Yuanwang （远望） 项目的一部分。
// src/model.rs - 目标检测
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

//! # 目标检测
//!
//! [`DetectionEngine`] 负责 letterbox 预处理、调用推理后端、NMS 与置信度过滤，
//! 并把检测框换算回原始帧的归一化坐标。推理后端通过 [`InferenceBackend`] 接入，
//! 引擎本身不依赖具体的推理库。

use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::frame::FrameError;

mod descriptor;
mod engine;
mod labels;
mod nms;
mod preprocess;
#[cfg(feature = "backend_rknn")]
mod rknn;
#[cfg(feature = "backend_tract")]
mod tract;

pub use self::descriptor::{BackendKind, ModelDescriptor, OutputLayout};
pub use self::engine::{DetectionEngine, EngineConfig, SharedDetector};
pub use self::labels::LabelTable;
pub use self::nms::nms_sort;
pub use self::preprocess::{Letterbox, letterbox};
#[cfg(feature = "backend_rknn")]
pub use self::rknn::RknnBackend;
#[cfg(feature = "backend_tract")]
pub use self::tract::TractBackend;

/// 中心点形式的检测框，坐标为归一化值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
  pub center_x: f32,
  pub center_y: f32,
  pub width: f32,
  pub height: f32,
}

impl BBox {
  pub fn new(center_x: f32, center_y: f32, width: f32, height: f32) -> Self {
    Self {
      center_x,
      center_y,
      width,
      height,
    }
  }

  pub fn from_corners(left: f32, top: f32, right: f32, bottom: f32) -> Self {
    Self {
      center_x: (left + right) / 2.0,
      center_y: (top + bottom) / 2.0,
      width: right - left,
      height: bottom - top,
    }
  }

  pub fn left(&self) -> f32 {
    self.center_x - self.width / 2.0
  }

  pub fn right(&self) -> f32 {
    self.center_x + self.width / 2.0
  }

  pub fn top(&self) -> f32 {
    self.center_y - self.height / 2.0
  }

  pub fn bottom(&self) -> f32 {
    self.center_y + self.height / 2.0
  }

  pub fn area(&self) -> f32 {
    self.width.max(0.0) * self.height.max(0.0)
  }

  pub fn intersection(&self, other: &BBox) -> f32 {
    let w = self.right().min(other.right()) - self.left().max(other.left());
    let h = self.bottom().min(other.bottom()) - self.top().max(other.top());
    if w <= 0.0 || h <= 0.0 { 0.0 } else { w * h }
  }

  /// 交并比，两框面积都为零时返回 0
  pub fn iou(&self, other: &BBox) -> f32 {
    let inter = self.intersection(other);
    let union = self.area() + other.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }

  /// 把框裁剪到 [0,1] 范围内
  pub fn clamp_unit(&self) -> BBox {
    BBox::from_corners(
      self.left().clamp(0.0, 1.0),
      self.top().clamp(0.0, 1.0),
      self.right().clamp(0.0, 1.0),
      self.bottom().clamp(0.0, 1.0),
    )
  }
}

/// 单个检测结果；`confidence` 总是严格大于引擎的置信度阈值
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub label: String,
  pub confidence: f32,
  pub bbox: BBox,
}

/// 一帧的检测结果，可以为空
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionBatch {
  detections: Vec<Detection>,
}

impl DetectionBatch {
  pub fn new(detections: Vec<Detection>) -> Self {
    Self { detections }
  }

  pub fn len(&self) -> usize {
    self.detections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.detections.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.detections.iter()
  }

  pub fn as_slice(&self) -> &[Detection] {
    &self.detections
  }
}

impl From<Vec<Detection>> for DetectionBatch {
  fn from(detections: Vec<Detection>) -> Self {
    Self { detections }
  }
}

impl<'a> IntoIterator for &'a DetectionBatch {
  type Item = &'a Detection;
  type IntoIter = std::slice::Iter<'a, Detection>;

  fn into_iter(self) -> Self::IntoIter {
    self.detections.iter()
  }
}

impl IntoIterator for DetectionBatch {
  type Item = Detection;
  type IntoIter = std::vec::IntoIter<Detection>;

  fn into_iter(self) -> Self::IntoIter {
    self.detections.into_iter()
  }
}

/// 推理后端输出的候选框
///
/// `bbox` 以网络输入尺寸归一化（仍处于 letterbox 坐标系），`scores` 是每个类别的得分。
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
  pub bbox: BBox,
  pub scores: Vec<f32>,
}

impl Candidate {
  pub fn new(bbox: BBox, scores: Vec<f32>) -> Self {
    Self { bbox, scores }
  }

  /// 得分最高的类别，得分相同时取编号小的
  pub fn best_class(&self) -> Option<(usize, f32)> {
    self
      .scores
      .iter()
      .copied()
      .enumerate()
      .fold(None, |best, (idx, score)| match best {
        Some((_, s)) if s >= score => best,
        _ => Some((idx, score)),
      })
  }
}

/// 预处理后的网络输入：RGB、CHW 排列、取值 [0,1]
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
  width: u32,
  height: u32,
  data: Vec<f32>,
}

impl InputTensor {
  pub const CHANNELS: usize = 3;

  /// 以 `fill` 填充的张量
  pub fn filled(width: u32, height: u32, fill: f32) -> Self {
    Self {
      width,
      height,
      data: vec![fill; Self::CHANNELS * width as usize * height as usize],
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }

  pub fn index(&self, channel: usize, y: u32, x: u32) -> usize {
    (channel * self.height as usize + y as usize) * self.width as usize + x as usize
  }

  pub fn at(&self, channel: usize, y: u32, x: u32) -> f32 {
    self.data[self.index(channel, y, x)]
  }

  pub(crate) fn set(&mut self, channel: usize, y: u32, x: u32, value: f32) {
    let idx = self.index(channel, y, x);
    self.data[idx] = value;
  }
}

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("模型加载失败: {0}")]
  Load(String),
  #[error("推理失败: {0}")]
  Inference(String),
  #[error("模型输出无效: {0}")]
  InvalidOutput(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 推理能力：给定预处理好的张量，返回每个候选框的各类别得分
///
/// 实现不要求可重入；跨线程共享时由 [`SharedDetector`] 串行化调用。
pub trait InferenceBackend {
  fn name(&self) -> &str;
  fn predict(&mut self, input: &InputTensor) -> Result<Vec<Candidate>, BackendError>;
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
  fn name(&self) -> &str {
    (**self).name()
  }

  fn predict(&mut self, input: &InputTensor) -> Result<Vec<Candidate>, BackendError> {
    (**self).predict(input)
  }
}

pub type DynBackend = Box<dyn InferenceBackend + Send>;

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("推理后端错误: {0}")]
  BackendError(#[from] BackendError),
  #[error("模型描述文件错误: {0}")]
  DescriptorError(String),
  #[error("类别名称文件错误: {0}")]
  LabelError(String),
  #[error("未启用的推理后端: {0:?}")]
  BackendUnavailable(BackendKind),
  #[error("帧数据错误: {0}")]
  FrameError(#[from] FrameError),
  #[error("输入帧为空")]
  EmptyFrame,
}

/// 检测器：输入一帧，输出该帧的检测结果
pub trait Detector {
  fn detect(&mut self, frame: &crate::frame::Frame) -> Result<DetectionBatch, ModelError>;
}

/// 按三个位置参数构建检测引擎：模型描述、模型权重、类别名称
pub fn load_engine(
  descriptor: impl AsRef<Path>,
  weights: impl AsRef<Path>,
  names: impl AsRef<Path>,
) -> Result<DetectionEngine<DynBackend>, ModelError> {
  let descriptor = ModelDescriptor::load(descriptor)?;
  let labels = LabelTable::load(names)?;
  info!(
    "模型描述: {:?} {}x{}, {} 个类别",
    descriptor.backend,
    descriptor.input_width,
    descriptor.input_height,
    labels.len()
  );
  let backend = descriptor.open_backend(weights.as_ref())?;
  Ok(DetectionEngine::new(
    backend,
    labels,
    descriptor.engine_config(),
  ))
}
