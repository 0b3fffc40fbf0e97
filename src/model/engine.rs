// 该文件是 Yuanwang （远望） 项目的一部分。
// src/model/engine.rs - 检测引擎
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

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::{
  Detection, DetectionBatch, Detector, InferenceBackend, LabelTable, ModelError, letterbox,
  nms_sort,
};
use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
  pub input_width: u32,
  pub input_height: u32,
  pub nms_threshold: f32,
  /// 最佳类别得分必须严格大于该值
  pub confidence_threshold: f32,
}

impl EngineConfig {
  pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
  pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

  pub fn new(input_width: u32, input_height: u32) -> Self {
    Self {
      input_width,
      input_height,
      nms_threshold: Self::DEFAULT_NMS_THRESHOLD,
      confidence_threshold: Self::DEFAULT_CONFIDENCE_THRESHOLD,
    }
  }
}

/// 检测引擎，独占一个推理后端
pub struct DetectionEngine<B> {
  backend: B,
  labels: LabelTable,
  config: EngineConfig,
}

impl<B: InferenceBackend> DetectionEngine<B> {
  pub fn new(backend: B, labels: LabelTable, config: EngineConfig) -> Self {
    Self {
      backend,
      labels,
      config,
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  pub fn with_thresholds(mut self, nms_threshold: f32, confidence_threshold: f32) -> Self {
    self.config.nms_threshold = nms_threshold;
    self.config.confidence_threshold = confidence_threshold;
    self
  }

  /// 放进互斥锁，供多个通道共享
  pub fn into_shared(self) -> SharedDetector<B> {
    SharedDetector {
      inner: Arc::new(Mutex::new(self)),
    }
  }

  pub fn detect(&mut self, frame: &Frame) -> Result<DetectionBatch, ModelError> {
    let (tensor, geometry) = letterbox(frame, self.config.input_width, self.config.input_height)?;
    let mut candidates = self.backend.predict(&tensor)?;
    let threshold = self.config.confidence_threshold;
    debug!(
      "{} 返回 {} 个候选框",
      self.backend.name(),
      candidates.len()
    );

    // 不超过阈值的得分在 NMS 之前清零，全零的候选框直接丢弃
    for candidate in candidates.iter_mut() {
      for score in candidate.scores.iter_mut() {
        if !(*score > threshold) {
          *score = 0.0;
        }
      }
    }
    candidates.retain(|c| c.scores.iter().any(|&s| s > 0.0));

    let classes = candidates.iter().map(|c| c.scores.len()).max().unwrap_or(0);
    nms_sort(&mut candidates, classes, self.config.nms_threshold);

    let detections: Vec<Detection> = candidates
      .iter()
      .filter_map(|candidate| {
        let (class, confidence) = candidate.best_class()?;
        (confidence > threshold).then(|| Detection {
          label: self.labels.name_of(class),
          confidence,
          bbox: geometry.invert(candidate.bbox),
        })
      })
      .collect();

    debug!("检测到 {} 个目标", detections.len());
    Ok(DetectionBatch::new(detections))
  }
}

impl<B: InferenceBackend> Detector for DetectionEngine<B> {
  fn detect(&mut self, frame: &Frame) -> Result<DetectionBatch, ModelError> {
    DetectionEngine::detect(self, frame)
  }
}

/// 多个通道共享同一个检测引擎，推理调用经互斥锁串行化
pub struct SharedDetector<B> {
  inner: Arc<Mutex<DetectionEngine<B>>>,
}

impl<B> Clone for SharedDetector<B> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<B: InferenceBackend> Detector for SharedDetector<B> {
  fn detect(&mut self, frame: &Frame) -> Result<DetectionBatch, ModelError> {
    self
      .inner
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .detect(frame)
  }
}
