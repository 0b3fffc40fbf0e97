// 该文件是 Yuanwang （远望） 项目的一部分。
// src/model/descriptor.rs - 模型描述文件
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

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{BBox, BackendError, Candidate, DynBackend, EngineConfig, ModelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  /// ONNX 模型，CPU 推理
  Tract,
  /// RKNN 模型，NPU 推理
  Rknn,
}

/// 单输出检测模型的张量布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
  /// `[1, 4 + C, N]`，按列存放 `cx, cy, w, h` 与各类得分
  #[default]
  Yolov8,
  /// `[1, N, 5 + C]`，每行 `cx, cy, w, h, obj` 与各类得分，类别得分乘以 obj
  Yolov5,
}

impl OutputLayout {
  /// 把输出张量解码为候选框；坐标以网络输入像素给出，解码后除以输入尺寸归一化
  pub fn decode(
    &self,
    shape: &[usize],
    data: &[f32],
    net_width: u32,
    net_height: u32,
  ) -> Result<Vec<Candidate>, BackendError> {
    let dims: Vec<usize> = match shape {
      [1, rest @ ..] if rest.len() == 2 => rest.to_vec(),
      [_, _] => shape.to_vec(),
      _ => {
        return Err(BackendError::InvalidOutput(format!(
          "不支持的输出形状 {:?}",
          shape
        )));
      }
    };
    let (rows, cols) = (dims[0], dims[1]);
    if data.len() != rows * cols {
      return Err(BackendError::InvalidOutput(format!(
        "输出形状 {:?} 与数据长度 {} 不一致",
        shape,
        data.len()
      )));
    }

    let (net_w, net_h) = (net_width as f32, net_height as f32);
    let bbox = |cx: f32, cy: f32, w: f32, h: f32| BBox::new(cx / net_w, cy / net_h, w / net_w, h / net_h);

    match self {
      OutputLayout::Yolov8 => {
        if rows <= 4 {
          return Err(BackendError::InvalidOutput(format!(
            "yolov8 输出至少需要 5 行，实际 {}",
            rows
          )));
        }
        let at = |r: usize, i: usize| data[r * cols + i];
        Ok(
          (0..cols)
            .map(|i| {
              Candidate::new(
                bbox(at(0, i), at(1, i), at(2, i), at(3, i)),
                (4..rows).map(|r| at(r, i)).collect(),
              )
            })
            .collect(),
        )
      }
      OutputLayout::Yolov5 => {
        if cols <= 5 {
          return Err(BackendError::InvalidOutput(format!(
            "yolov5 输出至少需要 6 列，实际 {}",
            cols
          )));
        }
        Ok(
          data
            .chunks_exact(cols)
            .map(|row| {
              let objectness = row[4];
              Candidate::new(
                bbox(row[0], row[1], row[2], row[3]),
                row[5..].iter().map(|s| s * objectness).collect(),
              )
            })
            .collect(),
        )
      }
    }
  }
}

fn default_nms_threshold() -> f32 {
  EngineConfig::DEFAULT_NMS_THRESHOLD
}

fn default_confidence_threshold() -> f32 {
  EngineConfig::DEFAULT_CONFIDENCE_THRESHOLD
}

/// 模型拓扑描述（JSON）
///
/// ```json
/// {"backend":"tract","input_width":416,"input_height":416,"layout":"yolov8"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
  pub backend: BackendKind,
  pub input_width: u32,
  pub input_height: u32,
  #[serde(default)]
  pub layout: OutputLayout,
  #[serde(default = "default_nms_threshold")]
  pub nms_threshold: f32,
  #[serde(default = "default_confidence_threshold")]
  pub confidence_threshold: f32,
}

impl ModelDescriptor {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
      .map_err(|e| ModelError::DescriptorError(format!("{}: {}", path.display(), e)))?;
    Self::parse(&content)
  }

  pub fn parse(content: &str) -> Result<Self, ModelError> {
    let descriptor: Self = serde_json::from_str(content)
      .map_err(|e| ModelError::DescriptorError(e.to_string()))?;
    descriptor.validate()?;
    Ok(descriptor)
  }

  fn validate(&self) -> Result<(), ModelError> {
    if self.input_width == 0 || self.input_height == 0 {
      return Err(ModelError::DescriptorError(format!(
        "无效的输入尺寸 {}x{}",
        self.input_width, self.input_height
      )));
    }
    for (name, value) in [
      ("nms_threshold", self.nms_threshold),
      ("confidence_threshold", self.confidence_threshold),
    ] {
      if !(0.0..=1.0).contains(&value) {
        return Err(ModelError::DescriptorError(format!(
          "{} 必须在 [0,1] 之间，实际为 {}",
          name, value
        )));
      }
    }
    Ok(())
  }

  pub fn engine_config(&self) -> EngineConfig {
    EngineConfig {
      input_width: self.input_width,
      input_height: self.input_height,
      nms_threshold: self.nms_threshold,
      confidence_threshold: self.confidence_threshold,
    }
  }

  /// 按描述加载推理后端；后端无法构建属于致命配置错误
  pub fn open_backend(&self, weights: &Path) -> Result<DynBackend, ModelError> {
    info!("加载 {:?} 后端，权重文件 {}", self.backend, weights.display());
    match self.backend {
      #[cfg(feature = "backend_tract")]
      BackendKind::Tract => Ok(Box::new(super::TractBackend::load(
        weights,
        self.input_width,
        self.input_height,
        self.layout,
      )?)),
      #[cfg(feature = "backend_rknn")]
      BackendKind::Rknn => Ok(Box::new(super::RknnBackend::load(
        weights,
        self.input_width,
        self.input_height,
        self.confidence_threshold,
      )?)),
      #[allow(unreachable_patterns)]
      other => Err(ModelError::BackendUnavailable(other)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn descriptor_defaults() {
    let descriptor =
      ModelDescriptor::parse(r#"{"backend":"tract","input_width":416,"input_height":416}"#)
        .unwrap();
    assert_eq!(descriptor.layout, OutputLayout::Yolov8);
    assert_eq!(descriptor.nms_threshold, 0.45);
    assert_eq!(descriptor.confidence_threshold, 0.5);
  }

  #[test]
  fn descriptor_validation() {
    assert!(ModelDescriptor::parse(r#"{"backend":"tract","input_width":0,"input_height":416}"#).is_err());
    assert!(
      ModelDescriptor::parse(
        r#"{"backend":"rknn","input_width":640,"input_height":640,"nms_threshold":1.5}"#
      )
      .is_err()
    );
    assert!(ModelDescriptor::parse(r#"{"backend":"opencv","input_width":1,"input_height":1}"#).is_err());
  }

  #[test]
  fn decode_yolov8_columns() {
    // 2 个类别，3 个候选框
    let data = vec![
      32.0, 64.0, 0.0, // cx
      32.0, 64.0, 0.0, // cy
      16.0, 32.0, 0.0, // w
      16.0, 32.0, 0.0, // h
      0.9, 0.1, 0.0, // class 0
      0.2, 0.8, 0.0, // class 1
    ];
    let candidates = OutputLayout::Yolov8
      .decode(&[1, 6, 3], &data, 128, 128)
      .unwrap();
    assert_eq!(candidates.len(), 3);
    assert_eq!(candidates[0].bbox, BBox::new(0.25, 0.25, 0.125, 0.125));
    assert_eq!(candidates[1].scores, vec![0.1, 0.8]);
  }

  #[test]
  fn decode_yolov5_rows_multiplies_objectness() {
    let data = vec![64.0, 64.0, 32.0, 32.0, 0.5, 0.8, 0.4];
    let candidates = OutputLayout::Yolov5
      .decode(&[1, 1, 7], &data, 128, 128)
      .unwrap();
    assert_eq!(candidates[0].bbox, BBox::new(0.5, 0.5, 0.25, 0.25));
    assert_eq!(candidates[0].scores, vec![0.4, 0.2]);
  }

  #[test]
  fn decode_rejects_mismatched_shapes() {
    assert!(OutputLayout::Yolov8.decode(&[1, 6, 3], &[0.0; 5], 8, 8).is_err());
    assert!(OutputLayout::Yolov8.decode(&[1, 2, 3, 4], &[0.0; 24], 8, 8).is_err());
    assert!(OutputLayout::Yolov5.decode(&[1, 4], &[0.0; 4], 8, 8).is_err());
  }
}
