// 该文件是 Yuanwang （远望） 项目的一部分。
// src/output/record.rs - 检测结果文本记录
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

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::model::{BBox, Detection, DetectionBatch};

/// 空结果哨兵记录使用的标签
pub const NONE_LABEL: &str = "none";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordParseError {
  #[error("字段数量不足: {0}")]
  MissingFields(usize),
  #[error("无效的数值字段 {field}: {value}")]
  InvalidNumber { field: &'static str, value: String },
}

/// 一条检测记录：`channel,label,confidence,center_x,center_y,width,height`
///
/// 字段之间用逗号分隔，不做转义。解析时从右往左取六个字段，其余部分都算作通道名。
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
  pub channel: String,
  pub label: String,
  pub confidence: f32,
  pub bbox: BBox,
}

impl DetectionRecord {
  pub fn from_detection(channel: &str, detection: &Detection) -> Self {
    Self {
      channel: channel.to_string(),
      label: detection.label.clone(),
      confidence: detection.confidence,
      bbox: detection.bbox,
    }
  }

  /// `channel,none,0,0,0,0,0`
  pub fn sentinel(channel: &str) -> Self {
    Self {
      channel: channel.to_string(),
      label: NONE_LABEL.to_string(),
      confidence: 0.0,
      bbox: BBox::new(0.0, 0.0, 0.0, 0.0),
    }
  }

  pub fn is_sentinel(&self) -> bool {
    self.label == NONE_LABEL
  }
}

impl fmt::Display for DetectionRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{},{},{},{},{},{},{}",
      self.channel,
      self.label,
      self.confidence,
      self.bbox.center_x,
      self.bbox.center_y,
      self.bbox.width,
      self.bbox.height
    )
  }
}

impl FromStr for DetectionRecord {
  type Err = RecordParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let fields: Vec<&str> = s.trim_end().rsplitn(7, ',').collect();
    if fields.len() < 7 {
      return Err(RecordParseError::MissingFields(fields.len()));
    }
    let number = |field: &'static str, value: &str| {
      value
        .trim()
        .parse::<f32>()
        .map_err(|_| RecordParseError::InvalidNumber {
          field,
          value: value.to_string(),
        })
    };

    // rsplitn 从右往左：height, width, cy, cx, confidence, label, channel
    Ok(Self {
      channel: fields[6].to_string(),
      label: fields[5].to_string(),
      confidence: number("confidence", fields[4])?,
      bbox: BBox::new(
        number("center_x", fields[3])?,
        number("center_y", fields[2])?,
        number("width", fields[1])?,
        number("height", fields[0])?,
      ),
    })
  }
}

/// 一帧对应的全部记录，空结果时恰好一条哨兵记录
pub fn records_for(channel: &str, batch: &DetectionBatch) -> Vec<DetectionRecord> {
  if batch.is_empty() {
    return vec![DetectionRecord::sentinel(channel)];
  }
  batch
    .iter()
    .map(|detection| DetectionRecord::from_detection(channel, detection))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sentinel_format() {
    for channel in ["camera_front", "", "a,b"] {
      let records = records_for(channel, &DetectionBatch::default());
      assert_eq!(records.len(), 1);
      assert_eq!(records[0].to_string(), format!("{},none,0,0,0,0,0", channel));
    }
  }

  #[test]
  fn one_record_per_detection() {
    let batch = DetectionBatch::new(vec![
      Detection {
        label: "person".into(),
        confidence: 0.875,
        bbox: BBox::new(0.5, 0.25, 0.125, 0.5),
      },
      Detection {
        label: "dog".into(),
        confidence: 0.75,
        bbox: BBox::new(0.1, 0.2, 0.3, 0.4),
      },
    ]);
    let records = records_for("camera_front", &batch);
    assert_eq!(records.len(), 2);
    assert_eq!(
      records[0].to_string(),
      "camera_front,person,0.875,0.5,0.25,0.125,0.5"
    );
  }

  #[test]
  fn parse_from_right() {
    let record: DetectionRecord = "left,eye,camera,dog,0.75,0.1,0.2,0.3,0.4".parse().unwrap();
    assert_eq!(record.channel, "left,eye,camera");
    assert_eq!(record.label, "dog");
    assert_eq!(record.bbox, BBox::new(0.1, 0.2, 0.3, 0.4));

    let sentinel: DetectionRecord = "camera_front,none,0,0,0,0,0".parse().unwrap();
    assert!(sentinel.is_sentinel());
  }

  #[test]
  fn parse_errors() {
    assert_eq!(
      "a,b,c".parse::<DetectionRecord>(),
      Err(RecordParseError::MissingFields(3))
    );
    assert!(matches!(
      "cam,dog,high,0,0,0,0".parse::<DetectionRecord>(),
      Err(RecordParseError::InvalidNumber {
        field: "confidence",
        ..
      })
    ));
  }
}
