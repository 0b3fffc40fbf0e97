// 该文件是 Yuanwang （远望） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use std::cmp::Ordering;

use super::Candidate;

/// 按类别做排序式 NMS
///
/// 对每个类别，候选框按该类得分从高到低处理；与更高分框的 IoU 超过 `threshold`
/// 的框，该类得分被置零。候选框本身不删除，只修改得分，顺序保持不变。
pub fn nms_sort(candidates: &mut [Candidate], classes: usize, threshold: f32) {
  let mut order: Vec<usize> = (0..candidates.len()).collect();

  for class in 0..classes {
    let score = |c: &Candidate| c.scores.get(class).copied().unwrap_or(0.0);
    order.sort_by(|&a, &b| {
      score(&candidates[b])
        .partial_cmp(&score(&candidates[a]))
        .unwrap_or(Ordering::Equal)
    });

    for i in 0..order.len() {
      let keep = order[i];
      if score(&candidates[keep]) <= 0.0 {
        continue;
      }
      let kept_box = candidates[keep].bbox;
      for &other in &order[i + 1..] {
        if kept_box.iou(&candidates[other].bbox) > threshold
          && let Some(s) = candidates[other].scores.get_mut(class)
        {
          *s = 0.0;
        }
      }
    }
  }
}
