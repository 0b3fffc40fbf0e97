// 该文件是 Yuanwang （远望） 项目的一部分。
// src/model/tract.rs - ONNX 推理后端
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

use tracing::{debug, info};
use tract_onnx::prelude::*;

use super::{BackendError, Candidate, InferenceBackend, InputTensor, OutputLayout};

/// 基于 tract 的 ONNX 后端，输入固定为 `[1, 3, H, W]` 的 f32 张量
pub struct TractBackend {
  model: TypedRunnableModel<TypedModel>,
  width: u32,
  height: u32,
  layout: OutputLayout,
}

impl TractBackend {
  pub fn load(
    path: impl AsRef<Path>,
    width: u32,
    height: u32,
    layout: OutputLayout,
  ) -> Result<Self, BackendError> {
    let path = path.as_ref();
    info!("加载 ONNX 模型: {}", path.display());
    let model = tract_onnx::onnx()
      .model_for_path(path)
      .and_then(|model| {
        model.with_input_fact(
          0,
          InferenceFact::dt_shape(
            f32::datum_type(),
            tvec!(1, 3, height as usize, width as usize),
          ),
        )
      })
      .and_then(|model| model.into_optimized())
      .and_then(|model| model.into_runnable())
      .map_err(|e| BackendError::Load(format!("{}: {:#}", path.display(), e)))?;
    info!("模型加载完成，输入 {}x{}, 输出布局 {:?}", width, height, layout);

    Ok(Self {
      model,
      width,
      height,
      layout,
    })
  }
}

impl InferenceBackend for TractBackend {
  fn name(&self) -> &str {
    "tract"
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

    let tensor: Tensor = tract_ndarray::Array4::from_shape_fn(
      (1, 3, self.height as usize, self.width as usize),
      |(_, c, y, x)| input.at(c, y as u32, x as u32),
    )
    .into();

    let outputs = self
      .model
      .run(tvec!(tensor.into()))
      .map_err(|e| BackendError::Inference(format!("{:#}", e)))?;
    let output = outputs
      .first()
      .ok_or_else(|| BackendError::InvalidOutput("模型没有输出".into()))?;
    let view = output
      .to_array_view::<f32>()
      .map_err(|e| BackendError::InvalidOutput(format!("{:#}", e)))?;
    let shape = view.shape().to_vec();
    let data: Vec<f32> = view.iter().copied().collect();
    debug!("模型输出形状 {:?}", shape);

    self.layout.decode(&shape, &data, self.width, self.height)
  }
}
