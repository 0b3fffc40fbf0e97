// 该文件是 Yuanwang （远望） 项目的一部分。
// src/bin/detect_relay.rs - 取帧、检测并发布结果
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

use std::{path::PathBuf, thread, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use url::Url;

use yuanwang::{
  frame::Region,
  model::load_engine,
  task::{ChannelSpec, ContinuousTask, FrameTransform, StopSignal, spawn_channel},
};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 从帧服务取帧，运行目标检测，并以 UDP 发布检测结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型描述文件 (JSON)
  #[arg(value_name = "CONFIG")]
  pub config: PathBuf,
  /// 模型权重文件
  #[arg(value_name = "WEIGHTS")]
  pub weights: PathBuf,
  /// 类别名称文件
  #[arg(value_name = "NAMES")]
  pub names: PathBuf,

  /// 帧源，格式为 name=url，可重复指定；每个帧源一个检测通道
  #[arg(long = "source", value_name = "NAME=URL",
        default_value = "camera_front=tcp://127.0.0.1:25661")]
  pub sources: Vec<ChannelSpec>,
  /// 检测结果发布地址，可重复指定；每条记录发往每个地址
  #[arg(long, value_name = "URL", default_value = "udp://127.0.0.1:12346")]
  pub publish: Vec<Url>,
  /// 帧存档目录 (folder:///base/dir?record&annotate)
  #[arg(long, value_name = "URL")]
  pub archive: Option<Url>,
  /// 检测前裁剪的区域 x,y,w,h
  #[arg(long, value_name = "X,Y,W,H")]
  pub crop: Option<Region>,
  /// 检测前的缩放比例
  #[arg(long, value_name = "FACTOR")]
  pub scale: Option<f32>,
  /// 每个通道处理的帧数，0 表示不限制
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: u64,
  /// 覆盖模型描述中的置信度阈值
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,
  /// 覆盖模型描述中的 NMS 阈值
  #[arg(long, value_name = "THRESHOLD")]
  pub nms_threshold: Option<f32>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型描述: {}", args.config.display());
  info!("模型权重: {}", args.weights.display());
  info!("类别名称: {}", args.names.display());
  for url in &args.publish {
    info!("发布地址: {}", url);
  }

  let engine = load_engine(&args.config, &args.weights, &args.names)
    .inspect_err(|e| error!("检测引擎构建失败: {}", e))?;
  let defaults = *engine.config();
  let engine = engine.with_thresholds(
    args.nms_threshold.unwrap_or(defaults.nms_threshold),
    args.confidence.unwrap_or(defaults.confidence_threshold),
  );
  info!(
    "置信度阈值 {}, NMS 阈值 {}",
    engine.config().confidence_threshold,
    engine.config().nms_threshold
  );
  let detector = engine.into_shared();

  let stop = StopSignal::new();
  stop.install_ctrlc()?;

  let task = ContinuousTask::new(stop.clone())
    .with_frame_number((args.frame_number > 0).then_some(args.frame_number))
    .with_transform(FrameTransform {
      crop: args.crop,
      scale: args.scale,
    });

  let mut outputs = args.publish.clone();
  outputs.extend(args.archive.clone());

  let mut handles = Vec::with_capacity(args.sources.len());
  for channel in args.sources {
    info!("启动通道 {}: {}", channel.name, channel.url);
    let name = channel.name.clone();
    let handle = spawn_channel(channel, outputs.clone(), detector.clone(), task.clone())?;
    handles.push((name, handle));
  }

  // 任一通道致命失败，整个进程以非零状态退出
  let mut failure = None;
  while failure.is_none() && !handles.is_empty() {
    let Some(index) = handles.iter().position(|(_, handle)| handle.is_finished()) else {
      thread::sleep(JOIN_POLL_INTERVAL);
      continue;
    };
    let (name, handle) = handles.swap_remove(index);
    match handle.join() {
      Ok(Ok(report)) => info!(
        "[{}] 通道结束: {:?}, {} 帧, {} 个目标",
        report.channel, report.reason, report.frames, report.detections
      ),
      Ok(Err(e)) => {
        error!("[{}] 通道异常终止: {:#}", name, e);
        failure = Some(e);
      }
      Err(_) => {
        error!("[{}] 通道线程崩溃", name);
        failure = Some(anyhow::anyhow!("通道 {} 线程崩溃", name));
      }
    }
  }

  match failure {
    Some(e) => {
      stop.stop();
      Err(e)
    }
    None => {
      info!("任务完成，退出");
      Ok(())
    }
  }
}
