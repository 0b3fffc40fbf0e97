// 该文件是 Yuanwang （远望） 项目的一部分。
// src/bin/frame_server.rs - 帧服务程序
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

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use url::Url;

use yuanwang::{
  FromUrl,
  codec::{DEFAULT_JPEG_QUALITY, JpegCodec},
  frame::Half,
  input::InputWrapper,
  task::StopSignal,
  transport::{FrameSlot, FrameTransportServer, ServerConfig, run_capture},
};

/// 采集摄像头画面，按请求回复最新一帧 JPEG
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 摄像头编号或设备路径
  #[arg(value_name = "DEVICE", default_value = "0")]
  pub device: String,
  /// 采集宽度
  #[arg(value_name = "WIDTH", requires = "height")]
  pub width: Option<u32>,
  /// 采集高度
  #[arg(value_name = "HEIGHT")]
  pub height: Option<u32>,
  /// 采集帧率
  #[arg(value_name = "FPS")]
  pub fps: Option<u32>,

  /// 监听地址
  #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:25661")]
  pub bind: String,
  /// 用 URL 指定帧源，替代位置参数中的摄像头
  /// (v4l2:///dev/video0?width=640&height=480, image:///path/a.jpg?repeat)
  #[arg(long, value_name = "SOURCE")]
  pub input: Option<Url>,
  /// 只保留左右拼接帧的一半
  #[arg(long, value_enum, value_name = "HALF")]
  pub half: Option<Half>,
  /// JPEG 编码质量
  #[arg(long, value_name = "QUALITY", default_value_t = DEFAULT_JPEG_QUALITY,
        value_parser = clap::value_parser!(u8).range(1..=100))]
  pub quality: u8,
  /// 允许同一连接重复收到同一帧
  #[arg(long)]
  pub allow_repeat: bool,
  /// 没有新帧时重新检查的间隔（毫秒）
  #[arg(long, value_name = "MS", default_value_t = 1)]
  pub retry_delay_ms: u64,
}

#[cfg(feature = "camera_v4l2")]
fn open_camera(args: &Args) -> Result<InputWrapper> {
  use yuanwang::input::CameraConfig;

  let mut config = CameraConfig::default()
    .with_device(&args.device)
    .with_fps(args.fps);
  if let (Some(width), Some(height)) = (args.width, args.height) {
    config = config.with_size(width, height);
  }
  info!(
    "打开摄像头 {} ({}x{}, fps {:?})",
    config.device, config.width, config.height, config.fps
  );
  Ok(InputWrapper::Camera(config.open()?))
}

#[cfg(not(feature = "camera_v4l2"))]
fn open_camera(args: &Args) -> Result<InputWrapper> {
  anyhow::bail!(
    "未启用 camera_v4l2 特性，无法打开摄像头 {}，请使用 --input 指定帧源",
    args.device
  )
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let stop = StopSignal::new();
  stop.install_ctrlc()?;

  let input = match &args.input {
    Some(url) => {
      info!("帧源: {}", url);
      InputWrapper::from_url(url)?
    }
    None => open_camera(&args).inspect_err(|e| error!("摄像头打开失败: {:#}", e))?,
  };
  info!("帧源已打开: {}", input.describe());

  let slot = Arc::new(FrameSlot::new());
  let retry_delay = Duration::from_millis(args.retry_delay_ms.max(1));
  let config = ServerConfig {
    bind: args.bind.clone(),
    retry_delay,
    fresh: !args.allow_repeat,
  };
  let server = FrameTransportServer::bind(config, slot.clone())?.with_stop(stop.flag());
  let stats = server.stats();
  let server = server.spawn()?;

  let codec = JpegCodec::with_quality(args.quality);
  info!("开始采集，JPEG 质量 {}", codec.quality());
  let flag = stop.flag();
  let captured = run_capture(input, &codec, &slot, args.half, retry_delay, &flag);

  stop.stop();
  match server.join() {
    Ok(Ok(())) => {}
    Ok(Err(e)) => warn!("帧服务异常退出: {}", e),
    Err(_) => warn!("帧服务线程崩溃"),
  }
  info!(
    "共 {} 个连接、{} 个请求、{} 次回复",
    stats.connections(),
    stats.requests(),
    stats.replies()
  );

  match captured {
    Ok(frames) => {
      info!("采集结束，共 {} 帧", frames);
      Ok(())
    }
    Err(e) => {
      error!("采集失败: {}", e);
      Err(e.into())
    }
  }
}
