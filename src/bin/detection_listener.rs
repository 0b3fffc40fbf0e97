// 该文件是 Yuanwang （远望） 项目的一部分。
// src/bin/detection_listener.rs - 接收并打印检测结果
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

use std::{collections::BTreeMap, io, net::UdpSocket, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};

use yuanwang::{
  output::{DEFAULT_PUBLISH_HOST, DEFAULT_PUBLISH_PORT, DetectionRecord, MAX_DATAGRAM},
  task::StopSignal,
};

/// 监听检测结果 UDP 端口，解析并打印每条记录
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听地址
  #[arg(long, value_name = "ADDR",
        default_value_t = format!("{}:{}", DEFAULT_PUBLISH_HOST, DEFAULT_PUBLISH_PORT))]
  pub bind: String,
  /// 收到指定条数后退出，0 表示一直运行
  #[arg(long, value_name = "COUNT", default_value_t = 0)]
  pub count: u64,
}

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let stop = StopSignal::new();
  stop.install_ctrlc()?;

  let socket = UdpSocket::bind(&args.bind)?;
  socket.set_read_timeout(Some(POLL_TIMEOUT))?;
  info!("监听检测结果: {}", socket.local_addr()?);

  let mut received = 0u64;
  let mut per_channel: BTreeMap<String, u64> = BTreeMap::new();
  let mut buffer = vec![0u8; MAX_DATAGRAM];
  while !stop.is_stopped() {
    let (len, peer) = match socket.recv_from(&mut buffer) {
      Ok(datagram) => datagram,
      Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
        continue;
      }
      Err(e) => return Err(e.into()),
    };

    let text = String::from_utf8_lossy(&buffer[..len]);
    debug!("来自 {} 的数据: {}", peer, text);
    match text.parse::<DetectionRecord>() {
      Ok(record) if record.is_sentinel() => {
        info!("[{}] 无目标", record.channel);
        *per_channel.entry(record.channel).or_default() += 1;
      }
      Ok(record) => {
        info!(
          "[{}] {}: {:.2}% at ({:.3}, {:.3}, {:.3}x{:.3})",
          record.channel,
          record.label,
          record.confidence * 100.0,
          record.bbox.center_x,
          record.bbox.center_y,
          record.bbox.width,
          record.bbox.height
        );
        *per_channel.entry(record.channel).or_default() += 1;
      }
      Err(e) => {
        warn!("无法解析来自 {} 的记录 '{}': {}", peer, text, e);
        continue;
      }
    }

    received += 1;
    if args.count > 0 && received >= args.count {
      info!("已收到 {} 条记录，退出", received);
      break;
    }
  }

  for (channel, count) in &per_channel {
    info!("[{}] 共 {} 条记录", channel, count);
  }
  Ok(())
}
