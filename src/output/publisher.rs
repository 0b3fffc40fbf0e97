// 该文件是 Yuanwang （远望） 项目的一部分。
// src/output/publisher.rs - UDP 检测结果发布
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

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::{Render, records_for};
use crate::{FromUrl, FromUrlWithScheme, frame::Frame, model::DetectionBatch};

pub const DEFAULT_PUBLISH_HOST: &str = "127.0.0.1";
pub const DEFAULT_PUBLISH_PORT: u16 = 12346;
/// 单条记录数据报的最大长度 (UDP 负载上限)，接收方按此分配缓冲区
pub const MAX_DATAGRAM: usize = 65507;

#[derive(Error, Debug)]
pub enum PublisherError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("无法解析发布地址: {0}")]
  InvalidAddress(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 每条记录一个 UDP 数据报，尽力投递，不确认也不重发
pub struct UdpPublisher {
  socket: UdpSocket,
  targets: Vec<SocketAddr>,
}

impl FromUrlWithScheme for UdpPublisher {
  const SCHEME: &'static str = "udp";
}

impl FromUrl for UdpPublisher {
  type Error = PublisherError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Self::new(target_of(url)?)
  }
}

/// `udp://host:port` 对应的接收方地址，主机和端口均可省略
pub fn target_of(url: &Url) -> Result<SocketAddr, PublisherError> {
  if url.scheme() != UdpPublisher::SCHEME {
    return Err(PublisherError::SchemeMismatch);
  }
  let host = url
    .host_str()
    .filter(|h| !h.is_empty())
    .unwrap_or(DEFAULT_PUBLISH_HOST);
  let port = url.port().unwrap_or(DEFAULT_PUBLISH_PORT);
  let target = format!("{}:{}", host, port);
  target
    .to_socket_addrs()?
    .next()
    .ok_or(PublisherError::InvalidAddress(target))
}

impl UdpPublisher {
  pub fn new(target: impl ToSocketAddrs + std::fmt::Display) -> Result<Self, PublisherError> {
    let resolved: Vec<SocketAddr> = target.to_socket_addrs()?.collect();
    let target = resolved
      .first()
      .copied()
      .ok_or_else(|| PublisherError::InvalidAddress(target.to_string()))?;
    let bind: SocketAddr = if target.is_ipv4() {
      ([0u8; 4], 0).into()
    } else {
      ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind)?;
    Ok(Self {
      socket,
      targets: vec![target],
    })
  }

  /// 额外的接收方；与发送套接字地址族不同的接收方无法送达，拒绝加入
  pub fn add_target(&mut self, target: SocketAddr) -> Result<(), PublisherError> {
    let local = self.socket.local_addr()?;
    if local.is_ipv4() != target.is_ipv4() {
      return Err(PublisherError::InvalidAddress(target.to_string()));
    }
    if !self.targets.contains(&target) {
      self.targets.push(target);
    }
    Ok(())
  }

  pub fn targets(&self) -> &[SocketAddr] {
    &self.targets
  }

  /// 发布一帧的结果，返回生成的记录数（至少为 1）；发送失败只记录警告
  pub fn publish(&self, channel: &str, batch: &DetectionBatch) -> usize {
    let records = records_for(channel, batch);
    for record in &records {
      let message = record.to_string();
      for target in &self.targets {
        match self.socket.send_to(message.as_bytes(), target) {
          Ok(_) => debug!("-> {}: {}", target, message),
          Err(e) => warn!("向 {} 发送检测结果失败: {}", target, e),
        }
      }
    }
    records.len()
  }
}

impl Render for UdpPublisher {
  type Error = PublisherError;

  fn render_result(
    &mut self,
    channel: &str,
    _frame: &Frame,
    batch: &DetectionBatch,
  ) -> Result<(), Self::Error> {
    self.publish(channel, batch);
    Ok(())
  }
}
