// 该文件是 Yuanwang （远望） 项目的一部分。
// src/transport.rs - 帧传输协议
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

//! # 帧传输
//!
//! 请求/应答式的取帧协议：客户端发送固定的握手负载，服务端回复一帧编码后的图像。
//! 每条消息在 TCP 上以 4 字节大端长度前缀分帧。
//!
//! - [`FrameTransportClient`] 负责超时重传，只在拿到可解码的非空帧时返回
//! - [`FrameTransportServer`] 对每个请求回复最近一次采集的帧，没有帧时暂缓应答

use thiserror::Error;

use crate::codec::CodecError;

mod client;
mod retry;
mod server;
pub mod wire;

pub use self::client::{ClientStats, FrameTransportClient, TransportClientBuilder};
pub use self::retry::{Backoff, RetryPolicy};
pub use self::server::{
  CaptureError, FrameSlot, FrameTransportServer, ServerConfig, ServerStats, run_capture,
};

/// 默认的应答超时时间（毫秒）
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
/// 默认的帧服务端口
pub const DEFAULT_PORT: u16 = 25661;

#[derive(Error, Debug)]
pub enum TransportError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("无效的地址: {0}")]
  InvalidAddress(String),
  #[error("无效的配置: {0}")]
  InvalidConfig(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("编解码错误: {0}")]
  CodecError(#[from] CodecError),
  #[error("已重试 {attempts} 次仍未从 {server} 获取到有效帧")]
  RetriesExhausted { server: String, attempts: u32 },
}
