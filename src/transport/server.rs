// 该文件是 Yuanwang （远望） 项目的一部分。
// src/transport/server.rs - 帧传输服务端
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

use std::{
  io,
  net::{SocketAddr, TcpListener, TcpStream},
  sync::{
    Arc, Condvar, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
  DEFAULT_PORT, TransportError,
  wire::{read_message, write_message},
};
use crate::{
  FromUrl, FromUrlWithScheme,
  codec::{CodecError, FrameCodec},
  frame::{EncodedFrame, Frame, FrameError, Half},
  query_flag, query_value,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STALL_WARNING_AFTER: Duration = Duration::from_secs(1);
const PEER_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct SlotState {
  frame: Option<Arc<EncodedFrame>>,
  sequence: u64,
}

/// 保存最近一次采集并编码好的帧
///
/// 采集线程写入，各连接只读共享。每写入一帧序号加一，序号 0 表示还没有帧。
#[derive(Default)]
pub struct FrameSlot {
  state: Mutex<SlotState>,
  ready: Condvar,
}

impl FrameSlot {
  pub fn new() -> Self {
    Self::default()
  }

  /// 写入新帧并唤醒等待中的连接；空负载不会被写入
  pub fn publish(&self, frame: EncodedFrame) -> bool {
    if frame.is_empty() {
      warn!("拒绝写入空的编码帧");
      return false;
    }
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.sequence += 1;
    state.frame = Some(Arc::new(frame));
    drop(state);
    self.ready.notify_all();
    true
  }

  pub fn sequence(&self) -> u64 {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .sequence
  }

  pub fn latest(&self) -> Option<(u64, Arc<EncodedFrame>)> {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.frame.clone().map(|frame| (state.sequence, frame))
  }

  /// 等待一帧序号大于 `after` 的帧，每隔 `retry_delay` 重新检查一次停止标志
  ///
  /// `abandoned` 返回真时放弃等待，用于发现已经断开的对端。
  pub fn wait_newer(
    &self,
    after: u64,
    retry_delay: Duration,
    stop: &AtomicBool,
    mut abandoned: impl FnMut() -> bool,
  ) -> Option<(u64, Arc<EncodedFrame>)> {
    let started = Instant::now();
    let mut checked = started;
    let mut warned = false;
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
      if let Some(frame) = &state.frame
        && state.sequence > after
      {
        return Some((state.sequence, frame.clone()));
      }
      if stop.load(Ordering::Relaxed) {
        return None;
      }
      if checked.elapsed() >= PEER_CHECK_INTERVAL {
        checked = Instant::now();
        if abandoned() {
          return None;
        }
      }
      if !warned && started.elapsed() >= STALL_WARNING_AFTER {
        warn!("暂无可用的新帧，暂缓应答...");
        warned = true;
      }
      state = self
        .ready
        .wait_timeout(state, retry_delay)
        .unwrap_or_else(PoisonError::into_inner)
        .0;
    }
  }
}

/// 服务端统计
#[derive(Debug, Default)]
pub struct ServerStats {
  connections: AtomicU64,
  active: AtomicU64,
  requests: AtomicU64,
  replies: AtomicU64,
}

impl ServerStats {
  pub fn connections(&self) -> u64 {
    self.connections.load(Ordering::Relaxed)
  }

  /// 仍在服务的连接数
  pub fn active(&self) -> u64 {
    self.active.load(Ordering::Relaxed)
  }

  pub fn requests(&self) -> u64 {
    self.requests.load(Ordering::Relaxed)
  }

  pub fn replies(&self) -> u64 {
    self.replies.load(Ordering::Relaxed)
  }
}

/// 服务端配置，可从 `tcp://0.0.0.0:25661?fresh=false&retry_delay_ms=1` 解析
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
  pub bind: String,
  /// 没有帧时重新检查的间隔
  pub retry_delay: Duration,
  /// 为真时同一连接不会收到重复的帧
  pub fresh: bool,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: format!("0.0.0.0:{}", DEFAULT_PORT),
      retry_delay: Duration::from_millis(1),
      fresh: true,
    }
  }
}

impl ServerConfig {
  pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
    self.bind = bind.into();
    self
  }
}

impl FromUrlWithScheme for ServerConfig {
  const SCHEME: &'static str = "tcp";
}

impl FromUrl for ServerConfig {
  type Error = TransportError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(TransportError::SchemeMismatch);
    }
    let host = url.host_str().unwrap_or("0.0.0.0");
    let port = url.port().unwrap_or(DEFAULT_PORT);
    let retry_delay_ms =
      query_value::<u64>(url, "retry_delay_ms").map_err(TransportError::InvalidConfig)?;
    let fresh = match url.query_pairs().any(|(k, _)| k == "fresh") {
      true => query_flag(url, "fresh"),
      false => true,
    };

    Ok(Self {
      bind: format!("{}:{}", host, port),
      retry_delay: Duration::from_millis(retry_delay_ms.unwrap_or(1).max(1)),
      fresh,
    })
  }
}

/// 帧传输服务端
///
/// 每个连接一个线程，连接内严格一问一答；所有连接共享同一个 [`FrameSlot`]。
pub struct FrameTransportServer {
  listener: TcpListener,
  slot: Arc<FrameSlot>,
  config: ServerConfig,
  stats: Arc<ServerStats>,
  stop: Arc<AtomicBool>,
}

impl FrameTransportServer {
  pub fn bind(config: ServerConfig, slot: Arc<FrameSlot>) -> Result<Self, TransportError> {
    let listener = TcpListener::bind(&config.bind)?;
    listener.set_nonblocking(true)?;
    info!("帧服务监听于 {}", listener.local_addr()?);
    Ok(Self {
      listener,
      slot,
      config,
      stats: Arc::new(ServerStats::default()),
      stop: Arc::new(AtomicBool::new(false)),
    })
  }

  /// 使用外部的停止标志
  pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = stop;
    self
  }

  pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
    Ok(self.listener.local_addr()?)
  }

  pub fn stats(&self) -> Arc<ServerStats> {
    self.stats.clone()
  }

  pub fn stop_flag(&self) -> Arc<AtomicBool> {
    self.stop.clone()
  }

  /// 阻塞运行接受循环，直到停止标志被置位
  pub fn serve(self) -> Result<(), TransportError> {
    while !self.stop.load(Ordering::Relaxed) {
      match self.listener.accept() {
        Ok((stream, peer)) => {
          stream.set_nonblocking(false)?;
          stream.set_nodelay(true)?;
          self.stats.connections.fetch_add(1, Ordering::Relaxed);
          self.stats.active.fetch_add(1, Ordering::Relaxed);
          info!("接受来自 {} 的连接", peer);

          let slot = self.slot.clone();
          let stats = self.stats.clone();
          let stop = self.stop.clone();
          let config = self.config.clone();
          thread::Builder::new()
            .name(format!("frame-conn-{}", peer))
            .spawn(move || {
              serve_connection(stream, peer, &slot, &stats, &config, &stop);
              stats.active.fetch_sub(1, Ordering::Relaxed);
            })?;
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
        Err(e) => {
          error!("接受连接失败: {}", e);
          return Err(e.into());
        }
      }
    }
    info!("帧服务已停止");
    Ok(())
  }

  pub fn spawn(self) -> Result<JoinHandle<Result<(), TransportError>>, TransportError> {
    Ok(
      thread::Builder::new()
        .name("frame-server".into())
        .spawn(move || self.serve())?,
    )
  }
}

fn serve_connection(
  mut stream: TcpStream,
  peer: SocketAddr,
  slot: &FrameSlot,
  stats: &ServerStats,
  config: &ServerConfig,
  stop: &AtomicBool,
) {
  let mut last_sent = 0u64;
  loop {
    debug!("等待 {} 的请求", peer);
    let request = match read_message(&mut stream) {
      Ok(request) => request,
      Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
        info!("{} 已断开连接", peer);
        return;
      }
      Err(e) => {
        warn!("读取 {} 的请求失败: {}", peer, e);
        return;
      }
    };
    if request.is_empty() {
      warn!("收到 {} 的空请求，关闭连接", peer);
      return;
    }
    stats.requests.fetch_add(1, Ordering::Relaxed);

    let after = if config.fresh { last_sent } else { 0 };
    let waiting = slot.wait_newer(after, config.retry_delay, stop, || peer_gone(&stream));
    let Some((sequence, frame)) = waiting else {
      info!("{} 已断开或服务已停止，不再等待新帧", peer);
      return;
    };

    if let Err(e) = write_message(&mut stream, frame.as_bytes()) {
      warn!("向 {} 发送应答失败: {}", peer, e);
      return;
    }
    last_sent = sequence;
    stats.replies.fetch_add(1, Ordering::Relaxed);
    debug!("已向 {} 发送第 {} 帧 ({} 字节)", peer, sequence, frame.len());
  }
}

/// 对端是否已经关闭或出错；只窥视不读取，不影响后续请求
fn peer_gone(stream: &TcpStream) -> bool {
  if stream.set_nonblocking(true).is_err() {
    return true;
  }
  let mut byte = [0u8; 1];
  let gone = match stream.peek(&mut byte) {
    Ok(0) => true,
    Ok(_) => false,
    Err(e) => e.kind() != io::ErrorKind::WouldBlock,
  };
  gone || stream.set_nonblocking(false).is_err()
}

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("帧处理错误: {0}")]
  Frame(#[from] FrameError),
  #[error("编码错误: {0}")]
  Encode(#[from] CodecError),
}

/// 采集循环：从帧源取帧、编码并写入帧槽，返回写入的帧数
///
/// 单帧读取失败视为暂时不可用，等待 `retry_delay` 后继续；
/// 帧源结束时正常返回，裁切或编码出错时返回错误。
pub fn run_capture<I, E, C>(
  input: I,
  codec: &C,
  slot: &FrameSlot,
  half: Option<Half>,
  retry_delay: Duration,
  stop: &AtomicBool,
) -> Result<u64, CaptureError>
where
  I: Iterator<Item = Result<Frame, E>>,
  E: std::error::Error + Send + Sync + 'static,
  C: FrameCodec,
{
  let mut count = 0u64;
  let mut skipped = 0u64;
  for frame in input {
    if stop.load(Ordering::Relaxed) {
      info!("收到停止信号，退出采集循环");
      break;
    }
    let frame = match frame {
      Ok(frame) => frame,
      Err(e) => {
        skipped += 1;
        warn!("读取帧失败: {}，稍后重试", e);
        thread::sleep(retry_delay);
        continue;
      }
    };
    let frame = match half {
      Some(half) => frame.half(half)?,
      None => frame,
    };
    let encoded = codec.encode(&frame)?;
    if slot.publish(encoded) {
      count += 1;
    }
  }
  if skipped > 0 {
    warn!("采集期间共跳过 {} 个无法读取的帧", skipped);
  }
  Ok(count)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn slot_sequences_and_rejects_empty() {
    let slot = FrameSlot::new();
    assert!(slot.latest().is_none());
    assert!(!slot.publish(EncodedFrame::from(Vec::new())));
    assert_eq!(slot.sequence(), 0);
    assert!(slot.publish(EncodedFrame::from(vec![1, 2, 3])));
    assert!(slot.publish(EncodedFrame::from(vec![4])));
    let (sequence, frame) = slot.latest().unwrap();
    assert_eq!(sequence, 2);
    assert_eq!(frame.as_bytes(), &[4]);
  }

  #[test]
  fn wait_newer_returns_after_publish() {
    let slot = Arc::new(FrameSlot::new());
    let stop = AtomicBool::new(false);
    let writer = {
      let slot = slot.clone();
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        slot.publish(EncodedFrame::from(vec![9]));
      })
    };
    let (sequence, frame) = slot
      .wait_newer(0, Duration::from_millis(1), &stop, || false)
      .unwrap();
    writer.join().unwrap();
    assert_eq!(sequence, 1);
    assert_eq!(frame.as_bytes(), &[9]);
  }

  #[test]
  fn wait_newer_honours_stop() {
    let slot = FrameSlot::new();
    slot.publish(EncodedFrame::from(vec![1]));
    let stop = AtomicBool::new(true);
    // 序号 1 已发送过，没有更新的帧
    assert!(
      slot
        .wait_newer(1, Duration::from_millis(1), &stop, || false)
        .is_none()
    );
  }

  #[test]
  fn wait_newer_gives_up_when_abandoned() {
    let slot = FrameSlot::new();
    let stop = AtomicBool::new(false);
    let mut checks = 0;
    let started = Instant::now();
    let waited = slot.wait_newer(0, Duration::from_millis(1), &stop, || {
      checks += 1;
      checks >= 2
    });
    assert!(waited.is_none());
    assert_eq!(checks, 2);
    assert!(started.elapsed() < Duration::from_secs(1));
  }

  #[derive(Debug, Error)]
  #[error("第 {0} 帧读取失败")]
  struct ReadFailure(usize);

  #[test]
  fn capture_skips_unreadable_frames() {
    let slot = FrameSlot::new();
    let stop = AtomicBool::new(false);
    let codec = crate::codec::JpegCodec::default();
    let source = (0..4).map(|i| match i {
      1 => Err(ReadFailure(i)),
      _ => Ok(Frame::from(image::RgbImage::from_pixel(
        16,
        8,
        image::Rgb([i as u8 * 60, 20, 20]),
      ))),
    });

    let published =
      run_capture(source, &codec, &slot, None, Duration::from_millis(1), &stop).unwrap();
    assert_eq!(published, 3);
    assert_eq!(slot.sequence(), 3);
    let (_, latest) = slot.latest().unwrap();
    let frame = codec.decode(latest.as_bytes()).unwrap();
    assert_eq!((frame.width(), frame.height()), (16, 8));
  }

  #[test]
  fn capture_stops_on_flag() {
    let slot = FrameSlot::new();
    let stop = AtomicBool::new(true);
    let codec = crate::codec::JpegCodec::default();
    let source = std::iter::repeat_with(|| {
      Ok::<_, ReadFailure>(Frame::from(image::RgbImage::new(4, 4)))
    });
    assert_eq!(
      run_capture(source, &codec, &slot, None, Duration::from_millis(1), &stop).unwrap(),
      0
    );
  }

  #[test]
  fn config_from_url() {
    let url = Url::parse("tcp://127.0.0.1:7000?fresh=false&retry_delay_ms=5").unwrap();
    let config = ServerConfig::from_url(&url).unwrap();
    assert_eq!(config.bind, "127.0.0.1:7000");
    assert!(!config.fresh);
    assert_eq!(config.retry_delay, Duration::from_millis(5));

    let url = Url::parse("tcp://0.0.0.0").unwrap();
    assert_eq!(ServerConfig::from_url(&url).unwrap(), ServerConfig::default());
  }
}
