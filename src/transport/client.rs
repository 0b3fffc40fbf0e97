// 该文件是 Yuanwang （远望） 项目的一部分。
// src/transport/client.rs - 帧传输客户端
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
  io::{self, Read},
  net::{TcpStream, ToSocketAddrs},
  thread,
  time::{Duration, Instant},
};

use tracing::{debug, info, warn};
use url::Url;

use super::{
  DEFAULT_PORT, DEFAULT_TIMEOUT_MS, RetryPolicy, TransportError,
  wire::{HANDSHAKE, is_timeout, read_message, write_message},
};
use crate::{
  FromUrl, FromUrlWithScheme,
  codec::{CodecError, FrameCodec, JpegCodec},
  frame::{EncodedFrame, Frame},
  query_value,
};

/// 客户端累计的统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
  pub requests: u64,
  pub frames: u64,
  pub timeouts: u64,
  pub io_errors: u64,
  pub invalid_replies: u64,
  pub connect_failures: u64,
}

enum AttemptError {
  Connect(io::Error),
  Timeout,
  Io(io::Error),
  Invalid(CodecError),
}

/// 请求/应答取帧客户端
///
/// `fetch` 会一直阻塞直到拿到一帧可解码的非空图像。超时、连接失败和损坏的应答
/// 都在内部重试，只有在配置了最大尝试次数并耗尽时才向调用者报错。
///
/// 超时或套接字错误后旧连接会被丢弃，下一次尝试重新建立连接后再发送同样的握手，
/// 迟到的应答因此不会被当作新请求的结果。
pub struct FrameTransportClient<C = JpegCodec> {
  server: String,
  name: String,
  timeout: Duration,
  retry: RetryPolicy,
  codec: C,
  stream: Option<TcpStream>,
  stats: ClientStats,
}

impl FrameTransportClient<JpegCodec> {
  pub fn new(server: impl Into<String>) -> Self {
    let server = server.into();
    Self {
      name: server.clone(),
      server,
      timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
      retry: RetryPolicy::default(),
      codec: JpegCodec::default(),
      stream: None,
      stats: ClientStats::default(),
    }
  }
}

impl<C: FrameCodec> FrameTransportClient<C> {
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn server(&self) -> &str {
    &self.server
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn stats(&self) -> &ClientStats {
    &self.stats
  }

  /// 取回一帧编码数据，内部已验证可以解码
  pub fn fetch(&mut self) -> Result<EncodedFrame, TransportError> {
    self.fetch_decoded().map(|(encoded, _)| encoded)
  }

  /// 取回一帧并返回解码后的像素
  pub fn fetch_frame(&mut self) -> Result<Frame, TransportError> {
    self.fetch_decoded().map(|(_, frame)| frame)
  }

  pub fn fetch_decoded(&mut self) -> Result<(EncodedFrame, Frame), TransportError> {
    let mut backoff = self.retry.backoff();
    loop {
      match self.attempt() {
        Ok(result) => {
          self.stats.frames += 1;
          return Ok(result);
        }
        Err(AttemptError::Connect(e)) => {
          self.stats.connect_failures += 1;
          warn!("无法连接到 {} ({}): {}，重试...", self.name, self.server, e);
        }
        Err(AttemptError::Timeout) => {
          self.stats.timeouts += 1;
          warn!(
            "在 {:?} 内未收到 {} 的应答，重试...",
            self.timeout, self.name
          );
        }
        Err(AttemptError::Io(e)) => {
          self.stats.io_errors += 1;
          warn!("与 {} 通信失败: {}，重试...", self.name, e);
        }
        Err(AttemptError::Invalid(e)) => {
          self.stats.invalid_replies += 1;
          warn!("收到来自 {} 的空帧或损坏的帧: {}，重试...", self.name, e);
        }
      }

      match backoff.next() {
        Some(delay) if !delay.is_zero() => thread::sleep(delay),
        Some(_) => {}
        None => {
          return Err(TransportError::RetriesExhausted {
            server: self.name.clone(),
            attempts: backoff.attempts(),
          });
        }
      }
    }
  }

  fn attempt(&mut self) -> Result<(EncodedFrame, Frame), AttemptError> {
    // 出错时连接随 stream 一起被丢弃
    let mut stream = match self.stream.take() {
      Some(stream) => stream,
      None => self.connect().map_err(AttemptError::Connect)?,
    };

    debug!("向 {} 发送请求", self.name);
    self.stats.requests += 1;
    write_message(&mut stream, HANDSHAKE).map_err(AttemptError::Io)?;

    let deadline = Instant::now() + self.timeout;
    let payload = read_message(&mut DeadlineReader {
      stream: &mut stream,
      deadline,
    })
    .map_err(|e| {
      if is_timeout(&e) {
        AttemptError::Timeout
      } else {
        AttemptError::Io(e)
      }
    })?;

    // 已收到完整应答，连接可以继续复用
    self.stream = Some(stream);

    let frame = self.codec.decode(&payload).map_err(AttemptError::Invalid)?;
    debug!(
      "收到来自 {} 的帧: {} 字节, {}x{}",
      self.name,
      payload.len(),
      frame.width(),
      frame.height()
    );
    Ok((EncodedFrame::from(payload), frame))
  }

  fn connect(&self) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in self.server.to_socket_addrs()? {
      match TcpStream::connect_timeout(&addr, self.timeout) {
        Ok(stream) => {
          stream.set_nodelay(true)?;
          stream.set_write_timeout(Some(self.timeout))?;
          info!("已连接到 {} ({})", self.name, addr);
          return Ok(stream);
        }
        Err(e) => last_error = Some(e),
      }
    }
    Err(last_error.unwrap_or_else(|| {
      io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("无法解析地址: {}", self.server),
      )
    }))
  }
}

/// 保证一次应答的总读取时间不超过截止时刻
struct DeadlineReader<'a> {
  stream: &'a mut TcpStream,
  deadline: Instant,
}

impl Read for DeadlineReader<'_> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let remaining = self.deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
      return Err(io::Error::new(io::ErrorKind::TimedOut, "应答超时"));
    }
    self.stream.set_read_timeout(Some(remaining))?;
    self.stream.read(buf)
  }
}

/// 从 `tcp://host:port?...` 构建客户端
///
/// 支持的查询参数：`timeout_ms`、`backoff_ms`、`max_backoff_ms`、`max_attempts`、`name`。
#[derive(Debug, Clone)]
pub struct TransportClientBuilder {
  server: String,
  name: Option<String>,
  timeout: Duration,
  retry: RetryPolicy,
}

impl FromUrlWithScheme for TransportClientBuilder {
  const SCHEME: &'static str = "tcp";
}

impl FromUrl for TransportClientBuilder {
  type Error = TransportError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(TransportError::SchemeMismatch);
    }
    let host = url
      .host_str()
      .ok_or_else(|| TransportError::InvalidAddress(url.to_string()))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);

    let timeout_ms =
      query_value::<u64>(url, "timeout_ms").map_err(TransportError::InvalidConfig)?;
    let backoff_ms =
      query_value::<u64>(url, "backoff_ms").map_err(TransportError::InvalidConfig)?;
    let max_backoff_ms =
      query_value::<u64>(url, "max_backoff_ms").map_err(TransportError::InvalidConfig)?;
    let max_attempts =
      query_value::<u32>(url, "max_attempts").map_err(TransportError::InvalidConfig)?;
    let name = query_value::<String>(url, "name").map_err(TransportError::InvalidConfig)?;

    let mut retry = match backoff_ms {
      Some(0) => RetryPolicy::immediate(),
      Some(ms) => RetryPolicy {
        initial_backoff: Duration::from_millis(ms),
        ..RetryPolicy::default()
      },
      None => RetryPolicy::default(),
    };
    if let Some(ms) = max_backoff_ms {
      retry.max_backoff = Duration::from_millis(ms);
    }
    let retry = retry.with_max_attempts(max_attempts);

    let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
    if timeout.is_zero() {
      return Err(TransportError::InvalidConfig("timeout_ms 必须大于 0".into()));
    }

    Ok(Self {
      server: format!("{}:{}", host, port),
      name,
      timeout,
      retry,
    })
  }
}

impl TransportClientBuilder {
  pub fn build(self) -> FrameTransportClient<JpegCodec> {
    let client = FrameTransportClient::new(self.server)
      .with_timeout(self.timeout)
      .with_retry(self.retry);
    match self.name {
      Some(name) => client.with_name(name),
      None => client,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_reads_query_parameters() {
    let url = Url::parse(
      "tcp://192.168.123.13:25661?timeout_ms=500&backoff_ms=50&max_backoff_ms=400&max_attempts=4&name=front",
    )
    .unwrap();
    let client = TransportClientBuilder::from_url(&url).unwrap().build();
    assert_eq!(client.server(), "192.168.123.13:25661");
    assert_eq!(client.name(), "front");
    assert_eq!(client.timeout, Duration::from_millis(500));
    assert_eq!(client.retry.initial_backoff, Duration::from_millis(50));
    assert_eq!(client.retry.max_backoff, Duration::from_millis(400));
    assert_eq!(client.retry.max_attempts, Some(4));
  }

  #[test]
  fn builder_defaults() {
    let url = Url::parse("tcp://camera.local").unwrap();
    let client = TransportClientBuilder::from_url(&url).unwrap().build();
    assert_eq!(client.server(), "camera.local:25661");
    assert_eq!(client.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    assert_eq!(client.retry, RetryPolicy::default());

    let immediate = Url::parse("tcp://camera.local?backoff_ms=0").unwrap();
    let client = TransportClientBuilder::from_url(&immediate).unwrap().build();
    assert_eq!(client.retry, RetryPolicy::immediate());
  }

  #[test]
  fn builder_rejects_other_schemes() {
    let url = Url::parse("udp://127.0.0.1:1").unwrap();
    assert!(matches!(
      TransportClientBuilder::from_url(&url),
      Err(TransportError::SchemeMismatch)
    ));
  }

  #[test]
  fn bounded_client_gives_up_on_refused_connection() {
    // 绑定后立即释放，得到一个大概率无人监听的端口
    let port = std::net::TcpListener::bind("127.0.0.1:0")
      .unwrap()
      .local_addr()
      .unwrap()
      .port();
    let mut client = FrameTransportClient::new(format!("127.0.0.1:{}", port))
      .with_timeout(Duration::from_millis(200))
      .with_retry(RetryPolicy::immediate().with_max_attempts(Some(2)));
    let err = client.fetch().unwrap_err();
    assert!(matches!(
      err,
      TransportError::RetriesExhausted { attempts: 2, .. }
    ));
    assert_eq!(client.stats().frames, 0);
  }
}
