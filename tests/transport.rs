// 该文件是 Yuanwang （远望） 项目的一部分。
// tests/transport.rs - 帧传输集成测试
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

//! 在回环地址上运行真实的 TCP 服务端与客户端：
//! 暂缓应答、不应答、损坏应答、服务端重启等情况下两端的行为。

use std::{
  net::TcpListener,
  sync::{Arc, Mutex},
  thread,
  time::{Duration, Instant},
};

use yuanwang::{
  codec::{FrameCodec, JpegCodec},
  frame::{Frame, PixelOrder},
  transport::{
    FrameSlot, FrameTransportClient, FrameTransportServer, RetryPolicy, ServerConfig,
    TransportError,
    wire::{HANDSHAKE, read_message, write_message},
  },
};

fn gradient(width: u32, height: u32) -> Frame {
  let mut data = Vec::with_capacity((width * height * 3) as usize);
  for y in 0..height {
    for x in 0..width {
      data.extend_from_slice(&[(x * 2) as u8, (y * 2) as u8, 128]);
    }
  }
  Frame::new(width, height, PixelOrder::Rgb, data).unwrap()
}

fn local_server(slot: Arc<FrameSlot>) -> (String, FrameTransportServer) {
  let server =
    FrameTransportServer::bind(ServerConfig::default().with_bind("127.0.0.1:0"), slot).unwrap();
  let addr = server.local_addr().unwrap().to_string();
  (addr, server)
}

/// 只记录握手、从不应答的服务端
fn silent_server() -> (String, Arc<Mutex<Vec<(Instant, Vec<u8>)>>>) {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap().to_string();
  let requests = Arc::new(Mutex::new(Vec::new()));
  let seen = requests.clone();
  thread::spawn(move || {
    for stream in listener.incoming() {
      let Ok(mut stream) = stream else { break };
      let seen = seen.clone();
      thread::spawn(move || {
        while let Ok(request) = read_message(&mut stream) {
          seen.lock().unwrap().push((Instant::now(), request));
        }
      });
    }
  });
  (addr, requests)
}

#[test]
fn delayed_frame_is_delivered_without_retry() {
  let slot = Arc::new(FrameSlot::new());
  let (addr, server) = local_server(slot.clone());
  let stop = server.stop_flag();
  let stats = server.stats();
  let handle = server.spawn().unwrap();

  let publisher = {
    let slot = slot.clone();
    thread::spawn(move || {
      thread::sleep(Duration::from_millis(50));
      let encoded = JpegCodec::default().encode(&gradient(100, 100)).unwrap();
      assert!(slot.publish(encoded));
    })
  };

  let mut client = FrameTransportClient::new(addr);
  let frame = client.fetch_frame().unwrap();
  publisher.join().unwrap();

  assert_eq!((frame.width(), frame.height()), (100, 100));
  assert_eq!(client.stats().requests, 1);
  assert_eq!(client.stats().timeouts, 0);
  assert_eq!(stats.requests(), 1);
  assert_eq!(stats.replies(), 1);

  stop.store(true, std::sync::atomic::Ordering::SeqCst);
  handle.join().unwrap().unwrap();
}

#[test]
fn silent_server_gets_identical_handshakes() {
  let (addr, requests) = silent_server();

  let started = Instant::now();
  let mut client =
    FrameTransportClient::new(addr).with_retry(RetryPolicy::default().with_max_attempts(Some(3)));
  let result = client.fetch();

  assert!(matches!(
    result,
    Err(TransportError::RetriesExhausted { attempts: 3, .. })
  ));
  assert_eq!(client.stats().timeouts, 3);
  assert_eq!(client.stats().frames, 0);

  let requests = requests.lock().unwrap();
  assert_eq!(requests.len(), 3);
  assert!(requests.iter().all(|(_, payload)| payload == HANDSHAKE));
  // 第一次之后至少两次重发都在 3 秒之内
  let within = requests
    .iter()
    .filter(|(at, _)| at.duration_since(started) < Duration::from_secs(3))
    .count();
  assert!(within >= 3, "only {} handshakes within 3s", within);
}

#[test]
fn corrupt_reply_is_retried() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap().to_string();
  let server = thread::spawn(move || {
    let (mut stream, _) = listener.accept().unwrap();
    let first = read_message(&mut stream).unwrap();
    write_message(&mut stream, b"not a jpeg").unwrap();
    let second = read_message(&mut stream).unwrap();
    let encoded = JpegCodec::default().encode(&gradient(32, 24)).unwrap();
    write_message(&mut stream, encoded.as_bytes()).unwrap();
    (first, second)
  });

  let mut client = FrameTransportClient::new(addr).with_retry(RetryPolicy::immediate());
  let frame = client.fetch_frame().unwrap();
  let (first, second) = server.join().unwrap();

  assert_eq!((frame.width(), frame.height()), (32, 24));
  assert_eq!(first, second);
  assert_eq!(client.stats().invalid_replies, 1);
  assert_eq!(client.stats().requests, 2);
}

#[test]
fn round_trip_keeps_dimensions() {
  let slot = Arc::new(FrameSlot::new());
  let (addr, server) = local_server(slot.clone());
  let stop = server.stop_flag();
  let handle = server.spawn().unwrap();

  let mut client = FrameTransportClient::new(addr);
  for (width, height) in [(37, 23), (640, 480), (1, 1)] {
    let encoded = JpegCodec::with_quality(92).encode(&gradient(width, height)).unwrap();
    assert!(slot.publish(encoded));
    let frame = client.fetch_frame().unwrap();
    assert_eq!((frame.width(), frame.height()), (width, height));
  }
  assert_eq!(client.stats().requests, 3);

  stop.store(true, std::sync::atomic::Ordering::SeqCst);
  handle.join().unwrap().unwrap();
}

#[test]
fn departed_clients_release_their_connections() {
  let slot = Arc::new(FrameSlot::new());
  let (addr, server) = local_server(slot);
  let stop = server.stop_flag();
  let stats = server.stats();
  let handle = server.spawn().unwrap();

  // 帧槽一直为空，每个客户端都会超时离开
  for _ in 0..10 {
    let mut client = FrameTransportClient::new(addr.clone())
      .with_timeout(Duration::from_millis(100))
      .with_retry(RetryPolicy::immediate().with_max_attempts(Some(1)));
    assert!(matches!(
      client.fetch(),
      Err(TransportError::RetriesExhausted { attempts: 1, .. })
    ));
  }

  let deadline = Instant::now() + Duration::from_secs(3);
  while stats.active() > 0 && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(20));
  }
  assert_eq!(stats.connections(), 10);
  assert_eq!(stats.active(), 0);
  assert_eq!(stats.replies(), 0);

  stop.store(true, std::sync::atomic::Ordering::SeqCst);
  handle.join().unwrap().unwrap();
}

#[test]
fn default_policy_outlasts_server_restart() {
  // 绑定后立即释放，服务端稍后在同一端口上线
  let addr = TcpListener::bind("127.0.0.1:0")
    .unwrap()
    .local_addr()
    .unwrap()
    .to_string();

  let client = {
    let addr = addr.clone();
    thread::spawn(move || {
      let mut client = FrameTransportClient::new(addr);
      let frame = client.fetch_frame().unwrap();
      (frame, client.stats().clone())
    })
  };

  // 100 + 200 + 400 + 800 ms 之后仍未上线
  thread::sleep(Duration::from_millis(2500));
  let slot = Arc::new(FrameSlot::new());
  let encoded = JpegCodec::default().encode(&gradient(48, 32)).unwrap();
  assert!(slot.publish(encoded));
  let server =
    FrameTransportServer::bind(ServerConfig::default().with_bind(addr.as_str()), slot).unwrap();
  let stop = server.stop_flag();
  let handle = server.spawn().unwrap();

  let (frame, stats) = client.join().unwrap();
  assert_eq!((frame.width(), frame.height()), (48, 32));
  assert!(stats.connect_failures >= 4, "{:?}", stats);
  assert_eq!(stats.frames, 1);

  stop.store(true, std::sync::atomic::Ordering::SeqCst);
  handle.join().unwrap().unwrap();
}
