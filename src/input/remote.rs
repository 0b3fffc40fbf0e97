// 该文件是 Yuanwang （远望） 项目的一部分。
// src/input/remote.rs - 远程帧服务输入
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

use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  transport::{FrameTransportClient, TransportClientBuilder, TransportError},
};

/// 把取帧客户端包装成帧迭代器
///
/// 每次 `next` 都是一次完整的阻塞取帧。客户端放弃重试后迭代器返回一次错误并结束。
pub struct RemoteInput {
  client: FrameTransportClient,
  exhausted: bool,
}

impl RemoteInput {
  pub fn new(client: FrameTransportClient) -> Self {
    Self {
      client,
      exhausted: false,
    }
  }

  pub fn server(&self) -> &str {
    self.client.server()
  }

  pub fn client(&self) -> &FrameTransportClient {
    &self.client
  }
}

impl FromUrlWithScheme for RemoteInput {
  const SCHEME: &'static str = TransportClientBuilder::SCHEME;
}

impl FromUrl for RemoteInput {
  type Error = TransportError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Ok(Self::new(TransportClientBuilder::from_url(url)?.build()))
  }
}

impl Iterator for RemoteInput {
  type Item = Result<Frame, TransportError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.exhausted {
      return None;
    }
    let result = self.client.fetch_frame();
    if result.is_err() {
      self.exhausted = true;
    }
    Some(result)
  }
}
