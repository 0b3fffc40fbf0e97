// 该文件是 Yuanwang （远望） 项目的一部分。
// src/output.rs - 检测结果输出
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

use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, model::DetectionBatch};

mod archive;
mod publisher;
mod record;

pub use self::archive::{ArchiveConfig, ArchiveError, DirectoryArchive};
pub use self::publisher::{
  DEFAULT_PUBLISH_HOST, DEFAULT_PUBLISH_PORT, MAX_DATAGRAM, PublisherError, UdpPublisher, target_of,
};
pub use self::record::{DetectionRecord, NONE_LABEL, RecordParseError, records_for};

/// 输出一帧的检测结果
pub trait Render {
  type Error;
  fn render_result(
    &mut self,
    channel: &str,
    frame: &Frame,
    batch: &DetectionBatch,
  ) -> Result<(), Self::Error>;
}

/// 依次交给每个输出，遇到第一个错误即返回
impl<R: Render> Render for Vec<R> {
  type Error = R::Error;

  fn render_result(
    &mut self,
    channel: &str,
    frame: &Frame,
    batch: &DetectionBatch,
  ) -> Result<(), Self::Error> {
    for output in self.iter_mut() {
      output.render_result(channel, frame, batch)?;
    }
    Ok(())
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("检测结果发布错误: {0}")]
  PublisherError(#[from] PublisherError),
  #[error("帧存档错误: {0}")]
  ArchiveError(#[from] ArchiveError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 按 URL scheme 选择的输出：`udp://` 发布结果，`folder://` 存档帧
pub enum OutputWrapper {
  Publisher(UdpPublisher),
  Archive(DirectoryArchive),
}

impl OutputWrapper {
  /// 为某个通道打开输出；存档目录未指定后缀时以通道名为后缀
  pub fn open(url: &Url, channel: &str) -> Result<Self, OutputError> {
    match url.scheme() {
      UdpPublisher::SCHEME => Ok(OutputWrapper::Publisher(UdpPublisher::from_url(url)?)),
      ArchiveConfig::SCHEME => Ok(OutputWrapper::Archive(
        ArchiveConfig::from_url(url)?.open(channel)?,
      )),
      _ => Err(OutputError::SchemeMismatch),
    }
  }

  /// 打开一个通道的全部输出；所有 `udp://` 地址合并为一个发布者，每条记录发往每个接收方
  pub fn open_all(urls: &[Url], channel: &str) -> Result<Vec<Self>, OutputError> {
    let mut outputs = Vec::with_capacity(urls.len());
    let mut publisher: Option<UdpPublisher> = None;
    for url in urls {
      if url.scheme() != UdpPublisher::SCHEME {
        outputs.push(Self::open(url, channel)?);
      } else if let Some(publisher) = publisher.as_mut() {
        publisher.add_target(target_of(url)?)?;
      } else {
        publisher = Some(UdpPublisher::from_url(url)?);
      }
    }
    if let Some(publisher) = publisher {
      outputs.insert(0, OutputWrapper::Publisher(publisher));
    }
    Ok(outputs)
  }
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Self::open(url, "frames")
  }
}

impl Render for OutputWrapper {
  type Error = OutputError;

  fn render_result(
    &mut self,
    channel: &str,
    frame: &Frame,
    batch: &DetectionBatch,
  ) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Publisher(output) => output
        .render_result(channel, frame, batch)
        .map_err(OutputError::from),
      OutputWrapper::Archive(output) => output
        .render_result(channel, frame, batch)
        .map_err(OutputError::from),
    }
  }
}
