// 该文件是 Yuanwang （远望） 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod codec;
pub mod frame;
pub mod input;
pub mod model;
pub mod output;
pub mod task;
pub mod transport;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 从 URL 查询参数中读取并解析一个值，不存在时返回 `None`
pub(crate) fn query_value<T: std::str::FromStr>(
  url: &url::Url,
  key: &str,
) -> Result<Option<T>, String> {
  match url.query_pairs().find(|(k, _)| k == key) {
    Some((_, v)) => v
      .parse::<T>()
      .map(Some)
      .map_err(|_| format!("无效的查询参数 {}={}", key, v)),
    None => Ok(None),
  }
}

/// 查询参数作为开关使用：`?flag`、`?flag=true`、`?flag=1` 均视为打开
pub(crate) fn query_flag(url: &url::Url, key: &str) -> bool {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .map(|(_, v)| v.is_empty() || v == "true" || v == "1")
    .unwrap_or(false)
}
