// 该文件是 Yuanwang （远望） 项目的一部分。
// src/transport/retry.rs - 重试与退避策略
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

use std::time::Duration;

/// 取帧失败后的重试策略
///
/// 默认不限次数，两次尝试之间按指数退避，上限 2 秒。
/// `initial_backoff` 为零时退化为立即重发。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  pub multiplier: u32,
  /// 总尝试次数上限（含第一次），`None` 表示不限
  pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      initial_backoff: Duration::from_millis(100),
      max_backoff: Duration::from_secs(2),
      multiplier: 2,
      max_attempts: None,
    }
  }
}

impl RetryPolicy {
  /// 超时后立即重发，不退避
  pub fn immediate() -> Self {
    Self {
      initial_backoff: Duration::ZERO,
      max_backoff: Duration::ZERO,
      multiplier: 1,
      max_attempts: None,
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
    self.max_attempts = max_attempts.filter(|&n| n > 0);
    self
  }

  pub fn backoff(&self) -> Backoff {
    Backoff {
      policy: self.clone(),
      retries: 0,
    }
  }
}

/// 一次取帧过程中的退避序列，每次失败取下一个等待时长
#[derive(Debug, Clone)]
pub struct Backoff {
  policy: RetryPolicy,
  retries: u32,
}

impl Backoff {
  /// 已经发起的尝试次数
  pub fn attempts(&self) -> u32 {
    self.retries + 1
  }
}

impl Iterator for Backoff {
  type Item = Duration;

  fn next(&mut self) -> Option<Duration> {
    if let Some(max) = self.policy.max_attempts
      && self.retries + 1 >= max
    {
      return None;
    }

    let factor = self
      .policy
      .multiplier
      .max(1)
      .checked_pow(self.retries)
      .unwrap_or(u32::MAX);
    let delay = self
      .policy
      .initial_backoff
      .checked_mul(factor)
      .unwrap_or(self.policy.max_backoff)
      .min(self.policy.max_backoff);
    self.retries += 1;
    Some(delay)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_backoff_grows_and_caps() {
    let delays: Vec<_> = RetryPolicy::default().backoff().take(7).collect();
    let ms: Vec<_> = delays.iter().map(|d| d.as_millis()).collect();
    assert_eq!(ms, vec![100, 200, 400, 800, 1600, 2000, 2000]);
  }

  #[test]
  fn bounded_policy_stops() {
    let policy = RetryPolicy::default().with_max_attempts(Some(3));
    let mut backoff = policy.backoff();
    assert!(backoff.next().is_some());
    assert!(backoff.next().is_some());
    assert_eq!(backoff.attempts(), 3);
    assert!(backoff.next().is_none());
  }

  #[test]
  fn zero_max_attempts_means_unbounded() {
    let policy = RetryPolicy::immediate().with_max_attempts(Some(0));
    assert_eq!(policy.max_attempts, None);
    assert!(policy.backoff().take(1000).all(|d| d == Duration::ZERO));
  }
}
