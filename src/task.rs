// 该文件是 Yuanwang （远望） 项目的一部分。
// src/task.rs - 流水线驱动
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
  str::FromStr,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl,
  frame::{Frame, FrameError, Region},
  input::InputWrapper,
  model::Detector,
  output::{OutputWrapper, Render},
};

pub trait Task<I, D, O>: Sized {
  type Error;
  fn run_task(self, channel: &str, input: I, detector: D, output: O)
  -> Result<TaskReport, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Running,
  Stopped,
}

/// 流水线进入 STOPPED 的原因；致命错误以 `Err` 返回，不在此列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  /// 帧源结束
  EndOfStream,
  /// 操作者中断
  Interrupted,
  /// 达到指定帧数
  FrameLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
  pub channel: String,
  pub frames: u64,
  pub detections: u64,
  pub reason: StopReason,
}

/// 中断信号：所有通道和帧服务共享同一个标志
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
  flag: Arc<AtomicBool>,
}

impl StopSignal {
  /// 收到中断后等待各循环自行退出的时间，超时则直接结束进程
  pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

  pub fn new() -> Self {
    Self::default()
  }

  /// 安装 Ctrl-C 处理函数，每个进程只能调用一次
  pub fn install_ctrlc(&self) -> Result<(), ctrlc::Error> {
    let flag = self.flag.clone();
    ctrlc::set_handler(move || {
      if flag.swap(true, Ordering::SeqCst) {
        return;
      }
      info!("收到中断信号，准备退出...");
      // 阻塞在取帧重试中的通道无法及时看到标志
      thread::spawn(|| {
        thread::sleep(StopSignal::GRACE_PERIOD);
        warn!("等待超时，强制退出程序");
        std::process::exit(0);
      });
    })
  }

  pub fn stop(&self) {
    self.flag.store(true, Ordering::SeqCst);
  }

  pub fn is_stopped(&self) -> bool {
    self.flag.load(Ordering::SeqCst)
  }

  pub fn state(&self) -> PipelineState {
    if self.is_stopped() {
      PipelineState::Stopped
    } else {
      PipelineState::Running
    }
  }

  pub fn flag(&self) -> Arc<AtomicBool> {
    self.flag.clone()
  }
}

/// 检测之前对帧做的裁剪与缩放，先裁剪后缩放
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTransform {
  pub crop: Option<Region>,
  pub scale: Option<f32>,
}

impl FrameTransform {
  pub fn is_identity(&self) -> bool {
    self.crop.is_none() && self.scale.is_none()
  }

  pub fn apply(&self, frame: Frame) -> Result<Frame, FrameError> {
    let frame = match self.crop {
      Some(region) => frame.crop(region)?,
      None => frame,
    };
    match self.scale {
      Some(factor) if factor != 1.0 => frame.scale(factor),
      _ => Ok(frame),
    }
  }
}

/// 连续任务：取帧 → 检测 → 发布/存档，直到帧源结束、达到帧数或收到中断
#[derive(Default, Debug, Clone)]
pub struct ContinuousTask {
  frame_number: Option<u64>,
  transform: FrameTransform,
  stop: StopSignal,
}

impl ContinuousTask {
  pub fn new(stop: StopSignal) -> Self {
    Self {
      stop,
      ..Self::default()
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_transform(mut self, transform: FrameTransform) -> Self {
    self.transform = transform;
    self
  }

  pub fn stop_signal(&self) -> &StopSignal {
    &self.stop
  }
}

impl<I, E, D, O, RE> Task<I, D, O> for ContinuousTask
where
  I: Iterator<Item = Result<Frame, E>>,
  E: std::error::Error + Send + Sync + 'static,
  D: Detector,
  O: Render<Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    channel: &str,
    mut input: I,
    mut detector: D,
    mut output: O,
  ) -> Result<TaskReport, Self::Error> {
    info!("[{}] 开始任务...", channel);
    let mut state = PipelineState::Running;
    let mut frames = 0u64;
    let mut detections = 0u64;
    let mut reason = StopReason::EndOfStream;

    while state == PipelineState::Running {
      if self.stop.is_stopped() {
        warn!("[{}] 中断信号接收，退出任务循环", channel);
        reason = StopReason::Interrupted;
        state = PipelineState::Stopped;
        continue;
      }

      let frame = match input.next() {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
          error!("[{}] 帧源不可用: {}", channel, e);
          return Err(anyhow::Error::new(e).context(format!("[{}] 取帧失败", channel)));
        }
        None => {
          info!("[{}] 帧源结束", channel);
          reason = StopReason::EndOfStream;
          state = PipelineState::Stopped;
          continue;
        }
      };
      // 取帧可能阻塞很久，期间收到的中断不再处理这一帧
      if self.stop.is_stopped() {
        continue;
      }

      let now = Instant::now();
      let frame = self
        .transform
        .apply(frame)
        .with_context(|| format!("[{}] 帧预处理失败", channel))?;
      let batch = detector.detect(&frame).map_err(|e| {
        error!("[{}] 推理失败: {}", channel, e);
        anyhow::Error::new(e).context(format!("[{}] 推理失败", channel))
      })?;
      let elapsed_a = now.elapsed();
      for detection in &batch {
        debug!(
          "[{}] {} {:.3} ({:.3}, {:.3}, {:.3}, {:.3})",
          channel,
          detection.label,
          detection.confidence,
          detection.bbox.center_x,
          detection.bbox.center_y,
          detection.bbox.width,
          detection.bbox.height
        );
      }
      output.render_result(channel, &frame, &batch).map_err(|e| {
        error!("[{}] 输出失败: {}", channel, e);
        anyhow::Error::new(e).context(format!("[{}] 输出失败", channel))
      })?;
      let elapsed_b = now.elapsed();

      frames += 1;
      detections += batch.len() as u64;
      info!(
        "[{}] 第 {} 帧: {} 个目标，耗时: {:.2?} / {:.2?}",
        channel,
        frames,
        batch.len(),
        elapsed_a,
        elapsed_b
      );

      if self.frame_number.is_some_and(|n| frames >= n) {
        info!("[{}] 达到指定帧数 {}, 退出任务循环", channel, frames);
        reason = StopReason::FrameLimit;
        state = PipelineState::Stopped;
      }
    }

    info!("[{}] 任务完成，共处理 {} 帧", channel, frames);
    Ok(TaskReport {
      channel: channel.to_string(),
      frames,
      detections,
      reason,
    })
  }
}

/// 一个检测通道：`name=url`，省略名称时用 URL 的 `name` 参数或主机名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
  pub name: String,
  pub url: Url,
}

impl FromStr for ChannelSpec {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    // 通道名称中不会出现 "://"，查询参数里的 '=' 不当作分隔符
    let (name, raw) = match s.split_once('=') {
      Some((name, rest)) if !name.contains("://") => (Some(name.trim()), rest.trim()),
      _ => (None, s.trim()),
    };
    let url = Url::parse(raw).map_err(|e| format!("无效的通道地址 {}: {}", raw, e))?;
    let name = match name {
      Some("") => return Err(format!("通道名称为空: {}", s)),
      Some(name) => name.to_string(),
      None => url
        .query_pairs()
        .find(|(k, _)| k == "name")
        .map(|(_, v)| v.into_owned())
        .or_else(|| url.host_str().map(str::to_string))
        .unwrap_or_else(|| url.scheme().to_string()),
    };
    Ok(Self { name, url })
  }
}

/// 在独立线程中运行一个通道；各通道只共享检测器
pub fn spawn_channel<D>(
  channel: ChannelSpec,
  outputs: Vec<Url>,
  detector: D,
  task: ContinuousTask,
) -> anyhow::Result<JoinHandle<anyhow::Result<TaskReport>>>
where
  D: Detector + Send + 'static,
{
  let handle = thread::Builder::new()
    .name(channel.name.clone())
    .spawn(move || {
      let input = InputWrapper::from_url(&channel.url)
        .with_context(|| format!("[{}] 无法打开帧源 {}", channel.name, channel.url))?;
      info!("[{}] 帧源: {}", channel.name, input.describe());
      let outputs = OutputWrapper::open_all(&outputs, &channel.name)
        .with_context(|| format!("[{}] 无法打开输出", channel.name))?;
      task.run_task(&channel.name, input, detector, outputs)
    })?;
  Ok(handle)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    frame::PixelOrder,
    model::{BBox, Detection, DetectionBatch, ModelError},
  };

  struct CountingDetector {
    hits: usize,
  }

  impl Detector for CountingDetector {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionBatch, ModelError> {
      assert!(!frame.is_empty());
      Ok(
        (0..self.hits)
          .map(|i| Detection {
            label: format!("obj{}", i),
            confidence: 0.9,
            bbox: BBox::new(0.5, 0.5, 0.1, 0.1),
          })
          .collect::<Vec<_>>()
          .into(),
      )
    }
  }

  struct FailingDetector;

  impl Detector for FailingDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<DetectionBatch, ModelError> {
      Err(ModelError::EmptyFrame)
    }
  }

  #[derive(Default)]
  struct Collect {
    seen: Vec<(String, u32, usize)>,
  }

  impl Render for &mut Collect {
    type Error = std::io::Error;

    fn render_result(
      &mut self,
      channel: &str,
      frame: &Frame,
      batch: &DetectionBatch,
    ) -> Result<(), Self::Error> {
      self.seen.push((channel.to_string(), frame.width(), batch.len()));
      Ok(())
    }
  }

  fn frames(n: usize) -> impl Iterator<Item = Result<Frame, FrameError>> {
    (0..n).map(|_| Frame::new(8, 6, PixelOrder::Rgb, vec![10; 8 * 6 * 3]))
  }

  #[test]
  fn runs_until_end_of_stream() {
    let mut sink = Collect::default();
    let report = ContinuousTask::default()
      .run_task(
        "camera_front",
        frames(3),
        CountingDetector { hits: 2 },
        &mut sink,
      )
      .unwrap();
    assert_eq!(report.frames, 3);
    assert_eq!(report.detections, 6);
    assert_eq!(report.reason, StopReason::EndOfStream);
    assert_eq!(sink.seen.len(), 3);
    assert!(sink.seen.iter().all(|(c, w, n)| c == "camera_front" && *w == 8 && *n == 2));
  }

  #[test]
  fn frame_limit_stops_early() {
    let mut sink = Collect::default();
    let report = ContinuousTask::default()
      .with_frame_number(Some(2))
      .run_task("c", frames(10), CountingDetector { hits: 0 }, &mut sink)
      .unwrap();
    assert_eq!(report.frames, 2);
    assert_eq!(report.reason, StopReason::FrameLimit);
  }

  #[test]
  fn interrupt_stops_before_next_frame() {
    let stop = StopSignal::new();
    stop.stop();
    assert_eq!(stop.state(), PipelineState::Stopped);
    let mut sink = Collect::default();
    let report = ContinuousTask::new(stop)
      .run_task("c", frames(10), CountingDetector { hits: 1 }, &mut sink)
      .unwrap();
    assert_eq!(report.frames, 0);
    assert_eq!(report.reason, StopReason::Interrupted);
    assert!(sink.seen.is_empty());
  }

  #[test]
  fn fatal_errors_end_with_err() {
    let mut sink = Collect::default();
    let result = ContinuousTask::default().run_task("c", frames(3), FailingDetector, &mut sink);
    assert!(result.is_err());
    assert!(sink.seen.is_empty());

    let broken = std::iter::once(Err::<Frame, _>(FrameError::InvalidScale(0.0)));
    let result = ContinuousTask::default().run_task(
      "c",
      broken,
      CountingDetector { hits: 0 },
      &mut sink,
    );
    assert!(result.is_err());
  }

  #[test]
  fn transform_crops_then_scales() {
    let transform = FrameTransform {
      crop: Some("2,1,4,4".parse().unwrap()),
      scale: Some(0.5),
    };
    assert!(!transform.is_identity());
    let mut sink = Collect::default();
    ContinuousTask::default()
      .with_transform(transform)
      .run_task("c", frames(1), CountingDetector { hits: 0 }, &mut sink)
      .unwrap();
    assert_eq!(sink.seen[0].1, 2);

    let out_of_bounds = FrameTransform {
      crop: Some("6,0,4,4".parse().unwrap()),
      scale: None,
    };
    let result = ContinuousTask::default().with_transform(out_of_bounds).run_task(
      "c",
      frames(1),
      CountingDetector { hits: 0 },
      &mut sink,
    );
    assert!(result.is_err());
  }

  #[test]
  fn channel_spec_parsing() {
    let channel: ChannelSpec = "camera_front=tcp://127.0.0.1:25661".parse().unwrap();
    assert_eq!(channel.name, "camera_front");
    assert_eq!(channel.url.port(), Some(25661));

    let channel: ChannelSpec = "tcp://10.0.0.2:25661?name=left&timeout_ms=500".parse().unwrap();
    assert_eq!(channel.name, "left");
    assert_eq!(channel.url.query(), Some("name=left&timeout_ms=500"));

    let channel: ChannelSpec = "tcp://10.0.0.3:25661".parse().unwrap();
    assert_eq!(channel.name, "10.0.0.3");

    assert!("=tcp://127.0.0.1:1".parse::<ChannelSpec>().is_err());
    assert!("front=not a url".parse::<ChannelSpec>().is_err());
  }
}
