// 该文件是 Yuanwang （远望） 项目的一部分。
// src/output/archive.rs - 帧存档输出
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
  fs,
  io::Write,
  path::{Path, PathBuf},
};

use ab_glyph::{FontArc, PxScale};
use chrono::Local;
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::{Render, records_for};
use crate::{
  FromUrl, FromUrlWithScheme,
  codec::{CodecError, FrameCodec, JpegCodec},
  frame::Frame,
  model::{Detection, DetectionBatch},
  query_flag, query_value,
};

const PALETTE: [[u8; 3]; 6] = [
  [255, 56, 56],
  [56, 255, 56],
  [56, 56, 255],
  [255, 178, 29],
  [207, 49, 255],
  [0, 194, 255],
];

// 标签文字
const LABEL_FONT_SIZE: f32 = 14.0;
const LABEL_TEXT_HEIGHT: u32 = 16;
const LABEL_CHAR_WIDTH: f32 = 7.5; // 没有字体时估算宽度
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// 未指定 `font` 时依次尝试的系统字体
const FONT_CANDIDATES: [&str; 4] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

#[derive(Error, Debug)]
pub enum ArchiveError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("无效的配置: {0}")]
  InvalidConfig(String),
  #[error("编码错误: {0}")]
  CodecError(#[from] CodecError),
  #[error("无法加载字体 {0}")]
  FontLoadError(PathBuf),
  #[error("写入 {path} 失败: {source}")]
  WriteFailed {
    path: PathBuf,
    source: std::io::Error,
  },
}

/// `folder:///base/dir?suffix=front&record&annotate&font=/path/to/font.ttf`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
  pub base: PathBuf,
  pub suffix: Option<String>,
  /// 在图像旁写出同名 `.txt` 记录
  pub record: bool,
  /// 在存档图像上画出检测框和 `名称 XX%` 标签
  pub annotate: bool,
  /// 标签字体 (TTF/OTF)
  pub font: Option<PathBuf>,
  pub quality: u8,
}

impl FromUrlWithScheme for ArchiveConfig {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for ArchiveConfig {
  type Error = ArchiveError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ArchiveError::SchemeMismatch);
    }
    let base = match url.path() {
      "" => PathBuf::from("."),
      path => PathBuf::from(path),
    };
    let suffix = query_value::<String>(url, "suffix").map_err(ArchiveError::InvalidConfig)?;
    let quality = query_value::<u8>(url, "quality").map_err(ArchiveError::InvalidConfig)?;
    let font = query_value::<PathBuf>(url, "font").map_err(ArchiveError::InvalidConfig)?;

    Ok(Self {
      base,
      suffix: suffix.filter(|s| !s.is_empty()),
      record: query_flag(url, "record"),
      annotate: query_flag(url, "annotate"),
      font,
      quality: quality.unwrap_or(crate::codec::DEFAULT_JPEG_QUALITY),
    })
  }
}

impl ArchiveConfig {
  pub fn new(base: impl Into<PathBuf>) -> Self {
    Self {
      base: base.into(),
      suffix: None,
      record: false,
      annotate: false,
      font: None,
      quality: crate::codec::DEFAULT_JPEG_QUALITY,
    }
  }

  /// 指定的字体必须可用；未指定时在系统字体中查找，找不到则标签只有底色
  fn load_font(&self) -> Result<Option<FontArc>, ArchiveError> {
    if let Some(path) = &self.font {
      return read_font(path)
        .map(Some)
        .ok_or_else(|| ArchiveError::FontLoadError(path.clone()));
    }
    let found = FONT_CANDIDATES
      .iter()
      .find_map(|path| read_font(Path::new(path)));
    if found.is_none() {
      warn!("未找到可用字体，检测框标签不显示文字");
    }
    Ok(found)
  }

  /// 创建 `YYYY_MM_DD_HHMM_<suffix>` 目录；未配置后缀时使用 `default_suffix`
  pub fn open(&self, default_suffix: &str) -> Result<DirectoryArchive, ArchiveError> {
    let suffix = self.suffix.as_deref().unwrap_or(default_suffix);
    let name = format!("{}_{}", Local::now().format("%Y_%m_%d_%H%M"), suffix);
    let directory = self.base.join(name);
    fs::create_dir_all(&directory).map_err(|source| ArchiveError::WriteFailed {
      path: directory.clone(),
      source,
    })?;
    info!("帧存档目录: {}", directory.display());

    let font = match self.annotate {
      true => self.load_font()?,
      false => None,
    };

    Ok(DirectoryArchive {
      directory,
      codec: JpegCodec::with_quality(self.quality),
      counter: 0,
      record: self.record,
      annotate: self.annotate,
      font,
    })
  }
}

/// 每帧一个 JPEG：`image_00000.jpg`、`image_00001.jpg`……写入失败即报错
pub struct DirectoryArchive {
  directory: PathBuf,
  codec: JpegCodec,
  counter: u64,
  record: bool,
  annotate: bool,
  font: Option<FontArc>,
}

impl DirectoryArchive {
  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn saved(&self) -> u64 {
    self.counter
  }

  /// 保存一帧，返回图像路径
  pub fn save(
    &mut self,
    channel: &str,
    frame: &Frame,
    batch: &DetectionBatch,
  ) -> Result<PathBuf, ArchiveError> {
    let path = self
      .directory
      .join(format!("image_{:05}.jpg", self.counter));

    let encoded = if self.annotate && !batch.is_empty() {
      let mut image = frame.to_rgb_image();
      annotate(&mut image, batch.as_slice(), self.font.as_ref());
      self.codec.encode(&Frame::from(image))?
    } else {
      self.codec.encode(frame)?
    };
    write_file(&path, encoded.as_bytes())?;

    if self.record {
      let text: String = records_for(channel, batch)
        .iter()
        .map(|record| format!("{}\n", record))
        .collect();
      write_file(&path.with_extension("txt"), text.as_bytes())?;
    }

    debug!("已保存 {}", path.display());
    self.counter += 1;
    Ok(path)
  }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
  fs::File::create(path)
    .and_then(|mut file| file.write_all(bytes))
    .map_err(|source| ArchiveError::WriteFailed {
      path: path.to_path_buf(),
      source,
    })
}

fn color_of(label: &str) -> Rgb<u8> {
  let hash = label
    .bytes()
    .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
  Rgb(PALETTE[hash % PALETTE.len()])
}

fn read_font(path: &Path) -> Option<FontArc> {
  let data = fs::read(path).ok()?;
  FontArc::try_from_vec(data).ok()
}

/// 按归一化中心框画出两像素宽的矩形，框上方是 `名称 XX%` 标签
fn annotate(image: &mut RgbImage, detections: &[Detection], font: Option<&FontArc>) {
  let (w, h) = (image.width() as f32, image.height() as f32);
  let scale = PxScale::from(LABEL_FONT_SIZE);
  for detection in detections {
    let bbox = detection.bbox;
    let x = (bbox.left() * w).floor().max(0.0) as i32;
    let y = (bbox.top() * h).floor().max(0.0) as i32;
    let width = (bbox.width * w).round() as u32;
    let height = (bbox.height * h).round() as u32;
    if width < 3 || height < 3 {
      continue;
    }

    let color = color_of(&detection.label);
    draw_hollow_rect_mut(image, Rect::at(x, y).of_size(width, height), color);
    draw_hollow_rect_mut(
      image,
      Rect::at(x + 1, y + 1).of_size(width - 2, height - 2),
      color,
    );

    let label = format!("{} {:.0}%", detection.label, detection.confidence * 100.0);
    let text_width = match font {
      Some(font) => text_size(scale, font, &label).0 + 4,
      None => (label.chars().count() as f32 * LABEL_CHAR_WIDTH) as u32,
    };
    // 框上方放不下时放在框内顶部
    let label_y = (y - LABEL_TEXT_HEIGHT as i32).max(0);
    let label_width = text_width.min(image.width().saturating_sub(x as u32));
    if label_width == 0 {
      continue;
    }
    draw_filled_rect_mut(
      image,
      Rect::at(x, label_y).of_size(label_width, LABEL_TEXT_HEIGHT),
      color,
    );
    if let Some(font) = font {
      draw_text_mut(image, LABEL_TEXT_COLOR, x + 2, label_y + 1, scale, font, &label);
    }
  }
}

impl Render for DirectoryArchive {
  type Error = ArchiveError;

  fn render_result(
    &mut self,
    channel: &str,
    frame: &Frame,
    batch: &DetectionBatch,
  ) -> Result<(), Self::Error> {
    self.save(channel, frame, batch).map(|_| ())
  }
}
