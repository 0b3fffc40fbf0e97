// 该文件是 Yuanwang （远望） 项目的一部分。
// src/model/labels.rs - 类别名称表
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
  path::{Path, PathBuf},
};

use tracing::{debug, warn};

use super::ModelError;

/// 类别编号到名称的映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelTable {
  names: Vec<String>,
}

impl LabelTable {
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      names: names.into_iter().map(Into::into).collect(),
    }
  }

  /// 读取类别描述文件
  ///
  /// 支持两种写法：含 `names = coco.names` 的选项列表（`classes` 可选，用于校验），
  /// 或者每行一个名称的名称文件。
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
      .map_err(|e| ModelError::LabelError(format!("{}: {}", path.display(), e)))?;

    let options = parse_options(&content);
    let table = match options.iter().find(|(k, _)| k == "names") {
      Some((_, names)) => {
        let names_path = resolve(path, names);
        debug!("类别名称文件: {}", names_path.display());
        let table = Self::load_names(&names_path)?;
        if let Some((_, classes)) = options.iter().find(|(k, _)| k == "classes") {
          let classes: usize = classes
            .parse()
            .map_err(|_| ModelError::LabelError(format!("无效的 classes = {}", classes)))?;
          if classes != table.len() {
            return Err(ModelError::LabelError(format!(
              "classes = {} 与名称文件中的 {} 个名称不一致",
              classes,
              table.len()
            )));
          }
        }
        table
      }
      None => Self::from_lines(&content),
    };

    if table.is_empty() {
      return Err(ModelError::LabelError(format!(
        "{} 中没有类别名称",
        path.display()
      )));
    }
    Ok(table)
  }

  fn load_names(path: &Path) -> Result<Self, ModelError> {
    let content = fs::read_to_string(path)
      .map_err(|e| ModelError::LabelError(format!("{}: {}", path.display(), e)))?;
    Ok(Self::from_lines(&content))
  }

  fn from_lines(content: &str) -> Self {
    Self::new(
      content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#')),
    )
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn get(&self, class: usize) -> Option<&str> {
    self.names.get(class).map(String::as_str)
  }

  /// 名称表之外的编号使用 `class<N>`
  pub fn name_of(&self, class: usize) -> String {
    match self.get(class) {
      Some(name) => name.to_string(),
      None => {
        warn!("类别编号 {} 超出名称表范围 ({})", class, self.len());
        format!("class{}", class)
      }
    }
  }
}

fn parse_options(content: &str) -> Vec<(String, String)> {
  content
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty() && !line.starts_with('#'))
    .filter_map(|line| line.split_once('='))
    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
    .collect()
}

/// 相对路径先按当前目录查找，找不到再相对于描述文件所在目录
fn resolve(base: &Path, name: &str) -> PathBuf {
  let direct = PathBuf::from(name);
  if direct.is_absolute() || direct.exists() {
    return direct;
  }
  match base.parent() {
    Some(dir) => dir.join(name),
    None => direct,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_names_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coco.names");
    fs::write(&path, "person\nbicycle\n\n# comment\ncar\n").unwrap();
    let table = LabelTable::load(&path).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.get(2), Some("car"));
    assert_eq!(table.name_of(7), "class7");
  }

  #[test]
  fn option_list_points_to_names() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("obj.names"), "cat\ndog\n").unwrap();
    let data = dir.path().join("obj.data");
    fs::write(&data, "classes = 2\nnames = obj.names\nbackup = backup/\n").unwrap();
    let table = LabelTable::load(&data).unwrap();
    assert_eq!(table, LabelTable::new(["cat", "dog"]));

    fs::write(&data, "classes = 3\nnames = obj.names\n").unwrap();
    assert!(LabelTable::load(&data).is_err());
  }

  #[test]
  fn empty_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.names");
    fs::write(&path, "\n# nothing\n").unwrap();
    assert!(LabelTable::load(&path).is_err());
  }
}
