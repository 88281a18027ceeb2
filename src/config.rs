// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/config.rs - 项目配置
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

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// VOC 数据集类别名称（不含背景）
pub const VOC_CLASSES: [&str; 20] = [
  "aeroplane",
  "bicycle",
  "bird",
  "boat",
  "bottle",
  "bus",
  "car",
  "cat",
  "chair",
  "cow",
  "diningtable",
  "dog",
  "horse",
  "motorbike",
  "person",
  "pottedplant",
  "sheep",
  "sofa",
  "train",
  "tvmonitor",
];

/// 配置错误，均为致命错误
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("未知的预处理方法: {0}")]
  UnknownMethod(String),
  #[error("无效的输入尺寸: {0}")]
  InvalidInputDim(String),
  #[error("未知的骨干网络: {0}")]
  UnknownBackbone(String),
  #[error("类别列数不匹配: 期望 {expected}, 实际 {found}")]
  ClassColumnMismatch { expected: usize, found: usize },
  #[error("配置文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置文件解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// 类别名称，不含背景类
  pub class_names: Vec<String>,
  /// 背景类索引
  pub bg_class: usize,
  /// 困难负样本与正样本的比例
  pub neg_pos_ratio: f32,
  /// 整个批次都不需要负样本时注入的负样本数量
  pub negatives_for_hard: f32,
  /// 定位损失权重
  pub alpha: f32,
  /// 模型输入尺寸（正方形边长）
  pub input_dim: u32,
  pub variances: [f32; 4],
  /// 真值框与先验框匹配的 IOU 阈值
  pub overlap_threshold: f32,
  pub nms_threshold: f32,
  pub confidence_threshold: f32,
  pub top_k: usize,
  pub keep_top_k: usize,
  pub checkpoint_dir: PathBuf,
  pub tensorboard_log_dir: PathBuf,
  /// 标签字体文件，为空时只绘制边框
  pub font_path: Option<PathBuf>,
  /// 数值计算线程数，为空时由 rayon 决定
  pub num_threads: Option<usize>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      class_names: VOC_CLASSES.iter().map(|name| name.to_string()).collect(),
      bg_class: 0,
      neg_pos_ratio: 3.0,
      negatives_for_hard: 100.0,
      alpha: 1.0,
      input_dim: 300,
      variances: [0.1, 0.1, 0.2, 0.2],
      overlap_threshold: 0.5,
      nms_threshold: 0.45,
      confidence_threshold: 0.01,
      top_k: 400,
      keep_top_k: 200,
      checkpoint_dir: PathBuf::from("checkpoints"),
      tensorboard_log_dir: PathBuf::from("logs"),
      font_path: None,
      num_threads: None,
    }
  }
}

impl Config {
  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("加载配置文件: {}", path.display());
    let data = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&data)?;
    debug!("配置内容: {:?}", config);
    Ok(config)
  }

  /// 类别数（含背景）
  pub fn num_classes(&self) -> usize {
    self.class_names.len() + 1
  }

  /// 每个先验框一行的张量宽度: 4 个偏移 + 类别 + 8 个辅助值
  pub fn row_width(&self) -> usize {
    4 + self.num_classes() + 8
  }

  pub fn class_name(&self, index: u32) -> Option<&str> {
    let index = index as usize;
    if index == self.bg_class {
      return Some("background");
    }
    let offset = if index > self.bg_class { 1 } else { 0 };
    self
      .class_names
      .get(index - offset)
      .map(|name| name.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_describe_voc() {
    let config = Config::default();
    assert_eq!(config.num_classes(), 21);
    assert_eq!(config.row_width(), 33);
    assert_eq!(config.class_name(0), Some("background"));
    assert_eq!(config.class_name(15), Some("person"));
    assert_eq!(config.class_name(21), None);
  }

  #[test]
  fn partial_json_keeps_defaults() {
    let config: Config =
      serde_json::from_str(r#"{ "class_names": ["cat", "dog"], "alpha": 2.0 }"#).unwrap();
    assert_eq!(config.num_classes(), 3);
    assert_eq!(config.alpha, 2.0);
    assert_eq!(config.neg_pos_ratio, 3.0);
    assert_eq!(config.input_dim, 300);
  }
}
