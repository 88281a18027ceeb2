// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/model.rs - 骨干网络注册与模型组装
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

use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr};

use image::RgbImage;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{Config, ConfigError},
  prior::{PriorBoxList, prior_boxes},
};

/// 一个检测结果: 归一化框 [x_min, y_min, x_max, y_max]、置信度、类别索引
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub bbox: [f32; 4],
  pub confidence: f32,
  pub class_index: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    DetectResult {
      items: items.into_boxed_slice(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backbone {
  Vgg16,
  ResNet50,
  ResNet101,
  MobileNetV2,
}

impl Backbone {
  pub const ALL: [Backbone; 4] = [
    Backbone::Vgg16,
    Backbone::ResNet50,
    Backbone::ResNet101,
    Backbone::MobileNetV2,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      Backbone::Vgg16 => "VGG16",
      Backbone::ResNet50 => "ResNet50",
      Backbone::ResNet101 => "ResNet101",
      Backbone::MobileNetV2 => "MobileNetV2",
    }
  }
}

impl fmt::Display for Backbone {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Backbone {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Backbone::ALL
      .into_iter()
      .find(|b| b.name().eq_ignore_ascii_case(s))
      .ok_or_else(|| ConfigError::UnknownBackbone(s.to_string()))
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("骨干网络未注册: {0}")]
  NotRegistered(Backbone),
  #[error("权重文件不存在: {0}")]
  WeightNotFound(PathBuf),
  #[error("网络输出形状错误: 期望 {expected:?}, 实际 {found:?}")]
  OutputShape {
    expected: (usize, usize, usize),
    found: (usize, usize, usize),
  },
  #[error("网络错误: {0}")]
  Network(String),
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
}

/// 待加载的权重文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightFile {
  pub path: PathBuf,
  /// 按层名匹配加载，跳过形状不匹配的层
  pub by_name: bool,
}

impl WeightFile {
  pub fn new<P: Into<PathBuf>>(path: P, by_name: bool) -> Self {
    WeightFile {
      path: path.into(),
      by_name,
    }
  }
}

/// 由外部框架实现的 SSD 网络
pub trait SsdNetwork: Send + Sync {
  fn backbone(&self) -> Backbone;
  fn num_priors(&self) -> usize;
  fn load_weights(&mut self, weights: &WeightFile) -> Result<(), ModelError>;
  /// 输出形状 [batch, num_priors, 4 + num_classes + 8]
  fn predict(&self, images: &[RgbImage]) -> Result<Array3<f32>, ModelError>;
}

pub trait NetworkBuilder: Send + Sync {
  fn build(&self, priors: &PriorBoxList) -> Result<Box<dyn SsdNetwork>, ModelError>;
}

impl<F> NetworkBuilder for F
where
  F: Fn(&PriorBoxList) -> Result<Box<dyn SsdNetwork>, ModelError> + Send + Sync,
{
  fn build(&self, priors: &PriorBoxList) -> Result<Box<dyn SsdNetwork>, ModelError> {
    self(priors)
  }
}

#[derive(Default)]
pub struct NetworkRegistry {
  builders: HashMap<Backbone, Box<dyn NetworkBuilder>>,
}

impl NetworkRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<B: NetworkBuilder + 'static>(mut self, backbone: Backbone, builder: B) -> Self {
    if self.builders.insert(backbone, Box::new(builder)).is_some() {
      warn!("骨干网络 {} 的构建器被替换", backbone);
    }
    self
  }

  pub fn contains(&self, backbone: Backbone) -> bool {
    self.builders.contains_key(&backbone)
  }

  pub fn build(
    &self,
    backbone: Backbone,
    priors: &PriorBoxList,
  ) -> Result<Box<dyn SsdNetwork>, ModelError> {
    let builder = self
      .builders
      .get(&backbone)
      .ok_or(ModelError::NotRegistered(backbone))?;
    builder.build(priors)
  }

  /// 生成先验框、构建网络并依次加载权重
  pub fn get_model(
    &self,
    backbone: Backbone,
    config: &Config,
    weights: &[WeightFile],
  ) -> Result<Box<dyn SsdNetwork>, ModelError> {
    let priors = prior_boxes(backbone, config.input_dim, config.variances);
    info!("构建 {} 模型, 先验框数量: {}", backbone, priors.len());
    let mut network = self.build(backbone, &priors)?;

    for weight in weights {
      if !weight.path.exists() {
        return Err(ModelError::WeightNotFound(weight.path.clone()));
      }
      info!(
        "加载权重文件: {} (按层名: {})",
        weight.path.display(),
        weight.by_name
      );
      network.load_weights(weight)?;
    }

    debug!("模型组装完成");
    Ok(network)
  }
}
