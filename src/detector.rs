// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/detector.rs - SSD 推理流程
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

use image::RgbImage;
use ndarray::Axis;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  codec::{BoxDecoder, CodecError},
  config::Config,
  model::{DetectResult, ModelError, SsdNetwork},
  preprocess::{PMethod, preprocess},
};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("模型错误: {0}")]
  ModelError(#[from] ModelError),
  #[error("解码错误: {0}")]
  CodecError(#[from] CodecError),
}

/// 预处理 -> 网络前向 -> 解码
pub struct SsdDetector {
  network: Box<dyn SsdNetwork>,
  decoder: BoxDecoder,
  method: PMethod,
  input_dim: u32,
  row_width: usize,
}

impl SsdDetector {
  pub fn new(network: Box<dyn SsdNetwork>, config: &Config, method: PMethod) -> Self {
    info!(
      "创建检测器: 骨干网络 {}, 预处理方法 {}, 输入尺寸 {}",
      network.backbone(),
      method,
      config.input_dim
    );
    SsdDetector {
      network,
      decoder: BoxDecoder::new(config),
      method,
      input_dim: config.input_dim,
      row_width: config.row_width(),
    }
  }

  pub fn with_decoder(mut self, decoder: BoxDecoder) -> Self {
    self.decoder = decoder;
    self
  }

  pub fn method(&self) -> PMethod {
    self.method
  }

  pub fn input_dim(&self) -> u32 {
    self.input_dim
  }

  pub fn detect_batch(&self, images: &[RgbImage]) -> Result<Vec<DetectResult>, DetectorError> {
    let inputs: Vec<RgbImage> = images
      .iter()
      .map(|image| preprocess(image, self.method, self.input_dim))
      .collect();

    let now = std::time::Instant::now();
    let prediction = self.network.predict(&inputs)?;
    debug!("网络前向耗时: {:.2?}", now.elapsed());

    let expected = (inputs.len(), self.network.num_priors(), self.row_width);
    if prediction.dim() != expected {
      return Err(
        ModelError::OutputShape {
          expected,
          found: prediction.dim(),
        }
        .into(),
      );
    }

    prediction
      .axis_iter(Axis(0))
      .map(|sample| self.decoder.decode(sample).map_err(DetectorError::from))
      .collect()
  }
}

impl Model for SsdDetector {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = DetectorError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let mut results = self.detect_batch(std::slice::from_ref(input))?;
    Ok(results.pop().unwrap_or_default())
  }
}
