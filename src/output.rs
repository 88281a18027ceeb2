// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/output.rs - 输出定义
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

use std::path::Path;
use std::sync::Mutex;

use image::RgbImage;
use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl,
  config::ConfigError,
  geometry::{PixelBox, remap},
  model::{DetectResult, Detection},
  preprocess::PMethod,
};
#[cfg(any(feature = "draw_image", feature = "svg_plot"))]
use crate::FromUrlWithScheme;

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[cfg(feature = "draw_image")]
pub mod draw;
#[cfg(feature = "draw_image")]
pub use self::draw::{DrawError, ImageDraw, SaveImageFileOutput};

#[cfg(feature = "svg_plot")]
pub mod plot;
#[cfg(feature = "svg_plot")]
pub use self::plot::{PlotError, SvgPlot, SvgPlotOutput};

/// 两种渲染后端共用的选项
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOptions {
  pub method: PMethod,
  pub input_dim: u32,
  pub show_label: bool,
  pub show_conf: bool,
  pub print_result: bool,
}

impl RenderOptions {
  pub fn new(method: PMethod, input_dim: u32) -> Self {
    RenderOptions {
      method,
      input_dim,
      show_label: true,
      show_conf: true,
      print_result: true,
    }
  }

  /// 读取输出 URL 中的 `method` 与 `input_dim`，缺省为 reshape 与 300，给出但无效时报错
  pub fn from_query(uri: &Url) -> Result<Self, ConfigError> {
    let mut method = PMethod::Reshape;
    let mut input_dim = 300;
    for (key, value) in uri.query_pairs() {
      match key.as_ref() {
        "method" => method = value.parse()?,
        "input_dim" => {
          input_dim = value
            .parse::<u32>()
            .ok()
            .filter(|&dim| dim > 0)
            .ok_or_else(|| ConfigError::InvalidInputDim(value.to_string()))?;
        }
        _ => {}
      }
    }
    Ok(RenderOptions::new(method, input_dim))
  }
}

/// 一个待绘制的检测框
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
  pub bbox: PixelBox,
  pub color: [u8; 3],
  pub text: Option<String>,
  pub detection: Detection,
}

impl Annotation {
  pub fn text_lines(&self) -> impl Iterator<Item = &str> {
    self.text.iter().flat_map(|text| text.lines())
  }
}

fn label_text(detection: &Detection, show_label: bool, show_conf: bool) -> Option<String> {
  let conf = detection.confidence * 100.0;
  match (show_label, show_conf) {
    (true, true) => Some(format!("{:.2}% \n{}", conf, detection.class_index)),
    (true, false) => Some(format!("{}", detection.class_index)),
    (false, true) => Some(format!("{:.2}%", conf)),
    (false, false) => None,
  }
}

/// 坐标映射、随机颜色与文本摘要，两个后端都经由这里得到像素框
pub struct Annotator {
  options: RenderOptions,
  rng: Mutex<StdRng>,
}

impl Annotator {
  pub fn new(options: RenderOptions) -> Self {
    Annotator {
      options,
      rng: Mutex::new(StdRng::from_os_rng()),
    }
  }

  /// 固定随机种子，颜色可复现
  pub fn with_seed(options: RenderOptions, seed: u64) -> Self {
    Annotator {
      options,
      rng: Mutex::new(StdRng::seed_from_u64(seed)),
    }
  }

  pub fn options(&self) -> &RenderOptions {
    &self.options
  }

  pub fn annotate(
    &self,
    result: &DetectResult,
    image_width: u32,
    image_height: u32,
  ) -> Vec<Annotation> {
    let options = &self.options;
    let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());

    if options.print_result {
      println!("identification result:");
    }

    let annotations = result
      .items
      .iter()
      .map(|detection| {
        let bbox = remap(
          &detection.bbox,
          image_width,
          image_height,
          options.method,
          options.input_dim,
        );
        let color = [rng.random::<u8>(), rng.random::<u8>(), rng.random::<u8>()];

        if options.print_result {
          println!("{}", summary_line(detection, &bbox));
        }

        Annotation {
          bbox,
          color,
          text: label_text(detection, options.show_label, options.show_conf),
          detection: detection.clone(),
        }
      })
      .collect();

    if options.print_result {
      println!("identification result end.");
    }
    annotations
  }
}

/// 每个检测结果的一行文本摘要，坐标向零取整
pub fn summary_line(detection: &Detection, bbox: &PixelBox) -> String {
  format!(
    "class:{}\tlocation:{},{},{},{}\tconf:{:.2}%",
    detection.class_index,
    bbox.x_min as i32,
    bbox.y_min as i32,
    bbox.x_max as i32,
    bbox.y_max as i32,
    detection.confidence * 100.0
  )
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "draw_image")]
  #[error("图像绘制输出错误: {0}")]
  DrawError(#[from] DrawError),
  #[cfg(feature = "svg_plot")]
  #[error("SVG 绘图输出错误: {0}")]
  PlotError(#[from] PlotError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  #[cfg(feature = "draw_image")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "svg_plot")]
  SvgPlotOutput(SvgPlotOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "draw_image")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "svg_plot")]
      SvgPlotOutput::SCHEME => {
        let output = SvgPlotOutput::from_url(url)?;
        Ok(OutputWrapper::SvgPlotOutput(output))
      }
      scheme => Err(OutputError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl OutputWrapper {
  /// 由各后端自己的构造参数以外的渲染选项重新配置
  pub fn with_annotator(self, annotator: Annotator) -> Self {
    match self {
      #[cfg(feature = "draw_image")]
      OutputWrapper::SaveImageFileOutput(output) => {
        OutputWrapper::SaveImageFileOutput(output.with_annotator(annotator))
      }
      #[cfg(feature = "svg_plot")]
      OutputWrapper::SvgPlotOutput(output) => {
        OutputWrapper::SvgPlotOutput(output.with_annotator(annotator))
      }
    }
  }

  /// 为标签文字加载字体，SVG 输出交给查看器排版
  pub fn load_font<P: AsRef<Path>>(self, path: P) -> Result<Self, OutputError> {
    match self {
      #[cfg(feature = "draw_image")]
      OutputWrapper::SaveImageFileOutput(output) => {
        Ok(OutputWrapper::SaveImageFileOutput(output.load_font(path)?))
      }
      #[cfg(feature = "svg_plot")]
      OutputWrapper::SvgPlotOutput(output) => {
        debug!("SVG 输出忽略字体文件: {}", path.as_ref().display());
        Ok(OutputWrapper::SvgPlotOutput(output))
      }
    }
  }
}

impl Render<RgbImage, DetectResult> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "draw_image")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "svg_plot")]
      OutputWrapper::SvgPlotOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}
