// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/output/plot.rs - SVG 图形绘制检测结果
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

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::ConfigError,
  model::DetectResult,
  output::{Annotation, Annotator, Render, RenderOptions},
};

#[derive(Error, Debug)]
pub enum PlotError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("格式化错误: {0}")]
  FmtError(#[from] std::fmt::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
}

fn escape(text: &str) -> String {
  text
    .replace('&', "&amp;")
    .replace('<', "&lt;")
    .replace('>', "&gt;")
    .replace('"', "&quot;")
}

/// 以原图为底，叠加矢量框与文字
pub struct SvgPlot {
  annotator: Annotator,
}

impl SvgPlot {
  pub fn new(annotator: Annotator) -> Self {
    SvgPlot { annotator }
  }

  pub fn annotator(&self) -> &Annotator {
    &self.annotator
  }

  fn write_annotation(
    svg: &mut String,
    annotation: &Annotation,
    font_size: u32,
  ) -> Result<(), std::fmt::Error> {
    let bbox = &annotation.bbox;
    let [r, g, b] = annotation.color;
    writeln!(
      svg,
      r#"  <rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="none" stroke="rgb({},{},{})" stroke-width="1"/>"#,
      bbox.x_min,
      bbox.y_min,
      bbox.width(),
      bbox.height(),
      r,
      g,
      b
    )?;

    if annotation.text.is_none() {
      return Ok(());
    }
    writeln!(
      svg,
      r#"  <text x="{:.1}" y="{:.1}" font-size="{}" fill="rgb({},{},{})">"#,
      bbox.x_min + 2.0,
      bbox.y_min + 2.0,
      font_size,
      r,
      g,
      b
    )?;
    for line in annotation.text_lines() {
      writeln!(
        svg,
        r#"    <tspan x="{:.1}" dy="{}">{}</tspan>"#,
        bbox.x_min + 2.0,
        font_size,
        escape(line)
      )?;
    }
    writeln!(svg, "  </text>")
  }

  /// 生成 SVG 文本，`href` 指向作为背景的图像
  pub fn plot(
    &self,
    width: u32,
    height: u32,
    href: &str,
    result: &DetectResult,
  ) -> Result<(String, Vec<Annotation>), PlotError> {
    let font_size = (height / 20).max(10);
    let annotations = self.annotator.annotate(result, width, height);

    let mut svg = String::new();
    writeln!(
      svg,
      r#"<svg xmlns="http://www.w3.org/2000/svg" width="{0}" height="{1}" viewBox="0 0 {0} {1}">"#,
      width, height
    )?;
    writeln!(
      svg,
      r#"  <image href="{}" x="0" y="0" width="{}" height="{}"/>"#,
      escape(href),
      width,
      height
    )?;
    for annotation in &annotations {
      Self::write_annotation(&mut svg, annotation, font_size)?;
    }
    writeln!(svg, "</svg>")?;

    Ok((svg, annotations))
  }
}

/// 写出 SVG 文件以及同名的 PNG 背景图
pub struct SvgPlotOutput {
  path: PathBuf,
  plot: SvgPlot,
}

impl FromUrlWithScheme for SvgPlotOutput {
  const SCHEME: &'static str = "svg";
}

impl FromUrl for SvgPlotOutput {
  type Error = PlotError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(PlotError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let options = RenderOptions::from_query(uri)?;

    Ok(SvgPlotOutput {
      path: PathBuf::from(uri.path()),
      plot: SvgPlot::new(Annotator::new(options)),
    })
  }
}

impl SvgPlotOutput {
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn background_path(&self) -> PathBuf {
    self.path.with_extension("png")
  }

  pub fn with_annotator(mut self, annotator: Annotator) -> Self {
    self.plot.annotator = annotator;
    self
  }
}

impl Render<RgbImage, DetectResult> for SvgPlotOutput {
  type Error = PlotError;

  fn render_result(&self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let background = self.background_path();
    frame.save(&background)?;
    info!("保存背景图像: {}", background.display());

    let href = background
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default();
    let (width, height) = frame.dimensions();
    let (svg, _) = self.plot.plot(width, height, &href, result)?;
    std::fs::write(&self.path, svg)?;
    warn!("保存 SVG 到文件: {}", self.path.display());
    Ok(())
  }
}
