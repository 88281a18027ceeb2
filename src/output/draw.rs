// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/output/draw.rs - 在图像上绘制检测结果
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::ConfigError,
  model::DetectResult,
  output::{Annotation, Annotator, Render, RenderOptions},
};

/// 标签字号下限
const MIN_FONT_SIZE: f32 = 10.0;
/// 文字相对框左上角的偏移
const TEXT_OFFSET: i32 = 2;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("字体无效: {0}")]
  FontError(#[from] ab_glyph::InvalidFont),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
}

/// 直接在图像缓冲区上绘制
pub struct ImageDraw {
  font: Option<FontArc>,
  annotator: Annotator,
}

impl ImageDraw {
  pub fn new(annotator: Annotator) -> Self {
    ImageDraw {
      font: None,
      annotator,
    }
  }

  /// 没有字体时只画边框
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn load_font<P: AsRef<Path>>(self, path: P) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontArc::try_from_vec(data)?;
    info!("加载字体文件: {}", path.as_ref().display());
    Ok(self.with_font(font))
  }

  pub fn annotator(&self) -> &Annotator {
    &self.annotator
  }

  fn draw_annotation(&self, image: &mut RgbImage, annotation: &Annotation, font_size: f32) {
    let bbox = &annotation.bbox;
    let color = Rgb(annotation.color);

    let x = bbox.x_min as i32;
    let y = bbox.y_min as i32;
    let width = (bbox.width() as u32).max(1);
    let height = (bbox.height() as u32).max(1);
    draw_hollow_rect_mut(image, Rect::at(x, y).of_size(width, height), color);

    let Some(font) = &self.font else {
      return;
    };
    let scale = PxScale::from(font_size);
    for (i, line) in annotation.text_lines().enumerate() {
      draw_text_mut(
        image,
        color,
        x + TEXT_OFFSET,
        y + TEXT_OFFSET + i as i32 * font_size as i32,
        scale,
        font,
        line,
      );
    }
  }

  /// 在可变图像上绘制，返回实际使用的像素框
  pub fn draw_detections_on_image(
    &self,
    image: &mut RgbImage,
    result: &DetectResult,
  ) -> Vec<Annotation> {
    let (width, height) = image.dimensions();
    let font_size = ((height / 20) as f32).max(MIN_FONT_SIZE);
    let annotations = self.annotator.annotate(result, width, height);
    for annotation in &annotations {
      self.draw_annotation(image, annotation, font_size);
    }
    annotations
  }

  /// 返回绘制后的新图像，原图不变
  pub fn draw_image(&self, image: &RgbImage, result: &DetectResult) -> RgbImage {
    let mut output = image.clone();
    self.draw_detections_on_image(&mut output, result);
    output
  }
}

/// 绘制后保存为图像文件
pub struct SaveImageFileOutput {
  path: String,
  draw: ImageDraw,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = DrawError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DrawError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let options = RenderOptions::from_query(uri)?;

    Ok(SaveImageFileOutput {
      path: uri.path().to_string(),
      draw: ImageDraw::new(Annotator::new(options)),
    })
  }
}

impl SaveImageFileOutput {
  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn with_annotator(mut self, annotator: Annotator) -> Self {
    self.draw.annotator = annotator;
    self
  }

  pub fn with_font(mut self, font: FontArc) -> Self {
    self.draw.font = Some(font);
    self
  }

  pub fn load_font<P: AsRef<Path>>(mut self, path: P) -> Result<Self, DrawError> {
    self.draw = self.draw.load_font(path)?;
    Ok(self)
  }

  fn save_image(&self, image: RgbImage) -> Result<(), DrawError> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&self.path)?;
    warn!("保存图像到文件: {}", self.path);
    Ok(())
  }
}

impl Render<RgbImage, DetectResult> for SaveImageFileOutput {
  type Error = DrawError;

  fn render_result(&self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    let image = self.draw.draw_image(frame, result);
    self.save_image(image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{model::Detection, preprocess::PMethod};

  fn quiet_draw(method: PMethod) -> ImageDraw {
    let options = RenderOptions {
      print_result: false,
      ..RenderOptions::new(method, 300)
    };
    ImageDraw::new(Annotator::with_seed(options, 1))
  }

  fn result() -> DetectResult {
    DetectResult::from(vec![Detection {
      bbox: [0.25, 0.25, 0.75, 0.75],
      confidence: 0.9,
      class_index: 1,
    }])
  }

  #[test]
  fn rectangle_is_drawn_at_remapped_position() {
    let draw = quiet_draw(PMethod::Reshape);
    let mut image = RgbImage::new(40, 20);
    let annotations = draw.draw_detections_on_image(&mut image, &result());

    let color = Rgb(annotations[0].color);
    assert_eq!(annotations[0].bbox.x_min, 10.0);
    assert_eq!(annotations[0].bbox.y_max, 15.0);
    assert_eq!(*image.get_pixel(10, 5), color);
    assert_eq!(*image.get_pixel(20, 5), color);
    // 框内部保持原样
    assert_eq!(*image.get_pixel(20, 10), Rgb([0, 0, 0]));
  }

  #[test]
  fn draw_image_leaves_source_untouched() {
    let draw = quiet_draw(PMethod::Zoom);
    let source = RgbImage::from_pixel(30, 30, Rgb([9, 9, 9]));
    let output = draw.draw_image(&source, &result());
    assert!(source.pixels().all(|p| *p == Rgb([9, 9, 9])));
    assert!(output.pixels().any(|p| *p != Rgb([9, 9, 9])));
  }

  #[test]
  fn output_url_carries_render_options() {
    let url = Url::parse("image:///tmp/ssd/out.png?method=zoom&input_dim=512").unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();
    assert_eq!(output.path(), "/tmp/ssd/out.png");
    let options = output.draw.annotator().options();
    assert_eq!(options.method, PMethod::Zoom);
    assert_eq!(options.input_dim, 512);

    let url = Url::parse("svg:///tmp/out.svg").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(DrawError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn invalid_render_query_is_a_config_error() {
    let url = Url::parse("image:///tmp/out.png?method=stretch").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(DrawError::Config(ConfigError::UnknownMethod(ref m))) if m == "stretch"
    ));

    let url = Url::parse("image:///tmp/out.png?method=zoom&input_dim=abc").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(DrawError::Config(ConfigError::InvalidInputDim(_)))
    ));
  }

  #[test]
  fn render_result_saves_png() {
    let path = std::env::temp_dir().join(format!("ssd-draw-{}.png", std::process::id()));
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let output = SaveImageFileOutput::from_url(&url)
      .unwrap()
      .with_annotator(Annotator::with_seed(
        RenderOptions {
          print_result: false,
          ..RenderOptions::new(PMethod::Reshape, 300)
        },
        3,
      ));

    output
      .render_result(&RgbImage::new(32, 32), &result())
      .unwrap();
    let saved = image::open(&path).unwrap().to_rgb8();
    assert_eq!(saved.dimensions(), (32, 32));
    std::fs::remove_file(&path).unwrap();
  }
}
