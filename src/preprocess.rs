// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/preprocess.rs - 图像预处理
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

use std::{fmt, str::FromStr};

use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::config::ConfigError;

/// 填充区域的灰色
const PAD_COLOR: Rgb<u8> = Rgb([128, 128, 128]);

/// 推理前对图像做的几何变换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PMethod {
  /// 非等比拉伸到正方形输入
  Reshape,
  /// 等比缩放后居中，较短的一边用灰色填充
  Zoom,
}

impl FromStr for PMethod {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "reshape" => Ok(PMethod::Reshape),
      "zoom" => Ok(PMethod::Zoom),
      _ => Err(ConfigError::UnknownMethod(s.to_string())),
    }
  }
}

impl fmt::Display for PMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PMethod::Reshape => write!(f, "reshape"),
      PMethod::Zoom => write!(f, "zoom"),
    }
  }
}

impl<'de> Deserialize<'de> for PMethod {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Zoom 方法的缩放与填充参数
///
/// 预处理和坐标反变换共用同一份计算，保证两边的填充带完全一致。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub new_width: u32,
  pub new_height: u32,
  /// 左右两侧各自的填充宽度
  pub width_offset: u32,
  /// 上下两侧各自的填充高度
  pub height_offset: u32,
}

impl Letterbox {
  pub fn new(image_width: u32, image_height: u32, input_dim: u32) -> Self {
    let dim = input_dim as f64;
    let zoom_ratio = (dim / image_width as f64).min(dim / image_height as f64);
    let new_width = (zoom_ratio * image_width as f64) as u32;
    let new_height = (zoom_ratio * image_height as f64) as u32;

    Letterbox {
      new_width,
      new_height,
      width_offset: input_dim.saturating_sub(new_width) / 2,
      height_offset: input_dim.saturating_sub(new_height) / 2,
    }
  }

  /// 图像比输入更“高”，左右有填充
  pub fn pads_width(&self) -> bool {
    self.width_offset > 0
  }

  /// 图像比输入更“宽”，上下有填充
  pub fn pads_height(&self) -> bool {
    self.height_offset > 0
  }
}

pub fn resize_image(image: &RgbImage, input_dim: u32) -> RgbImage {
  imageops::resize(image, input_dim, input_dim, FilterType::Lanczos3)
}

pub fn zoom_image(image: &RgbImage, input_dim: u32) -> RgbImage {
  let letterbox = Letterbox::new(image.width(), image.height(), input_dim);
  debug!(
    "缩放 {}x{} -> {}x{}, 填充 ({}, {})",
    image.width(),
    image.height(),
    letterbox.new_width,
    letterbox.new_height,
    letterbox.width_offset,
    letterbox.height_offset
  );

  let scaled = imageops::resize(
    image,
    letterbox.new_width,
    letterbox.new_height,
    FilterType::CatmullRom,
  );
  let mut canvas = RgbImage::from_pixel(input_dim, input_dim, PAD_COLOR);
  imageops::replace(
    &mut canvas,
    &scaled,
    letterbox.width_offset as i64,
    letterbox.height_offset as i64,
  );
  canvas
}

pub fn preprocess(image: &RgbImage, method: PMethod, input_dim: u32) -> RgbImage {
  match method {
    PMethod::Reshape => resize_image(image, input_dim),
    PMethod::Zoom => zoom_image(image, input_dim),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn method_parses_case_insensitively() {
    assert_eq!("Reshape".parse::<PMethod>().unwrap(), PMethod::Reshape);
    assert_eq!("zoom".parse::<PMethod>().unwrap(), PMethod::Zoom);
    assert_eq!(PMethod::Zoom.to_string(), "zoom");
  }

  #[test]
  fn unknown_method_is_a_config_error() {
    let err = "stretch".parse::<PMethod>().unwrap_err();
    assert!(matches!(err, ConfigError::UnknownMethod(ref m) if m == "stretch"));

    let err = serde_json::from_str::<PMethod>(r#""crop""#).unwrap_err();
    assert!(err.to_string().contains("crop"));
  }

  #[test]
  fn letterbox_pads_the_short_axis() {
    let wide = Letterbox::new(200, 100, 300);
    assert_eq!((wide.new_width, wide.new_height), (300, 150));
    assert_eq!((wide.width_offset, wide.height_offset), (0, 75));
    assert!(wide.pads_height() && !wide.pads_width());

    let tall = Letterbox::new(100, 200, 300);
    assert_eq!((tall.width_offset, tall.height_offset), (75, 0));

    let square = Letterbox::new(640, 640, 300);
    assert!(!square.pads_height() && !square.pads_width());
  }

  #[test]
  fn zoom_image_centers_content_on_gray() {
    let image = RgbImage::from_pixel(200, 100, Rgb([255, 0, 0]));
    let zoomed = zoom_image(&image, 300);
    assert_eq!(zoomed.dimensions(), (300, 300));
    assert_eq!(*zoomed.get_pixel(150, 10), PAD_COLOR);
    assert_eq!(*zoomed.get_pixel(150, 290), PAD_COLOR);
    assert_eq!(*zoomed.get_pixel(150, 150), Rgb([255, 0, 0]));
  }

  #[test]
  fn reshape_fills_the_whole_input() {
    let image = RgbImage::from_pixel(200, 100, Rgb([0, 255, 0]));
    let resized = preprocess(&image, PMethod::Reshape, 300);
    assert_eq!(resized.dimensions(), (300, 300));
    assert_eq!(*resized.get_pixel(150, 5), Rgb([0, 255, 0]));
  }
}
