// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/geometry.rs - 检测框坐标反变换
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

use crate::preprocess::{Letterbox, PMethod};

/// 原图像素坐标下的检测框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
  pub x_min: f32,
  pub y_min: f32,
  pub x_max: f32,
  pub y_max: f32,
}

impl PixelBox {
  pub fn width(&self) -> f32 {
    self.x_max - self.x_min
  }

  pub fn height(&self) -> f32 {
    self.y_max - self.y_min
  }

  /// 按原图尺寸重新归一化
  pub fn normalize(&self, image_width: u32, image_height: u32) -> [f32; 4] {
    let (w, h) = (image_width as f32, image_height as f32);
    [self.x_min / w, self.y_min / h, self.x_max / w, self.y_max / h]
  }
}

/// 以输入中线为轴，按比例 `ratio` 拉伸坐标
fn stretch_about_center(value: f32, dim: f32, ratio: f32) -> f32 {
  let half = dim * 0.5;
  if value < half {
    half - (half - value) * ratio
  } else {
    half + (value - half) * ratio
  }
}

/// 把归一化检测框 [x_min, y_min, x_max, y_max] 映射到原图像素坐标
pub fn remap(
  bbox: &[f32; 4],
  image_width: u32,
  image_height: u32,
  method: PMethod,
  input_dim: u32,
) -> PixelBox {
  let (w, h) = (image_width as f32, image_height as f32);

  match method {
    PMethod::Reshape => PixelBox {
      x_min: w * bbox[0],
      y_min: h * bbox[1],
      x_max: w * bbox[2],
      y_max: h * bbox[3],
    },
    PMethod::Zoom => {
      let dim = input_dim as f32;
      let letterbox = Letterbox::new(image_width, image_height, input_dim);

      let mut x_min = dim * bbox[0];
      let mut y_min = dim * bbox[1];
      let mut x_max = dim * bbox[2];
      let mut y_max = dim * bbox[3];

      if letterbox.pads_width() {
        x_min = stretch_about_center(x_min, dim, h / w);
        x_max = stretch_about_center(x_max, dim, h / w);
      }
      if letterbox.pads_height() {
        y_min = stretch_about_center(y_min, dim, w / h);
        y_max = stretch_about_center(y_max, dim, w / h);
      }

      PixelBox {
        x_min: x_min / dim * w,
        y_min: y_min / dim * h,
        x_max: x_max / dim * w,
        y_max: y_max / dim * h,
      }
    }
  }
}
