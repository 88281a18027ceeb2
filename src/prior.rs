// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/prior.rs - 先验框生成
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

use tracing::debug;

use crate::model::Backbone;

/// 归一化的中心点格式先验框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorBox {
  pub cx: f32,
  pub cy: f32,
  pub w: f32,
  pub h: f32,
}

impl PriorBox {
  pub fn from_corners(corners: [f32; 4]) -> Self {
    PriorBox {
      cx: 0.5 * (corners[0] + corners[2]),
      cy: 0.5 * (corners[1] + corners[3]),
      w: corners[2] - corners[0],
      h: corners[3] - corners[1],
    }
  }

  /// [x_min, y_min, x_max, y_max]
  pub fn corners(&self) -> [f32; 4] {
    [
      self.cx - 0.5 * self.w,
      self.cy - 0.5 * self.h,
      self.cx + 0.5 * self.w,
      self.cy + 0.5 * self.h,
    ]
  }
}

/// 一个骨干网络/输入尺寸组合下固定的先验框序列
#[derive(Debug, Clone, PartialEq)]
pub struct PriorBoxList {
  boxes: Vec<PriorBox>,
  variances: [f32; 4],
}

impl PriorBoxList {
  pub fn new(boxes: Vec<PriorBox>, variances: [f32; 4]) -> Self {
    PriorBoxList { boxes, variances }
  }

  pub fn len(&self) -> usize {
    self.boxes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.boxes.is_empty()
  }

  pub fn boxes(&self) -> &[PriorBox] {
    &self.boxes
  }

  pub fn variances(&self) -> [f32; 4] {
    self.variances
  }
}

/// 一层特征图上的先验框参数，尺寸单位为像素
#[derive(Debug, Clone, Copy)]
pub struct PriorLayer {
  pub feature_size: u32,
  pub min_size: f32,
  pub max_size: Option<f32>,
  pub aspect_ratios: &'static [f32],
}

const fn layer(
  feature_size: u32,
  min_size: f32,
  max_size: Option<f32>,
  aspect_ratios: &'static [f32],
) -> PriorLayer {
  PriorLayer {
    feature_size,
    min_size,
    max_size,
    aspect_ratios,
  }
}

const VGG16_LAYERS: [PriorLayer; 6] = [
  layer(38, 30.0, None, &[2.0]),
  layer(19, 60.0, Some(114.0), &[2.0, 3.0]),
  layer(10, 114.0, Some(168.0), &[2.0, 3.0]),
  layer(5, 168.0, Some(222.0), &[2.0, 3.0]),
  layer(3, 222.0, Some(276.0), &[2.0, 3.0]),
  layer(1, 276.0, Some(330.0), &[2.0, 3.0]),
];

const RESNET_LAYERS: [PriorLayer; 6] = [
  layer(38, 30.0, Some(60.0), &[2.0]),
  layer(19, 60.0, Some(114.0), &[2.0, 3.0]),
  layer(10, 114.0, Some(168.0), &[2.0, 3.0]),
  layer(5, 168.0, Some(222.0), &[2.0, 3.0]),
  layer(3, 222.0, Some(276.0), &[2.0]),
  layer(1, 276.0, Some(330.0), &[2.0]),
];

const MOBILENETV2_LAYERS: [PriorLayer; 6] = [
  layer(19, 60.0, None, &[2.0]),
  layer(10, 105.0, Some(150.0), &[2.0, 3.0]),
  layer(5, 150.0, Some(195.0), &[2.0, 3.0]),
  layer(3, 195.0, Some(240.0), &[2.0, 3.0]),
  layer(2, 240.0, Some(285.0), &[2.0, 3.0]),
  layer(1, 285.0, Some(300.0), &[2.0, 3.0]),
];

pub fn prior_layers(backbone: Backbone) -> &'static [PriorLayer] {
  match backbone {
    Backbone::Vgg16 => &VGG16_LAYERS,
    Backbone::ResNet50 | Backbone::ResNet101 => &RESNET_LAYERS,
    Backbone::MobileNetV2 => &MOBILENETV2_LAYERS,
  }
}

impl PriorLayer {
  /// 宽高比序列: 1、可选的 sqrt(min*max) 方框，再是每个 ar 及其倒数
  fn box_sizes(&self) -> Vec<(f32, f32)> {
    let mut sizes = vec![(self.min_size, self.min_size)];
    if let Some(max_size) = self.max_size {
      let side = (self.min_size * max_size).sqrt();
      sizes.push((side, side));
    }
    for &ar in self.aspect_ratios {
      for ratio in [ar, 1.0 / ar] {
        let scale = ratio.sqrt();
        sizes.push((self.min_size * scale, self.min_size / scale));
      }
    }
    sizes
  }

  pub fn boxes_per_cell(&self) -> usize {
    self.box_sizes().len()
  }

  fn generate(&self, img_size: f32, out: &mut Vec<PriorBox>) {
    let sizes = self.box_sizes();
    let step = img_size / self.feature_size as f32;

    for row in 0..self.feature_size {
      let center_y = (row as f32 + 0.5) * step;
      for col in 0..self.feature_size {
        let center_x = (col as f32 + 0.5) * step;
        for &(w, h) in &sizes {
          let corners = [
            ((center_x - 0.5 * w) / img_size).clamp(0.0, 1.0),
            ((center_y - 0.5 * h) / img_size).clamp(0.0, 1.0),
            ((center_x + 0.5 * w) / img_size).clamp(0.0, 1.0),
            ((center_y + 0.5 * h) / img_size).clamp(0.0, 1.0),
          ];
          out.push(PriorBox::from_corners(corners));
        }
      }
    }
  }
}

/// 按特征图顺序（行优先、每个单元内按宽高比顺序）生成先验框
pub fn prior_boxes(backbone: Backbone, input_dim: u32, variances: [f32; 4]) -> PriorBoxList {
  let layers = prior_layers(backbone);
  let total: usize = layers
    .iter()
    .map(|l| (l.feature_size * l.feature_size) as usize * l.boxes_per_cell())
    .sum();

  let mut boxes = Vec::with_capacity(total);
  for layer in layers {
    layer.generate(input_dim as f32, &mut boxes);
  }
  debug!("{} 先验框数量: {}", backbone, boxes.len());

  PriorBoxList::new(boxes, variances)
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;

  const VARIANCES: [f32; 4] = [0.1, 0.1, 0.2, 0.2];

  #[test]
  fn prior_counts_per_backbone() {
    assert_eq!(prior_boxes(Backbone::Vgg16, 300, VARIANCES).len(), 7308);
    assert_eq!(prior_boxes(Backbone::ResNet50, 300, VARIANCES).len(), 8732);
    assert_eq!(prior_boxes(Backbone::ResNet101, 300, VARIANCES).len(), 8732);
    assert_eq!(prior_boxes(Backbone::MobileNetV2, 300, VARIANCES).len(), 1917);
  }

  #[test]
  fn priors_are_clipped_to_unit_square() {
    let priors = prior_boxes(Backbone::Vgg16, 300, VARIANCES);
    for prior in priors.boxes() {
      let [x0, y0, x1, y1] = prior.corners();
      assert!(x0 >= -1e-6 && y0 >= -1e-6 && x1 <= 1.0 + 1e-6 && y1 <= 1.0 + 1e-6);
      assert!(prior.w > 0.0 && prior.h > 0.0);
    }
    assert_eq!(priors.variances(), VARIANCES);
  }

  #[test]
  fn cell_boxes_follow_aspect_ratio_order() {
    let priors = prior_boxes(Backbone::Vgg16, 300, VARIANCES);
    let last = &priors.boxes()[priors.len() - 6..];

    // 1x1 特征图只有一个单元，中心在图像中央
    assert_abs_diff_eq!(last[0].cx, 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(last[0].w, 276.0 / 300.0, epsilon = 1e-6);
    // sqrt(276 * 330) 超出图像，被裁剪为整幅
    assert_abs_diff_eq!(last[1].w, 1.0, epsilon = 1e-6);
    // ar = 2: 更宽更矮
    assert!(last[2].w > last[2].h);
    assert!(last[3].w < last[3].h);
    assert_abs_diff_eq!(last[2].w, last[3].h, epsilon = 1e-6);
  }

  #[test]
  fn corners_round_trip() {
    let prior = PriorBox::from_corners([0.1, 0.2, 0.5, 0.6]);
    assert_abs_diff_eq!(prior.cx, 0.3, epsilon = 1e-6);
    assert_abs_diff_eq!(prior.h, 0.4, epsilon = 1e-6);
    let corners = prior.corners();
    assert_abs_diff_eq!(corners[0], 0.1, epsilon = 1e-6);
    assert_abs_diff_eq!(corners[3], 0.6, epsilon = 1e-6);
  }
}
