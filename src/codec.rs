// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/codec.rs - 真值编码与预测解码
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

use ndarray::{Array2, ArrayView2};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
  config::{Config, ConfigError},
  loss::{AUX_COLUMNS, LOC_COLUMNS},
  model::{DetectResult, Detection},
  prior::PriorBoxList,
};

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("无效的类别索引: {0}")]
  InvalidClass(u32),
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
}

/// 一个真值框，bbox 为归一化 [x_min, y_min, x_max, y_max]
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
  pub bbox: [f32; 4],
  pub class_index: u32,
}

fn area(b: &[f32; 4]) -> f32 {
  (b[2] - b[0]) * (b[3] - b[1])
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = inter_w * inter_h;
  let union = area(a) + area(b) - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 把真值框编码为训练目标张量
pub struct BoxEncoder {
  priors: Vec<[f32; 4]>,
  variances: [f32; 4],
  num_classes: usize,
  bg_class: usize,
  overlap_threshold: f32,
}

impl BoxEncoder {
  pub fn new(priors: &PriorBoxList, config: &Config) -> Self {
    BoxEncoder {
      priors: priors.boxes().iter().map(|p| p.corners()).collect(),
      variances: priors.variances(),
      num_classes: config.num_classes(),
      bg_class: config.bg_class,
      overlap_threshold: config.overlap_threshold,
    }
  }

  pub fn row_width(&self) -> usize {
    LOC_COLUMNS + self.num_classes + AUX_COLUMNS
  }

  /// 相对先验框的偏移，按 variances 缩放
  fn offsets(&self, gt: &[f32; 4], prior: &[f32; 4]) -> [f32; 4] {
    let (gt_cx, gt_cy) = (0.5 * (gt[0] + gt[2]), 0.5 * (gt[1] + gt[3]));
    let (gt_w, gt_h) = (gt[2] - gt[0], gt[3] - gt[1]);
    let (p_cx, p_cy) = (0.5 * (prior[0] + prior[2]), 0.5 * (prior[1] + prior[3]));
    let (p_w, p_h) = (prior[2] - prior[0], prior[3] - prior[1]);

    [
      (gt_cx - p_cx) / p_w / self.variances[0],
      (gt_cy - p_cy) / p_h / self.variances[1],
      (gt_w / p_w).ln() / self.variances[2],
      (gt_h / p_h).ln() / self.variances[3],
    ]
  }

  /// 单个真值框与每个先验框的 IOU；没有超过阈值的先验框时保留 IOU 最大的一个
  fn matched_ious(&self, gt: &[f32; 4]) -> Vec<f32> {
    let ious: Vec<f32> = self.priors.iter().map(|p| iou(gt, p)).collect();
    let mut matched: Vec<f32> = ious
      .iter()
      .map(|&v| if v > self.overlap_threshold { v } else { 0.0 })
      .collect();

    if matched.iter().all(|&v| v == 0.0) {
      let mut best = 0;
      for (i, &v) in ious.iter().enumerate() {
        if v > ious[best] {
          best = i;
        }
      }
      matched[best] = ious[best];
    }
    matched
  }

  pub fn encode(&self, truths: &[GroundTruth]) -> Result<Array2<f32>, CodecError> {
    let width = self.row_width();
    let indicator = width - AUX_COLUMNS;
    let mut assignment = Array2::<f32>::zeros((self.priors.len(), width));
    assignment.column_mut(LOC_COLUMNS + self.bg_class).fill(1.0);

    if truths.is_empty() {
      return Ok(assignment);
    }

    for gt in truths {
      let class = gt.class_index as usize;
      if class >= self.num_classes || class == self.bg_class {
        return Err(CodecError::InvalidClass(gt.class_index));
      }
    }

    let matches: Vec<Vec<f32>> = truths.iter().map(|gt| self.matched_ious(&gt.bbox)).collect();

    let mut assigned = 0;
    for (p, prior) in self.priors.iter().enumerate() {
      let mut best_iou = 0.0;
      let mut best_gt = 0;
      for (g, ious) in matches.iter().enumerate() {
        if ious[p] > best_iou {
          best_iou = ious[p];
          best_gt = g;
        }
      }
      if best_iou <= 0.0 {
        continue;
      }

      let gt = &truths[best_gt];
      let mut row = assignment.row_mut(p);
      for (i, v) in self.offsets(&gt.bbox, prior).into_iter().enumerate() {
        row[i] = v;
      }
      row[LOC_COLUMNS + self.bg_class] = 0.0;
      row[LOC_COLUMNS + gt.class_index as usize] = 1.0;
      row[indicator] = 1.0;
      assigned += 1;
    }

    trace!("{} 个真值框匹配到 {} 个先验框", truths.len(), assigned);
    Ok(assignment)
  }
}

/// 把网络输出解码为检测结果
#[derive(Debug, Clone)]
pub struct BoxDecoder {
  num_classes: usize,
  bg_class: usize,
  confidence_threshold: f32,
  nms_threshold: f32,
  top_k: usize,
  keep_top_k: usize,
}

impl BoxDecoder {
  pub fn new(config: &Config) -> Self {
    BoxDecoder {
      num_classes: config.num_classes(),
      bg_class: config.bg_class,
      confidence_threshold: config.confidence_threshold,
      nms_threshold: config.nms_threshold,
      top_k: config.top_k,
      keep_top_k: config.keep_top_k,
    }
  }

  pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  /// 行尾 8 列依次为先验框角点和 4 个 variance
  fn decode_box(row: &[f32]) -> [f32; 4] {
    let width = row.len();
    let prior = &row[width - AUX_COLUMNS..width - 4];
    let variances = &row[width - 4..];

    let p_w = prior[2] - prior[0];
    let p_h = prior[3] - prior[1];
    let p_cx = 0.5 * (prior[0] + prior[2]);
    let p_cy = 0.5 * (prior[1] + prior[3]);

    let cx = row[0] * p_w * variances[0] + p_cx;
    let cy = row[1] * p_h * variances[1] + p_cy;
    let w = (row[2] * variances[2]).exp() * p_w;
    let h = (row[3] * variances[3]).exp() * p_h;

    [
      (cx - 0.5 * w).clamp(0.0, 1.0),
      (cy - 0.5 * h).clamp(0.0, 1.0),
      (cx + 0.5 * w).clamp(0.0, 1.0),
      (cy + 0.5 * h).clamp(0.0, 1.0),
    ]
  }

  /// 解码单个样本 [num_priors, width]
  pub fn decode(&self, prediction: ArrayView2<f32>) -> Result<DetectResult, CodecError> {
    let (_, width) = prediction.dim();
    let found = width.saturating_sub(LOC_COLUMNS + AUX_COLUMNS);
    if found != self.num_classes {
      return Err(
        ConfigError::ClassColumnMismatch {
          expected: self.num_classes,
          found,
        }
        .into(),
      );
    }

    let rows: Vec<Vec<f32>> = prediction.outer_iter().map(|r| r.to_vec()).collect();
    let boxes: Vec<[f32; 4]> = rows.iter().map(|r| Self::decode_box(r)).collect();

    let mut items = Vec::new();
    for class in (0..self.num_classes).filter(|&c| c != self.bg_class) {
      let candidates: Vec<(f32, [f32; 4])> = rows
        .iter()
        .zip(&boxes)
        .map(|(r, b)| (r[LOC_COLUMNS + class], *b))
        .filter(|(score, _)| *score > self.confidence_threshold)
        .collect();
      if candidates.is_empty() {
        continue;
      }

      for (confidence, bbox) in non_max_suppression(candidates, self.nms_threshold, self.top_k) {
        items.push(Detection {
          bbox,
          confidence,
          class_index: class as u32,
        });
      }
    }

    items.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    items.truncate(self.keep_top_k);
    debug!("解码得到 {} 个检测结果", items.len());

    Ok(DetectResult::from(items))
  }
}

/// 贪心 NMS: 按分数降序保留与已保留框 IOU 不超过阈值的框，最多 `max_output` 个
pub fn non_max_suppression(
  mut candidates: Vec<(f32, [f32; 4])>,
  iou_threshold: f32,
  max_output: usize,
) -> Vec<(f32, [f32; 4])> {
  candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

  let mut kept: Vec<(f32, [f32; 4])> = Vec::new();
  for candidate in candidates {
    if kept.len() >= max_output {
      break;
    }
    if kept.iter().all(|k| iou(&k.1, &candidate.1) <= iou_threshold) {
      kept.push(candidate);
    }
  }
  kept
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::prior::{PriorBox, PriorBoxList};
  use approx::assert_abs_diff_eq;
  use ndarray::{Array2, s};

  const VARIANCES: [f32; 4] = [0.1, 0.1, 0.2, 0.2];

  fn config() -> Config {
    Config {
      class_names: vec!["cat".to_string(), "dog".to_string()],
      ..Config::default()
    }
  }

  fn priors() -> PriorBoxList {
    PriorBoxList::new(
      vec![
        PriorBox::from_corners([0.0, 0.0, 0.5, 0.5]),
        PriorBox::from_corners([0.5, 0.0, 1.0, 0.5]),
        PriorBox::from_corners([0.0, 0.5, 0.5, 1.0]),
        PriorBox::from_corners([0.5, 0.5, 1.0, 1.0]),
      ],
      VARIANCES,
    )
  }

  /// 按网络的输出格式补上先验框和 variance
  fn with_tail(encoded: &Array2<f32>, priors: &PriorBoxList) -> Array2<f32> {
    let mut prediction = encoded.clone();
    let width = prediction.ncols();
    for (p, prior) in priors.boxes().iter().enumerate() {
      let corners = prior.corners();
      for i in 0..4 {
        prediction[[p, width - 8 + i]] = corners[i];
        prediction[[p, width - 4 + i]] = VARIANCES[i];
      }
    }
    prediction
  }

  #[test]
  fn iou_of_half_overlap() {
    assert_abs_diff_eq!(iou(&[0.0, 0.0, 1.0, 1.0], &[0.5, 0.0, 1.5, 1.0]), 1.0 / 3.0, epsilon = 1e-6);
    assert_eq!(iou(&[0.0, 0.0, 0.1, 0.1], &[0.5, 0.5, 0.6, 0.6]), 0.0);
  }

  #[test]
  fn encode_marks_matched_priors() {
    let priors = priors();
    let encoder = BoxEncoder::new(&priors, &config());
    let target = encoder
      .encode(&[GroundTruth {
        bbox: [0.05, 0.05, 0.45, 0.5],
        class_index: 2,
      }])
      .unwrap();

    assert_eq!(target.dim(), (4, 15));
    // 先验框 0 匹配: 背景列清零、类别列置一、正样本标记置一
    assert_eq!(target.slice(s![0, 4..7]).to_vec(), vec![0.0, 0.0, 1.0]);
    assert_eq!(target[[0, 7]], 1.0);
    // 其余先验框保持背景
    for p in 1..4 {
      assert_eq!(target.slice(s![p, 4..8]).to_vec(), vec![1.0, 0.0, 0.0, 0.0]);
    }
    // 中心偏移 (0.25 - 0.25) 为零，宽度 ln(0.8)/0.2
    assert_abs_diff_eq!(target[[0, 0]], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(target[[0, 2]], (0.8f32).ln() / 0.2, epsilon = 1e-5);
  }

  #[test]
  fn encode_falls_back_to_best_prior() {
    let priors = priors();
    let encoder = BoxEncoder::new(&priors, &config());
    // 与任何先验框 IOU 都不超过 0.5
    let target = encoder
      .encode(&[GroundTruth {
        bbox: [0.6, 0.6, 0.8, 0.8],
        class_index: 1,
      }])
      .unwrap();
    let positives: Vec<usize> = (0..4).filter(|&p| target[[p, 7]] == 1.0).collect();
    assert_eq!(positives, vec![3]);
  }

  #[test]
  fn encode_rejects_background_class() {
    let encoder = BoxEncoder::new(&priors(), &config());
    let err = encoder
      .encode(&[GroundTruth {
        bbox: [0.0, 0.0, 0.5, 0.5],
        class_index: 0,
      }])
      .unwrap_err();
    assert!(matches!(err, CodecError::InvalidClass(0)));
  }

  #[test]
  fn decode_recovers_encoded_box() {
    let priors = priors();
    let config = config();
    let gt = [0.55, 0.6, 0.95, 0.9];
    let target = BoxEncoder::new(&priors, &config)
      .encode(&[GroundTruth {
        bbox: gt,
        class_index: 1,
      }])
      .unwrap();

    let mut prediction = with_tail(&target, &priors);
    // 背景先验框给一点低置信度的“猫”
    for p in 0..3 {
      prediction[[p, 5]] = 0.005;
    }
    let result = BoxDecoder::new(&config).decode(prediction.view()).unwrap();

    assert_eq!(result.len(), 1);
    let detection = &result.items[0];
    assert_eq!(detection.class_index, 1);
    assert_eq!(detection.confidence, 1.0);
    for (a, b) in detection.bbox.iter().zip(gt.iter()) {
      assert_abs_diff_eq!(a, b, epsilon = 1e-5);
    }
  }

  #[test]
  fn nms_drops_overlapping_boxes() {
    let kept = non_max_suppression(
      vec![
        (0.6, [0.0, 0.0, 0.5, 0.5]),
        (0.9, [0.02, 0.0, 0.52, 0.5]),
        (0.8, [0.6, 0.6, 0.9, 0.9]),
      ],
      0.45,
      10,
    );
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].0, 0.9);
    assert_eq!(kept[1].0, 0.8);

    let capped = non_max_suppression(vec![(0.5, [0.0; 4]), (0.4, [0.5, 0.5, 1.0, 1.0])], 0.45, 1);
    assert_eq!(capped.len(), 1);
  }

  #[test]
  fn decode_checks_class_columns() {
    let prediction = Array2::<f32>::zeros((4, 16));
    let err = BoxDecoder::new(&config()).decode(prediction.view()).unwrap_err();
    assert!(matches!(
      err,
      CodecError::Config(ConfigError::ClassColumnMismatch { expected: 3, found: 4 })
    ));
  }
}
