// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/loss.rs - SSD 多任务损失
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

use ndarray::{Array1, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
  config::{Config, ConfigError},
  session::Session,
};

/// 交叉熵前对预测概率的裁剪边界
pub const CLIP_EPSILON: f32 = 1e-15;
/// 位置偏移列数
pub const LOC_COLUMNS: usize = 4;
/// 行尾辅助列数，其中倒数第 8 列为正样本标记
pub const AUX_COLUMNS: usize = 8;

#[derive(Error, Debug)]
pub enum LossError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("张量形状不匹配: y_true {y_true:?}, y_pred {y_pred:?}")]
  ShapeMismatch {
    y_true: (usize, usize, usize),
    y_pred: (usize, usize, usize),
  },
}

/// 平滑 L1: |e| < 1 时为 0.5·e²，否则为 |e| − 0.5
pub fn smooth_l1(diff: f32) -> f32 {
  let abs = diff.abs();
  if abs < 1.0 {
    0.5 * diff * diff
  } else {
    abs - 0.5
  }
}

/// 困难负样本挖掘的中间结果
#[derive(Debug, Clone, PartialEq)]
pub struct MiningStats {
  /// 每个样本的正样本数
  pub num_pos: Vec<f32>,
  /// 每个样本需要的负样本数
  pub num_neg: Vec<f32>,
  /// 整个批次共用的负样本数
  pub num_neg_batch: usize,
  /// 展平后的被选负样本索引 (b * num_boxes + prior)，按样本分组
  pub indices: Vec<usize>,
}

/// 单个样本逐先验框的损失项
struct SampleTerms {
  conf_loss: Vec<f32>,
  loc_loss: Vec<f32>,
  positive: Vec<f32>,
  max_conf: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct MultiboxLoss {
  num_classes: usize,
  bg_class: usize,
  neg_pos_ratio: f32,
  negatives_for_hard: f32,
  alpha: f32,
}

impl MultiboxLoss {
  pub fn new(config: &Config) -> Self {
    Self {
      num_classes: config.num_classes(),
      bg_class: config.bg_class,
      neg_pos_ratio: config.neg_pos_ratio,
      negatives_for_hard: config.negatives_for_hard,
      alpha: config.alpha,
    }
  }

  /// 计算每个样本的损失，返回形状为 [batch] 的张量
  pub fn compute(
    &self,
    session: &Session,
    y_true: ArrayView3<f32>,
    y_pred: ArrayView3<f32>,
  ) -> Result<Array1<f32>, LossError> {
    self.evaluate(session, y_true, y_pred).map(|(loss, _)| loss)
  }

  /// 只返回困难负样本挖掘的统计
  pub fn mine(
    &self,
    session: &Session,
    y_true: ArrayView3<f32>,
    y_pred: ArrayView3<f32>,
  ) -> Result<MiningStats, LossError> {
    self.evaluate(session, y_true, y_pred).map(|(_, stats)| stats)
  }

  /// 非背景类别列的范围 [start, end)
  fn conf_range(&self) -> (usize, usize) {
    let start = LOC_COLUMNS + self.bg_class + 1;
    (start, start + self.num_classes - 1)
  }

  fn check_layout(&self, y_true: &ArrayView3<f32>, y_pred: &ArrayView3<f32>) -> Result<(), LossError> {
    if y_true.dim() != y_pred.dim() {
      return Err(LossError::ShapeMismatch {
        y_true: y_true.dim(),
        y_pred: y_pred.dim(),
      });
    }

    let (_, _, width) = y_true.dim();
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

    let (_, end) = self.conf_range();
    if end > width - AUX_COLUMNS {
      return Err(
        ConfigError::ClassColumnMismatch {
          expected: end - LOC_COLUMNS,
          found,
        }
        .into(),
      );
    }
    Ok(())
  }

  fn sample_terms(&self, y_true: ArrayView2<f32>, y_pred: ArrayView2<f32>) -> SampleTerms {
    let (num_boxes, width) = y_true.dim();
    let indicator = width - AUX_COLUMNS;
    let (conf_start, conf_end) = self.conf_range();

    let mut terms = SampleTerms {
      conf_loss: Vec::with_capacity(num_boxes),
      loc_loss: Vec::with_capacity(num_boxes),
      positive: Vec::with_capacity(num_boxes),
      max_conf: Vec::with_capacity(num_boxes),
    };

    for (t, p) in y_true.outer_iter().zip(y_pred.outer_iter()) {
      let loc: f32 = (0..LOC_COLUMNS).map(|i| smooth_l1(t[i] - p[i])).sum();

      let conf: f32 = -(LOC_COLUMNS..indicator)
        .map(|i| t[i] * p[i].clamp(CLIP_EPSILON, 1.0 - CLIP_EPSILON).ln())
        .sum::<f32>();

      let max_conf = (conf_start..conf_end)
        .map(|i| p[i])
        .fold(f32::NEG_INFINITY, f32::max);

      terms.loc_loss.push(loc);
      terms.conf_loss.push(conf);
      terms.positive.push(t[indicator]);
      terms.max_conf.push(max_conf);
    }

    terms
  }

  /// 整个批次共用的负样本数
  fn negatives_per_batch(&self, num_neg: &[f32], num_boxes: usize) -> usize {
    let has_min = num_neg.iter().any(|&n| n > 0.0);
    let fallback = if has_min { 0.0 } else { self.negatives_for_hard };

    let (sum, count) = num_neg
      .iter()
      .chain(std::iter::once(&fallback))
      .filter(|&&n| n > 0.0)
      .fold((0.0f32, 0usize), |(sum, count), &n| (sum + n, count + 1));

    if count == 0 {
      return 0;
    }
    // 与框架的整型转换一致：向零截断
    let mean = (sum / count as f32) as usize;
    // top-k 不能超过先验框总数
    mean.min(num_boxes)
  }

  fn evaluate(
    &self,
    session: &Session,
    y_true: ArrayView3<f32>,
    y_pred: ArrayView3<f32>,
  ) -> Result<(Array1<f32>, MiningStats), LossError> {
    self.check_layout(&y_true, &y_pred)?;
    let (batch_size, num_boxes, _) = y_true.dim();

    let terms: Vec<SampleTerms> = session.install(|| {
      (0..batch_size)
        .into_par_iter()
        .map(|b| self.sample_terms(y_true.index_axis(Axis(0), b), y_pred.index_axis(Axis(0), b)))
        .collect()
    });

    let num_pos: Vec<f32> = terms.iter().map(|t| t.positive.iter().sum()).collect();
    let pos_loc_loss: Vec<f32> = terms
      .iter()
      .map(|t| t.loc_loss.iter().zip(&t.positive).map(|(l, m)| l * m).sum())
      .collect();
    let pos_conf_loss: Vec<f32> = terms
      .iter()
      .map(|t| t.conf_loss.iter().zip(&t.positive).map(|(l, m)| l * m).sum())
      .collect();

    let num_neg: Vec<f32> = num_pos
      .iter()
      .map(|&pos| (self.neg_pos_ratio * pos).min(num_boxes as f32 - pos))
      .collect();
    let num_neg_batch = self.negatives_per_batch(&num_neg, num_boxes);
    debug!(
      "批次大小: {}, 正样本数: {:?}, 负样本数: {:?}, 共用负样本数: {}",
      batch_size, num_pos, num_neg, num_neg_batch
    );

    // 逐样本取 top-k，再偏移 b * num_boxes 得到展平索引
    let indices: Vec<usize> = session.install(|| {
      terms
        .par_iter()
        .enumerate()
        .flat_map_iter(|(b, t)| {
          let scores: Vec<f32> = t
            .max_conf
            .iter()
            .zip(&t.positive)
            .map(|(c, m)| c * (1.0 - m))
            .collect();
          top_k(&scores, num_neg_batch)
            .into_iter()
            .map(move |idx| b * num_boxes + idx)
        })
        .collect()
    });

    let flat_conf_loss: Vec<f32> = terms.iter().flat_map(|t| t.conf_loss.iter().copied()).collect();
    let neg_conf_loss: Vec<f32> = if num_neg_batch == 0 {
      vec![0.0; batch_size]
    } else {
      indices
        .chunks(num_neg_batch)
        .map(|chunk| chunk.iter().map(|&i| flat_conf_loss[i]).sum())
        .collect()
    };
    trace!("困难负样本索引: {:?}", indices);

    let loss: Array1<f32> = (0..batch_size)
      .map(|b| {
        let mut total = (pos_conf_loss[b] + neg_conf_loss[b]) / (num_pos[b] + num_neg_batch as f32);
        let denom = if num_pos[b] != 0.0 { num_pos[b] } else { 1.0 };
        total += self.alpha * pos_loc_loss[b] / denom;
        total
      })
      .collect();

    let stats = MiningStats {
      num_pos,
      num_neg,
      num_neg_batch,
      indices,
    };
    Ok((loss, stats))
  }
}

/// 降序取前 k 个索引，分数相同时索引小者在前
fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
  let mut order: Vec<usize> = (0..scores.len()).collect();
  order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
  order.truncate(k);
  order
}
