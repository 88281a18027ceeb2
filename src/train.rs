// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/train.rs - 训练过程的目录、检查点与日志记录
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

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{config::Config, model::Backbone};

/// 每个运行目录下的逐轮日志文件名
pub const EPOCH_LOG_FILE: &str = "epochs.jsonl";

#[derive(Error, Debug)]
pub enum TrainError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("日志序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("运行目录已存在: {0}")]
  RunExists(PathBuf),
}

/// 训练计划，由外部训练循环使用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainPlan {
  pub steps_per_epoch: u32,
  pub epochs: u32,
  pub validation_steps: u32,
  pub initial_epoch: u32,
  pub learning_rate: f32,
  pub batch_size: usize,
}

impl Default for TrainPlan {
  fn default() -> Self {
    TrainPlan {
      steps_per_epoch: 1000,
      epochs: 50,
      validation_steps: 250,
      initial_epoch: 0,
      learning_rate: 1e-4,
      batch_size: 4,
    }
  }
}

/// 一次训练运行的检查点目录与日志目录
#[derive(Debug, Clone, PartialEq)]
pub struct RunDirs {
  pub checkpoint_dir: PathBuf,
  pub log_dir: PathBuf,
}

pub fn run_timestamp(now: &DateTime<Local>) -> String {
  now.format("%Y%m%d_%H%M%S").to_string()
}

impl RunDirs {
  pub fn new(config: &Config, backbone: Backbone, timestamp: &str) -> Self {
    RunDirs {
      checkpoint_dir: config
        .checkpoint_dir
        .join(backbone.name())
        .join(timestamp),
      log_dir: config
        .tensorboard_log_dir
        .join(backbone.name())
        .join(timestamp),
    }
  }

  /// `<目录>/<骨干网络>/<时间戳>`，同一时间戳重复创建视为错误
  pub fn create(config: &Config, backbone: Backbone, timestamp: &str) -> Result<Self, TrainError> {
    let dirs = Self::new(config, backbone, timestamp);
    // 先检查两个目录，再创建
    if let Some(dir) = [&dirs.checkpoint_dir, &dirs.log_dir]
      .into_iter()
      .find(|dir| dir.exists())
    {
      return Err(TrainError::RunExists(dir.clone()));
    }
    for dir in [&dirs.checkpoint_dir, &dirs.log_dir] {
      std::fs::create_dir_all(dir)?;
      debug!("创建目录: {}", dir.display());
    }
    info!(
      "训练运行目录: 检查点 {}, 日志 {}",
      dirs.checkpoint_dir.display(),
      dirs.log_dir.display()
    );
    Ok(dirs)
  }

  pub fn create_now(config: &Config, backbone: Backbone) -> Result<Self, TrainError> {
    Self::create(config, backbone, &run_timestamp(&Local::now()))
  }
}

/// 检查点文件名，`epoch` 从 1 开始计数
pub fn checkpoint_name(epoch: u32, loss: f32, val_loss: f32, backbone: Backbone) -> String {
  format!(
    "SSD_ep{:03}-loss{:.3}-val_loss{:.3}-{}.h5",
    epoch,
    loss,
    val_loss,
    backbone.name()
  )
}

/// 一轮训练结束时的损失
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
  pub epoch: u32,
  pub loss: f32,
  pub val_loss: f32,
  pub timestamp: String,
}

impl EpochRecord {
  pub fn new(epoch: u32, loss: f32, val_loss: f32) -> Self {
    EpochRecord {
      epoch,
      loss,
      val_loss,
      timestamp: Local::now().to_rfc3339(),
    }
  }
}

/// 逐行 JSON 的训练日志
pub struct EpochLog {
  path: PathBuf,
  writer: BufWriter<File>,
}

impl EpochLog {
  pub fn open<P: AsRef<Path>>(log_dir: P) -> Result<Self, TrainError> {
    let path = log_dir.as_ref().join(EPOCH_LOG_FILE);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(EpochLog {
      path,
      writer: BufWriter::new(file),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn append(&mut self, record: &EpochRecord) -> Result<(), TrainError> {
    serde_json::to_writer(&mut self.writer, record)?;
    self.writer.write_all(b"\n")?;
    self.writer.flush()?;
    Ok(())
  }
}

/// 只在验证损失严格下降时保存
#[derive(Debug, Clone, Default)]
pub struct BestCheckpoint {
  best: Option<f32>,
}

impl BestCheckpoint {
  pub fn best(&self) -> Option<f32> {
    self.best
  }

  /// 返回 true 表示本轮应当保存；NaN 永远不会被视为改进
  pub fn improves(&mut self, val_loss: f32) -> bool {
    let improved = match self.best {
      _ if val_loss.is_nan() => false,
      None => true,
      Some(best) => val_loss < best,
    };
    if improved {
      self.best = Some(val_loss);
    }
    improved
  }
}

/// 外部训练循环在每轮结束时调用，负责记录日志并决定检查点路径
pub struct TrainRecorder {
  backbone: Backbone,
  dirs: RunDirs,
  log: EpochLog,
  best: BestCheckpoint,
}

impl TrainRecorder {
  pub fn new(backbone: Backbone, dirs: RunDirs) -> Result<Self, TrainError> {
    let log = EpochLog::open(&dirs.log_dir)?;
    Ok(TrainRecorder {
      backbone,
      dirs,
      log,
      best: BestCheckpoint::default(),
    })
  }

  pub fn dirs(&self) -> &RunDirs {
    &self.dirs
  }

  /// 记录一轮结果，返回需要写出权重的检查点路径
  pub fn end_epoch(
    &mut self,
    epoch: u32,
    loss: f32,
    val_loss: f32,
  ) -> Result<Option<PathBuf>, TrainError> {
    self.log.append(&EpochRecord::new(epoch, loss, val_loss))?;

    if !self.best.improves(val_loss) {
      info!(
        "第 {} 轮: val_loss {:.5} 未优于 {:?}",
        epoch,
        val_loss,
        self.best.best()
      );
      return Ok(None);
    }

    let path = self
      .dirs
      .checkpoint_dir
      .join(checkpoint_name(epoch, loss, val_loss, self.backbone));
    warn!("第 {} 轮: val_loss 改进为 {:.5}, 保存到 {}", epoch, val_loss, path.display());
    Ok(Some(path))
  }
}
