// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/session.rs - 数值计算会话
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

use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("线程池创建失败: {0}")]
  ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
  Cpu,
}

/// 进程级数值计算上下文
///
/// 在任何计算之前创建一次，按引用传给需要它的模块，用完后调用 [`Session::close`]。
pub struct Session {
  pool: ThreadPool,
  device: Device,
}

impl Session {
  pub fn init(config: &Config) -> Result<Self, SessionError> {
    let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("ssd-worker-{}", i));
    if let Some(n) = config.num_threads {
      builder = builder.num_threads(n);
    }
    let pool = builder.build()?;
    info!("数值计算会话已创建, 线程数: {}", pool.current_num_threads());
    Ok(Session {
      pool,
      device: Device::Cpu,
    })
  }

  pub fn device(&self) -> Device {
    self.device
  }

  pub fn num_threads(&self) -> usize {
    self.pool.current_num_threads()
  }

  /// 在会话的线程池中执行计算
  pub fn install<R, F>(&self, op: F) -> R
  where
    R: Send,
    F: FnOnce() -> R + Send,
  {
    self.pool.install(op)
  }

  pub fn close(self) {
    debug!("关闭数值计算会话");
    drop(self.pool);
    info!("数值计算会话已关闭");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn session_runs_on_its_own_pool() {
    let config = Config {
      num_threads: Some(2),
      ..Config::default()
    };
    let session = Session::init(&config).unwrap();
    assert_eq!(session.num_threads(), 2);
    assert_eq!(session.device(), Device::Cpu);
    let threads = session.install(rayon::current_num_threads);
    assert_eq!(threads, 2);
    session.close();
  }
}
