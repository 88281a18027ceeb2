// 该文件是 SSD Multibox （多框检测） 项目的一部分。
// src/bin/ssd_render.rs - 将检测结果绘制到图像上
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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use ssd_multibox::{
  FromUrl,
  config::Config,
  model::{DetectResult, Detection},
  output::{Annotator, OutputWrapper, Render, RenderOptions},
  preprocess::PMethod,
};

/// SSD 检测结果渲染工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 原始图像路径
  #[arg(long, value_name = "IMAGE")]
  pub image: PathBuf,
  /// 检测结果 JSON 文件，内容为 Detection 数组
  #[arg(long, value_name = "FILE")]
  pub detections: PathBuf,
  /// 预处理方法: reshape 或 zoom
  #[arg(long, default_value = "reshape", value_name = "METHOD")]
  pub method: String,
  /// 模型输入尺寸，缺省时取配置文件中的值
  #[arg(long, value_name = "DIM")]
  pub input_dim: Option<u32>,
  /// 输出路径，image:///path/out.png 或 svg:///path/out.svg
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 配置文件路径
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<PathBuf>,
  /// 不显示类别
  #[arg(long)]
  pub no_label: bool,
  /// 不显示置信度
  #[arg(long)]
  pub no_conf: bool,
  /// 不在标准输出打印结果
  #[arg(long)]
  pub quiet: bool,
  /// 框颜色的随机种子
  #[arg(long, value_name = "SEED")]
  pub seed: Option<u64>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let config = match &args.config {
    Some(path) => Config::from_file(path)?,
    None => Config::default(),
  };
  let method: PMethod = args.method.parse()?;
  let input_dim = args.input_dim.unwrap_or(config.input_dim);

  info!("图像路径: {}", args.image.display());
  info!("检测结果: {}", args.detections.display());
  info!("输出路径: {}", args.output);

  let image = image::open(&args.image)
    .with_context(|| format!("无法读取图像 {}", args.image.display()))?
    .to_rgb8();
  let text = std::fs::read_to_string(&args.detections)
    .with_context(|| format!("无法读取检测结果 {}", args.detections.display()))?;
  let detections: Vec<Detection> = serde_json::from_str(&text)?;
  if detections.is_empty() {
    warn!("检测结果为空");
  }
  let result = DetectResult::from(detections);

  let options = RenderOptions {
    show_label: !args.no_label,
    show_conf: !args.no_conf,
    print_result: !args.quiet,
    ..RenderOptions::new(method, input_dim)
  };
  let annotator = match args.seed {
    Some(seed) => Annotator::with_seed(options, seed),
    None => Annotator::new(options),
  };

  let mut output = OutputWrapper::from_url(&args.output)?.with_annotator(annotator);
  if let Some(font_path) = &config.font_path {
    output = output.load_font(font_path)?;
  }

  let now = std::time::Instant::now();
  output.render_result(&image, &result)?;
  info!("渲染完成，耗时: {:.2?}", now.elapsed());

  Ok(())
}
