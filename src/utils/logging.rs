// 日志系统模块

use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

/// 初始化日志系统
/// 支持通过 RUST_LOG 环境变量控制日志级别，默认为 info
///
/// 日志写到 stderr，stdout 留给面板输出；重复初始化返回错误但不影响已有订阅器
pub fn init_logging() -> Result<(), String> {
    init_logging_with_default("info")
}

pub fn init_logging_with_default(default_directive: &str) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| format!("日志系统初始化失败: {}", e))?;

    debug!("日志系统初始化完成");
    Ok(())
}
