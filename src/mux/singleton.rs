//! TerminalMux 全局单例管理
//!
//! 确保整个应用只有一个 Mux 实例

use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::mux::{MuxConfig, MuxError, MuxNotification, MuxResult, TerminalMux};

/// 全局TerminalMux单例实例
static GLOBAL_MUX: OnceLock<Arc<TerminalMux>> = OnceLock::new();

/// 获取全局TerminalMux实例
///
/// 第一次调用时使用默认配置创建实例，后续调用返回同一个实例
pub fn get_mux() -> Arc<TerminalMux> {
    GLOBAL_MUX
        .get_or_init(|| build_mux(MuxConfig::default()))
        .clone()
}

/// 初始化全局TerminalMux实例
///
/// 已经初始化过时直接返回现有实例
pub fn init_mux() -> Arc<TerminalMux> {
    get_mux()
}

/// 使用指定配置初始化全局 TerminalMux
///
/// 应该在应用启动时调用一次；已经初始化过则返回 `AlreadyInitialized`
pub fn init_mux_with_config(config: MuxConfig) -> MuxResult<Arc<TerminalMux>> {
    if GLOBAL_MUX.get().is_some() {
        return Err(MuxError::AlreadyInitialized);
    }

    config.validate()?;
    let mux = build_mux(config);
    GLOBAL_MUX
        .set(Arc::clone(&mux))
        .map_err(|_| MuxError::AlreadyInitialized)?;
    debug!("全局 TerminalMux 初始化完成");
    Ok(mux)
}

fn build_mux(config: MuxConfig) -> Arc<TerminalMux> {
    let mux = Arc::new(TerminalMux::with_config(config));
    if let Err(e) = mux.start_exit_reaper() {
        // 没有回收线程时面板退出后需要显式 close_pane
        warn!("退出回收线程启动失败: {}", e);
    }
    mux
}

/// 关闭全局TerminalMux实例
///
/// 可重复调用；调用后 `get_mux()` 仍然返回已关闭的实例，新建面板会失败
pub fn shutdown_mux() {
    if let Some(mux) = GLOBAL_MUX.get() {
        mux.shutdown();
    }
}

/// 检查全局Mux是否已经初始化
pub fn is_mux_initialized() -> bool {
    GLOBAL_MUX.get().is_some()
}

/// 获取全局Mux的统计信息（用于调试）
pub fn get_mux_stats() -> Option<MuxStats> {
    GLOBAL_MUX.get().map(|mux| {
        let status = mux.get_status();
        MuxStats {
            pane_count: status.pane_count,
            subscriber_count: status.subscriber_count,
            is_initialized: true,
            is_shutting_down: status.shutting_down,
        }
    })
}

/// 从任意线程发送通知到全局Mux的订阅者
pub fn notify_global(notification: MuxNotification) {
    if let Some(mux) = GLOBAL_MUX.get() {
        mux.notify(notification);
    }
}

/// Mux统计信息
#[derive(Debug, Clone)]
pub struct MuxStats {
    pub pane_count: usize,
    pub subscriber_count: usize,
    pub is_initialized: bool,
    pub is_shutting_down: bool,
}
