//! Terminal Mux - 核心终端多路复用器
//!
//! 提供统一的终端会话管理、事件通知和PTY I/O处理

pub mod config;
pub mod error;
pub mod io_handler;
pub mod notifier;
pub mod pane;
pub mod performance_monitor;
pub mod singleton;
pub mod terminal_mux;
pub mod types;

pub use config::*;
pub use error::*;
pub use io_handler::{IoHandler, IoWorker};
pub use notifier::*;
pub use pane::*;
pub use performance_monitor::{PaneCounters, PaneMetrics, PerformanceMetrics, PerformanceMonitor};
pub use singleton::*;
pub use terminal_mux::*;
pub use types::*;
