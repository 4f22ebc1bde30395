//! 终端多路复用器错误类型
//!
//! `PaneError` 描述单个面板上的失败，`MuxError` 是对外暴露的统一错误

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::mux::PaneId;

/// 面板级错误
#[derive(Debug, Error)]
pub enum PaneError {
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Pane is closed")]
    Closed,

    #[error("Pane I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pane resize failed: {0}")]
    Resize(String),

    #[error("Failed to acquire pane reader: {0}")]
    Reader(String),

    #[error("Unsupported key: {0}")]
    UnsupportedKey(String),
}

pub type PaneResult<T> = Result<T, PaneError>;

/// Mux 级错误
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Spawn failed for pane {pane_id}: {reason}")]
    Spawn { pane_id: PaneId, reason: String },

    #[error("Pane {0} not found")]
    PaneNotFound(PaneId),

    #[error("Pane {pane_id} I/O error: {reason}")]
    Io { pane_id: PaneId, reason: String },

    #[error("Pane {0} is closed")]
    PaneClosed(PaneId),

    #[error("Invalid pane size: {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },

    #[error("Terminal mux is shutting down")]
    ShuttingDown,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Terminal mux already initialized")]
    AlreadyInitialized,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type MuxResult<T> = Result<T, MuxError>;

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl MuxError {
    /// 把面板错误提升为带面板ID的 Mux 错误
    pub fn from_pane(pane_id: PaneId, err: PaneError) -> Self {
        match err {
            PaneError::Spawn { program, reason } => Self::Spawn {
                pane_id,
                reason: format!("{program}: {reason}"),
            },
            PaneError::Closed => Self::PaneClosed(pane_id),
            PaneError::Io(e) => Self::Io {
                pane_id,
                reason: e.to_string(),
            },
            PaneError::Resize(reason) | PaneError::Reader(reason) => Self::Io { pane_id, reason },
            PaneError::UnsupportedKey(key) => Self::Internal(format!("unsupported key: {key}")),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::PaneNotFound(_) | Self::PaneClosed(_) => ErrorSeverity::Warn,
            Self::InvalidSize { .. } | Self::ShuttingDown | Self::AlreadyInitialized => {
                ErrorSeverity::Info
            }
            Self::Spawn { .. } | Self::Io { .. } | Self::Config(_) => ErrorSeverity::Error,
            Self::ResourceExhausted(_) | Self::Internal(_) => ErrorSeverity::Critical,
        }
    }

    /// 调用方是否可以重试同一操作
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Spawn { .. } | Self::ResourceExhausted(_)
        )
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::PaneNotFound(_) => "not_found",
            Self::Io { .. } => "io",
            Self::PaneClosed(_) => "closed",
            Self::InvalidSize { .. } => "validation",
            Self::ShuttingDown => "lifecycle",
            Self::ResourceExhausted(_) => "resource",
            Self::AlreadyInitialized => "lifecycle",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// 按严重程度记录日志
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Info => debug!("{}", self),
            ErrorSeverity::Warn => warn!("{}", self),
            ErrorSeverity::Error => error!("{}", self),
            ErrorSeverity::Critical => error!("CRITICAL: {}", self),
        }
    }
}

impl From<&str> for MuxError {
    fn from(msg: &str) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<String> for MuxError {
    fn from(msg: String) -> Self {
        Self::Internal(msg)
    }
}
