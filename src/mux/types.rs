//! 核心数据类型定义

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::mux::error::{MuxError, MuxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneId(pub u32);

impl PaneId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PaneId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<PaneId> for u32 {
    fn from(pane_id: PaneId) -> Self {
        pane_id.0
    }
}

impl std::fmt::Display for PaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl PtySize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    pub fn with_pixels(rows: u16, cols: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// 行列都必须大于0
    pub fn validate(&self) -> MuxResult<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(MuxError::InvalidSize {
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(())
    }
}

impl Default for PtySize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl From<PtySize> for portable_pty::PtySize {
    fn from(size: PtySize) -> Self {
        portable_pty::PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: size.pixel_width,
            pixel_height: size.pixel_height,
        }
    }
}

/// 面板生命周期状态
///
/// `Starting -> Running -> Exiting -> Closed`，`Closed` 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum PaneStatus {
    Starting = 0,
    Running = 1,
    Exiting = 2,
    Closed = 3,
}

impl PaneStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Exiting,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exiting => "exiting",
            Self::Closed => "closed",
        }
    }

    /// 是否还能接受写入和调整大小
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for PaneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 创建面板所需的进程描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub size: PtySize,
}

impl PaneSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            size: PtySize::default(),
        }
    }

    /// 使用系统默认 shell
    pub fn default_shell() -> Self {
        Self::new(detect_default_shell())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn size(mut self, size: PtySize) -> Self {
        self.size = size;
        self
    }

    /// 从一整行命令解析（支持引号）
    pub fn from_command_line(line: &str) -> MuxResult<Self> {
        let mut words = shell_words::split(line)
            .map_err(|e| MuxError::Config(format!("invalid command line '{line}': {e}")))?;
        if words.is_empty() {
            return Err(MuxError::Config("empty command line".to_string()));
        }
        let program = words.remove(0);
        Ok(Self::new(program).args(words))
    }
}

impl Default for PaneSpec {
    fn default() -> Self {
        Self::default_shell()
    }
}

/// 探测默认 shell：优先 `$SHELL`，然后按常见路径查找
pub fn detect_default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "C:\\Windows\\System32\\cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|path| Path::new(path).exists())
            .unwrap_or_else(|| {
                let shells = ["/bin/zsh", "/bin/bash", "/bin/sh"];
                shells
                    .iter()
                    .find(|&&path| Path::new(path).exists())
                    .map(|&path| path.to_string())
                    .unwrap_or_else(|| "/bin/sh".to_string())
            })
    }
}

/// Shell Integration 写回的面板元数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneShellState {
    pub current_working_directory: Option<String>,
    pub window_title: Option<String>,
    pub current_command: Option<String>,
}

/// 面板快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneInfo {
    pub pane_id: PaneId,
    pub status: PaneStatus,
    pub size: PtySize,
    pub program: String,
    pub title: Option<String>,
    pub working_directory: Option<String>,
    pub current_command: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
}

/// Mux通知事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[allow(clippy::enum_variant_names)]
pub enum MuxNotification {
    /// 面板输出数据
    PaneOutput { pane_id: PaneId, data: Bytes },
    /// 面板已添加
    PaneAdded { pane_id: PaneId },
    /// 面板已移除
    PaneRemoved { pane_id: PaneId },
    /// 面板大小已调整
    PaneResized { pane_id: PaneId, size: PtySize },
    /// 面板进程已退出，`None` 表示异常终止或状态未知
    PaneExited {
        pane_id: PaneId,
        exit_code: Option<i32>,
    },
    /// 面板标题已变化
    PaneTitleChanged { pane_id: PaneId, title: String },
    /// 面板工作目录已变化
    PaneCwdChanged { pane_id: PaneId, cwd: String },
}

impl MuxNotification {
    pub fn pane_id(&self) -> PaneId {
        match self {
            Self::PaneOutput { pane_id, .. }
            | Self::PaneAdded { pane_id }
            | Self::PaneRemoved { pane_id }
            | Self::PaneResized { pane_id, .. }
            | Self::PaneExited { pane_id, .. }
            | Self::PaneTitleChanged { pane_id, .. }
            | Self::PaneCwdChanged { pane_id, .. } => *pane_id,
        }
    }

    /// 输出事件在订阅者积压时允许丢弃，其余事件必须送达
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::PaneOutput { .. })
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::PaneOutput { .. } => "terminal_output",
            Self::PaneAdded { .. } => "terminal_created",
            Self::PaneRemoved { .. } => "terminal_closed",
            Self::PaneResized { .. } => "terminal_resized",
            Self::PaneExited { .. } => "terminal_exit",
            Self::PaneTitleChanged { .. } => "pane_title_changed",
            Self::PaneCwdChanged { .. } => "pane_cwd_changed",
        }
    }
}
