//! Mux 配置管理
//!
//! 配置来源按优先级：默认值 -> 配置文件 -> 环境变量

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mux::{MuxError, MuxResult, PaneSpec, PtySize};

/// 指定配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "ORBITX_MUX_CONFIG";

/// Mux 配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MuxConfig {
    /// I/O 线程配置
    pub io: IoConfig,
    /// 事件分发配置
    pub events: EventConfig,
    /// 新面板默认值
    pub shell: ShellDefaults,
    /// 资源限制
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IoConfig {
    /// 单次读取的最大字节数
    pub read_buffer_size: usize,
    /// 移除面板时等待读线程结束的时间（毫秒）
    pub worker_join_timeout_ms: u64,
    /// 读到 EOF 后等待子进程退出的时间（毫秒）
    pub exit_wait_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventConfig {
    /// 每个订阅者允许积压的输出事件数量
    pub subscriber_queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShellDefaults {
    /// 未设置时自动探测
    pub default_program: Option<String>,
    pub default_rows: u16,
    pub default_cols: u16,
    /// 注入每个面板的额外环境变量
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    pub max_panes: usize,
    /// 面板数超过该值时记录警告
    pub warn_pane_count: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192,
            worker_join_timeout_ms: 2000,
            exit_wait_timeout_ms: 2000,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 4096,
        }
    }
}

impl Default for ShellDefaults {
    fn default() -> Self {
        Self {
            default_program: None,
            default_rows: 24,
            default_cols: 80,
            env: HashMap::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_panes: 256,
            warn_pane_count: 50,
        }
    }
}

impl IoConfig {
    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }

    pub fn exit_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_wait_timeout_ms)
    }
}

impl ShellDefaults {
    pub fn default_size(&self) -> PtySize {
        PtySize::new(self.default_rows, self.default_cols)
    }

    /// 按配置构建默认 shell 的面板描述
    pub fn default_spec(&self, size: PtySize) -> PaneSpec {
        let spec = match &self.default_program {
            Some(program) => PaneSpec::new(program.clone()),
            None => PaneSpec::default_shell(),
        };
        spec.size(size)
    }

    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl MuxConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("从文件加载配置: {:?}", path);

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        info!("配置加载成功: {:?}", path);
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        debug!("保存配置到文件: {:?}", path);

        let content = toml::to_string_pretty(self).context("failed to serialize config")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        info!("配置保存成功: {:?}", path);
        Ok(())
    }

    /// 从环境变量覆盖配置
    pub fn override_from_env(&mut self) {
        debug!("从环境变量覆盖配置");
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(size) = parse_var::<usize>(&lookup, "ORBITX_MUX_READ_BUFFER_SIZE") {
            self.io.read_buffer_size = size;
            debug!("从环境变量设置 io.read_buffer_size = {}", size);
        }

        if let Some(capacity) = parse_var::<usize>(&lookup, "ORBITX_MUX_QUEUE_CAPACITY") {
            self.events.subscriber_queue_capacity = capacity;
            debug!(
                "从环境变量设置 events.subscriber_queue_capacity = {}",
                capacity
            );
        }

        if let Some(max) = parse_var::<usize>(&lookup, "ORBITX_MUX_MAX_PANES") {
            self.limits.max_panes = max;
            debug!("从环境变量设置 limits.max_panes = {}", max);
        }

        if let Some(shell) = lookup("ORBITX_MUX_SHELL").filter(|s| !s.trim().is_empty()) {
            debug!("从环境变量设置 shell.default_program = {}", shell);
            self.shell.default_program = Some(shell);
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> MuxResult<()> {
        if self.io.read_buffer_size == 0 {
            return Err(MuxError::Config("io.readBufferSize must be > 0".to_string()));
        }

        if self.events.subscriber_queue_capacity == 0 {
            return Err(MuxError::Config(
                "events.subscriberQueueCapacity must be > 0".to_string(),
            ));
        }

        if self.limits.max_panes == 0 {
            return Err(MuxError::Config("limits.maxPanes must be > 0".to_string()));
        }

        self.shell.default_size().validate().map_err(|_| {
            MuxError::Config(format!(
                "shell default size {}x{} is invalid",
                self.shell.default_rows, self.shell.default_cols
            ))
        })?;

        if matches!(&self.shell.default_program, Some(p) if p.trim().is_empty()) {
            return Err(MuxError::Config(
                "shell.defaultProgram must not be empty".to_string(),
            ));
        }

        debug!("配置验证通过");
        Ok(())
    }

    /// 按优先级加载配置：默认值 -> 第一个存在的配置文件 -> 环境变量
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        for path in Self::candidate_paths() {
            if !path.exists() {
                continue;
            }
            match Self::from_file(&path) {
                Ok(file_config) => {
                    config = file_config;
                    break;
                }
                Err(e) => {
                    warn!("加载配置文件失败 {:?}: {:#}", path, e);
                }
            }
        }

        config.override_from_env();
        config.validate()?;
        Ok(config)
    }

    /// 配置文件查找顺序
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(path));
        }
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("orbitx").join("mux.toml"));
        }
        paths.push(PathBuf::from("orbitx-mux.toml"));
        paths
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("忽略无效的环境变量 {}={}", key, raw);
            None
        }
    }
}
