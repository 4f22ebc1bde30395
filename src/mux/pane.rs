//! 面板接口和实现

use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::mux::{
    PaneError, PaneId, PaneInfo, PaneResult, PaneShellState, PaneSpec, PaneStatus, PtySize,
};
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty};

/// 每个子进程都会带上的基础环境变量
const BASE_ENV: &[(&str, &str)] = &[
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("TERM_PROGRAM", "OrbitX"),
];

/// 关闭面板时等待子进程响应 SIGHUP 的时间
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// 面板的可变簿记状态，与具体的 PTY 实现无关
#[derive(Debug)]
pub struct PaneState {
    status: AtomicU8,
    size: Mutex<PtySize>,
    shell: Mutex<PaneShellState>,
    exit_code: Mutex<Option<i32>>,
    created_at: SystemTime,
    last_activity: Mutex<SystemTime>,
}

impl PaneState {
    pub fn new(size: PtySize) -> Self {
        let now = SystemTime::now();
        Self {
            status: AtomicU8::new(PaneStatus::Starting as u8),
            size: Mutex::new(size),
            shell: Mutex::new(PaneShellState::default()),
            exit_code: Mutex::new(None),
            created_at: now,
            last_activity: Mutex::new(now),
        }
    }

    pub fn status(&self) -> PaneStatus {
        PaneStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// 只有 `from` 中的状态可以迁移到 `to`
    fn transition(&self, from: &[PaneStatus], to: PaneStatus) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if !from.contains(&PaneStatus::from_u8(current)) {
                return false;
            }
            match self.status.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn mark_running(&self) -> bool {
        self.transition(&[PaneStatus::Starting], PaneStatus::Running)
    }

    pub fn mark_exiting(&self) -> bool {
        self.transition(
            &[PaneStatus::Starting, PaneStatus::Running],
            PaneStatus::Exiting,
        )
    }

    /// 返回之前的状态，调用方据此判断是否为第一次关闭
    pub fn mark_closed(&self) -> PaneStatus {
        PaneStatus::from_u8(self.status.swap(PaneStatus::Closed as u8, Ordering::AcqRel))
    }

    pub fn size(&self) -> PtySize {
        *self.size.lock()
    }

    pub fn set_size(&self, size: PtySize) {
        *self.size.lock() = size;
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    pub fn set_exit_code(&self, code: Option<i32>) {
        *self.exit_code.lock() = code;
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn last_activity(&self) -> SystemTime {
        *self.last_activity.lock()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = SystemTime::now();
    }

    pub fn shell_state(&self) -> PaneShellState {
        self.shell.lock().clone()
    }

    pub fn set_title(&self, title: &str) -> bool {
        let mut shell = self.shell.lock();
        if shell.window_title.as_deref() == Some(title) {
            return false;
        }
        shell.window_title = Some(title.to_string());
        true
    }

    pub fn set_cwd(&self, cwd: &str) -> bool {
        let mut shell = self.shell.lock();
        if shell.current_working_directory.as_deref() == Some(cwd) {
            return false;
        }
        shell.current_working_directory = Some(cwd.to_string());
        true
    }

    pub fn set_current_command(&self, command: Option<String>) -> bool {
        let mut shell = self.shell.lock();
        if shell.current_command == command {
            return false;
        }
        shell.current_command = command;
        true
    }
}

pub trait Pane: Send + Sync {
    fn pane_id(&self) -> PaneId;

    fn program(&self) -> &str;

    fn state(&self) -> &PaneState;

    fn write(&self, data: &[u8]) -> PaneResult<()>;

    fn resize(&self, size: PtySize) -> PaneResult<()>;

    fn reader(&self) -> PaneResult<Box<dyn Read + Send>>;

    /// 幂等：终止子进程、关闭 master，状态置为 `Closed`
    fn close(&self);

    /// 读到 EOF 之后回收子进程，最多等待 `timeout`
    fn reap(&self, timeout: Duration) -> Option<i32>;

    fn status(&self) -> PaneStatus {
        self.state().status()
    }

    fn is_dead(&self) -> bool {
        !self.status().is_live()
    }

    fn get_size(&self) -> PtySize {
        self.state().size()
    }

    fn exit_code(&self) -> Option<i32> {
        self.state().exit_code()
    }

    fn created_at(&self) -> SystemTime {
        self.state().created_at()
    }

    fn last_activity(&self) -> SystemTime {
        self.state().last_activity()
    }

    fn mark_running(&self) -> bool {
        self.state().mark_running()
    }

    fn mark_exiting(&self) -> bool {
        self.state().mark_exiting()
    }

    fn shell_state(&self) -> PaneShellState {
        self.state().shell_state()
    }

    fn set_title(&self, title: &str) -> bool {
        self.state().set_title(title)
    }

    fn set_cwd(&self, cwd: &str) -> bool {
        self.state().set_cwd(cwd)
    }

    fn set_current_command(&self, command: Option<String>) -> bool {
        self.state().set_current_command(command)
    }

    fn info(&self) -> PaneInfo {
        let state = self.state();
        let shell = state.shell_state();
        PaneInfo {
            pane_id: self.pane_id(),
            status: state.status(),
            size: state.size(),
            program: self.program().to_string(),
            title: shell.window_title,
            working_directory: shell.current_working_directory,
            current_command: shell.current_command,
            exit_code: state.exit_code(),
            created_at: state.created_at(),
            last_activity: state.last_activity(),
        }
    }
}

pub struct LocalPane {
    pane_id: PaneId,
    program: String,
    state: PaneState,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
}

impl LocalPane {
    /// 分配 PTY 并在 slave 端启动子进程
    pub fn open(pane_id: PaneId, spec: &PaneSpec) -> PaneResult<Self> {
        Self::open_with_env(pane_id, spec, &[])
    }

    /// 与 `open` 相同，额外注入一组环境变量（优先级低于 PaneSpec 自带的 env）
    pub fn open_with_env(
        pane_id: PaneId,
        spec: &PaneSpec,
        extra_env: &[(String, String)],
    ) -> PaneResult<Self> {
        tracing::debug!(
            "创建本地面板: {:?}, 大小: {:?}, 程序: {}",
            pane_id,
            spec.size,
            spec.program
        );

        let spawn_error = |reason: String| PaneError::Spawn {
            program: spec.program.clone(),
            reason,
        };

        let pty_system = portable_pty::native_pty_system();
        let pty_pair = pty_system
            .openpty(spec.size.into())
            .map_err(|e| spawn_error(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);

        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }

        for (key, value) in BASE_ENV {
            cmd.env(key, value);
        }
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pty_pair.slave.spawn_command(cmd).map_err(|e| {
            tracing::warn!("子进程启动失败: {:?}, 错误: {}", pane_id, e);
            spawn_error(e.to_string())
        })?;
        // slave 端只属于子进程，否则子进程退出后读端永远等不到 EOF
        drop(pty_pair.slave);

        let killer = child.clone_killer();

        let writer = pty_pair
            .master
            .take_writer()
            .map_err(|e| spawn_error(format!("take_writer failed: {e}")))?;

        tracing::debug!(
            "本地面板创建完成: {:?}, pid: {:?}",
            pane_id,
            child.process_id()
        );

        Ok(Self {
            pane_id,
            program: spec.program.clone(),
            state: PaneState::new(spec.size),
            master: Mutex::new(Some(pty_pair.master)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            killer: Mutex::new(Some(killer)),
        })
    }

    /// 先发送 SIGHUP，宽限期内仍未退出则通过子进程句柄强制终止
    fn terminate_child(&self) {
        if let Some(mut killer) = self.killer.lock().take() {
            if let Err(e) = killer.kill() {
                // 进程可能已经自行退出
                tracing::trace!("面板 {:?} 发送终止信号失败: {}", self.pane_id, e);
            }
        }

        // 读线程正在 reap 时由它负责强制终止
        let Some(mut guard) = self.child.try_lock() else {
            return;
        };
        let Some(child) = guard.as_mut() else {
            return;
        };

        let deadline = Instant::now() + CLOSE_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::trace!("面板 {:?} 查询子进程状态失败: {}", self.pane_id, e);
                    break;
                }
            }
        }

        tracing::debug!("面板 {:?} 子进程未响应挂断信号，强制终止", self.pane_id);
        // portable-pty 的 Child::kill 在 SIGHUP 无效时升级为 SIGKILL
        if let Err(e) = child.kill() {
            tracing::trace!("面板 {:?} 强制终止失败: {}", self.pane_id, e);
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(|child| child.process_id())
    }

    /// 写入字符串数据
    pub fn write_str(&self, data: &str) -> PaneResult<()> {
        self.write(data.as_bytes())
    }

    /// 写入带换行的字符串
    pub fn write_line(&self, data: &str) -> PaneResult<()> {
        let mut line = data.to_string();
        line.push('\n');
        self.write(line.as_bytes())
    }

    /// 发送控制字符
    pub fn send_control(&self, ctrl_char: char) -> PaneResult<()> {
        self.write(&[control_code(ctrl_char)?])
    }

    /// 发送特殊键序列
    pub fn send_key(&self, key: &str) -> PaneResult<()> {
        self.write(key_sequence(key)?)
    }
}

pub fn control_code(ctrl_char: char) -> PaneResult<u8> {
    match ctrl_char.to_ascii_lowercase() {
        'c' => Ok(0x03),
        'd' => Ok(0x04),
        'l' => Ok(0x0C),
        'z' => Ok(0x1A),
        '\\' => Ok(0x1C),
        other => Err(PaneError::UnsupportedKey(format!("Ctrl+{other}"))),
    }
}

pub fn key_sequence(key: &str) -> PaneResult<&'static [u8]> {
    let sequence: &[u8] = match key {
        "Enter" => b"\r",
        "Tab" => b"\t",
        "Backspace" => b"\x7f",
        "Escape" => b"\x1b",
        "Up" => b"\x1b[A",
        "Down" => b"\x1b[B",
        "Right" => b"\x1b[C",
        "Left" => b"\x1b[D",
        "Home" => b"\x1b[H",
        "End" => b"\x1b[F",
        "PageUp" => b"\x1b[5~",
        "PageDown" => b"\x1b[6~",
        "Delete" => b"\x1b[3~",
        "Insert" => b"\x1b[2~",
        _ => return Err(PaneError::UnsupportedKey(key.to_string())),
    };
    Ok(sequence)
}

impl Pane for LocalPane {
    fn pane_id(&self) -> PaneId {
        self.pane_id
    }

    fn program(&self) -> &str {
        &self.program
    }

    fn state(&self) -> &PaneState {
        &self.state
    }

    fn write(&self, data: &[u8]) -> PaneResult<()> {
        if self.is_dead() {
            tracing::debug!("尝试写入已关闭的面板: {:?}", self.pane_id);
            return Err(PaneError::Closed);
        }

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(PaneError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;

        self.state.touch();
        tracing::trace!("面板 {:?} 写入 {} 字节", self.pane_id, data.len());
        Ok(())
    }

    fn resize(&self, size: PtySize) -> PaneResult<()> {
        if self.is_dead() {
            tracing::debug!("尝试调整已关闭面板的大小: {:?}", self.pane_id);
            return Err(PaneError::Closed);
        }

        {
            let guard = self.master.lock();
            let master = guard.as_ref().ok_or(PaneError::Closed)?;
            master
                .resize(size.into())
                .map_err(|e| PaneError::Resize(e.to_string()))?;
        }

        self.state.set_size(size);
        tracing::debug!("面板 {:?} 大小调整为 {}x{}", self.pane_id, size.cols, size.rows);
        Ok(())
    }

    fn reader(&self) -> PaneResult<Box<dyn Read + Send>> {
        if self.status() == PaneStatus::Closed {
            return Err(PaneError::Closed);
        }

        let guard = self.master.lock();
        let master = guard.as_ref().ok_or(PaneError::Closed)?;
        master
            .try_clone_reader()
            .map_err(|e| PaneError::Reader(e.to_string()))
    }

    fn close(&self) {
        if self.state.mark_closed() == PaneStatus::Closed {
            return;
        }

        tracing::debug!("关闭面板: {:?}", self.pane_id);

        if self.state.exit_code().is_none() {
            self.terminate_child();
        }

        drop(self.writer.lock().take());
        drop(self.master.lock().take());
    }

    fn reap(&self, timeout: Duration) -> Option<i32> {
        let mut guard = self.child.lock();
        let Some(child) = guard.as_mut() else {
            return self.state.exit_code();
        };

        let mut deadline = Instant::now() + timeout;
        let mut close_seen = false;
        let code = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status.exit_code() as i32),
                Ok(None) => {
                    // 面板已关闭时只保留挂断宽限期
                    if !close_seen && self.state.status() == PaneStatus::Closed {
                        close_seen = true;
                        deadline = deadline.min(Instant::now() + CLOSE_GRACE);
                    }
                    if Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(10));
                        continue;
                    }

                    tracing::warn!("面板 {:?} 子进程未按时退出，强制终止", self.pane_id);
                    if let Err(e) = child.kill() {
                        tracing::trace!("面板 {:?} 强制终止失败: {}", self.pane_id, e);
                    }
                    break child.wait().ok().map(|status| status.exit_code() as i32);
                }
                Err(e) => {
                    tracing::warn!("面板 {:?} 等待子进程失败: {}", self.pane_id, e);
                    break None;
                }
            }
        };

        guard.take();
        self.killer.lock().take();
        self.state.set_exit_code(code);
        code
    }
}

impl Drop for LocalPane {
    fn drop(&mut self) {
        self.close();
        if let Some(mut child) = self.child.lock().take() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                if let Err(e) = child.kill() {
                    tracing::trace!("面板 {:?} 释放时终止子进程失败: {}", self.pane_id, e);
                }
                let _ = child.try_wait();
            }
        }
    }
}
