//! TerminalMux - 核心终端多路复用器
//!
//! 面板注册表、ID 分配、生命周期管理和事件分发的唯一入口

use crossbeam_channel::RecvTimeoutError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use crate::mux::io_handler::join_thread_timeout;
use crate::mux::{
    EventNotifier, EventStream, IoHandler, IoWorker, LocalPane, MuxConfig, MuxError,
    MuxNotification, MuxResult, Pane, PaneId, PaneInfo, PaneResult, PaneSpec, PerformanceMetrics,
    PerformanceMonitor, PtySize, SubscriberId,
};

/// TerminalMux状态信息
#[derive(Debug, Clone)]
pub struct TerminalMuxStatus {
    /// 当前面板数量
    pub pane_count: usize,
    /// 仍在运行的面板数量
    pub live_pane_count: usize,
    /// 当前订阅者数量（包含内部退出回收订阅）
    pub subscriber_count: usize,
    /// 下一个面板ID
    pub next_pane_id: u32,
    pub shutting_down: bool,
}

struct PaneEntry {
    pane: Arc<dyn Pane>,
    worker: IoWorker,
}

struct ExitReaper {
    stream_id: SubscriberId,
    handle: JoinHandle<()>,
}

/// TerminalMux - 核心终端多路复用器
pub struct TerminalMux {
    /// 面板存储，只在插入和移除时持有写锁
    panes: RwLock<HashMap<PaneId, PaneEntry>>,

    /// 下一个面板ID生成器，从1开始
    next_pane_id: AtomicU32,

    notifier: EventNotifier,
    io_handler: IoHandler,
    monitor: Arc<PerformanceMonitor>,
    config: MuxConfig,

    /// 关闭标志，置位后拒绝创建新面板
    shutting_down: AtomicBool,

    reaper: Mutex<Option<ExitReaper>>,
}

impl TerminalMux {
    pub fn new() -> Self {
        Self::with_config(MuxConfig::default())
    }

    pub fn with_config(config: MuxConfig) -> Self {
        let notifier = EventNotifier::new(config.events.subscriber_queue_capacity);
        let monitor = Arc::new(PerformanceMonitor::new());
        let io_handler = IoHandler::new(notifier.clone(), Arc::clone(&monitor), config.io.clone());

        debug!(
            "创建 TerminalMux: 读缓冲 {} 字节, 订阅队列容量 {}, 最大面板数 {}",
            config.io.read_buffer_size,
            config.events.subscriber_queue_capacity,
            config.limits.max_panes
        );

        Self {
            panes: RwLock::new(HashMap::new()),
            next_pane_id: AtomicU32::new(1),
            notifier,
            io_handler,
            monitor,
            config,
            shutting_down: AtomicBool::new(false),
            reaper: Mutex::new(None),
        }
    }

    /// 创建共享实例并启动退出回收线程
    pub fn new_shared() -> MuxResult<Arc<Self>> {
        Self::shared_with_config(MuxConfig::default())
    }

    pub fn shared_with_config(config: MuxConfig) -> MuxResult<Arc<Self>> {
        let mux = Arc::new(Self::with_config(config));
        mux.start_exit_reaper()?;
        Ok(mux)
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// 进程退出后自动移除面板；重复调用无副作用
    pub fn start_exit_reaper(self: &Arc<Self>) -> MuxResult<()> {
        let mut guard = self.reaper.lock();
        if guard.is_some() {
            return Ok(());
        }
        if self.is_shutting_down() {
            return Err(MuxError::ShuttingDown);
        }

        let stream = self.notifier.subscribe();
        let stream_id = stream.id();
        let mux = Arc::downgrade(self);

        let handle = thread::Builder::new()
            .name("mux-exit-reaper".to_string())
            .spawn(move || run_exit_reaper(mux, stream))
            .map_err(|e| MuxError::Internal(format!("failed to spawn exit reaper: {e}")))?;

        *guard = Some(ExitReaper { stream_id, handle });
        debug!("退出回收线程已启动");
        Ok(())
    }

    fn next_pane_id(&self) -> PaneId {
        PaneId::new(self.next_pane_id.fetch_add(1, Ordering::Relaxed))
    }

    /// ID 曾经分配过（不一定还在注册表中）
    fn was_issued(&self, pane_id: PaneId) -> bool {
        let id = pane_id.as_u32();
        id != 0 && id < self.next_pane_id.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // === 面板管理方法 ===

    /// 按描述启动子进程并注册面板
    #[instrument(skip(self, spec), fields(program = %spec.program))]
    pub fn create_pane(&self, spec: &PaneSpec) -> MuxResult<PaneId> {
        spec.size.validate()?;
        let extra_env = self.config.shell.env_pairs();

        self.create_pane_with(|pane_id| {
            LocalPane::open_with_env(pane_id, spec, &extra_env)
                .map(|pane| Arc::new(pane) as Arc<dyn Pane>)
        })
    }

    /// 使用配置中的默认 shell 创建面板
    pub fn create_default_pane(&self, size: PtySize) -> MuxResult<PaneId> {
        let spec = self.config.shell.default_spec(size);
        self.create_pane(&spec)
    }

    /// 通用创建入口：分配ID，由 `builder` 构建面板，然后注册并启动 I/O 线程
    pub fn create_pane_with<F>(&self, builder: F) -> MuxResult<PaneId>
    where
        F: FnOnce(PaneId) -> PaneResult<Arc<dyn Pane>>,
    {
        if self.is_shutting_down() {
            return Err(MuxError::ShuttingDown);
        }
        self.check_capacity(self.pane_count())?;

        let pane_id = self.next_pane_id();
        let pane = builder(pane_id).map_err(|e| {
            let err = MuxError::from_pane(pane_id, e);
            err.log();
            err
        })?;

        if pane.pane_id() != pane_id {
            pane.close();
            return Err(MuxError::Internal(format!(
                "pane builder returned id {} for {}",
                pane.pane_id(),
                pane_id
            )));
        }

        if let Err(e) = pane.get_size().validate() {
            pane.close();
            return Err(e);
        }

        // 写锁持有到读线程句柄入表为止，PaneAdded 先于该面板的任何输出
        let registered = {
            let mut panes = self.panes.write();
            if self.is_shutting_down() {
                Err(MuxError::ShuttingDown)
            } else if let Err(err) = self.check_capacity(panes.len()) {
                Err(err)
            } else {
                self.notifier.publish(MuxNotification::PaneAdded { pane_id });
                match self.io_handler.spawn_io_thread(Arc::clone(&pane)) {
                    Ok(worker) => {
                        panes.insert(
                            pane_id,
                            PaneEntry {
                                pane: Arc::clone(&pane),
                                worker,
                            },
                        );
                        Ok(panes.len())
                    }
                    Err(err) => {
                        err.log();
                        self.monitor.unregister(pane_id);
                        self.notifier
                            .publish(MuxNotification::PaneRemoved { pane_id });
                        Err(err)
                    }
                }
            }
        };

        let total_panes = match registered {
            Ok(total) => total,
            Err(err) => {
                pane.close();
                return Err(err);
            }
        };

        if total_panes > self.config.limits.warn_pane_count {
            warn!("活跃面板数量较多: {}", total_panes);
        }

        debug!(
            "创建面板成功: pane_id={}, program={}, total_panes={}",
            pane_id,
            pane.program(),
            total_panes
        );
        Ok(pane_id)
    }

    fn check_capacity(&self, current: usize) -> MuxResult<()> {
        if current >= self.config.limits.max_panes {
            return Err(MuxError::ResourceExhausted(format!(
                "pane limit {} reached",
                self.config.limits.max_panes
            )));
        }
        Ok(())
    }

    /// 获取面板引用
    pub fn get_pane(&self, pane_id: PaneId) -> MuxResult<Arc<dyn Pane>> {
        self.panes
            .read()
            .get(&pane_id)
            .map(|entry| Arc::clone(&entry.pane))
            .ok_or(MuxError::PaneNotFound(pane_id))
    }

    pub fn pane_exists(&self, pane_id: PaneId) -> bool {
        self.panes.read().contains_key(&pane_id)
    }

    pub fn pane_info(&self, pane_id: PaneId) -> MuxResult<PaneInfo> {
        Ok(self.get_pane(pane_id)?.info())
    }

    /// 获取所有面板ID列表（升序）
    pub fn list_panes(&self) -> Vec<PaneId> {
        let mut ids: Vec<PaneId> = self.panes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn list_pane_infos(&self) -> Vec<PaneInfo> {
        let mut panes: Vec<Arc<dyn Pane>> = self
            .panes
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.pane))
            .collect();
        panes.sort_by_key(|pane| pane.pane_id());
        panes.iter().map(|pane| pane.info()).collect()
    }

    pub fn pane_count(&self) -> usize {
        self.panes.read().len()
    }

    #[instrument(skip(self, data), fields(pane_id = %pane_id, data_len = data.len()))]
    pub fn write_to_pane(&self, pane_id: PaneId, data: &[u8]) -> MuxResult<()> {
        let pane = self.get_pane(pane_id)?;
        pane.write(data)
            .map_err(|e| MuxError::from_pane(pane_id, e))?;

        if let Some(counters) = self.monitor.counters(pane_id) {
            counters.record_write(data.len());
        }
        trace!("写入面板 {} 成功: {} 字节", pane_id, data.len());
        Ok(())
    }

    #[instrument(skip(self), fields(pane_id = %pane_id, rows = size.rows, cols = size.cols))]
    pub fn resize_pane(&self, pane_id: PaneId, size: PtySize) -> MuxResult<()> {
        size.validate()?;
        let pane = self.get_pane(pane_id)?;
        pane.resize(size)
            .map_err(|e| MuxError::from_pane(pane_id, e))?;

        self.notifier
            .publish(MuxNotification::PaneResized { pane_id, size });
        Ok(())
    }

    /// 关闭面板：终止子进程并移除
    ///
    /// 已经移除的面板再次关闭返回 `Ok`；从未分配过的ID返回 `PaneNotFound`
    #[instrument(skip(self), fields(pane_id = %pane_id))]
    pub fn close_pane(&self, pane_id: PaneId) -> MuxResult<()> {
        match self.get_pane(pane_id) {
            Ok(pane) => {
                pane.close();
                self.remove_pane(pane_id);
                Ok(())
            }
            Err(_) if self.was_issued(pane_id) => {
                trace!("面板 {} 已移除，忽略关闭请求", pane_id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// 移除面板，返回本次调用是否真正移除了它
    #[instrument(skip(self), fields(pane_id = %pane_id))]
    pub fn remove_pane(&self, pane_id: PaneId) -> bool {
        let Some(entry) = self.panes.write().remove(&pane_id) else {
            trace!("面板 {} 不在注册表中", pane_id);
            return false;
        };

        entry.pane.close();

        entry
            .worker
            .join_timeout(self.config.io.worker_join_timeout());

        self.monitor.unregister(pane_id);
        self.notifier
            .publish(MuxNotification::PaneRemoved { pane_id });

        debug!(
            "移除面板成功: pane_id={}, remaining_panes={}",
            pane_id,
            self.pane_count()
        );
        true
    }

    // === 事件订阅 ===

    pub fn subscribe(&self) -> EventStream {
        self.notifier.subscribe()
    }

    pub fn unsubscribe(&self, subscriber_id: SubscriberId) -> bool {
        self.notifier.unsubscribe(subscriber_id)
    }

    /// 发布任意通知给所有订阅者
    pub fn notify(&self, notification: MuxNotification) {
        self.notifier.publish(notification);
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    // === Shell Integration 写回 ===

    pub fn update_pane_title(&self, pane_id: PaneId, title: &str) -> MuxResult<()> {
        let pane = self.get_pane(pane_id)?;
        if pane.set_title(title) {
            self.notifier.publish(MuxNotification::PaneTitleChanged {
                pane_id,
                title: title.to_string(),
            });
        }
        Ok(())
    }

    pub fn update_pane_cwd(&self, pane_id: PaneId, cwd: &str) -> MuxResult<()> {
        let pane = self.get_pane(pane_id)?;
        if pane.set_cwd(cwd) {
            self.notifier.publish(MuxNotification::PaneCwdChanged {
                pane_id,
                cwd: cwd.to_string(),
            });
        }
        Ok(())
    }

    pub fn update_pane_command(&self, pane_id: PaneId, command: Option<String>) -> MuxResult<()> {
        let pane = self.get_pane(pane_id)?;
        pane.set_current_command(command);
        Ok(())
    }

    pub fn get_pane_cwd(&self, pane_id: PaneId) -> Option<String> {
        self.get_pane(pane_id)
            .ok()
            .and_then(|pane| pane.shell_state().current_working_directory)
    }

    pub fn get_pane_title(&self, pane_id: PaneId) -> Option<String> {
        self.get_pane(pane_id)
            .ok()
            .and_then(|pane| pane.shell_state().window_title)
    }

    // === 诊断 ===

    pub fn get_status(&self) -> TerminalMuxStatus {
        let (pane_count, live_pane_count) = {
            let panes = self.panes.read();
            let live = panes
                .values()
                .filter(|entry| entry.pane.status().is_live())
                .count();
            (panes.len(), live)
        };

        TerminalMuxStatus {
            pane_count,
            live_pane_count,
            subscriber_count: self.notifier.subscriber_count(),
            next_pane_id: self.next_pane_id.load(Ordering::Relaxed),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// 收集性能指标并检查警告阈值
    pub fn performance_snapshot(&self) -> PerformanceMetrics {
        let metrics = self.monitor.snapshot();
        self.monitor
            .check_performance_warnings(&metrics, self.config.limits.warn_pane_count);
        metrics
    }

    pub fn performance_monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    // === 生命周期管理 ===

    /// 关闭所有面板并停止后台线程，重复调用无副作用
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let pane_ids = self.list_panes();
        info!("关闭 TerminalMux，剩余 {} 个面板", pane_ids.len());

        // 先全部终止，再逐个回收，避免串行等待
        for pane_id in &pane_ids {
            if let Ok(pane) = self.get_pane(*pane_id) {
                pane.close();
            }
        }
        for pane_id in pane_ids {
            self.remove_pane(pane_id);
        }

        self.stop_exit_reaper();
        self.notifier.clear();
        debug!("TerminalMux 关闭完成");
    }

    fn stop_exit_reaper(&self) {
        let Some(reaper) = self.reaper.lock().take() else {
            return;
        };

        self.notifier.unsubscribe(reaper.stream_id);

        // 最后一个引用可能在回收线程里释放
        if reaper.handle.thread().id() == thread::current().id() {
            return;
        }
        join_thread_timeout(reaper.handle, self.config.io.worker_join_timeout());
    }
}

fn run_exit_reaper(mux: Weak<TerminalMux>, stream: EventStream) {
    loop {
        match stream.recv_timeout(Duration::from_millis(100)) {
            Ok(MuxNotification::PaneExited { pane_id, exit_code }) => {
                let Some(mux) = mux.upgrade() else {
                    break;
                };
                debug!("面板 {} 已退出 (exit_code={:?})，自动移除", pane_id, exit_code);
                mux.remove_pane(pane_id);
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                if mux.strong_count() == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("退出回收线程结束");
}

impl Default for TerminalMux {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TerminalMux {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TerminalMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalMux")
            .field("pane_count", &self.pane_count())
            .field("next_pane_id", &self.next_pane_id.load(Ordering::Relaxed))
            .field("subscriber_count", &self.notifier.subscriber_count())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
