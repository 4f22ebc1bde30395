//! 面板 I/O 处理
//!
//! 每个面板一个专用读线程：阻塞读取 PTY 输出并原样发布，读到 EOF 后回收子进程并发布退出事件

use bytes::Bytes;
use std::io::{self, Read};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::mux::{
    config::IoConfig, EventNotifier, MuxError, MuxNotification, MuxResult, Pane, PaneCounters,
    PaneId, PerformanceMonitor,
};

/// 面板读线程的句柄
#[derive(Debug)]
pub struct IoWorker {
    pane_id: PaneId,
    handle: JoinHandle<()>,
}

impl IoWorker {
    pub fn pane_id(&self) -> PaneId {
        self.pane_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 在超时时间内等待线程结束；超时则放弃等待，线程自行结束
    pub fn join_timeout(self, timeout: Duration) -> bool {
        join_thread_timeout(self.handle, timeout)
    }
}

/// 轮询 `is_finished` 等待线程结束，超时后分离线程
pub(crate) fn join_thread_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("线程 {} 未在 {:?} 内结束，放弃等待", name, timeout);
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }

    if handle.join().is_err() {
        warn!("线程 {} 发生 panic", name);
    }
    true
}

pub struct IoHandler {
    notifier: EventNotifier,
    monitor: Arc<PerformanceMonitor>,
    config: IoConfig,
}

impl IoHandler {
    pub fn new(notifier: EventNotifier, monitor: Arc<PerformanceMonitor>, config: IoConfig) -> Self {
        Self {
            notifier,
            monitor,
            config,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.config.read_buffer_size
    }

    /// 为面板启动读线程
    pub fn spawn_io_thread(&self, pane: Arc<dyn Pane>) -> MuxResult<IoWorker> {
        let pane_id = pane.pane_id();
        let reader = pane
            .reader()
            .map_err(|err| MuxError::from_pane(pane_id, err))?;

        let worker = ReaderLoop {
            pane_id,
            pane: Arc::downgrade(&pane),
            reader,
            notifier: self.notifier.clone(),
            counters: self.monitor.register(pane_id),
            buffer_size: self.config.read_buffer_size.max(1),
            exit_wait_timeout: Duration::from_millis(self.config.exit_wait_timeout_ms),
        };

        let handle = thread::Builder::new()
            .name(format!("pane-io-{pane_id}"))
            .spawn(move || worker.run())
            .map_err(|e| MuxError::Io {
                pane_id,
                reason: format!("failed to spawn I/O thread: {e}"),
            })?;

        debug!("面板 {} 的 I/O 线程已启动", pane_id);
        Ok(IoWorker { pane_id, handle })
    }
}

impl std::fmt::Debug for IoHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandler")
            .field("buffer_size", &self.config.read_buffer_size)
            .finish()
    }
}

struct ReaderLoop {
    pane_id: PaneId,
    pane: Weak<dyn Pane>,
    reader: Box<dyn Read + Send>,
    notifier: EventNotifier,
    counters: Arc<PaneCounters>,
    buffer_size: usize,
    exit_wait_timeout: Duration,
}

impl ReaderLoop {
    fn run(mut self) {
        let pane_id = self.pane_id;
        if let Some(pane) = self.pane.upgrade() {
            pane.mark_running();
        }

        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            match self.reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("面板 {} 读到 EOF", pane_id);
                    break;
                }
                Ok(len) => {
                    self.counters.record_read(len);
                    trace!("面板 {} 读取 {} 字节", pane_id, len);
                    self.notifier.publish(MuxNotification::PaneOutput {
                        pane_id,
                        data: Bytes::copy_from_slice(&buffer[..len]),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(err) => {
                    // 子进程退出后 Linux 上 master 读端返回 EIO
                    debug!("面板 {} 读线程结束: {}", pane_id, err);
                    break;
                }
            }
        }

        let exit_code = match self.pane.upgrade() {
            Some(pane) => {
                pane.mark_exiting();
                pane.reap(self.exit_wait_timeout)
            }
            None => None,
        };

        debug!("面板 {} 进程退出，退出码: {:?}", pane_id, exit_code);
        self.notifier
            .publish(MuxNotification::PaneExited { pane_id, exit_code });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{PaneResult, PaneState, PaneStatus, PtySize};
    use std::io::Cursor;

    struct CursorPane {
        pane_id: PaneId,
        state: PaneState,
        output: Vec<u8>,
    }

    impl Pane for CursorPane {
        fn pane_id(&self) -> PaneId {
            self.pane_id
        }

        fn program(&self) -> &str {
            "cursor"
        }

        fn state(&self) -> &PaneState {
            &self.state
        }

        fn write(&self, _data: &[u8]) -> PaneResult<()> {
            Ok(())
        }

        fn resize(&self, size: PtySize) -> PaneResult<()> {
            self.state.set_size(size);
            Ok(())
        }

        fn reader(&self) -> PaneResult<Box<dyn Read + Send>> {
            Ok(Box::new(Cursor::new(self.output.clone())))
        }

        fn close(&self) {
            self.state.mark_closed();
        }

        fn reap(&self, _timeout: Duration) -> Option<i32> {
            self.state.set_exit_code(Some(7));
            Some(7)
        }
    }

    fn handler(buffer_size: usize) -> (IoHandler, EventNotifier, Arc<PerformanceMonitor>) {
        let notifier = EventNotifier::new(1024);
        let monitor = Arc::new(PerformanceMonitor::new());
        let config = IoConfig {
            read_buffer_size: buffer_size,
            ..IoConfig::default()
        };
        (
            IoHandler::new(notifier.clone(), Arc::clone(&monitor), config),
            notifier,
            monitor,
        )
    }

    #[test]
    fn test_output_then_exit() {
        let (handler, notifier, monitor) = handler(4);
        let stream = notifier.subscribe();
        let pane: Arc<dyn Pane> = Arc::new(CursorPane {
            pane_id: PaneId::new(1),
            state: PaneState::new(PtySize::default()),
            output: b"hello world".to_vec(),
        });

        let worker = handler.spawn_io_thread(Arc::clone(&pane)).unwrap();
        assert_eq!(worker.pane_id(), PaneId::new(1));
        assert!(worker.join_timeout(Duration::from_secs(5)));

        let events = stream.drain();
        let (last, outputs) = events.split_last().unwrap();
        assert_eq!(
            *last,
            MuxNotification::PaneExited {
                pane_id: PaneId::new(1),
                exit_code: Some(7),
            }
        );

        // 读缓冲为 4 字节，输出按读取边界原样切分
        let chunks: Vec<&[u8]> = outputs
            .iter()
            .map(|event| match event {
                MuxNotification::PaneOutput { data, .. } => data.as_ref(),
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(chunks, vec![&b"hell"[..], &b"o wo"[..], &b"rld"[..]]);

        assert_eq!(pane.status(), PaneStatus::Exiting);
        assert_eq!(pane.exit_code(), Some(7));

        let metrics = monitor.pane_metrics(PaneId::new(1)).unwrap();
        assert_eq!(metrics.bytes_read, 11);
        assert_eq!(metrics.read_events, 3);
    }

    #[test]
    fn test_dropped_pane_still_reports_exit() {
        let (handler, notifier, _monitor) = handler(64);
        let stream = notifier.subscribe();
        let pane: Arc<dyn Pane> = Arc::new(CursorPane {
            pane_id: PaneId::new(2),
            state: PaneState::new(PtySize::default()),
            output: Vec::new(),
        });

        let worker = handler.spawn_io_thread(pane).unwrap();
        assert!(worker.join_timeout(Duration::from_secs(5)));

        let events = stream.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            MuxNotification::PaneExited { pane_id, .. } if pane_id == PaneId::new(2)
        ));
    }
}
