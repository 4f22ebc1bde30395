//! PTY I/O 测试
//!
//! 使用模拟面板测试读线程、事件分发和注册表的交互

#[cfg(test)]
mod pty_io_tests {
    use bytes::Bytes;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use parking_lot::Mutex;
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use orbitx_mux::mux::{
        EventStream, MuxConfig, MuxError, MuxNotification, Pane, PaneError, PaneId, PaneResult,
        PaneState, PaneStatus, PtySize, TerminalMux,
    };

    /// 由通道驱动的读端，发送端全部释放后返回 EOF
    struct ChannelReader {
        receiver: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.receiver.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let len = buf.len().min(self.pending.len());
            buf[..len].copy_from_slice(&self.pending[..len]);
            self.pending.drain(..len);
            Ok(len)
        }
    }

    /// 模拟面板用于测试
    struct MockPane {
        pane_id: PaneId,
        state: PaneState,
        output_tx: Mutex<Option<Sender<Vec<u8>>>>,
        output_rx: Receiver<Vec<u8>>,
        written_data: Mutex<Vec<u8>>,
        should_fail_reader: AtomicBool,
        exit_code: Option<i32>,
    }

    impl MockPane {
        fn new(pane_id: PaneId, size: PtySize) -> Self {
            let (output_tx, output_rx) = unbounded();
            Self {
                pane_id,
                state: PaneState::new(size),
                output_tx: Mutex::new(Some(output_tx)),
                output_rx,
                written_data: Mutex::new(Vec::new()),
                should_fail_reader: AtomicBool::new(false),
                exit_code: Some(0),
            }
        }

        fn failing_reader(pane_id: PaneId) -> Self {
            let pane = Self::new(pane_id, PtySize::default());
            pane.should_fail_reader.store(true, Ordering::Relaxed);
            pane
        }

        /// 模拟子进程输出
        fn emit(&self, data: &[u8]) {
            if let Some(tx) = self.output_tx.lock().as_ref() {
                let _ = tx.send(data.to_vec());
            }
        }

        /// 模拟子进程自行退出
        fn finish(&self) {
            self.output_tx.lock().take();
        }

        fn get_written_data(&self) -> Vec<u8> {
            self.written_data.lock().clone()
        }
    }

    impl Pane for MockPane {
        fn pane_id(&self) -> PaneId {
            self.pane_id
        }

        fn program(&self) -> &str {
            "mock"
        }

        fn state(&self) -> &PaneState {
            &self.state
        }

        fn write(&self, data: &[u8]) -> PaneResult<()> {
            if self.is_dead() {
                return Err(PaneError::Closed);
            }
            self.written_data.lock().extend_from_slice(data);
            self.state.touch();
            Ok(())
        }

        fn resize(&self, size: PtySize) -> PaneResult<()> {
            if self.is_dead() {
                return Err(PaneError::Closed);
            }
            self.state.set_size(size);
            Ok(())
        }

        fn reader(&self) -> PaneResult<Box<dyn Read + Send>> {
            if self.should_fail_reader.load(Ordering::Relaxed) {
                return Err(PaneError::Reader("模拟读取失败".to_string()));
            }
            Ok(Box::new(ChannelReader {
                receiver: self.output_rx.clone(),
                pending: Vec::new(),
            }))
        }

        fn close(&self) {
            self.state.mark_closed();
            self.finish();
        }

        fn reap(&self, _timeout: Duration) -> Option<i32> {
            self.state.set_exit_code(self.exit_code);
            self.exit_code
        }
    }

    fn add_mock(mux: &TerminalMux) -> (PaneId, Arc<MockPane>) {
        let mut created = None;
        let pane_id = mux
            .create_pane_with(|pane_id| {
                let pane = Arc::new(MockPane::new(pane_id, PtySize::default()));
                created = Some(Arc::clone(&pane));
                Ok(pane as Arc<dyn Pane>)
            })
            .unwrap();
        (pane_id, created.unwrap())
    }

    /// 收集事件直到谓词满足或超时
    fn collect_until<F>(stream: &EventStream, timeout: Duration, mut done: F) -> Vec<MuxNotification>
    where
        F: FnMut(&MuxNotification) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        while Instant::now() < deadline {
            if let Ok(event) = stream.recv_timeout(Duration::from_millis(20)) {
                let finished = done(&event);
                events.push(event);
                if finished {
                    break;
                }
            }
        }
        events
    }

    fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_mock_pane_basic_operations() {
        let pane = MockPane::new(PaneId::new(1), PtySize::new(24, 80));

        assert_eq!(pane.pane_id(), PaneId::new(1));
        assert_eq!(pane.get_size().rows, 24);
        assert_eq!(pane.status(), PaneStatus::Starting);

        assert!(pane.write(b"hello").is_ok());
        assert!(pane.write(b" world").is_ok());
        assert_eq!(pane.get_written_data(), b"hello world");

        assert!(pane.resize(PtySize::new(30, 100)).is_ok());
        assert_eq!(pane.get_size(), PtySize::new(30, 100));

        pane.close();
        assert!(pane.is_dead());
        assert!(matches!(pane.write(b"test"), Err(PaneError::Closed)));
        assert!(pane.resize(PtySize::default()).is_err());
    }

    #[test]
    fn test_output_is_delivered_verbatim_and_in_order() {
        let mux = TerminalMux::new_shared().unwrap();
        let stream = mux.subscribe();
        let (pane_id, pane) = add_mock(&mux);

        assert_eq!(
            stream.recv_timeout(Duration::from_secs(1)).unwrap(),
            MuxNotification::PaneAdded { pane_id }
        );

        pane.emit(b"first\n");
        pane.emit(b"\x1b[31mred\x1b[0m");
        pane.emit(&[0xff, 0x00, 0xfe]);
        pane.finish();

        let events = collect_until(&stream, Duration::from_secs(5), |event| {
            matches!(event, MuxNotification::PaneRemoved { .. })
        });

        let outputs: Vec<Bytes> = events
            .iter()
            .filter_map(|event| match event {
                MuxNotification::PaneOutput { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            outputs,
            vec![
                Bytes::from_static(b"first\n"),
                Bytes::from_static(b"\x1b[31mred\x1b[0m"),
                Bytes::from_static(&[0xff, 0x00, 0xfe]),
            ],
            "输出必须逐字节原样转发"
        );

        let tail: Vec<&MuxNotification> = events
            .iter()
            .filter(|event| !matches!(event, MuxNotification::PaneOutput { .. }))
            .collect();
        assert_eq!(
            tail,
            vec![
                &MuxNotification::PaneExited {
                    pane_id,
                    exit_code: Some(0)
                },
                &MuxNotification::PaneRemoved { pane_id },
            ]
        );

        // 退出的面板被自动回收
        assert!(wait_for(Duration::from_secs(2), || !mux.pane_exists(pane_id)));
        assert!(matches!(
            mux.get_pane(pane_id),
            Err(MuxError::PaneNotFound(id)) if id == pane_id
        ));
    }

    #[test]
    fn test_no_output_after_exit() {
        let mux = TerminalMux::new_shared().unwrap();
        let stream = mux.subscribe();
        let (pane_id, pane) = add_mock(&mux);

        for i in 0..200 {
            pane.emit(format!("line {i}\n").as_bytes());
        }
        mux.close_pane(pane_id).unwrap();

        let events = collect_until(&stream, Duration::from_secs(5), |event| {
            matches!(event, MuxNotification::PaneRemoved { .. })
        });

        let exit_index = events
            .iter()
            .position(|event| matches!(event, MuxNotification::PaneExited { .. }))
            .expect("应该收到退出事件");
        assert!(
            events[exit_index..]
                .iter()
                .all(|event| !matches!(event, MuxNotification::PaneOutput { .. })),
            "退出事件之后不应再有输出"
        );
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, MuxNotification::PaneExited { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_reader_failure_rolls_back_registration() {
        let mux = TerminalMux::new_shared().unwrap();
        let stream = mux.subscribe();

        let result = mux.create_pane_with(|pane_id| {
            Ok(Arc::new(MockPane::failing_reader(pane_id)) as Arc<dyn Pane>)
        });

        let err = result.unwrap_err();
        assert!(matches!(err, MuxError::Io { .. }), "unexpected error: {err}");
        assert_eq!(mux.pane_count(), 0);

        let events = stream.drain();
        assert_eq!(
            events,
            vec![
                MuxNotification::PaneAdded {
                    pane_id: PaneId::new(1)
                },
                MuxNotification::PaneRemoved {
                    pane_id: PaneId::new(1)
                },
            ]
        );
    }

    #[test]
    fn test_builder_error_consumes_id() {
        let mux = TerminalMux::new();
        let err = mux
            .create_pane_with(|_| {
                Err(PaneError::Spawn {
                    program: "nope".to_string(),
                    reason: "not found".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, MuxError::Spawn { pane_id, .. } if pane_id == PaneId::new(1)));

        let (pane_id, _pane) = add_mock(&mux);
        assert_eq!(pane_id, PaneId::new(2));

        // 失败的ID视为已退役
        assert!(mux.close_pane(PaneId::new(1)).is_ok());
        assert!(matches!(
            mux.close_pane(PaneId::new(99)),
            Err(MuxError::PaneNotFound(_))
        ));
    }

    #[test]
    fn test_write_and_resize_through_mux() {
        let mux = TerminalMux::new();
        let stream = mux.subscribe();
        let (pane_id, pane) = add_mock(&mux);

        mux.write_to_pane(pane_id, b"ls\n").unwrap();
        mux.write_to_pane(pane_id, b"pwd\n").unwrap();
        assert_eq!(pane.get_written_data(), b"ls\npwd\n");

        mux.resize_pane(pane_id, PtySize::new(40, 120)).unwrap();
        assert_eq!(pane.get_size(), PtySize::new(40, 120));
        assert!(matches!(
            mux.resize_pane(pane_id, PtySize::new(0, 120)),
            Err(MuxError::InvalidSize { rows: 0, cols: 120 })
        ));

        let events = collect_until(&stream, Duration::from_secs(1), |event| {
            matches!(event, MuxNotification::PaneResized { .. })
        });
        assert!(events.contains(&MuxNotification::PaneResized {
            pane_id,
            size: PtySize::new(40, 120)
        }));

        let metrics = mux.performance_monitor().pane_metrics(pane_id).unwrap();
        assert_eq!(metrics.bytes_written, 7);
        assert_eq!(metrics.write_events, 2);

        mux.close_pane(pane_id).unwrap();
        assert!(matches!(
            mux.write_to_pane(pane_id, b"late"),
            Err(MuxError::PaneNotFound(_))
        ));
    }

    #[test]
    fn test_slow_subscriber_keeps_lifecycle_events() {
        let mut config = MuxConfig::default();
        config.events.subscriber_queue_capacity = 4;
        let mux = TerminalMux::shared_with_config(config).unwrap();
        let slow = mux.subscribe();
        let (pane_id, pane) = add_mock(&mux);

        for _ in 0..100 {
            pane.emit(b"spam");
        }
        pane.finish();

        // 条目移除时读线程已经发布完所有输出
        assert!(wait_for(Duration::from_secs(5), || !mux.pane_exists(pane_id)));
        assert!(slow.dropped() > 0, "慢订阅者应该丢弃部分输出");

        let events = collect_until(&slow, Duration::from_secs(5), |event| {
            matches!(event, MuxNotification::PaneRemoved { .. })
        });
        assert!(events.contains(&MuxNotification::PaneAdded { pane_id }));
        assert!(events.contains(&MuxNotification::PaneExited {
            pane_id,
            exit_code: Some(0)
        }));
        assert_eq!(
            events.last(),
            Some(&MuxNotification::PaneRemoved { pane_id })
        );
    }

    #[test]
    fn test_concurrent_creates_have_no_cross_talk() {
        let mux = TerminalMux::new_shared().unwrap();
        let stream = mux.subscribe();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let mux = Arc::clone(&mux);
                thread::spawn(move || {
                    let (pane_id, pane) = add_mock(&mux);
                    pane.emit(format!("pane-{pane_id}").as_bytes());
                    pane.finish();
                    pane_id
                })
            })
            .collect();

        let mut ids: Vec<PaneId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 100, "面板ID必须唯一");

        let mut exited = 0;
        let events = collect_until(&stream, Duration::from_secs(10), |event| {
            if matches!(event, MuxNotification::PaneExited { .. }) {
                exited += 1;
            }
            exited == 100
        });
        assert_eq!(exited, 100);

        for event in &events {
            if let MuxNotification::PaneOutput { pane_id, data } = event {
                assert_eq!(data.as_ref(), format!("pane-{pane_id}").as_bytes());
            }
        }

        assert!(wait_for(Duration::from_secs(5), || mux.pane_count() == 0));
    }

    #[test]
    fn test_pane_limit() {
        let mut config = MuxConfig::default();
        config.limits.max_panes = 2;
        let mux = TerminalMux::with_config(config);

        let (first, _a) = add_mock(&mux);
        let (_second, _b) = add_mock(&mux);
        let err = mux
            .create_pane_with(|pane_id| {
                Ok(Arc::new(MockPane::new(pane_id, PtySize::default())) as Arc<dyn Pane>)
            })
            .unwrap_err();
        assert!(matches!(err, MuxError::ResourceExhausted(_)));

        mux.close_pane(first).unwrap();
        assert!(mux
            .create_pane_with(|pane_id| {
                Ok(Arc::new(MockPane::new(pane_id, PtySize::default())) as Arc<dyn Pane>)
            })
            .is_ok());
    }

    #[test]
    fn test_shell_integration_hooks() {
        let mux = TerminalMux::new();
        let stream = mux.subscribe();
        let (pane_id, _pane) = add_mock(&mux);
        stream.drain();

        mux.update_pane_title(pane_id, "vim").unwrap();
        mux.update_pane_title(pane_id, "vim").unwrap();
        mux.update_pane_cwd(pane_id, "/tmp").unwrap();
        mux.update_pane_command(pane_id, Some("make".to_string()))
            .unwrap();

        assert_eq!(mux.get_pane_title(pane_id).as_deref(), Some("vim"));
        assert_eq!(mux.get_pane_cwd(pane_id).as_deref(), Some("/tmp"));
        assert_eq!(
            mux.pane_info(pane_id).unwrap().current_command.as_deref(),
            Some("make")
        );

        let events: Vec<MuxNotification> = stream
            .drain()
            .into_iter()
            .filter(|event| !matches!(event, MuxNotification::PaneOutput { .. }))
            .collect();
        assert_eq!(
            events,
            vec![
                MuxNotification::PaneTitleChanged {
                    pane_id,
                    title: "vim".to_string()
                },
                MuxNotification::PaneCwdChanged {
                    pane_id,
                    cwd: "/tmp".to_string()
                },
            ],
            "标题未变化时不应重复通知"
        );

        assert!(mux.update_pane_title(PaneId::new(42), "x").is_err());
    }

    #[test]
    fn test_shutdown_rejects_new_panes() {
        let mux = TerminalMux::new_shared().unwrap();
        let (pane_id, pane) = add_mock(&mux);

        mux.shutdown();
        mux.shutdown();

        assert_eq!(mux.pane_count(), 0);
        assert_eq!(pane.status(), PaneStatus::Closed);
        assert!(mux.get_status().shutting_down);
        assert_eq!(mux.get_status().subscriber_count, 0);
        assert!(matches!(
            mux.create_pane_with(|id| Ok(Arc::new(MockPane::new(id, PtySize::default()))
                as Arc<dyn Pane>)),
            Err(MuxError::ShuttingDown)
        ));
        assert!(mux.close_pane(pane_id).is_ok());
    }
}
