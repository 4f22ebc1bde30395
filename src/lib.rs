//! OrbitX Mux
//!
//! 伪终端会话注册表：为每个子进程分配一个 PTY，后台线程读取输出并以事件形式分发给订阅者

pub mod mux;
pub mod utils;

pub use mux::{
    get_mux, init_mux, init_mux_with_config, shutdown_mux, EventStream, MuxConfig, MuxError,
    MuxNotification, MuxResult, PaneId, PaneSpec, PtySize, TerminalMux,
};
