// 命令行演示：在一个面板中运行命令，转发 stdin，打印输出

use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::thread;
use tracing::{debug, info, warn};

use orbitx_mux::mux::{
    get_mux, init_mux_with_config, performance_monitor::utils::format_bytes, shutdown_mux,
    MuxConfig, MuxNotification, PaneId, PaneSpec,
};
use orbitx_mux::utils::init_logging;

fn main() {
    if let Err(e) = init_logging() {
        eprintln!("{}", e);
    }

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("orbitx-mux: {:#}", e);
            1
        }
    };

    shutdown_mux();
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let config = MuxConfig::load().context("failed to load mux config")?;
    let spec = spec_from_args(std::env::args().skip(1).collect(), &config)?;

    init_mux_with_config(config).context("failed to initialize mux")?;
    let mux = get_mux();

    // 先订阅，避免错过子进程最早的输出
    let events = mux.subscribe();
    let pane_id = mux
        .create_pane(&spec)
        .with_context(|| format!("failed to start '{}'", spec.program))?;
    info!("面板 {} 已启动: {}", pane_id, spec.program);

    if let Ok(pane_info) = mux.pane_info(pane_id) {
        match serde_json::to_string(&pane_info) {
            Ok(json) => debug!("面板信息: {}", json),
            Err(e) => warn!("序列化面板信息失败: {}", e),
        }
    }

    spawn_stdin_forwarder(pane_id)?;

    let mut stdout = std::io::stdout().lock();
    let mut exit_code = None;
    for event in events.iter() {
        match event {
            MuxNotification::PaneOutput { pane_id: id, data } if id == pane_id => {
                stdout.write_all(&data).context("failed to write to stdout")?;
                stdout.flush().context("failed to flush stdout")?;
            }
            MuxNotification::PaneExited {
                pane_id: id,
                exit_code: code,
            } if id == pane_id => {
                exit_code = code;
                break;
            }
            _ => {}
        }
    }

    if events.dropped() > 0 {
        warn!("丢弃了 {} 个输出事件", events.dropped());
    }

    let metrics = mux.performance_snapshot();
    debug!("{}", mux.performance_monitor().generate_report(&metrics));
    info!(
        "面板 {} 退出，退出码 {:?}，共读取 {}",
        pane_id,
        exit_code,
        format_bytes(metrics.total_bytes_read)
    );

    Ok(exit_code.unwrap_or(1))
}

fn spec_from_args(args: Vec<String>, config: &MuxConfig) -> Result<PaneSpec> {
    let size = config.shell.default_size();
    let spec = match args.as_slice() {
        [] => config.shell.default_spec(size),
        [line] => PaneSpec::from_command_line(line)?.size(size),
        [program, rest @ ..] => PaneSpec::new(program.clone())
            .args(rest.iter().cloned())
            .size(size),
    };
    Ok(spec)
}

/// 把 stdin 的每一行写入面板；stdin 结束时发送 Ctrl+D
fn spawn_stdin_forwarder(pane_id: PaneId) -> Result<()> {
    thread::Builder::new()
        .name("stdin-forwarder".to_string())
        .spawn(move || {
            let mux = get_mux();
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(mut line) = line else {
                    break;
                };
                line.push('\n');
                if let Err(e) = mux.write_to_pane(pane_id, line.as_bytes()) {
                    debug!("停止转发 stdin: {}", e);
                    return;
                }
            }
            let _ = mux.write_to_pane(pane_id, &[0x04]);
        })
        .context("failed to spawn stdin forwarder")?;
    Ok(())
}
