//! Agent process control: detach, foreground run, stop, status and help
use anyhow::{Context, Result};
use classguard_core::{
    config::CoreConfig,
    daemon_control::DaemonControl,
    ipc::{self, IpcClient, IpcRequest, IpcResponse},
    AppContext, Daemon,
};
use std::{env, fs, path::Path, process::Command, time::Duration};
use sysinfo::{Pid, System};
use tokio::sync::mpsc;

use super::status::print_status;

const STOP_WAIT: Duration = Duration::from_secs(2);

fn is_alive(pid: u32) -> bool {
    System::new().refresh_process(Pid::from_u32(pid))
}

fn clear_socket(sock_path: &Path) -> Result<()> {
    if sock_path.exists() {
        fs::remove_file(sock_path)
            .with_context(|| format!("Failed to remove {}", sock_path.display()))?;
    }
    Ok(())
}

pub fn start_daemon(data_dir: &Path) -> Result<()> {
    let control = DaemonControl::new(data_dir);

    match control.get_pid() {
        Ok(Some(pid)) if is_alive(pid) => {
            println!("classguard agent already running (pid {pid})");
            return Ok(());
        }
        Ok(None) => {}
        Ok(Some(pid)) => {
            log::warn!("pid {pid} from the pid file is gone, cleaning up");
            control.remove_pid()?;
        }
        Err(e) => {
            log::warn!("Unreadable pid file ({e:#}), cleaning up");
            control.remove_pid()?;
        }
    }
    clear_socket(&ipc::socket_path(data_dir))?;

    let child = Command::new(env::current_exe()?)
        .arg("daemon-internal-start")
        .current_dir(env::current_dir()?)
        .spawn()
        .context("Failed to spawn the agent process")?;

    control.write_pid(child.id())?;
    println!("classguard agent started (pid {})", child.id());
    Ok(())
}

/// Entry point of the detached process; logs go to a file
pub async fn run_daemon_process(data_dir: &Path) -> Result<()> {
    setup_daemon_logging(data_dir)?;
    log::info!("Agent process {} starting", std::process::id());

    let result = run_foreground(data_dir).await;
    if let Err(e) = &result {
        log::error!("Agent stopped on a fatal error: {e:#}");
    }
    result
}

/// Build the context and serve until shutdown
pub async fn run_foreground(data_dir: &Path) -> Result<()> {
    let config = CoreConfig::load(&CoreConfig::default_path(data_dir))?;
    if config.device.device_id.is_empty() {
        anyhow::bail!("This device has no id yet. Run 'classguard init' first.");
    }

    let ctx = AppContext::init(config, data_dir)?;
    let daemon = Daemon::start(ctx).await?;

    let sock_path = ipc::socket_path(data_dir);
    let listener = ipc::bind(&sock_path).context("Failed to bind the IPC socket")?;
    let (calls, requests) = mpsc::channel(16);
    let server = tokio::spawn(ipc::listen(listener, calls));

    daemon.run(requests).await;
    server.abort();
    clear_socket(&sock_path)
}

pub async fn stop_daemon(data_dir: &Path) -> Result<()> {
    let control = DaemonControl::new(data_dir);
    let sock_path = ipc::socket_path(data_dir);

    let Some(pid) = control.get_pid()? else {
        println!("classguard agent is not running");
        return clear_socket(&sock_path);
    };

    match IpcClient::new(&sock_path)
        .send_command(IpcRequest::Shutdown)
        .await
    {
        Ok(IpcResponse::Shutdown) => {
            tokio::time::sleep(STOP_WAIT).await;
            if is_alive(pid) {
                log::warn!("Agent {pid} still alive after shutdown request, killing it");
                kill(pid);
            }
        }
        Ok(other) => log::error!("Agent answered shutdown with {other:?}"),
        Err(e) => {
            log::error!("Agent unreachable ({e:#}), killing pid {pid}");
            kill(pid);
        }
    }

    control.remove_pid()?;
    clear_socket(&sock_path)?;
    println!("classguard agent stopped");
    Ok(())
}

fn kill(pid: u32) {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if sys.refresh_process(pid) {
        if let Some(process) = sys.process(pid) {
            process.kill();
        }
    }
}

pub async fn show_status(data_dir: &Path) -> Result<()> {
    let sock_path = ipc::socket_path(data_dir);
    if !sock_path.exists() {
        println!("Agent: not running");
        return Ok(());
    }

    match IpcClient::new(&sock_path)
        .send_command(IpcRequest::Status)
        .await
    {
        Ok(IpcResponse::Status(status)) => print_status(&status),
        Ok(IpcResponse::Error(e)) => anyhow::bail!("Agent reported an error: {e}"),
        Ok(other) => anyhow::bail!("Agent answered status with {other:?}"),
        Err(e) => {
            log::debug!("Status request failed: {e:#}");
            println!("Agent: not responding");
        }
    }
    Ok(())
}

pub async fn raise_help(data_dir: &Path, reason: &str) -> Result<()> {
    let client = IpcClient::new(&ipc::socket_path(data_dir));
    let response = client
        .send_command(IpcRequest::RaiseHelp {
            reason: reason.to_string(),
        })
        .await
        .context("Agent not reachable; start it with 'classguard start'")?;

    match response {
        IpcResponse::HelpRaised { request_id } => {
            println!("Help request sent ({request_id}).");
        }
        IpcResponse::HelpDenied {
            request_id,
            retry_after_secs,
        } => {
            println!("Help already requested ({request_id}). Try again in {retry_after_secs}s.");
        }
        IpcResponse::Error(e) => anyhow::bail!("Help request failed: {e}"),
        other => anyhow::bail!("Agent answered help with {other:?}"),
    }
    Ok(())
}

fn setup_daemon_logging(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)?;
    let log_path = data_dir.join("classguard.log");
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();
    Ok(())
}
