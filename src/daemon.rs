use std::fs;

use anyhow::{Result, bail};

use crate::config;
use crate::state;

/// Write PID file for the current process.
pub fn write_pid_file() -> Result<()> {
    let pid = std::process::id();
    let path = config::pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, pid.to_string())?;
    Ok(())
}

/// Remove PID file.
pub fn remove_pid_file() {
    let _ = fs::remove_file(config::pid_file_path());
}

fn read_pid() -> Result<u32> {
    let path = config::pid_file_path();
    let content = fs::read_to_string(&path).map_err(|_| {
        anyhow::anyhow!("No PID file found at {}. Is market-connect running?", path.display())
    })?;
    content
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid PID file"))
}

fn is_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Ask the running connector to shut down gracefully.
pub fn stop_daemon() -> Result<()> {
    let pid = read_pid()?;
    if !is_running(pid) {
        remove_pid_file();
        bail!("Process {pid} is not running (stale PID file removed)");
    }
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    println!("Sent SIGTERM to market-connect (PID {pid})");
    Ok(())
}

/// Process liveness plus the last recorded connection state.
pub fn show_status() -> Result<()> {
    match read_pid() {
        Ok(pid) if is_running(pid) => println!("market-connect is running (PID {pid})"),
        Ok(_) => {
            remove_pid_file();
            println!("market-connect is not running (stale PID file removed)");
        }
        Err(_) => println!("market-connect is not running"),
    }
    state::print_status(&config::state_file_path());
    Ok(())
}

/// Re-launch self in the background as `serve`, stdio redirected to the log file.
pub fn daemonize() -> Result<()> {
    let exe = std::env::current_exe()?;
    let args = serve_args(std::env::args().skip(1));

    let log_dir = config::log_dir();
    fs::create_dir_all(&log_dir)?;
    let log_file = log_dir.join("connect.log");

    let log_out = fs::File::create(&log_file)?;
    let log_err = log_out.try_clone()?;

    let child = std::process::Command::new(exe)
        .args(&args)
        .arg("serve")
        .stdout(log_out)
        .stderr(log_err)
        .stdin(std::process::Stdio::null())
        .spawn()?;

    println!("market-connect started in background (PID {})", child.id());
    println!("Log: {}", log_file.display());
    Ok(())
}

/// Global options that consume the following argument as their value.
const VALUE_FLAGS: &[&str] = &["-c", "--config", "--agent-id", "--max-concurrent"];

/// Command line for the background child: the caller's arguments with the
/// `start` subcommand removed. Option values are kept even when they read "start".
fn serve_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out = Vec::new();
    let mut removed = false;
    let mut value_next = false;
    for arg in args {
        if value_next {
            value_next = false;
        } else if VALUE_FLAGS.contains(&arg.as_str()) {
            value_next = true;
        } else if !removed && arg == "start" {
            removed = true;
            continue;
        }
        out.push(arg);
    }
    out
}
