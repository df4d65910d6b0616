//! Port probing, child-process spawning/termination, and resource sampling.
//!
//! Grounded on `examples/original_source/src/llm_proxifier/utils.py`
//! (`is_port_open`, `is_port_listening`, `wait_for_server`,
//! `format_llama_cpp_command`, `graceful_shutdown`,
//! `get_process_memory_usage`, `get_process_cpu_usage`), reworked in the
//! teacher's async/`tokio::process` idiom (`runtime/src/model_manager.rs`).

use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ModelConfig;

/// Attempt to bind `host:port`. Success means the port is free; the
/// listener is dropped immediately so nothing leaks.
pub fn port_bindable(host: &str, port: u16) -> bool {
    let addr = format!("{host}:{port}");
    match addr.parse::<SocketAddr>() {
        Ok(addr) => TcpListener::bind(addr).is_ok(),
        Err(_) => false,
    }
}

/// Attempt a TCP connect with a 1s timeout; success means something is
/// already listening on the port.
pub async fn port_listening(host: &str, port: u16) -> bool {
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => true,
        _ => false,
    }
}

/// Poll `GET {base_url}/health` once per second until it returns HTTP 200
/// or `timeout` elapses. Connection errors and timeouts are treated as
/// "not yet ready".
pub async fn wait_for_ready(client: &reqwest::Client, base_url: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let health_url = format!("{base_url}/health");

    while Instant::now() < deadline {
        match client.get(&health_url).send().await {
            Ok(resp) if resp.status().is_success() => return true,
            _ => {}
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    false
}

/// Build the llama-server argv for `config`, in the exact order the spec
/// requires: model path, port, ctx size, gpu layers, chat template, host,
/// then the configured additional args verbatim.
pub fn build_command(config: &ModelConfig) -> Vec<String> {
    let mut argv = vec![
        "llama-server".to_string(),
        "--model".to_string(),
        config.model_path.clone(),
        "--port".to_string(),
        config.port.to_string(),
        "--ctx-size".to_string(),
        config.context_length.to_string(),
        "--n-gpu-layers".to_string(),
        config.gpu_layers.to_string(),
        "--chat-template".to_string(),
        config.chat_format.clone(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
    ];
    argv.extend(config.additional_args.iter().cloned());
    argv
}

/// Spawn the llama-server child process for `config`, capturing stdout and
/// stderr so the parent doesn't inherit them.
pub fn spawn_model_process(config: &ModelConfig) -> std::io::Result<Child> {
    let argv = build_command(config);
    let (program, args) = argv.split_first().expect("argv always has llama-server");

    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
}

/// Send SIGTERM (or `Child::kill` on non-unix); if the process has not
/// exited within `timeout`, send SIGKILL. Returns `true` iff the graceful
/// phase sufficed.
pub async fn graceful_stop(child: &mut Child, timeout: Duration) -> bool {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            warn!("error waiting for child process: {e}");
            let _ = child.kill().await;
            false
        }
        Err(_) => {
            warn!("graceful stop timed out, sending SIGKILL");
            let _ = child.kill().await;
            false
        }
    }
}

/// Best-effort RSS sample in MB for `pid`. `None` if the process is gone or
/// permission-denied.
pub fn rss_mb(pid: u32) -> Option<f64> {
    let mut system = sysinfo::System::new();
    let sysinfo_pid = sysinfo::Pid::from_u32(pid);
    system.refresh_process(sysinfo_pid);
    system
        .process(sysinfo_pid)
        .map(|p| p.memory() as f64 / 1024.0 / 1024.0)
}

/// Best-effort CPU usage percentage for `pid`. `None` if the process is
/// gone or permission-denied. `sysinfo` needs two refreshes a tick apart to
/// compute a meaningful delta; callers that need accuracy should sample
/// periodically rather than once.
pub fn cpu_percent(pid: u32) -> Option<f32> {
    let mut system = sysinfo::System::new();
    let sysinfo_pid = sysinfo::Pid::from_u32(pid);
    system.refresh_process(sysinfo_pid);
    system.process(sysinfo_pid).map(|p| p.cpu_usage())
}

pub fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// System-wide memory snapshot in GB, mirroring
/// `utils.py`'s `get_system_memory_usage` (`psutil.virtual_memory`).
pub struct SystemMemory {
    pub total_gb: f64,
    pub available_gb: f64,
    pub used_gb: f64,
    pub percent: f64,
}

pub fn system_memory() -> SystemMemory {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total = system.total_memory() as f64;
    let available = system.available_memory() as f64;
    let used = system.used_memory() as f64;
    let percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    SystemMemory {
        total_gb: total / GB,
        available_gb: available / GB,
        used_gb: used / GB,
        percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ModelConfig {
        ModelConfig {
            name: "m1".into(),
            port: 11501,
            model_path: "/models/a.gguf".into(),
            context_length: 4096,
            gpu_layers: -1,
            chat_format: "chatml".into(),
            auto_start: false,
            preload: false,
            priority: 5,
            resource_group: "default".into(),
            additional_args: vec!["--verbose".into()],
        }
    }

    #[test]
    fn build_command_has_expected_order() {
        let cfg = sample_config();
        let argv = build_command(&cfg);
        assert_eq!(
            argv,
            vec![
                "llama-server",
                "--model",
                "/models/a.gguf",
                "--port",
                "11501",
                "--ctx-size",
                "4096",
                "--n-gpu-layers",
                "-1",
                "--chat-template",
                "chatml",
                "--host",
                "127.0.0.1",
                "--verbose",
            ]
        );
    }

    #[test]
    fn port_bindable_true_for_free_ephemeral_port() {
        // Bind to port 0 to get an OS-assigned free port, then check it's
        // bindable again once the first listener drops.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(port_bindable("127.0.0.1", port));
    }

    #[test]
    fn port_bindable_false_while_held() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_bindable("127.0.0.1", port));
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_nothing_listens() {
        let client = reqwest::Client::new();
        let ready = wait_for_ready(
            &client,
            "http://127.0.0.1:1",
            Duration::from_millis(1500),
        )
        .await;
        assert!(!ready);
    }
}
