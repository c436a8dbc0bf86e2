use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub port: u16,
    pub password: Option<String>,
    pub shell: String,
    pub history_limit: usize,
    pub default_cwd: PathBuf,
    pub ping_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let shell = env::var("COVE_SHELL")
            .or_else(|_| env::var("SHELL"))
            .unwrap_or_else(|_| "/bin/bash".to_string());
        let default_cwd = env::var("COVE_CWD")
            .map(PathBuf::from)
            .ok()
            .or_else(|| env::var("HOME").map(PathBuf::from).ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        Self {
            bind_host: env::var("COVE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("COVE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(9846),
            password: env::var("COVE_PASSWORD").ok().filter(|p| !p.is_empty()),
            shell,
            history_limit: env::var("COVE_HISTORY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(512 * 1024),
            default_cwd,
            ping_interval_secs: env::var("COVE_PING_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 9846,
            password: None,
            shell: "/bin/bash".to_string(),
            history_limit: 512 * 1024,
            default_cwd: PathBuf::from("/"),
            ping_interval_secs: 30,
        }
    }
}
