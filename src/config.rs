use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    pub kernel: KernelConfig,
    pub grading: GradingConfig,
    pub sessions: SessionConfig,
    pub submissions_dir: PathBuf,
    pub assessment_path: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    pub max_code_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub python: String,
    pub startup_timeout: Duration,
    pub max_concurrent_starts: usize,
}

#[derive(Debug, Clone)]
pub struct GradingConfig {
    pub execution_timeout: Duration,
    pub test_timeout: Duration,
    /// Wall-clock bound on any single run, student code or test snippet.
    pub run_deadline: Duration,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `None` disables idle reaping.
    pub idle_timeout: Option<Duration>,
    pub reaper_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" | "text" => Ok(Self::Compact),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let kernel = KernelConfig {
            python: env::var("KERNEL_PYTHON").unwrap_or_else(|_| "python3".to_string()),
            startup_timeout: Duration::from_secs(env_parse("KERNEL_STARTUP_TIMEOUT_SECS", 30u64).max(1)),
            max_concurrent_starts: env_parse("MAX_CONCURRENT_STARTS", 4usize).max(1),
        };

        let grading = GradingConfig {
            execution_timeout: Duration::from_secs(env_parse("EXECUTION_TIMEOUT_SECS", 20u64).max(1)),
            test_timeout: Duration::from_secs(env_parse("TEST_TIMEOUT_SECS", 5u64).max(1)),
            run_deadline: Duration::from_secs(env_parse("RUN_DEADLINE_SECS", 120u64).max(1)),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", 1_048_576usize).max(1),
        };

        let idle_secs = env_parse("SESSION_IDLE_TIMEOUT_SECS", 7200u64);
        let sessions = SessionConfig {
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            reaper_interval: Duration::from_secs(env_parse("REAPER_INTERVAL_SECS", 60u64).max(1)),
        };

        Ok(Self {
            bind_addr,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env_parse("LOG_FORMAT", LogFormat::Json),
            kernel,
            grading,
            sessions,
            submissions_dir: env::var("SUBMISSIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            assessment_path: env::var("ASSESSMENT_PATH").ok().map(PathBuf::from),
            cors_origins: parse_csv("CORS_ORIGINS", "*"),
            max_code_bytes: env_parse("MAX_CODE_BYTES", 250_000usize),
        })
    }
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
