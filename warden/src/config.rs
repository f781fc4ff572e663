use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the warden HTTP surface listens on
    pub port: u16,
    /// Path to the warden SQLite database
    pub database_url: String,
    /// Directory for per-session raw output logs
    pub logs_dir: String,
    /// Path to the worker executable
    pub worker_binary: String,
    /// Model label passed to the worker
    pub worker_model: String,
    /// Escalation model label, surfaced to the worker via its context block
    pub escalation_model: String,
    /// Instruction source handed to the worker
    pub prompt_path: String,
    /// Tool allowlist passed to the worker
    pub allowed_tools: Vec<String>,
    /// Directory the worker may persist state under
    pub state_dir: String,
    /// Directory the worker writes results into
    pub results_dir: String,
    /// When set, the worker must not perform mutating actions
    pub dry_run: bool,
    /// Hard deadline for one session
    pub session_timeout: Duration,
    /// Grace between SIGTERM and SIGKILL
    pub term_grace: Duration,
    /// Interval between scheduled session attempts
    pub schedule_interval: Duration,
    /// Lines of per-session replay history kept for late stream subscribers
    pub hub_history: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: env_parse("WARDEN_PORT", 9190)?,
            database_url: env_str("WARDEN_DATABASE_URL", "sqlite:./data/warden.db"),
            logs_dir: env_str("WARDEN_LOGS_DIR", "./data/logs"),
            worker_binary: env_str("WARDEN_WORKER_BINARY", "agent-worker"),
            worker_model: env_str("WARDEN_WORKER_MODEL", "worker-standard"),
            escalation_model: env_str("WARDEN_ESCALATION_MODEL", "worker-large"),
            prompt_path: env_str("WARDEN_PROMPT_PATH", "./prompts/ops.md"),
            allowed_tools: env_csv(
                "WARDEN_ALLOWED_TOOLS",
                &["Bash", "Read", "Write", "WebFetch"],
            ),
            state_dir: env_str("WARDEN_STATE_DIR", "./data/state"),
            results_dir: env_str("WARDEN_RESULTS_DIR", "./data/results"),
            dry_run: env_parse("WARDEN_DRY_RUN", false)?,
            session_timeout: Duration::from_secs(env_parse("WARDEN_SESSION_TIMEOUT_SECS", 1800)?),
            term_grace: Duration::from_secs(env_parse("WARDEN_TERM_GRACE_SECS", 10)?),
            schedule_interval: Duration::from_secs(env_parse("WARDEN_SCHEDULE_INTERVAL_SECS", 3600)?),
            hub_history: env_parse("WARDEN_HUB_HISTORY_LINES", 200)?,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
