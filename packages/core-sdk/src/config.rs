use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::keys::DefaultSecretResolver;
use crate::llm::NativeConfig;
use crate::retry::RetryPolicy;

pub const DEFAULT_DB_PATH: &str = "storyloom.db";
pub const DEFAULT_NATIVE_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_NATIVE_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
/** \brief 会话续接时最多重放的对话轮次（user/assistant 各算一轮） */
pub const DEFAULT_HISTORY_TURNS: usize = 8;
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 30 * 60;

/**
 * \brief 进程级配置，来源于环境变量（CLI 参数可覆盖）。
 */
#[derive(Debug, Clone)]
pub struct AppConfig {
    /** \brief SQLite 数据库文件 */
    pub db_path: PathBuf,
    pub native: NativeConfig,
    /** \brief 运行期覆盖的默认密钥 */
    pub default_api_key: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub history_turns: usize,
    /** \brief 会话闲置超过该时长后被回收 */
    pub session_idle_ttl: Duration,
    pub log_dir: PathBuf,
    /** \brief 强制开启遥测（忽略数据库中的开关） */
    pub telemetry_override: Option<bool>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            native: NativeConfig {
                api_base: DEFAULT_NATIVE_BASE.to_string(),
                model: DEFAULT_NATIVE_MODEL.to_string(),
            },
            default_api_key: None,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            history_turns: DEFAULT_HISTORY_TURNS,
            session_idle_ttl: Duration::from_secs(DEFAULT_SESSION_IDLE_SECS),
            log_dir: PathBuf::from("logs"),
            telemetry_override: None,
        }
    }
}

impl AppConfig {
    /**
     * \brief 从进程环境读取配置。
     */
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 以任意键值来源构造配置，便于测试。
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        if let Some(path) = get("STORYLOOM_DB") {
            cfg.db_path = PathBuf::from(path);
        }
        if let Some(base) = get("STORYLOOM_NATIVE_BASE") {
            cfg.native.api_base = base;
        }
        if let Some(model) = get("STORYLOOM_NATIVE_MODEL") {
            cfg.native.model = model;
        }
        cfg.default_api_key = get("STORYLOOM_DEFAULT_API_KEY");
        if let Some(secs) = get("STORYLOOM_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid STORYLOOM_TIMEOUT_SECS: {}", secs))?;
            cfg.request_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = get("STORYLOOM_MAX_RETRIES") {
            cfg.retry.max_retries = retries
                .parse()
                .with_context(|| format!("invalid STORYLOOM_MAX_RETRIES: {}", retries))?;
        }
        if let Some(turns) = get("STORYLOOM_HISTORY_TURNS") {
            cfg.history_turns = turns
                .parse()
                .with_context(|| format!("invalid STORYLOOM_HISTORY_TURNS: {}", turns))?;
        }
        if let Some(secs) = get("STORYLOOM_SESSION_IDLE_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid STORYLOOM_SESSION_IDLE_SECS: {}", secs))?;
            cfg.session_idle_ttl = Duration::from_secs(secs);
        }
        if let Some(dir) = get("STORYLOOM_LOG_DIR") {
            cfg.log_dir = PathBuf::from(dir);
        }
        if let Some(flag) = get("STORYLOOM_TELEMETRY") {
            cfg.telemetry_override = Some(matches!(
                flag.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ));
        }
        Ok(cfg)
    }

    pub fn secret_resolver(&self) -> DefaultSecretResolver {
        DefaultSecretResolver::new(self.default_api_key.clone())
    }

    /**
     * \brief 默认凭据是否有共享密钥可用（运行期覆盖或编译期注入）。
     */
    pub fn default_key_available(&self) -> bool {
        self.secret_resolver().has_shared_secret()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::BUILD_DEFAULT_SECRET;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let cfg = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(cfg.native.model, DEFAULT_NATIVE_MODEL);
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert!(cfg.default_api_key.is_none());
        assert!(cfg.telemetry_override.is_none());
        assert_eq!(cfg.history_turns, DEFAULT_HISTORY_TURNS);
        assert!(!cfg.default_key_available() || BUILD_DEFAULT_SECRET.is_some());
    }

    #[test]
    fn test_env_overrides() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("STORYLOOM_DB", "/tmp/s.db"),
            ("STORYLOOM_NATIVE_MODEL", "gemini-pro"),
            ("STORYLOOM_DEFAULT_API_KEY", "  "),
            ("STORYLOOM_TIMEOUT_SECS", "30"),
            ("STORYLOOM_MAX_RETRIES", "1"),
            ("STORYLOOM_TELEMETRY", "on"),
            ("STORYLOOM_HISTORY_TURNS", "4"),
            ("STORYLOOM_SESSION_IDLE_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/s.db"));
        assert_eq!(cfg.native.model, "gemini-pro");
        assert!(cfg.default_api_key.is_none());
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.retry.max_retries, 1);
        assert_eq!(cfg.telemetry_override, Some(true));
        assert_eq!(cfg.history_turns, 4);
        assert_eq!(cfg.session_idle_ttl, Duration::from_secs(60));

        let keyed = AppConfig::from_lookup(lookup(&[("STORYLOOM_DEFAULT_API_KEY", "sk-shared")])).unwrap();
        assert!(keyed.default_key_available());
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = AppConfig::from_lookup(lookup(&[("STORYLOOM_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("STORYLOOM_TIMEOUT_SECS"));
    }
}
