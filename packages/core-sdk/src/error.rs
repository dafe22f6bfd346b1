use thiserror::Error;

/**
 * \brief 单次 Provider 调用失败的分类。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /** \brief 无法建立连接（离线、DNS 失败等） */
    Network,
    Timeout,
    RateLimited,
    /** \brief 5xx */
    Server,
    /** \brief 401/403 */
    Auth,
    /** \brief 其余 4xx */
    Rejected,
    /** \brief 安全过滤拦截 */
    Safety,
    EmptyResponse,
    Malformed,
    Cancelled,
}

/**
 * \brief Provider 适配层抛出的错误，携带可读消息。
 */
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /**
     * \brief 根据 HTTP 状态码构造错误。
     */
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => ProviderErrorKind::RateLimited,
            401 | 403 => ProviderErrorKind::Auth,
            s if s >= 500 => ProviderErrorKind::Server,
            _ => ProviderErrorKind::Rejected,
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
        }
    }

    /**
     * \brief 将 reqwest 传输层错误归类。
     */
    pub fn from_transport(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if err.is_connect() || err.is_request() {
            ProviderErrorKind::Network
        } else if err.is_decode() || err.is_body() {
            ProviderErrorKind::Malformed
        } else {
            ProviderErrorKind::Network
        };
        Self {
            kind,
            status: err.status().map(|s| s.as_u16()),
            message: format!("network error: {}", err),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ProviderErrorKind::Cancelled, "request cancelled")
    }

    /**
     * \brief 是否属于瞬时错误（网络、超时、5xx、429）。
     */
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Network
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::Server
        ) || self.status.map(|s| s >= 500 || s == 429).unwrap_or(false)
    }
}

/**
 * \brief 某把凭据失败的记录（只含名称，不含密钥）。
 */
#[derive(Debug, Clone)]
pub struct KeyFailure {
    pub key_index: usize,
    pub name: String,
    pub error: ProviderError,
}

/**
 * \brief 生成请求在编排层之外可见的错误。
 */
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no API keys configured: add a key or enable the default key")]
    NoKeysConfigured,
    #[error("all API keys failed after {attempts} attempts; please retry")]
    AllKeysFailed {
        attempts: usize,
        failures: Vec<KeyFailure>,
    },
    #[error("generation cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl GenerationError {
    /**
     * \brief 全部凭据都因连接失败而失败，视为离线。
     */
    pub fn is_offline_exhaustion(&self) -> bool {
        match self {
            Self::AllKeysFailed { failures, .. } => {
                !failures.is_empty()
                    && failures
                        .iter()
                        .all(|f| f.error.kind == ProviderErrorKind::Network)
            }
            _ => false,
        }
    }

    /** \brief 是否可由用户重试（用于前端展示重试按钮）。 */
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::NoKeysConfigured)
    }
}

/**
 * \brief 存储层的业务错误，包在 anyhow 中向上传递，调用方可 downcast。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /** \brief 目标记录不存在 */
    #[error("{0} not found")]
    NotFound(String),
    /** \brief 输入不合法（ID 冲突、下标越界等） */
    #[error("{0}")]
    Invalid(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /**
     * \brief 从 anyhow 错误链中取出存储错误。
     */
    pub fn find(err: &anyhow::Error) -> Option<&StoreError> {
        err.chain().find_map(|cause| cause.downcast_ref::<StoreError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            ProviderError::from_status(429, "slow down").kind,
            ProviderErrorKind::RateLimited
        );
        assert_eq!(
            ProviderError::from_status(503, "down").kind,
            ProviderErrorKind::Server
        );
        assert_eq!(
            ProviderError::from_status(401, "bad key").kind,
            ProviderErrorKind::Auth
        );
        assert_eq!(
            ProviderError::from_status(400, "bad request").kind,
            ProviderErrorKind::Rejected
        );
        assert!(ProviderError::from_status(502, "x").is_transient());
        assert!(!ProviderError::from_status(404, "x").is_transient());
        assert!(!ProviderError::new(ProviderErrorKind::Safety, "blocked").is_transient());
    }

    #[test]
    fn test_offline_exhaustion_requires_all_network_failures() {
        let net = |i| KeyFailure {
            key_index: i,
            name: format!("k{}", i),
            error: ProviderError::new(ProviderErrorKind::Network, "connect refused"),
        };
        let offline = GenerationError::AllKeysFailed {
            attempts: 2,
            failures: vec![net(0), net(1)],
        };
        assert!(offline.is_offline_exhaustion());

        let mixed = GenerationError::AllKeysFailed {
            attempts: 2,
            failures: vec![
                net(0),
                KeyFailure {
                    key_index: 1,
                    name: "k1".into(),
                    error: ProviderError::from_status(401, "bad key"),
                },
            ],
        };
        assert!(!mixed.is_offline_exhaustion());
        assert!(!GenerationError::NoKeysConfigured.is_offline_exhaustion());
    }

    #[test]
    fn test_store_error_survives_context() {
        use anyhow::Context;
        let err = Err::<(), _>(anyhow::Error::from(StoreError::not_found("story id 7")))
            .context("rename failed")
            .unwrap_err();
        assert_eq!(StoreError::find(&err), Some(&StoreError::not_found("story id 7")));
        assert!(StoreError::find(&anyhow::anyhow!("disk I/O error")).is_none());
    }
}
