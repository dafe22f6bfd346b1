pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod retry;
pub mod server;
pub mod session;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::db;
    pub use crate::error::{GenerationError, ProviderError, ProviderErrorKind};
    pub use crate::keys;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::orchestrator::{generate_with_failover, FailoverRequest, GenerationOutcome};
    pub use crate::retry::{retry_with_backoff, RetryPolicy};
    pub use crate::server;
    pub use crate::session::GenerationService;
    pub use crate::telemetry;
}
