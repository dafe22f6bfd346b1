use tokio_util::sync::CancellationToken;

use crate::error::{GenerationError, KeyFailure, ProviderError, ProviderErrorKind};
use crate::llm::{AdapterCall, AdapterReply, ChatHandle, Generation, ProviderAdapter, SkipReason};
use crate::models::CredentialEntry;
use crate::telemetry;

/**
 * \brief 一次故障转移生成的输入。
 */
#[derive(Clone, Copy)]
pub struct FailoverRequest<'a> {
    /** \brief 有效凭据列表（默认凭据已按设置前置） */
    pub keys: &'a [CredentialEntry],
    pub start_index: usize,
    pub system_instruction: &'a str,
    pub user_message: &'a str,
    pub prior_handle: Option<&'a ChatHandle>,
}

/**
 * \brief 首个成功的生成结果，以及下次开始尝试的下标。
 */
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub content: String,
    pub new_key_index: usize,
    pub new_handle: ChatHandle,
}

/**
 * \brief 对单条凭据的处理结果。
 */
#[derive(Debug)]
pub enum Attempt {
    Succeeded(Generation),
    Skipped(SkipReason),
    Failed(ProviderError),
}

/** \brief 轮询顺序，例如 start = 2, n = 4 时为 2, 3, 0, 1。 */
pub fn rotation_order(start_index: usize, n: usize) -> impl Iterator<Item = usize> {
    (0..n).map(move |i| (start_index + i) % n)
}

/**
 * \brief 尝试单条凭据：取第一个启用的密钥，调用适配器一次。
 */
pub async fn attempt_credential(
    adapter: &dyn ProviderAdapter,
    entry: &CredentialEntry,
    request: &FailoverRequest<'_>,
    cancel: &CancellationToken,
) -> Attempt {
    let Some((_, secret)) = entry.first_active_secret() else {
        return Attempt::Skipped(SkipReason::NoActiveKey);
    };
    let call = AdapterCall {
        entry,
        secret,
        system_instruction: request.system_instruction,
        user_message: request.user_message,
        prior_handle: request.prior_handle,
        cancel,
    };
    match adapter.generate(call).await {
        Ok(AdapterReply::Generated(generation)) => Attempt::Succeeded(generation),
        Ok(AdapterReply::Skipped(reason)) => Attempt::Skipped(reason),
        Err(err) => Attempt::Failed(err),
    }
}

/**
 * \brief 带故障转移地生成一段文本，首个成功者胜出。
 * \details 从 start_index 起循环访问，每条凭据至多访问一次；被跳过的凭据与失败的一样占用一次机会。
 * 单条失败只记录日志，只有全部失败时才向外返回汇总错误。
 */
pub async fn generate_with_failover(
    adapter: &dyn ProviderAdapter,
    request: FailoverRequest<'_>,
    cancel: &CancellationToken,
) -> Result<GenerationOutcome, GenerationError> {
    let n = request.keys.len();
    if n == 0 {
        return Err(GenerationError::NoKeysConfigured);
    }

    let mut failures = Vec::new();
    for key_index in rotation_order(request.start_index, n) {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let entry = &request.keys[key_index];
        match attempt_credential(adapter, entry, &request, cancel).await {
            Attempt::Succeeded(generation) => {
                telemetry::log_event(
                    "orchestrator",
                    &format!("key #{} ({}) succeeded", key_index, entry.name),
                );
                return Ok(GenerationOutcome {
                    content: generation.content,
                    new_key_index: key_index,
                    new_handle: generation.handle,
                });
            }
            Attempt::Skipped(reason) => {
                telemetry::log_event(
                    "orchestrator",
                    &format!("key #{} ({}) skipped: {}", key_index, entry.name, reason),
                );
            }
            Attempt::Failed(err) if err.kind == ProviderErrorKind::Cancelled => {
                return Err(GenerationError::Cancelled);
            }
            Attempt::Failed(err) => {
                telemetry::log_warn(
                    "orchestrator",
                    &format!("key #{} ({}) failed: {}", key_index, entry.name, err),
                );
                failures.push(KeyFailure {
                    key_index,
                    name: entry.name.clone(),
                    error: err,
                });
            }
        }
    }

    telemetry::log_error(
        "orchestrator",
        &format!("all {} keys failed ({} errors)", n, failures.len()),
    );
    Err(GenerationError::AllKeysFailed {
        attempts: n,
        failures,
    })
}
