use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, DEFAULT_HISTORY_TURNS, DEFAULT_SESSION_IDLE_SECS};
use crate::error::GenerationError;
use crate::llm::{ChatHandle, HttpProviderAdapter, ProviderAdapter, SkipReason};
use crate::models::CredentialEntry;
use crate::orchestrator::{self, Attempt, FailoverRequest, GenerationOutcome};
use crate::prompt::{self, PromptInput};
use crate::retry::{self, RetryPolicy};
use crate::telemetry;

const CHECK_SYSTEM_INSTRUCTION: &str = "You are a connectivity check for a writing assistant.";
const CHECK_USER_MESSAGE: &str = "Reply with the single word: ready";

/**
 * \brief 单个会话的内存状态，不持久化。
 */
#[derive(Debug, Default)]
pub struct SessionState {
    /** \brief 下次从哪条凭据开始尝试 */
    pub current_key_index: usize,
    /** \brief 续接句柄；新会话为 None */
    pub chat_handle: Option<ChatHandle>,
}

/**
 * \brief 单条凭据的检测结果。
 */
#[derive(Debug, Clone)]
pub enum CredentialCheck {
    Working { reply: String },
    Skipped(SkipReason),
}

struct SessionSlot {
    state: Arc<tokio::sync::Mutex<SessionState>>,
    last_used: Instant,
}

/**
 * \brief 生成服务：按会话保存轮询下标与续接句柄，组合提示构建、重试与故障转移。
 * \details 同一会话的请求通过 tokio Mutex 串行执行。闲置超过 idle_ttl 的会话被回收，
 * 续接句柄只保留最近 history_turns 个轮次。
 */
pub struct GenerationService {
    adapter: Arc<dyn ProviderAdapter>,
    retry: RetryPolicy,
    history_turns: usize,
    idle_ttl: Duration,
    default_key_available: bool,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl GenerationService {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, retry: RetryPolicy) -> Self {
        Self {
            adapter,
            retry,
            history_turns: DEFAULT_HISTORY_TURNS,
            idle_ttl: Duration::from_secs(DEFAULT_SESSION_IDLE_SECS),
            default_key_available: true,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /**
     * \brief 按配置构造：reqwest 适配器 + 默认密钥解析策略。
     */
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let resolver = Arc::new(config.secret_resolver());
        let adapter =
            HttpProviderAdapter::new(config.native.clone(), resolver, config.request_timeout)?;
        Ok(Self::new(Arc::new(adapter), config.retry.clone())
            .with_session_limits(config.history_turns, config.session_idle_ttl)
            .with_default_key(config.default_key_available()))
    }

    pub fn with_session_limits(mut self, history_turns: usize, idle_ttl: Duration) -> Self {
        self.history_turns = history_turns;
        self.idle_ttl = idle_ttl;
        self
    }

    /**
     * \brief 标记默认凭据是否有共享密钥；没有时有效列表中不应出现默认凭据。
     */
    pub fn with_default_key(mut self, available: bool) -> Self {
        self.default_key_available = available;
        self
    }

    pub fn default_key_available(&self) -> bool {
        self.default_key_available
    }

    fn session(&self, session_id: &str) -> Arc<tokio::sync::Mutex<SessionState>> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        self.evict_idle(&mut sessions, now);
        let slot = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionSlot {
                state: Arc::default(),
                last_used: now,
            });
        slot.last_used = now;
        slot.state.clone()
    }

    /**
     * \brief 回收闲置会话；仍有请求持有的会话不回收。
     */
    fn evict_idle(&self, sessions: &mut HashMap<String, SessionSlot>, now: Instant) {
        let before = sessions.len();
        sessions.retain(|_, slot| {
            Arc::strong_count(&slot.state) > 1 || now.duration_since(slot.last_used) < self.idle_ttl
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            telemetry::log_event("session", &format!("evicted {} idle session(s)", evicted));
        }
    }

    /** \brief 当前保存的会话数。 */
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /**
     * \brief 生成一段文本。
     * \details 成功时记住命中的凭据下标与新句柄；失败时会话状态保持不变。
     * \param keys 有效凭据列表（默认凭据已按设置前置）
     */
    pub async fn generate(
        &self,
        session_id: &str,
        keys: &[CredentialEntry],
        input: &PromptInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let session = self.session(session_id);
        let mut state = session.lock().await;

        let system = prompt::system_instruction(input.mode);
        let user = prompt::build_user_message(input);
        let system = system.as_str();
        let user = user.as_str();
        let prior_handle = state.chat_handle.as_ref();
        let start_index = state.current_key_index;
        let adapter = self.adapter.as_ref();

        let result = retry::retry_with_backoff(
            &self.retry,
            cancel,
            move |_| {
                orchestrator::generate_with_failover(
                    adapter,
                    FailoverRequest {
                        keys,
                        start_index,
                        system_instruction: system,
                        user_message: user,
                        prior_handle,
                    },
                    cancel,
                )
            },
            retry::is_retryable,
            retry::log_retry("retry"),
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) if cancel.is_cancelled() => return Err(GenerationError::Cancelled),
            Err(err) => return Err(err),
        };
        let mut handle = outcome.new_handle.clone();
        handle.truncate_history(self.history_turns);
        telemetry::log_event(
            "session",
            &format!(
                "session {} now at key #{} ({} turns kept)",
                session_id,
                outcome.new_key_index,
                handle.turns()
            ),
        );
        state.current_key_index = outcome.new_key_index;
        state.chat_handle = Some(handle);
        Ok(outcome)
    }

    /**
     * \brief 清空会话：下次从第 0 条凭据、全新对话开始。
     */
    pub async fn reset_session(&self, session_id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(session_id)
        };
        match removed {
            Some(slot) => {
                // 等待进行中的生成结束
                drop(slot.state.lock().await);
                true
            }
            None => false,
        }
    }

    pub async fn current_key_index(&self, session_id: &str) -> Option<usize> {
        let session = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.get(session_id).map(|slot| slot.state.clone())
        }?;
        let state = session.lock().await;
        Some(state.current_key_index)
    }

    /**
     * \brief 单独验证一条凭据（不轮询其他凭据），瞬时错误按重试策略重试。
     */
    pub async fn check_credential(
        &self,
        entry: &CredentialEntry,
        cancel: &CancellationToken,
    ) -> Result<CredentialCheck, GenerationError> {
        let adapter = self.adapter.as_ref();
        let request = FailoverRequest {
            keys: std::slice::from_ref(entry),
            start_index: 0,
            system_instruction: CHECK_SYSTEM_INSTRUCTION,
            user_message: CHECK_USER_MESSAGE,
            prior_handle: None,
        };
        let result = retry::retry_with_backoff(
            &self.retry,
            cancel,
            move |_| async move {
                match orchestrator::attempt_credential(adapter, entry, &request, cancel).await {
                    Attempt::Succeeded(generation) => Ok(CredentialCheck::Working {
                        reply: generation.content,
                    }),
                    Attempt::Skipped(reason) => Ok(CredentialCheck::Skipped(reason)),
                    Attempt::Failed(err) => Err(GenerationError::Provider(err)),
                }
            },
            retry::is_retryable,
            retry::log_retry("check"),
        )
        .await;
        match result {
            Err(_) if cancel.is_cancelled() => Err(GenerationError::Cancelled),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::models::{CreativeDirection, GenerationMode};
    use crate::orchestrator::tests::{entries, Behavior, RecordingAdapter};
    use std::time::Duration;

    fn instant_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    fn service(adapter: &Arc<RecordingAdapter>, max_retries: u32) -> GenerationService {
        GenerationService::new(adapter.clone(), instant_retry(max_retries))
    }

    fn input(direction: &CreativeDirection) -> PromptInput<'_> {
        PromptInput {
            mode: GenerationMode::Continue,
            story_text: "Once upon a time.",
            chapter: None,
            user_prompt: None,
            direction,
        }
    }

    #[tokio::test]
    async fn test_index_persists_between_calls() {
        let keys = entries(&["a", "b", "c"]);
        let adapter = Arc::new(RecordingAdapter::with(&[
            ("a", Behavior::Fail(ProviderErrorKind::RateLimited)),
            ("b", Behavior::Succeed("b wrote")),
        ]));
        let svc = service(&adapter, 0);
        let dir = CreativeDirection::default();
        let cancel = CancellationToken::new();

        let first = svc.generate("s1", &keys, &input(&dir), &cancel).await.unwrap();
        assert_eq!(first.new_key_index, 1);
        assert_eq!(svc.current_key_index("s1").await, Some(1));

        adapter.calls.lock().unwrap().clear();
        let second = svc.generate("s1", &keys, &input(&dir), &cancel).await.unwrap();
        assert_eq!(adapter.called_ids(), vec!["b"]);
        assert_eq!(second.new_handle.turns(), 4);

        // 其他会话互不影响
        adapter.calls.lock().unwrap().clear();
        svc.generate("s2", &keys, &input(&dir), &cancel).await.unwrap();
        assert_eq!(adapter.called_ids(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_session_requests_run_one_after_another() {
        let keys = entries(&["a", "b"]);
        let adapter = Arc::new(RecordingAdapter::with(&[
            ("a", Behavior::Fail(ProviderErrorKind::RateLimited)),
            ("b", Behavior::Slow("b wrote", Duration::from_millis(200))),
        ]));
        let svc = service(&adapter, 0);
        let dir = CreativeDirection::default();
        let prompt = input(&dir);
        let cancel = CancellationToken::new();

        let (left, right) = tokio::join!(
            svc.generate("s", &keys, &prompt, &cancel),
            svc.generate("s", &keys, &prompt, &cancel),
        );
        let (left, right) = (left.unwrap(), right.unwrap());

        // 后到的请求从前一个请求命中的下标开始，并续接其句柄
        assert_eq!(adapter.called_ids(), vec!["a", "b", "b"]);
        assert_eq!(left.new_key_index, 1);
        assert_eq!(right.new_key_index, 1);
        let mut turns = vec![left.new_handle.turns(), right.new_handle.turns()];
        turns.sort();
        assert_eq!(turns, vec![2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_sessions_run_in_parallel() {
        let keys = entries(&["a"]);
        let adapter = Arc::new(RecordingAdapter::with(&[(
            "a",
            Behavior::Slow("a wrote", Duration::from_secs(1)),
        )]));
        let svc = service(&adapter, 0);
        let dir = CreativeDirection::default();
        let prompt = input(&dir);
        let cancel = CancellationToken::new();

        let started = tokio::time::Instant::now();
        let (left, right) = tokio::join!(
            svc.generate("s1", &keys, &prompt, &cancel),
            svc.generate("s2", &keys, &prompt, &cancel),
        );
        left.unwrap();
        right.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_replayed_history_is_capped() {
        let keys = entries(&["a"]);
        let adapter = Arc::new(RecordingAdapter::with(&[("a", Behavior::Succeed("more"))]));
        let svc = service(&adapter, 0).with_session_limits(4, Duration::from_secs(60));
        let dir = CreativeDirection::default();
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            svc.generate("s", &keys, &input(&dir), &cancel).await.unwrap();
        }
        let last = svc.generate("s", &keys, &input(&dir), &cancel).await.unwrap();
        // 重放 4 轮加本轮 2 轮
        assert_eq!(last.new_handle.turns(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_evicted() {
        let keys = entries(&["a", "b"]);
        let adapter = Arc::new(RecordingAdapter::with(&[
            ("a", Behavior::Fail(ProviderErrorKind::Server)),
            ("b", Behavior::Succeed("ok")),
        ]));
        let svc = service(&adapter, 0).with_session_limits(8, Duration::from_secs(60));
        let dir = CreativeDirection::default();
        let cancel = CancellationToken::new();

        svc.generate("old", &keys, &input(&dir), &cancel).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        svc.generate("recent", &keys, &input(&dir), &cancel).await.unwrap();
        assert_eq!(svc.session_count(), 2);

        tokio::time::advance(Duration::from_secs(45)).await;
        svc.generate("new", &keys, &input(&dir), &cancel).await.unwrap();
        assert_eq!(svc.current_key_index("old").await, None);
        assert_eq!(svc.current_key_index("recent").await, Some(1));
        assert_eq!(svc.session_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_session_state() {
        let keys = entries(&["a", "b"]);
        let adapter = Arc::new(RecordingAdapter::with(&[("b", Behavior::Succeed("ok"))]));
        let svc = service(&adapter, 0);
        let dir = CreativeDirection::default();
        let cancel = CancellationToken::new();

        svc.generate("s", &keys, &input(&dir), &cancel).await.unwrap();
        adapter.set("b", Behavior::Fail(ProviderErrorKind::Auth));
        let err = svc.generate("s", &keys, &input(&dir), &cancel).await.unwrap_err();
        assert!(matches!(err, GenerationError::AllKeysFailed { .. }));
        assert_eq!(svc.current_key_index("s").await, Some(1));
    }

    #[tokio::test]
    async fn test_offline_exhaustion_is_retried() {
        let keys = entries(&["a"]);
        let adapter = Arc::new(RecordingAdapter::with(&[(
            "a",
            Behavior::Fail(ProviderErrorKind::Network),
        )]));
        let svc = service(&adapter, 2);
        let dir = CreativeDirection::default();
        let cancel = CancellationToken::new();
        let err = svc.generate("s", &keys, &input(&dir), &cancel).await.unwrap_err();
        assert!(err.is_offline_exhaustion());
        assert_eq!(adapter.called_ids().len(), 3);
    }

    #[tokio::test]
    async fn test_auth_exhaustion_is_not_retried() {
        let keys = entries(&["a", "b"]);
        let adapter = Arc::new(RecordingAdapter::with(&[
            ("a", Behavior::Fail(ProviderErrorKind::Auth)),
            ("b", Behavior::Fail(ProviderErrorKind::Auth)),
        ]));
        let svc = service(&adapter, 3);
        let dir = CreativeDirection::default();
        let cancel = CancellationToken::new();
        svc.generate("s", &keys, &input(&dir), &cancel).await.unwrap_err();
        assert_eq!(adapter.called_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_session_starts_fresh() {
        let keys = entries(&["a", "b"]);
        let adapter = Arc::new(RecordingAdapter::with(&[
            ("a", Behavior::Fail(ProviderErrorKind::Server)),
            ("b", Behavior::Succeed("ok")),
        ]));
        let svc = service(&adapter, 0);
        let dir = CreativeDirection::default();
        let cancel = CancellationToken::new();
        svc.generate("s", &keys, &input(&dir), &cancel).await.unwrap();
        assert!(svc.reset_session("s").await);
        assert!(!svc.reset_session("s").await);
        assert_eq!(svc.current_key_index("s").await, None);

        adapter.calls.lock().unwrap().clear();
        let outcome = svc.generate("s", &keys, &input(&dir), &cancel).await.unwrap();
        assert_eq!(adapter.called_ids(), vec!["a", "b"]);
        assert_eq!(outcome.new_handle.turns(), 2);
    }

    #[tokio::test]
    async fn test_empty_keys_and_cancellation() {
        let adapter = Arc::new(RecordingAdapter::default());
        let svc = service(&adapter, 3);
        let dir = CreativeDirection::default();
        let cancel = CancellationToken::new();
        let err = svc.generate("s", &[], &input(&dir), &cancel).await.unwrap_err();
        assert!(matches!(err, GenerationError::NoKeysConfigured));

        cancel.cancel();
        let keys = entries(&["a"]);
        let err = svc.generate("s", &keys, &input(&dir), &cancel).await.unwrap_err();
        assert!(matches!(err, GenerationError::Cancelled));
        assert!(adapter.called_ids().is_empty());
    }

    #[tokio::test]
    async fn test_check_credential_reports_each_outcome() {
        let keys = entries(&["ok", "skip", "bad", "flaky"]);
        let adapter = Arc::new(RecordingAdapter::with(&[
            ("ok", Behavior::Succeed("ready")),
            ("skip", Behavior::Skip),
            ("bad", Behavior::Fail(ProviderErrorKind::Auth)),
            ("flaky", Behavior::Fail(ProviderErrorKind::Server)),
        ]));
        let svc = service(&adapter, 2);
        let cancel = CancellationToken::new();

        match svc.check_credential(&keys[0], &cancel).await.unwrap() {
            CredentialCheck::Working { reply } => assert_eq!(reply, "ready"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            svc.check_credential(&keys[1], &cancel).await.unwrap(),
            CredentialCheck::Skipped(SkipReason::MissingSecret)
        ));

        adapter.calls.lock().unwrap().clear();
        let err = svc.check_credential(&keys[2], &cancel).await.unwrap_err();
        assert!(matches!(err, GenerationError::Provider(ref e) if e.kind == ProviderErrorKind::Auth));
        assert_eq!(adapter.called_ids(), vec!["bad"]);

        adapter.calls.lock().unwrap().clear();
        svc.check_credential(&keys[3], &cancel).await.unwrap_err();
        assert_eq!(adapter.called_ids(), vec!["flaky", "flaky", "flaky"]);
    }
}
