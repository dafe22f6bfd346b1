use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{ProviderError, ProviderErrorKind};
use crate::keys::{Route, SecretResolver};
use crate::models::{CredentialEntry, Message};

/** \brief 固定采样参数。 */
pub const TEMPERATURE: f32 = 0.95;
pub const TOP_P: f32 = 0.95;

const OPENROUTER_HOST: &str = "openrouter.ai";
const DATA_POLICY_PATTERN: &str = "no endpoints found matching your data policy";

/**
 * \brief 原生厂商会话：系统指令、采样参数与已发生的对话轮次。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct NativeSession {
    pub model: String,
    pub system_instruction: String,
    pub temperature: f32,
    pub top_p: f32,
    /** \brief 仅包含 user/assistant 轮次 */
    pub history: Vec<Message>,
}

impl NativeSession {
    pub fn new(model: &str, system_instruction: &str) -> Self {
        Self {
            model: model.to_string(),
            system_instruction: system_instruction.to_string(),
            temperature: TEMPERATURE,
            top_p: TOP_P,
            history: Vec::new(),
        }
    }
}

/**
 * \brief 会话续接句柄：原生会话或可重放的消息列表。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum ChatHandle {
    Native(NativeSession),
    Generic(Vec<Message>),
}

impl ChatHandle {
    /**
     * \brief 转为 OpenAI 兼容的消息列表（原生会话会补上 system 轮次）。
     */
    pub fn to_messages(&self) -> Vec<Message> {
        match self {
            ChatHandle::Generic(messages) => messages.clone(),
            ChatHandle::Native(session) => {
                let mut messages = Vec::with_capacity(session.history.len() + 1);
                if !session.system_instruction.is_empty() {
                    messages.push(Message::system(session.system_instruction.clone()));
                }
                messages.extend(session.history.iter().cloned());
                messages
            }
        }
    }

    /**
     * \brief 转为原生会话；消息列表中的 system 轮次成为系统指令。
     */
    pub fn to_native(&self, model: &str, fallback_instruction: &str) -> NativeSession {
        match self {
            ChatHandle::Native(session) => session.clone(),
            ChatHandle::Generic(messages) => {
                let system: Vec<&str> = messages
                    .iter()
                    .filter(|m| m.role == "system")
                    .map(|m| m.content.as_str())
                    .collect();
                let instruction = if system.is_empty() {
                    fallback_instruction.to_string()
                } else {
                    system.join("\n\n")
                };
                let mut session = NativeSession::new(model, &instruction);
                session.history = messages
                    .iter()
                    .filter(|m| m.role != "system")
                    .cloned()
                    .collect();
                session
            }
        }
    }

    /** \brief 对话轮次数（不含 system）。 */
    pub fn turns(&self) -> usize {
        match self {
            ChatHandle::Native(session) => session.history.len(),
            ChatHandle::Generic(messages) => messages.iter().filter(|m| m.role != "system").count(),
        }
    }

    /**
     * \brief 只保留最近 max_turns 个对话轮次，system 轮次不计入也不丢弃。
     * \details 截断点后移到第一个 user 轮次，保证重放的历史以 user 开头。
     */
    pub fn truncate_history(&mut self, max_turns: usize) {
        match self {
            ChatHandle::Native(session) => keep_recent_turns(&mut session.history, max_turns),
            ChatHandle::Generic(messages) => {
                let (mut kept, mut turns): (Vec<Message>, Vec<Message>) =
                    messages.drain(..).partition(|m| m.role == "system");
                keep_recent_turns(&mut turns, max_turns);
                kept.append(&mut turns);
                *messages = kept;
            }
        }
    }
}

fn keep_recent_turns(history: &mut Vec<Message>, max_turns: usize) {
    if history.len() <= max_turns {
        return;
    }
    let mut start = history.len() - max_turns;
    while start < history.len() && history[start].role != "user" {
        start += 1;
    }
    history.drain(..start);
}

/**
 * \brief 跳过某把凭据的原因（不计为失败）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /** \brief 没有启用的密钥 */
    NoActiveKey,
    /** \brief 密钥解析结果为空 */
    MissingSecret,
    /** \brief endpoint 与 modelId 只配置了其一 */
    IncompleteEndpoint,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::NoActiveKey => "no active key",
            SkipReason::MissingSecret => "secret unresolved",
            SkipReason::IncompleteEndpoint => "endpoint and model id must be set together",
        };
        f.write_str(text)
    }
}

/**
 * \brief 单次适配器调用的入参。
 */
#[derive(Clone, Copy)]
pub struct AdapterCall<'a> {
    pub entry: &'a CredentialEntry,
    pub secret: &'a str,
    pub system_instruction: &'a str,
    pub user_message: &'a str,
    pub prior_handle: Option<&'a ChatHandle>,
    pub cancel: &'a CancellationToken,
}

/**
 * \brief 成功生成的文本及更新后的句柄。
 */
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub handle: ChatHandle,
}

#[derive(Debug, Clone)]
pub enum AdapterReply {
    Generated(Generation),
    Skipped(SkipReason),
}

/**
 * \brief Provider 适配器：对一把凭据执行恰好一次生成调用。
 */
pub trait ProviderAdapter: Send + Sync {
    fn generate<'a>(
        &'a self,
        call: AdapterCall<'a>,
    ) -> BoxFuture<'a, Result<AdapterReply, ProviderError>>;
}

/**
 * \brief 原生厂商（Gemini REST）配置。
 */
#[derive(Debug, Clone)]
pub struct NativeConfig {
    pub api_base: String,
    pub model: String,
}

/**
 * \brief 基于 reqwest 的默认适配器。
 */
#[derive(Clone)]
pub struct HttpProviderAdapter {
    client: reqwest::Client,
    native: NativeConfig,
    resolver: Arc<dyn SecretResolver>,
}

impl HttpProviderAdapter {
    pub fn new(
        native: NativeConfig,
        resolver: Arc<dyn SecretResolver>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            native,
            resolver,
        })
    }

    async fn call(&self, call: AdapterCall<'_>) -> Result<AdapterReply, ProviderError> {
        match call.entry.route() {
            Route::Incomplete => Ok(AdapterReply::Skipped(SkipReason::IncompleteEndpoint)),
            Route::Generic { endpoint, model } => {
                let generation = chat_once_openai(&self.client, endpoint, model, call).await?;
                Ok(AdapterReply::Generated(generation))
            }
            Route::Native => {
                let secret = self.resolver.resolve(call.entry, call.secret);
                if secret.is_empty() {
                    return Ok(AdapterReply::Skipped(SkipReason::MissingSecret));
                }
                let generation =
                    chat_once_gemini(&self.client, &self.native, &secret, call).await?;
                Ok(AdapterReply::Generated(generation))
            }
        }
    }
}

impl ProviderAdapter for HttpProviderAdapter {
    fn generate<'a>(
        &'a self,
        call: AdapterCall<'a>,
    ) -> BoxFuture<'a, Result<AdapterReply, ProviderError>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = call.cancel.cancelled() => Err(ProviderError::cancelled()),
                reply = self.call(call) => reply,
            }
        })
    }
}

/**
 * \brief 构造 OpenAI 兼容请求的消息列表：仅在新会话时加 system 轮次。
 */
pub fn build_openai_messages(
    system_instruction: &str,
    user_message: &str,
    prior: Option<&ChatHandle>,
) -> Vec<Message> {
    let mut messages = match prior {
        Some(handle) => handle.to_messages(),
        None => vec![Message::system(system_instruction)],
    };
    messages.push(Message::user(user_message));
    messages
}

async fn chat_once_openai(
    client: &reqwest::Client,
    endpoint: &str,
    model: &str,
    call: AdapterCall<'_>,
) -> Result<Generation, ProviderError> {
    let url = format!("{}/chat/completions", endpoint.trim_end_matches('/'));
    let mut messages =
        build_openai_messages(call.system_instruction, call.user_message, call.prior_handle);
    let body = json!({
        "model": model,
        "messages": messages,
        "temperature": TEMPERATURE,
        "top_p": TOP_P,
        "stream": false
    });

    let mut request = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .json(&body);
    let secret = call.secret.trim();
    if !secret.is_empty() {
        request = request.header(AUTHORIZATION, format!("Bearer {}", secret));
    }
    let resp = request.send().await.map_err(ProviderError::from_transport)?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let message = extract_error_message(&text);
        return Err(ProviderError::from_status(
            status.as_u16(),
            describe_http_failure(endpoint, model, status.as_u16(), &message),
        ));
    }

    let v: Value = resp.json().await.map_err(ProviderError::from_transport)?;
    let content = extract_openai_content(&v);
    if content.trim().is_empty() {
        return Err(ProviderError::new(
            ProviderErrorKind::EmptyResponse,
            format!("{} received empty response", call.entry.name),
        ));
    }
    messages.push(Message::assistant(content.clone()));
    Ok(Generation {
        content,
        handle: ChatHandle::Generic(messages),
    })
}

async fn chat_once_gemini(
    client: &reqwest::Client,
    native: &NativeConfig,
    secret: &str,
    call: AdapterCall<'_>,
) -> Result<Generation, ProviderError> {
    let mut session = match call.prior_handle {
        Some(handle) => handle.to_native(&native.model, call.system_instruction),
        None => NativeSession::new(&native.model, call.system_instruction),
    };
    session.history.push(Message::user(call.user_message));

    let base = normalize_gemini_base(&native.api_base);
    let url = format!("{}/models/{}:generateContent", base, session.model);
    let body = gemini_body(&session);

    let resp = client
        .post(url)
        .query(&[("key", secret)])
        .json(&body)
        .send()
        .await
        .map_err(ProviderError::from_transport)?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(
            status.as_u16(),
            format!(
                "gemini request failed: {} -> {}",
                status,
                extract_error_message(&text)
            ),
        ));
    }
    let v: Value = resp.json().await.map_err(ProviderError::from_transport)?;
    if let Some(reason) = gemini_block_reason(&v) {
        return Err(ProviderError::new(
            ProviderErrorKind::Safety,
            format!("response blocked by safety filter: {}", reason),
        ));
    }
    let content = extract_gemini_content(&v);
    if content.trim().is_empty() {
        return Err(ProviderError::new(
            ProviderErrorKind::EmptyResponse,
            format!("{} received empty response", call.entry.name),
        ));
    }
    session.history.push(Message::assistant(content.clone()));
    Ok(Generation {
        content,
        handle: ChatHandle::Native(session),
    })
}

fn gemini_body(session: &NativeSession) -> Value {
    let contents: Vec<Value> = session
        .history
        .iter()
        .map(|msg| {
            let role = if msg.role == "assistant" { "model" } else { "user" };
            json!({ "role": role, "parts": [{ "text": msg.content }] })
        })
        .collect();
    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": session.temperature,
            "topP": session.top_p
        }
    });
    if !session.system_instruction.is_empty() {
        body["systemInstruction"] = json!({
            "parts": [{ "text": session.system_instruction }]
        });
    }
    body
}

/**
 * \brief 生成可读的 HTTP 失败消息；对 OpenRouter 数据策略错误给出具体指引。
 */
pub fn describe_http_failure(endpoint: &str, model: &str, status: u16, message: &str) -> String {
    if is_openrouter(endpoint) && message.to_ascii_lowercase().contains(DATA_POLICY_PATTERN) {
        return format!(
            "OpenRouter has no endpoint for model {} that matches your data policy. \
             Adjust the privacy settings at https://openrouter.ai/settings/privacy \
             (allow prompt training for free models) or choose another model.",
            model
        );
    }
    format!("request failed: {} -> {}", status, message)
}

fn is_openrouter(endpoint: &str) -> bool {
    reqwest::Url::parse(endpoint)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.to_ascii_lowercase()))
        .map(|host| host == OPENROUTER_HOST || host.ends_with(".openrouter.ai"))
        .unwrap_or(false)
}

/**
 * \brief 从错误响应体中提取 message 字段；无法解析时返回截断后的原文。
 */
pub fn extract_error_message(text: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        let found = v
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(|m| m.as_str())
            .or_else(|| v.get("message").and_then(|m| m.as_str()))
            .or_else(|| v.get("detail").and_then(|m| m.as_str()));
        if let Some(message) = found {
            return message.to_string();
        }
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "no error details".to_string();
    }
    trimmed.chars().take(500).collect()
}

fn extract_openai_content(v: &Value) -> String {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_gemini_content(v: &Value) -> String {
    v.get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|first| first.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn gemini_block_reason(v: &Value) -> Option<String> {
    if let Some(reason) = v
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(|r| r.as_str())
    {
        return Some(reason.to_string());
    }
    let finish = v
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finishReason"))
        .and_then(|r| r.as_str())?;
    match finish {
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII" => Some(finish.to_string()),
        _ => None,
    }
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}
