use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, get_service, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use crate::config::AppConfig;
use crate::error::{GenerationError, StoreError};
use crate::keys;
use crate::llm::ProviderAdapter;
use crate::models::{Character, CreativeDirection, CredentialEntry, GenerationMode, RewriteScope, Segment, Story};
use crate::prompt::PromptInput;
use crate::retry::RetryPolicy;
use crate::session::{CredentialCheck, GenerationService};
use crate::{db, telemetry};

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<Json<T>, ApiError>;

/**
 * \brief 各 handler 共享的状态。
 */
#[derive(Clone)]
pub struct AppState {
    db_path: PathBuf,
    service: Arc<GenerationService>,
}

impl AppState {
    /**
     * \brief 按配置构造真实 HTTP 适配器。
     */
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            db_path: config.db_path.clone(),
            service: Arc::new(GenerationService::from_config(config)?),
        })
    }

    pub fn with_adapter(
        db_path: PathBuf,
        adapter: Arc<dyn ProviderAdapter>,
        retry: RetryPolicy,
    ) -> Self {
        Self::with_service(db_path, GenerationService::new(adapter, retry))
    }

    pub fn with_service(db_path: PathBuf, service: GenerationService) -> Self {
        Self {
            db_path,
            service: Arc::new(service),
        }
    }

    fn open(&self) -> Result<rusqlite::Connection, ApiError> {
        db::open_db(&self.db_path).map_err(internal_err)
    }

    /**
     * \brief 实际参与轮询的凭据；没有可用的共享密钥时不插入默认凭据。
     */
    fn effective_keys(&self, conn: &rusqlite::Connection) -> Result<Vec<CredentialEntry>> {
        let pool = db::load_key_pool(conn)?;
        let use_default = db::get_use_default_key(conn)? && self.service.default_key_available();
        Ok(keys::effective_key_list(&pool, use_default))
    }

    fn keys_state(&self, conn: &rusqlite::Connection) -> Result<KeysState> {
        let keys = self
            .effective_keys(conn)?
            .iter()
            .map(CredentialEntry::masked)
            .collect();
        Ok(KeysState {
            keys,
            use_default_key: db::get_use_default_key(conn)?,
            default_key_available: self.service.default_key_available(),
        })
    }
}

/**
 * \brief 组装 API 路由；存在静态目录时一并托管前端。
 */
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/keys", get(list_keys).post(create_key))
        .route("/api/keys/use-default", put(set_use_default))
        .route("/api/keys/{id}", put(update_key).delete(remove_key))
        .route("/api/keys/{id}/toggle/{index}", post(toggle_key))
        .route("/api/keys/{id}/check", post(check_key))
        .route("/api/stories", get(list_stories).post(create_story))
        .route("/api/stories/{id}", put(rename_story).delete(remove_story))
        .route(
            "/api/stories/{id}/segments",
            get(list_segments).post(append_segment),
        )
        .route(
            "/api/segments/{id}",
            put(update_segment).delete(remove_segment),
        )
        .route("/api/segments/{id}/move", post(move_segment))
        .route(
            "/api/stories/{id}/characters",
            get(list_characters).post(add_character),
        )
        .route("/api/characters/{id}", delete(remove_character))
        .route("/api/generate", post(generate))
        .route("/api/sessions/{id}", delete(reset_session))
        .with_state(state);

    let ui_root = std::env::var("STORYLOOM_UI_DIR").unwrap_or_else(|_| "web".to_string());
    if std::path::Path::new(&ui_root).exists() {
        let static_service =
            get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));
        api.fallback_service(static_service)
    } else {
        api
    }
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    telemetry::log_event("server", &format!("listening on {}", addr));
    axum::serve(listener, app).await?;
    Ok(())
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn not_found(what: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("{} not found", what))
}

/**
 * \brief 存储层错误：记录不存在为 404，输入不合法为 400，其余为 500。
 */
fn store_err(e: anyhow::Error) -> ApiError {
    match StoreError::find(&e) {
        Some(StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
        Some(StoreError::Invalid(_)) => (StatusCode::BAD_REQUEST, e.to_string()),
        None => internal_err(e),
    }
}

/**
 * \brief 生成错误到 HTTP 状态码的映射。
 */
fn generation_err(e: GenerationError) -> ApiError {
    let status = match &e {
        GenerationError::NoKeysConfigured => StatusCode::BAD_REQUEST,
        GenerationError::AllKeysFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GenerationError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        GenerationError::Provider(_) => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string())
}

#[derive(Serialize, Debug)]
struct KeysState {
    /** \brief 有效凭据列表（密钥已遮蔽） */
    keys: Vec<CredentialEntry>,
    use_default_key: bool,
    /** \brief 是否配置了默认凭据的共享密钥 */
    default_key_available: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct KeyRequest {
    #[serde(default)]
    id: Option<String>,
    name: String,
    /** \brief 原始密钥文本，可一次粘贴多把；更新时留空表示不变 */
    #[serde(default)]
    keys: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    model_id: Option<String>,
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

async fn health_check(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let conn = state.open()?;
    let keys = state.effective_keys(&conn).map_err(internal_err)?;
    let use_default = db::get_use_default_key(&conn).map_err(internal_err)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "keys": keys.len(),
        "use_default_key": use_default,
    })))
}

/**
 * \brief 获取凭据列表。
 */
async fn list_keys(State(state): State<AppState>) -> ApiResult<KeysState> {
    let conn = state.open()?;
    Ok(Json(state.keys_state(&conn).map_err(internal_err)?))
}

/**
 * \brief 新增凭据（追加到末尾）。
 */
async fn create_key(
    State(state): State<AppState>,
    Json(payload): Json<KeyRequest>,
) -> ApiResult<KeysState> {
    let secrets = keys::parse_raw_keys(&payload.keys);
    if secrets.is_empty() {
        return Err(bad_request("at least one API key is required"));
    }
    let id = blank_to_none(payload.id).unwrap_or_else(keys::new_entry_id);
    let mut entry = CredentialEntry::new(id, payload.name.trim(), secrets);
    entry.endpoint = blank_to_none(payload.endpoint);
    entry.model_id = blank_to_none(payload.model_id);

    let conn = state.open()?;
    db::insert_key_entry(&conn, entry).map_err(store_err)?;
    telemetry::log_event("server.keys", &format!("create name={}", payload.name));
    Ok(Json(state.keys_state(&conn).map_err(internal_err)?))
}

/**
 * \brief 更新凭据；密钥文本为空时保留原有密钥与启用状态。
 */
async fn update_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<KeyRequest>,
) -> ApiResult<KeysState> {
    let conn = state.open()?;
    let mut entry = db::load_key_pool(&conn)
        .map_err(internal_err)?
        .into_iter()
        .find(|e| e.id == id)
        .ok_or_else(|| not_found("key"))?;
    entry.name = payload.name.trim().to_string();
    entry.endpoint = blank_to_none(payload.endpoint);
    entry.model_id = blank_to_none(payload.model_id);
    let secrets = keys::parse_raw_keys(&payload.keys);
    if !secrets.is_empty() && secrets != entry.keys {
        entry.active_indexes = (0..secrets.len()).collect();
        entry.keys = secrets;
    }
    db::update_key_entry(&conn, entry).map_err(store_err)?;
    telemetry::log_event("server.keys", &format!("update id={}", id));
    Ok(Json(state.keys_state(&conn).map_err(internal_err)?))
}

async fn remove_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<KeysState> {
    let conn = state.open()?;
    db::delete_key_entry(&conn, &id).map_err(store_err)?;
    telemetry::log_event("server.keys", &format!("delete id={}", id));
    Ok(Json(state.keys_state(&conn).map_err(internal_err)?))
}

async fn toggle_key(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
) -> ApiResult<KeysState> {
    let conn = state.open()?;
    let active = db::toggle_key(&conn, &id, index).map_err(store_err)?;
    telemetry::log_event(
        "server.keys",
        &format!("toggle id={} index={} active={}", id, index, active),
    );
    Ok(Json(state.keys_state(&conn).map_err(internal_err)?))
}

#[derive(Deserialize, Debug)]
struct UseDefaultRequest {
    enabled: bool,
}

/**
 * \brief 开关内置默认凭据。
 */
async fn set_use_default(
    State(state): State<AppState>,
    Json(payload): Json<UseDefaultRequest>,
) -> ApiResult<KeysState> {
    let conn = state.open()?;
    db::set_use_default_key(&conn, payload.enabled).map_err(internal_err)?;
    Ok(Json(state.keys_state(&conn).map_err(internal_err)?))
}

/**
 * \brief 单独检测一条凭据是否可用。
 */
async fn check_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let entry = {
        let conn = state.open()?;
        state
            .effective_keys(&conn)
            .map_err(internal_err)?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| not_found("key"))?
    };
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let body = match state.service.check_credential(&entry, &cancel).await {
        Ok(CredentialCheck::Working { reply }) => serde_json::json!({
            "ok": true,
            "id": entry.id,
            "reply": reply,
        }),
        Ok(CredentialCheck::Skipped(reason)) => serde_json::json!({
            "ok": false,
            "id": entry.id,
            "skipped": reason.to_string(),
        }),
        Err(e) => serde_json::json!({
            "ok": false,
            "id": entry.id,
            "error": e.to_string(),
        }),
    };
    telemetry::log_event("server.keys", &format!("check id={} result={}", id, body["ok"]));
    Ok(Json(body))
}

#[derive(Deserialize, Debug)]
struct TitleRequest {
    title: String,
}

async fn list_stories(State(state): State<AppState>) -> ApiResult<Vec<Story>> {
    let conn = state.open()?;
    Ok(Json(db::list_stories(&conn).map_err(internal_err)?))
}

async fn create_story(
    State(state): State<AppState>,
    Json(payload): Json<TitleRequest>,
) -> ApiResult<Story> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(bad_request("story title must not be empty"));
    }
    let conn = state.open()?;
    let id = db::create_story(&conn, title).map_err(internal_err)?;
    let story = db::get_story(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| internal_err(anyhow!("story {} vanished", id)))?;
    telemetry::log_event("server.story", &format!("create id={}", id));
    Ok(Json(story))
}

async fn rename_story(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<TitleRequest>,
) -> ApiResult<Story> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(bad_request("story title must not be empty"));
    }
    let conn = state.open()?;
    db::rename_story(&conn, id, title).map_err(store_err)?;
    let story = db::get_story(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("story"))?;
    Ok(Json(story))
}

async fn remove_story(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Story>> {
    let conn = state.open()?;
    db::delete_story(&conn, id).map_err(internal_err)?;
    telemetry::log_event("server.story", &format!("delete id={}", id));
    Ok(Json(db::list_stories(&conn).map_err(internal_err)?))
}

#[derive(Deserialize, Debug)]
struct ContentRequest {
    content: String,
}

async fn list_segments(
    State(state): State<AppState>,
    Path(story_id): Path<i64>,
) -> ApiResult<Vec<Segment>> {
    let conn = state.open()?;
    Ok(Json(db::load_segments(&conn, story_id).map_err(internal_err)?))
}

async fn append_segment(
    State(state): State<AppState>,
    Path(story_id): Path<i64>,
    Json(payload): Json<ContentRequest>,
) -> ApiResult<Vec<Segment>> {
    let conn = state.open()?;
    db::append_segment(&conn, story_id, &payload.content).map_err(store_err)?;
    Ok(Json(db::load_segments(&conn, story_id).map_err(internal_err)?))
}

async fn update_segment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<ContentRequest>,
) -> ApiResult<Segment> {
    let conn = state.open()?;
    db::update_segment(&conn, id, &payload.content).map_err(store_err)?;
    let segment = db::get_segment(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("segment"))?;
    Ok(Json(segment))
}

async fn remove_segment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Segment>> {
    let conn = state.open()?;
    let segment = db::get_segment(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("segment"))?;
    db::delete_segment(&conn, id).map_err(store_err)?;
    Ok(Json(
        db::load_segments(&conn, segment.story_id).map_err(internal_err)?,
    ))
}

#[derive(Deserialize, Debug)]
struct MoveRequest {
    /** \brief 目标位置（0 起） */
    position: usize,
}

async fn move_segment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<MoveRequest>,
) -> ApiResult<Vec<Segment>> {
    let conn = state.open()?;
    let segment = db::get_segment(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("segment"))?;
    db::move_segment(&conn, id, payload.position).map_err(store_err)?;
    Ok(Json(
        db::load_segments(&conn, segment.story_id).map_err(internal_err)?,
    ))
}

#[derive(Deserialize, Debug)]
struct CharacterRequest {
    name: String,
    #[serde(default)]
    description: String,
}

async fn list_characters(
    State(state): State<AppState>,
    Path(story_id): Path<i64>,
) -> ApiResult<Vec<Character>> {
    let conn = state.open()?;
    Ok(Json(
        db::list_characters(&conn, story_id).map_err(internal_err)?,
    ))
}

async fn add_character(
    State(state): State<AppState>,
    Path(story_id): Path<i64>,
    Json(payload): Json<CharacterRequest>,
) -> ApiResult<Vec<Character>> {
    if payload.name.trim().is_empty() {
        return Err(bad_request("character name must not be empty"));
    }
    let conn = state.open()?;
    db::insert_character(&conn, story_id, payload.name.trim(), payload.description.trim())
        .map_err(store_err)?;
    Ok(Json(
        db::list_characters(&conn, story_id).map_err(internal_err)?,
    ))
}

async fn remove_character(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let conn = state.open()?;
    db::delete_character(&conn, id).map_err(internal_err)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ModeName {
    Continue,
    Rewrite,
}

#[derive(Deserialize, Debug)]
struct GenerateRequest {
    session_id: String,
    story_id: i64,
    mode: ModeName,
    #[serde(default)]
    scope: Option<RewriteScope>,
    /** \brief 章节改写的目标片段 */
    #[serde(default)]
    segment_id: Option<i64>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    direction: Option<CreativeDirection>,
    /** \brief 改写结果是否写回（续写总是追加） */
    #[serde(default)]
    apply: bool,
}

#[derive(Serialize, Debug)]
struct GenerateResponse {
    content: String,
    key_index: usize,
    /** \brief 写入或更新的片段；未写回时为 None */
    segment_id: Option<i64>,
}

impl GenerateRequest {
    fn generation_mode(&self) -> GenerationMode {
        match self.mode {
            ModeName::Continue => GenerationMode::Continue,
            ModeName::Rewrite => {
                GenerationMode::Rewrite(self.scope.unwrap_or(RewriteScope::EntireStory))
            }
        }
    }
}

/**
 * \brief 生成接口：构建提示、故障转移生成并按模式写回故事。
 */
async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<GenerateResponse> {
    let mode = req.generation_mode();
    let (keys, story_text, chapter, direction) = {
        let conn = state.open()?;
        if db::get_story(&conn, req.story_id)
            .map_err(internal_err)?
            .is_none()
        {
            return Err(not_found("story"));
        }
        let keys = state.effective_keys(&conn).map_err(internal_err)?;
        let story_text = db::story_text(&conn, req.story_id).map_err(internal_err)?;
        let chapter = match (mode, req.segment_id) {
            (GenerationMode::Rewrite(RewriteScope::SelectedChapter), Some(segment_id)) => {
                let segment = db::get_segment(&conn, segment_id)
                    .map_err(internal_err)?
                    .filter(|s| s.story_id == req.story_id)
                    .ok_or_else(|| not_found("segment"))?;
                Some(segment.content)
            }
            (GenerationMode::Rewrite(RewriteScope::SelectedChapter), None) => {
                return Err(bad_request("segment_id is required to rewrite a chapter"));
            }
            _ => None,
        };
        let mut direction = req.direction.clone().unwrap_or_default();
        if direction.characters.is_empty() {
            direction.characters =
                db::list_characters(&conn, req.story_id).map_err(internal_err)?;
        }
        (keys, story_text, chapter, direction)
    };

    let input = PromptInput {
        mode,
        story_text: &story_text,
        chapter: chapter.as_deref(),
        user_prompt: req.prompt.as_deref(),
        direction: &direction,
    };
    telemetry::log_event(
        "server.generate",
        &format!(
            "session={} story={} mode={:?} keys={}",
            req.session_id,
            req.story_id,
            mode,
            keys.len()
        ),
    );

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let outcome = state
        .service
        .generate(&req.session_id, &keys, &input, &cancel)
        .await
        .map_err(|e| {
            telemetry::log_error("server.generate", &e.to_string());
            generation_err(e)
        })?;

    let conn = state.open()?;
    let segment_id = match mode {
        GenerationMode::Continue => Some(
            db::append_segment(&conn, req.story_id, &outcome.content).map_err(store_err)?,
        ),
        GenerationMode::Rewrite(_) if !req.apply => None,
        GenerationMode::Rewrite(RewriteScope::EntireStory) => Some(
            db::replace_story_text(&conn, req.story_id, &outcome.content)
                .map_err(store_err)?,
        ),
        GenerationMode::Rewrite(RewriteScope::SelectedChapter) => {
            let segment_id = req
                .segment_id
                .ok_or_else(|| bad_request("segment_id is required to rewrite a chapter"))?;
            db::update_segment(&conn, segment_id, &outcome.content).map_err(store_err)?;
            Some(segment_id)
        }
    };

    Ok(Json(GenerateResponse {
        content: outcome.content,
        key_index: outcome.new_key_index,
        segment_id,
    }))
}

/**
 * \brief 重置会话：下次生成从首条凭据、全新对话开始。
 */
async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let existed = state.service.reset_session(&id).await;
    Ok(Json(serde_json::json!({ "reset": existed })))
}
