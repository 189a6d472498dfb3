use std::{
    collections::HashMap,
    convert::Infallible,
    path::PathBuf,
    time::Duration,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use crate::{
    client::ProviderClient,
    config::Session,
    db,
    error::ApiError,
    fanout,
    models::{
        AspectRatio, ChatMessage, ChatRequest, ImageRequest, MediaPayload, ResolutionTier, Role,
        UpscaleRequest, VideoRequest,
    },
    sse::Finish,
    telemetry,
};

type HandlerError = (StatusCode, String);

const KEEP_ALIVE: Duration = Duration::from_secs(5);

/**
 * \brief 一个已登记的流：ID、取消令牌，以及区分同名先后登记的票据号。
 */
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub id: String,
    pub token: CancellationToken,
    ticket: u64,
}

/**
 * \brief 管理流式任务的取消令牌。同一 ID 同时只能有一个活动流。
 */
#[derive(Default, Clone)]
pub struct StreamRegistry {
    inner: Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>,
    seq: Arc<AtomicU64>,
}

impl StreamRegistry {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /** \brief 分配一个新的流 ID。 */
    pub fn next_id(&self) -> String {
        format!("s{}", self.next_seq())
    }

    /** \brief 登记流；ID 已被活动流占用时返回 None。 */
    pub fn register(&self, stream_id: &str) -> Option<StreamHandle> {
        let ticket = self.next_seq();
        let mut guard = self.inner.lock().ok()?;
        if guard.contains_key(stream_id) {
            return None;
        }
        let token = CancellationToken::new();
        guard.insert(stream_id.to_string(), (ticket, token.clone()));
        Some(StreamHandle {
            id: stream_id.to_string(),
            token,
            ticket,
        })
    }

    /** \brief 取消并移除；不存在时返回 false。 */
    pub fn cancel(&self, stream_id: &str) -> bool {
        let entry = self
            .inner
            .lock()
            .ok()
            .and_then(|mut guard| guard.remove(stream_id));
        match entry {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /** \brief 仅当登记项仍属于该 handle 时移除。 */
    pub fn remove(&self, handle: &StreamHandle) {
        if let Ok(mut guard) = self.inner.lock() {
            if guard.get(&handle.id).map(|(t, _)| *t) == Some(handle.ticket) {
                guard.remove(&handle.id);
            }
        }
    }

    pub fn active(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }
}

/**
 * \brief 网关共享状态：数据库路径、当前会话配置与客户端、流注册表。
 */
#[derive(Clone)]
pub struct AppState {
    db_path: PathBuf,
    session: Arc<RwLock<Session>>,
    client: Arc<RwLock<ProviderClient>>,
    streams: StreamRegistry,
}

impl AppState {
    /**
     * \brief 打开数据库、执行迁移并从存储加载会话配置。
     */
    pub fn load(db_path: PathBuf) -> Result<Self> {
        let store = db::SqliteStore::new(db::open_db(&db_path)?)?;
        let session = Session::load(&store)?;
        let conn = db::open_db(&db_path)?;
        telemetry::set_enabled(db::get_telemetry_enabled(&conn)?);
        Self::with_session(db_path, session)
    }

    pub fn with_session(db_path: PathBuf, session: Session) -> Result<Self> {
        let conn = db::open_db(&db_path)?;
        db::migrate(&conn)?;
        let client = ProviderClient::new(&session)?;
        Ok(Self {
            db_path,
            session: Arc::new(RwLock::new(session)),
            client: Arc::new(RwLock::new(client)),
            streams: StreamRegistry::default(),
        })
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    fn conn(&self) -> Result<rusqlite::Connection, HandlerError> {
        db::open_db(&self.db_path).map_err(internal_err)
    }

    fn session(&self) -> Result<Session, HandlerError> {
        self.session
            .read()
            .map(|s| s.clone())
            .map_err(|_| internal_err("session lock poisoned"))
    }

    fn client(&self) -> Result<ProviderClient, HandlerError> {
        self.client
            .read()
            .map(|c| c.clone())
            .map_err(|_| internal_err("client lock poisoned"))
    }

    /** \brief 保存新会话配置并重建客户端（能力缓存随之失效）。 */
    fn replace_session(&self, session: Session) -> Result<(), HandlerError> {
        let store =
            db::SqliteStore::new(self.conn()?).map_err(internal_err)?;
        session.save(&store).map_err(internal_err)?;
        let client = ProviderClient::new(&session).map_err(api_err)?;
        *self
            .client
            .write()
            .map_err(|_| internal_err("client lock poisoned"))? = client;
        *self
            .session
            .write()
            .map_err(|_| internal_err("session lock poisoned"))? = session;
        Ok(())
    }
}

/**
 * \brief 构建路由。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/config",
            get(get_config).post(set_config).delete(clear_config),
        )
        .route("/api/models", get(list_models))
        .route("/api/capabilities", get(capabilities))
        .route("/api/health", get(health_check))
        .route("/api/chat/sse", get(chat_sse))
        .route("/api/streams/{id}/cancel", post(cancel_stream))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/{id}/messages", get(get_chat_messages))
        .route("/api/chats/{id}", axum::routing::delete(remove_chat))
        .route("/api/compare", post(compare))
        .route("/api/image", post(generate_image))
        .route("/api/video", post(generate_video))
        .route("/api/upscale", post(upscale))
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 网关，提供 API 与可选的静态前端。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str) -> Result<()> {
    let db_path =
        std::env::var("PROMPTDECK_DB").unwrap_or_else(|_| "promptdeck.db".to_string());
    let state = AppState::load(PathBuf::from(db_path))?;

    let ui_root = std::env::var("PROMPTDECK_UI_DIR").unwrap_or_else(|_| "web".to_string());
    let static_service =
        get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));
    let app = router(state).fallback_service(static_service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Gateway listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn internal_err<E: std::fmt::Display>(e: E) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn api_err(e: ApiError) -> HandlerError {
    let status = match &e {
        ApiError::MissingApiKey | ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
        ApiError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        ApiError::Http { .. }
        | ApiError::Schema { .. }
        | ApiError::NoData { .. }
        | ApiError::Transport(_) => StatusCode::BAD_GATEWAY,
        ApiError::Decode(_) | ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

#[derive(Serialize, Debug)]
struct ConfigState {
    api_base: String,
    api_key: Option<String>,
    has_key: bool,
    text_model: String,
    image_model: String,
    video_model: String,
    upscale_model: String,
    telemetry_enabled: bool,
    malformed_events: u64,
}

#[derive(Deserialize, Debug, Default)]
struct ConfigInput {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
    #[serde(default)]
    text_model: Option<String>,
    #[serde(default)]
    image_model: Option<String>,
    #[serde(default)]
    video_model: Option<String>,
    #[serde(default)]
    upscale_model: Option<String>,
    #[serde(default)]
    telemetry_enabled: Option<bool>,
}

fn build_config_state(state: &AppState) -> Result<ConfigState, HandlerError> {
    let session = state.session()?;
    let conn = state.conn()?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).map_err(internal_err)?;
    Ok(ConfigState {
        api_base: session.api_base.clone(),
        api_key: session.masked_key(),
        has_key: session.api_key.is_some(),
        text_model: session.text_model,
        image_model: session.image_model,
        video_model: session.video_model,
        upscale_model: session.upscale_model,
        telemetry_enabled,
        malformed_events: telemetry::malformed_events(),
    })
}

/**
 * \brief 获取当前配置（key 仅回显首尾）。
 */
async fn get_config(State(state): State<AppState>) -> Result<Json<ConfigState>, HandlerError> {
    Ok(Json(build_config_state(&state)?))
}

/**
 * \brief 更新配置；未提供的字段保持不变。
 */
async fn set_config(
    State(state): State<AppState>,
    Json(input): Json<ConfigInput>,
) -> Result<Json<ConfigState>, HandlerError> {
    let mut session = state.session()?;
    if let Some(key) = input.api_key {
        session.api_key = Some(key.trim().to_string()).filter(|k| !k.is_empty());
    }
    if let Some(base) = input.api_base.filter(|b| !b.trim().is_empty()) {
        session.api_base = base.trim().trim_end_matches('/').to_string();
    }
    if let Some(m) = input.text_model {
        session.text_model = m;
    }
    if let Some(m) = input.image_model {
        session.image_model = m;
    }
    if let Some(m) = input.video_model {
        session.video_model = m;
    }
    if let Some(m) = input.upscale_model {
        session.upscale_model = m;
    }
    state.replace_session(session)?;
    if let Some(enabled) = input.telemetry_enabled {
        db::set_telemetry_enabled(&state.conn()?, enabled).map_err(internal_err)?;
        telemetry::set_enabled(enabled);
    }
    telemetry::log_event("server.config", "updated");
    Ok(Json(build_config_state(&state)?))
}

/**
 * \brief 清除已保存的 API Key。
 */
async fn clear_config(State(state): State<AppState>) -> Result<Json<ConfigState>, HandlerError> {
    let mut session = state.session()?;
    session.api_key = None;
    state.replace_session(session)?;
    telemetry::log_event("server.config", "api key cleared");
    Ok(Json(build_config_state(&state)?))
}

async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let models = state.client()?.list_models().await.map_err(api_err)?;
    Ok(Json(serde_json::json!({ "models": models })))
}

async fn capabilities(
    State(state): State<AppState>,
) -> Result<Json<crate::models::Capabilities>, HandlerError> {
    let client = state.client()?;
    let caps = client.probe_capabilities().await.map_err(api_err)?;
    Ok(Json(caps))
}

/**
 * \brief 健康检查：尝试列出模型并返回状态。
 */
async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let session = state.session()?;
    match state.client()?.list_models().await {
        Ok(list) => Ok(Json(serde_json::json!({
            "ok": true,
            "base": session.api_base,
            "models": list.len(),
            "active_streams": state.streams.active(),
        }))),
        Err(e) => Ok(Json(serde_json::json!({
            "ok": false,
            "base": session.api_base,
            "auth": e.is_auth(),
            "error": e.to_string(),
        }))),
    }
}

#[derive(Deserialize, Debug)]
struct ChatQuery {
    /** \brief 会话ID（可选，缺省时新建） */
    chat_id: Option<i64>,
    /** \brief 用户发送的消息 */
    prompt: String,
    /** \brief 模型（可选，缺省使用配置中的文本模型） */
    model: Option<String>,
    /** \brief 系统指令（可选） */
    system: Option<String>,
    /** \brief 调用方指定的流 ID，用于之后取消 */
    stream_id: Option<String>,
}

/**
 * \brief 找到或新建会话，写入用户消息并组装带历史的请求。
 */
fn prepare_chat(state: &AppState, q: &ChatQuery) -> Result<(i64, ChatRequest), HandlerError> {
    let session = state.session()?;
    let conn = state.conn()?;

    let chat_id = match q.chat_id {
        Some(id) => {
            db::get_chat(&conn, id)
                .map_err(internal_err)?
                .ok_or_else(|| (StatusCode::NOT_FOUND, format!("chat {} not found", id)))?;
            id
        }
        None => {
            let title: String = q.prompt.chars().take(40).collect();
            let model = q.model.clone().unwrap_or_else(|| session.text_model.clone());
            db::create_chat(&conn, &title, &model).map_err(internal_err)?
        }
    };
    let model = match q.model.clone() {
        Some(m) => m,
        None => db::get_chat(&conn, chat_id)
            .map_err(internal_err)?
            .map(|c| c.model)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| session.text_model.clone()),
    };

    db::insert_message(&conn, chat_id, Role::User, &q.prompt).map_err(internal_err)?;
    let history = db::load_messages(&conn, chat_id).map_err(internal_err)?;
    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(sys) = q.system.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(ChatMessage::system(sys));
    }
    messages.extend(history);
    Ok((chat_id, ChatRequest::new(model, messages)))
}

fn persist_reply(db_path: &std::path::Path, chat_id: i64, text: &str) -> bool {
    let stored = db::open_db(db_path)
        .and_then(|conn| db::insert_message(&conn, chat_id, Role::Assistant, text));
    match stored {
        Ok(_) => true,
        Err(e) => {
            telemetry::log_error(
                "server.chat",
                &format!("chat_id={} store reply failed: {:#}", chat_id, e),
            );
            false
        }
    }
}

/**
 * \brief 聊天 SSE 流接口：GET /api/chat/sse?prompt=...&chat_id=...
 * \details 事件顺序：meta → 若干 data 增量 → error 或 done。
 * 客户端断开连接等同于取消；重复的 stream_id 返回 409。
 */
async fn chat_sse(
    State(state): State<AppState>,
    Query(q): Query<ChatQuery>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, HandlerError> {
    if q.prompt.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "prompt must not be empty".into()));
    }
    let client = state.client()?;

    let stream_id = q
        .stream_id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| state.streams.next_id());
    let handle = state.streams.register(&stream_id).ok_or_else(|| {
        (
            StatusCode::CONFLICT,
            format!("stream {} is already active", stream_id),
        )
    })?;
    let (chat_id, req) = match prepare_chat(&state, &q) {
        Ok(prepared) => prepared,
        Err(e) => {
            state.streams.remove(&handle);
            return Err(e);
        }
    };

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let _ = tx.send(Ok(Event::default().event("meta").data(
        serde_json::json!({ "chat_id": chat_id, "stream_id": stream_id, "model": req.model })
            .to_string(),
    )));

    telemetry::log_event(
        "server.chat",
        &format!(
            "chat_id={} model={} stream_id={} prompt_len={}",
            chat_id,
            req.model,
            stream_id,
            q.prompt.len()
        ),
    );

    let db_path = state.db_path.clone();
    let registry = state.streams.clone();
    tokio::spawn(async move {
        let delta_tx = tx.clone();
        let cancel = handle.token.clone();
        let upstream = client.stream_chat_with(&req, &cancel, |delta| {
            let _ = delta_tx.send(Ok(Event::default().data(delta)));
        });
        tokio::pin!(upstream);
        let result = tokio::select! {
            result = &mut upstream => result,
            _ = tx.closed() => {
                telemetry::log_event(
                    "server.chat",
                    &format!("stream_id={} client disconnected", handle.id),
                );
                cancel.cancel();
                upstream.await
            }
        };
        registry.remove(&handle);

        match result {
            Ok(completion) => {
                if !completion.text.is_empty() {
                    let _ = persist_reply(&db_path, chat_id, &completion.text);
                }
                if completion.finish == Finish::Cancelled {
                    telemetry::log_event(
                        "server.chat",
                        &format!("stream_id={} cancelled", handle.id),
                    );
                }
                let _ = tx.send(Ok(Event::default().event("done").data(
                    serde_json::json!({
                        "finish": completion.finish,
                        "malformed": completion.malformed,
                    })
                    .to_string(),
                )));
            }
            Err(e) => {
                telemetry::log_error("server.chat", &format!("stream failed: {}", e));
                let _ = tx.send(Ok(Event::default().event("error").data(e.to_string())));
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

/**
 * \brief 用户触发的停止：取消指定流。
 */
async fn cancel_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    if !state.streams.cancel(&id) {
        return Err((StatusCode::NOT_FOUND, format!("stream {} not active", id)));
    }
    telemetry::log_event("server.stream", &format!("cancel stream_id={}", id));
    Ok(Json(serde_json::json!({ "cancelled": id })))
}

#[derive(Serialize, Debug)]
struct ChatSummaryDto {
    id: i64,
    title: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct ChatListResponse {
    chats: Vec<ChatSummaryDto>,
}

#[derive(Serialize, Debug)]
struct ChatMessageDto {
    id: i64,
    role: Role,
    content: String,
}

#[derive(Serialize, Debug)]
struct ChatMessagesResponse {
    chat_id: i64,
    messages: Vec<ChatMessageDto>,
}

fn chat_list(conn: &rusqlite::Connection) -> Result<ChatListResponse, HandlerError> {
    let chats = db::list_chats(conn).map_err(internal_err)?;
    Ok(ChatListResponse {
        chats: chats
            .into_iter()
            .map(|c| ChatSummaryDto {
                id: c.id,
                title: c.title,
                model: c.model,
            })
            .collect(),
    })
}

/**
 * \brief 列出历史会话。
 */
async fn list_chats(State(state): State<AppState>) -> Result<Json<ChatListResponse>, HandlerError> {
    Ok(Json(chat_list(&state.conn()?)?))
}

/**
 * \brief 获取指定会话的消息。
 */
async fn get_chat_messages(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ChatMessagesResponse>, HandlerError> {
    let conn = state.conn()?;
    let messages = db::load_messages_with_meta(&conn, id).map_err(internal_err)?;
    Ok(Json(ChatMessagesResponse {
        chat_id: id,
        messages: messages
            .into_iter()
            .map(|m| ChatMessageDto {
                id: m.id,
                role: m.role,
                content: m.content,
            })
            .collect(),
    }))
}

/**
 * \brief 删除指定会话。
 */
async fn remove_chat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ChatListResponse>, HandlerError> {
    let conn = state.conn()?;
    db::delete_chat(&conn, id).map_err(internal_err)?;
    telemetry::log_event("server.chat", &format!("delete chat id={}", id));
    Ok(Json(chat_list(&conn)?))
}

#[derive(Deserialize, Debug)]
struct CompareRequest {
    models: Vec<String>,
    prompt: String,
    #[serde(default)]
    system: Option<String>,
}

/**
 * \brief 多模型对比：各模型独立结算。
 */
async fn compare(
    State(state): State<AppState>,
    Json(payload): Json<CompareRequest>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    if payload.models.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "models must not be empty".into()));
    }
    let client = state.client()?;
    let slots = fanout::compare_models(
        &client,
        &payload.models,
        &[ChatMessage::user(payload.prompt)],
        payload.system.as_deref(),
    )
    .await;
    Ok(Json(serde_json::json!({ "results": slots })))
}

#[derive(Deserialize, Debug)]
struct ImageInput {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    aspect: Option<String>,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    style: Option<String>,
    #[serde(default)]
    steps: Option<u32>,
}

#[derive(Serialize, Debug)]
struct MediaResponse {
    media: MediaPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
}

async fn generate_image(
    State(state): State<AppState>,
    Json(input): Json<ImageInput>,
) -> Result<Json<MediaResponse>, HandlerError> {
    let session = state.session()?;
    let aspect_label = input.aspect.as_deref().unwrap_or("1:1");
    let aspect = AspectRatio::find(aspect_label)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown aspect {}", aspect_label)))?;
    let tier_label = input.tier.as_deref().unwrap_or("1K");
    let tier = ResolutionTier::find(tier_label)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown tier {}", tier_label)))?;
    let dims = aspect.scaled(&tier);
    let req = ImageRequest {
        model: input.model.unwrap_or(session.image_model),
        prompt: input.prompt,
        width: dims.width,
        height: dims.height,
        steps: input.steps,
        format: Some("png".to_string()),
        style: input.style,
    };
    let media = state
        .client()?
        .generate_image(&req)
        .await
        .map_err(api_err)?;
    Ok(Json(MediaResponse {
        media,
        width: Some(dims.width),
        height: Some(dims.height),
    }))
}

#[derive(Deserialize, Debug)]
struct VideoInput {
    image: String,
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    duration_seconds: Option<u32>,
    #[serde(default)]
    aspect: Option<String>,
}

async fn generate_video(
    State(state): State<AppState>,
    Json(input): Json<VideoInput>,
) -> Result<Json<MediaResponse>, HandlerError> {
    let session = state.session()?;
    let aspect_label = input.aspect.as_deref().unwrap_or("16:9");
    let aspect = AspectRatio::find(aspect_label)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown aspect {}", aspect_label)))?;
    let req = VideoRequest {
        model: input.model.unwrap_or(session.video_model),
        image: input.image,
        prompt: input.prompt,
        duration_seconds: input.duration_seconds.unwrap_or(5),
        width: aspect.width,
        height: aspect.height,
    };
    let media = state
        .client()?
        .image_to_video(&req)
        .await
        .map_err(api_err)?;
    Ok(Json(MediaResponse {
        media,
        width: Some(req.width),
        height: Some(req.height),
    }))
}

#[derive(Deserialize, Debug)]
struct UpscaleInput {
    image: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    scale: Option<u32>,
    #[serde(default)]
    prompt: Option<String>,
}

async fn upscale(
    State(state): State<AppState>,
    Json(input): Json<UpscaleInput>,
) -> Result<Json<MediaResponse>, HandlerError> {
    let session = state.session()?;
    let req = UpscaleRequest {
        model: input.model.unwrap_or(session.upscale_model),
        image: input.image,
        scale: input.scale.unwrap_or(2),
        prompt: input.prompt,
    };
    let media = state
        .client()?
        .upscale_image(&req)
        .await
        .map_err(api_err)?;
    Ok(Json(MediaResponse {
        media,
        width: None,
        height: None,
    }))
}

/**
 * \brief 在后台启动网关并返回实际监听地址（addr 可用端口 0）。
 */
pub async fn spawn(state: AppState, addr: &str) -> Result<std::net::SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            telemetry::log_error("server", &format!("serve failed: {}", e));
        }
    });
    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use axum::{
        body::{Body, Bytes},
        response::{IntoResponse, Response},
    };
    use serde_json::{json, Value};

    fn temp_db(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "promptdeck-{}-{}-{}.db",
            name,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn provider_router(slow: bool) -> Router {
        Router::new().route(
            "/chat/completions",
            axum::routing::post(move |Json(body): Json<Value>| async move {
                if body["stream"] != json!(true) {
                    let model = body["model"].as_str().unwrap_or("").to_string();
                    if model == "bad" {
                        return (StatusCode::NOT_FOUND, r#"{"error":{"message":"x"}}"#)
                            .into_response();
                    }
                    return Json(json!({"choices": [{"message": {"content": model}}]}))
                        .into_response();
                }
                let first = futures_util::stream::iter(vec![Ok::<_, Infallible>(
                    Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n"),
                )]);
                let rest = futures_util::stream::once(async move {
                    if slow {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    Ok::<_, Infallible>(Bytes::from_static(b"data: [DONE]\n"))
                });
                use futures_util::StreamExt;
                Response::builder()
                    .body(Body::from_stream(first.chain(rest)))
                    .unwrap()
            }),
        )
    }

    async fn gateway(name: &str, slow: bool) -> (MockProvider, std::net::SocketAddr, AppState) {
        let mock = MockProvider::start(provider_router(slow)).await;
        let state =
            AppState::with_session(temp_db(name), Session::new(&mock.base_url(), "sk")).unwrap();
        let addr = spawn(state.clone(), "127.0.0.1:0").await.unwrap();
        (mock, addr, state)
    }

    async fn wait_for_active(state: &AppState, n: usize) -> bool {
        for _ in 0..200 {
            if state.streams().active() == n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn test_registry_cancel_and_remove() {
        let reg = StreamRegistry::default();
        let a = reg.next_id();
        let b = reg.next_id();
        assert_ne!(a, b);
        let handle = reg.register(&a).unwrap();
        assert_eq!(reg.active(), 1);
        assert!(reg.cancel(&a));
        assert!(handle.token.is_cancelled());
        assert!(!reg.cancel(&a));
        let hb = reg.register(&b).unwrap();
        reg.remove(&hb);
        assert_eq!(reg.active(), 0);
    }

    #[test]
    fn test_registry_rejects_duplicate_and_keeps_newer_entry() {
        let reg = StreamRegistry::default();
        let first = reg.register("dup").unwrap();
        assert!(reg.register("dup").is_none());

        assert!(reg.cancel("dup"));
        let second = reg.register("dup").unwrap();
        reg.remove(&first);
        assert_eq!(reg.active(), 1);
        assert!(!second.token.is_cancelled());
        reg.remove(&second);
        assert_eq!(reg.active(), 0);
    }

    #[test]
    fn test_persist_reply_reports_storage_failure() {
        let unmigrated = temp_db("unmigrated");
        assert!(!persist_reply(&unmigrated, 1, "hello"));
        assert!(!persist_reply(&unmigrated.join("missing").join("x.db"), 1, "hello"));

        let path = temp_db("persist");
        let conn = db::open_db(&path).unwrap();
        db::migrate(&conn).unwrap();
        let chat_id = db::create_chat(&conn, "t", "m").unwrap();
        assert!(persist_reply(&path, chat_id, "hello"));
        assert_eq!(db::load_messages(&conn, chat_id).unwrap()[0].content, "hello");
    }

    #[tokio::test]
    async fn test_duplicate_stream_id_is_conflict() {
        let (_mock, addr, state) = gateway("dup", true).await;
        let url = format!("http://{}/api/chat/sse?prompt=hello&stream_id=dup", addr);
        let first_url = url.clone();
        let first = tokio::spawn(async move {
            reqwest::get(first_url).await.unwrap().text().await.unwrap()
        });
        assert!(wait_for_active(&state, 1).await);

        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/streams/dup/cancel", addr))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let body = tokio::time::timeout(Duration::from_secs(10), first)
            .await
            .unwrap()
            .unwrap();
        assert!(body.contains("\"finish\":\"cancelled\""));

        let conn = db::open_db(&state.db_path).unwrap();
        assert_eq!(db::list_chats(&conn).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_upstream() {
        let (_mock, addr, state) = gateway("disconnect", true).await;
        let mut resp = reqwest::get(format!("http://{}/api/chat/sse?prompt=hello", addr))
            .await
            .unwrap();
        let first = resp.chunk().await.unwrap();
        assert!(first.is_some());
        assert_eq!(state.streams().active(), 1);
        drop(resp);

        assert!(wait_for_active(&state, 0).await);
    }

    #[tokio::test]
    async fn test_video_without_endpoint_is_not_implemented() {
        let (_mock, addr, _state) = gateway("video", false).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/video", addr))
            .json(&json!({"image": "QUJD", "prompt": "slow pan"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_IMPLEMENTED);
        assert!(resp.text().await.unwrap().contains("image-to-video"));
    }

    #[tokio::test]
    async fn test_chat_sse_streams_and_persists() {
        let (_mock, addr, state) = gateway("sse", false).await;
        let body = reqwest::get(format!("http://{}/api/chat/sse?prompt=hello", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("event: meta"));
        assert!(body.contains("data: Hi"));
        assert!(body.contains("event: done"));

        let conn = db::open_db(&state.db_path).unwrap();
        let chats = db::list_chats(&conn).unwrap();
        assert_eq!(chats.len(), 1);
        let msgs = db::load_messages(&conn, chats[0].id).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "Hi");
    }

    #[tokio::test]
    async fn test_cancel_endpoint_stops_stream() {
        let (_mock, addr, state) = gateway("cancel", true).await;
        let url = format!("http://{}/api/chat/sse?prompt=hello&stream_id=stop-me", addr);
        let reader = tokio::spawn(async move {
            reqwest::get(url).await.unwrap().text().await.unwrap()
        });

        assert!(wait_for_active(&state, 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/streams/stop-me/cancel", addr))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        let body = tokio::time::timeout(Duration::from_secs(10), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(body.contains("\"finish\":\"cancelled\""));
        assert_eq!(state.streams().active(), 0);
    }

    #[tokio::test]
    async fn test_compare_settles_independently() {
        let (_mock, addr, _state) = gateway("compare", false).await;
        let v: Value = reqwest::Client::new()
            .post(format!("http://{}/api/compare", addr))
            .json(&json!({"models": ["a", "bad", "c"], "prompt": "hi"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let results = v["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["value"], "a");
        assert_eq!(results[1]["error"], "x");
        assert_eq!(results[2]["value"], "c");
    }

    #[tokio::test]
    async fn test_config_masks_and_clears_key() {
        let (_mock, addr, _state) = gateway("config", false).await;
        let http = reqwest::Client::new();
        let v: Value = http
            .post(format!("http://{}/api/config", addr))
            .json(&json!({"api_key": "sk-1234567890abcd"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["has_key"], true);
        assert_eq!(v["api_key"], "sk-1…abcd");

        let v: Value = http
            .delete(format!("http://{}/api/config", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["has_key"], false);

        let resp = http
            .post(format!("http://{}/api/compare", addr))
            .json(&json!({"models": ["a"], "prompt": "hi"}))
            .send()
            .await
            .unwrap();
        let v: Value = resp.json().await.unwrap();
        assert!(v["results"][0]["error"]
            .as_str()
            .unwrap()
            .contains("No API key configured"));
    }
}
