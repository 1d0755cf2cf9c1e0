use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use parlay_config::Config;
use parlay_contracts::{
    is_ai_sender, Chatroom, LeaveWaitingRoomRequest, MatchNotice, MessageRecord,
    SendMessageRequest, SurveyRecord, SurveySubmissionRequest, WaitingEntrant, WaitingState,
    WaitingStatusResponse, AI_SENDER_PREFIX,
};
use parlay_kernel::{select_pair, TimingProfile};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

mod clients;
mod store;
mod turns;

pub use clients::{
    CachedTextProvider, GeneratorBackend, NotifierBackend, RecordingNotifier, ScriptedGenerator,
};
pub use store::{MemoryStore, SqliteStore, StoreBackend};
pub use turns::{dispatch_ai_turn, run_ai_turn, RoomLocks, SkipReason, TurnOutcome};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::from_config(cfg)?;
    Ok(build_router(state))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/waiting-room/join", post(join_waiting_room))
        .route("/v1/waiting-room/leave", post(leave_waiting_room))
        .route("/v1/waiting-room/{user_id}/status", get(waiting_status))
        .route("/v1/messages", post(post_message))
        .route("/v1/surveys", post(submit_survey))
        .route("/v1/time", get(current_time))
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub store: Arc<Mutex<StoreBackend>>,
    pub notifier: Arc<NotifierBackend>,
    pub generator: Arc<GeneratorBackend>,
    pub generator_credential: Arc<CachedTextProvider>,
    pub instructions: Arc<CachedTextProvider>,
    pub room_locks: Arc<RoomLocks>,
}

impl AppState {
    pub fn from_config(cfg: Config) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };

        let realtime_key = std::env::var(&cfg.realtime.api_key_env).map_err(|_| {
            format!(
                "environment variable {} is not set",
                cfg.realtime.api_key_env
            )
        })?;
        let notifier = NotifierBackend::http(&cfg.realtime.endpoint, &realtime_key)?;
        let generator =
            GeneratorBackend::http(&cfg.generator.endpoint, &cfg.generator.model, cfg.generator.timeout_ms)?;

        Ok(Self::with_backends(
            cfg,
            Arc::new(Mutex::new(store)),
            notifier,
            generator,
        ))
    }

    /// Wire a state over explicit backends; tests use this with the memory
    /// store, recording notifier and scripted generator.
    pub fn with_backends(
        cfg: Config,
        store: Arc<Mutex<StoreBackend>>,
        notifier: NotifierBackend,
        generator: GeneratorBackend,
    ) -> Self {
        let ttl = Duration::from_millis(cfg.generator.cache_ttl_ms);
        let generator_credential =
            Arc::new(CachedTextProvider::env(&cfg.generator.api_key_env, ttl));
        let instructions =
            Arc::new(CachedTextProvider::file(&cfg.generator.instructions_path, ttl));
        Self {
            cfg,
            store,
            notifier: Arc::new(notifier),
            generator: Arc::new(generator),
            generator_credential,
            instructions,
            room_locks: Arc::new(RoomLocks::default()),
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn timing_profile(timing: &parlay_config::Timing) -> TimingProfile {
    TimingProfile {
        typing_speed_cps: timing.typing_speed_cps,
        min_thinking_seconds: timing.min_thinking_seconds,
        max_random_thinking_seconds: timing.max_random_thinking_seconds,
        max_delay_seconds: timing.max_delay_seconds,
    }
}

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"code": "validation_error", "message": message}})),
    )
}

fn internal_error(message: String) -> ApiError {
    tracing::error!(error = %message, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": {"code": "store_error", "message": message}})),
    )
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn current_time() -> Json<Value> {
    Json(json!({ "currentTime": now_rfc3339() }))
}

async fn join_waiting_room(
    State(state): State<AppState>,
) -> Result<Json<WaitingStatusResponse>, ApiError> {
    let entrant = WaitingEntrant {
        id: Uuid::new_v4().to_string(),
        joined_at: now_rfc3339(),
    };
    {
        let mut store = state.store.lock().await;
        store.insert_waiting(&entrant).map_err(internal_error)?;
    }
    tracing::info!(user_id = %entrant.id, "entrant joined waiting room");

    // Each insertion triggers one pairing pass; store failures propagate so
    // the caller retries (safe: claims are conditional deletes).
    run_matchmaking_pass(&state).await.map_err(internal_error)?;

    Ok(Json(WaitingStatusResponse {
        user_id: entrant.id,
        status: WaitingState::Waiting,
        chatroom_id: None,
        wait_time: 0,
    }))
}

async fn leave_waiting_room(
    State(state): State<AppState>,
    Json(req): Json<LeaveWaitingRoomRequest>,
) -> Result<Json<Value>, ApiError> {
    let removed = {
        let mut store = state.store.lock().await;
        store
            .remove_waiting_if_present(&req.user_id)
            .map_err(internal_error)?
    };
    Ok(Json(json!({ "removed": removed })))
}

async fn waiting_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<WaitingStatusResponse>, ApiError> {
    let store = state.store.lock().await;
    if store.waiting_contains(&user_id).map_err(internal_error)? {
        return Ok(Json(WaitingStatusResponse {
            user_id,
            status: WaitingState::Waiting,
            chatroom_id: None,
            wait_time: 0,
        }));
    }
    if let Some(room) = store
        .find_chatroom_by_participant(&user_id)
        .map_err(internal_error)?
    {
        return Ok(Json(WaitingStatusResponse {
            user_id,
            status: WaitingState::Matched,
            chatroom_id: Some(room.id),
            wait_time: 0,
        }));
    }
    Ok(Json(WaitingStatusResponse {
        user_id,
        status: WaitingState::NotFound,
        chatroom_id: None,
        wait_time: 0,
    }))
}

async fn post_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessageRecord>, ApiError> {
    if req.chatroom_id.trim().is_empty()
        || req.text.trim().is_empty()
        || req.sender_id.trim().is_empty()
    {
        return Err(bad_request("chatroomId, text and senderId are required"));
    }

    let message = MessageRecord {
        id: Uuid::new_v4().to_string(),
        chatroom_id: req.chatroom_id.clone(),
        sender_id: req.sender_id.clone(),
        text: req.text,
        created_at: now_rfc3339(),
    };
    {
        let mut store = state.store.lock().await;
        store.append_message(&message).map_err(internal_error)?;
    }

    // The AI turn runs on its own task: the sender's write is already
    // acknowledged and is never blocked by the typing delay.
    if !is_ai_sender(&req.sender_id) {
        let _task = dispatch_ai_turn(state.clone(), req.chatroom_id);
    }

    Ok(Json(message))
}

async fn submit_survey(
    State(state): State<AppState>,
    Json(req): Json<SurveySubmissionRequest>,
) -> Result<Json<SurveyRecord>, ApiError> {
    let required = [
        req.chatroom_id.trim(),
        req.user_id.trim(),
        req.bot_guess.trim(),
        req.llm_knowledge.trim(),
        req.chatbot_frequency.trim(),
        req.education.trim(),
    ];
    if required.iter().any(|field| field.is_empty()) || req.age == 0 {
        return Err(bad_request("missing required survey fields"));
    }

    let record = SurveyRecord {
        id: Uuid::new_v4().to_string(),
        timestamp: now_rfc3339(),
        chatroom_id: req.chatroom_id,
        user_id: req.user_id,
        bot_guess: req.bot_guess,
        reasoning: req.reasoning,
        llm_knowledge: req.llm_knowledge,
        chatbot_frequency: req.chatbot_frequency,
        age: req.age,
        education: req.education,
    };
    {
        let mut store = state.store.lock().await;
        store.put_survey(&record).map_err(internal_error)?;
    }
    Ok(Json(record))
}

/// One pairing pass over the waiting pool. The snapshot may be stale; both
/// entrants are claimed with conditional deletes before anything is created,
/// so a lost race abandons the pass instead of double-pairing.
pub async fn run_matchmaking_pass(state: &AppState) -> Result<Option<Chatroom>, String> {
    let pool = { state.store.lock().await.list_waiting()? };
    let Some((first, second)) = select_pair(&pool) else {
        return Ok(None);
    };

    let chatroom = {
        let mut store = state.store.lock().await;
        if !store.remove_waiting_if_present(&first.id)? {
            // Another pass already claimed the head of the queue.
            return Ok(None);
        }
        if !store.remove_waiting_if_present(&second.id)? {
            // Contested: put the first entrant back with its original join
            // time and let a later pass retry.
            store.insert_waiting(&first)?;
            return Ok(None);
        }

        let chatroom = Chatroom {
            id: Uuid::new_v4().to_string(),
            participants: vec![
                first.id.clone(),
                second.id.clone(),
                format!("{AI_SENDER_PREFIX}{}", Uuid::new_v4()),
            ],
            created_at: now_rfc3339(),
        };
        store.put_chatroom(&chatroom)?;
        chatroom
    };

    tracing::info!(
        chatroom_id = %chatroom.id,
        first = %first.id,
        second = %second.id,
        "paired waiting entrants"
    );

    // Match notices are best-effort: the pairing stands even if delivery
    // fails, and retry is left to the platform.
    for (recipient, other) in [(&first, &second), (&second, &first)] {
        let notice = MatchNotice {
            user_id: recipient.id.clone(),
            matched_user_id: other.id.clone(),
            chatroom_id: chatroom.id.clone(),
        };
        if let Err(err) = state.notifier.notify_match(&notice).await {
            tracing::warn!(user_id = %recipient.id, error = %err, "match notice delivery failed");
        }
    }

    Ok(Some(chatroom))
}
