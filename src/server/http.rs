use anyhow::Result;
use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{sync::Arc, time::Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use super::extract::AuthUser;
use crate::auth::{
    IdentityProvider, LoginService, OAuthCoordinator, RedirectPolicy, SessionTokens, StateStore,
    TokenManager,
};
use crate::config::Config;
use crate::crypto::{CredentialCipher, CredentialVault};
use crate::error::Error;
use crate::metrics::METRICS;
use crate::queue::QueueService;
use crate::sessions::{SessionDetails, SessionService};
use crate::store::{CredentialRepository, MemoryStore, UserRepository};
use crate::types::{Id, QueueItem, Session, User, VoteType};

type ApiResult<T> = std::result::Result<T, Error>;

/// HTTP server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub users: Arc<dyn UserRepository>,
    pub sessions: SessionService,
    pub queue: QueueService,
    pub login: LoginService,
    pub tokens: SessionTokens,
    pub token_manager: TokenManager,
    pub states: Arc<StateStore>,
}

impl AppState {
    /// Wire every service over one store and one identity provider
    pub fn new(config: Config, store: MemoryStore, provider: Arc<dyn IdentityProvider>) -> Result<Self> {
        let cipher = Arc::new(CredentialCipher::new(config.security.encryption_secret.as_bytes())?);
        let credentials: Arc<dyn CredentialRepository> =
            Arc::new(CredentialVault::new(store.clone(), cipher));

        let users: Arc<dyn UserRepository> = Arc::new(store.clone());
        let store = Arc::new(store);

        let states = Arc::new(StateStore::new(
            config.oauth.state_ttl(),
            config.oauth.max_pending_states,
        ));
        let tokens = SessionTokens::from_config(&config.security);

        let sessions = SessionService::new(store.clone(), credentials.clone());
        let queue = QueueService::new(store.clone(), store.clone(), store);
        let coordinator = OAuthCoordinator::new(provider.clone(), states.clone());
        let login = LoginService::new(
            coordinator,
            provider.clone(),
            users.clone(),
            sessions.clone(),
            credentials.clone(),
            tokens.clone(),
            RedirectPolicy::from_config(&config.oauth),
        );
        let token_manager =
            TokenManager::new(credentials, provider, config.oauth.refresh_buffer_secs);

        Ok(Self {
            config: Arc::new(config),
            users,
            sessions,
            queue,
            login,
            tokens,
            token_manager,
            states,
        })
    }
}

/// Build the application router
pub fn app(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_handler))
        // Metrics (Prometheus)
        .route("/metrics", get(metrics_handler))
        // Login flow
        .route("/auth/login", get(login_handler))
        .route("/auth/callback", get(callback_handler))
        .route("/me", get(me_handler))
        // Sessions
        .route("/sessions", post(create_session_handler))
        .route(
            "/sessions/:slug",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route(
            "/sessions/:slug/members",
            post(join_session_handler).delete(leave_session_handler),
        )
        .route(
            "/sessions/:slug/queue",
            get(list_queue_handler).post(enqueue_handler),
        )
        .route("/sessions/:slug/provider-token", get(provider_token_handler))
        .route("/users/:id/queue", get(list_user_queue_handler))
        // Queue items
        .route(
            "/queue/:id",
            get(get_queue_item_handler)
                .patch(update_queue_item_handler)
                .delete(delete_queue_item_handler),
        )
        .route("/queue/:id/vote", put(vote_handler).delete(retract_vote_handler))
        // Middleware
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start HTTP server
pub async fn serve(state: AppState) -> Result<()> {
    let bind = state.config.server.bind.clone();
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("HTTP server listening on {}", bind);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    METRICS
        .request_duration_seconds
        .with_label_values(&[&endpoint, &method])
        .observe(start.elapsed().as_secs_f64());
    METRICS
        .requests_total
        .with_label_values(&[&endpoint, &method, response.status().as_str()])
        .inc();

    response
}

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": crate::VERSION,
        "pending_logins": state.states.len(),
    }))
}

/// GET /metrics (Prometheus format)
pub async fn metrics_handler() -> Response {
    match METRICS.render() {
        Ok(body) => body.into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    pub client_state: Option<String>,
    pub redirect_url: Option<String>,
}

/// GET /auth/login - Redirect to the provider
pub async fn login_handler(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> Redirect {
    match state.login.start(params.client_state, params.redirect_url) {
        Ok(url) => Redirect::temporary(&url),
        Err(e) => {
            warn!("Login could not start: {}", e);
            Redirect::temporary(state.login.failure_url())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// GET /auth/callback - Provider redirect target
pub async fn callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(reason) = &params.error {
        info!("Provider reported authorization error: {}", reason);
    }

    let raw_state = params.state.unwrap_or_default();
    match state.login.finish(params.code.as_deref(), &raw_state).await {
        Ok(destination) => Redirect::temporary(&destination).into_response(),
        Err(Error::InvalidState) => Error::InvalidState.into_response(),
        Err(_) => Redirect::temporary(state.login.failure_url()).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: User,
    pub sessions: Vec<Session>,
}

/// GET /me
pub async fn me_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<MeResponse>> {
    let user = state.users.get_user(user_id).await?;
    let sessions = state.users.get_user_sessions(user_id).await?;
    Ok(Json(MeResponse { user, sessions }))
}

/// POST /sessions
pub async fn create_session_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state.sessions.create(user_id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /sessions/:slug
pub async fn get_session_handler(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(slug): Path<String>,
) -> ApiResult<Json<SessionDetails>> {
    Ok(Json(state.sessions.details(&slug).await?))
}

/// DELETE /sessions/:slug - Host only
pub async fn delete_session_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(slug): Path<String>,
) -> ApiResult<StatusCode> {
    state.sessions.teardown(&slug, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /sessions/:slug/members - Join
pub async fn join_session_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(slug): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.sessions.join(&slug, user_id).await?))
}

/// DELETE /sessions/:slug/members - Leave
pub async fn leave_session_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(slug): Path<String>,
) -> ApiResult<StatusCode> {
    state.sessions.leave(&slug, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ListQueueParams {
    #[serde(default)]
    pub prioritize: bool,
    pub user_id: Option<Id>,
}

/// GET /sessions/:slug/queue
pub async fn list_queue_handler(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(slug): Path<String>,
    Query(params): Query<ListQueueParams>,
) -> ApiResult<Json<Vec<QueueItem>>> {
    let session = state.sessions.get(&slug).await?;
    let items = state
        .queue
        .list(session.id, params.user_id, params.prioritize)
        .await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct RankParams {
    #[serde(default)]
    pub prioritize: bool,
}

/// GET /users/:id/queue - A user's submissions in sessions the caller shares
pub async fn list_user_queue_handler(
    State(state): State<AppState>,
    AuthUser(viewer_id): AuthUser,
    Path(user_id): Path<Id>,
    Query(params): Query<RankParams>,
) -> ApiResult<Json<Vec<QueueItem>>> {
    state.users.get_user(user_id).await?;
    let items = state
        .queue
        .list_by_user(user_id, viewer_id, params.prioritize)
        .await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct TrackBody {
    pub track_uri: String,
}

/// POST /sessions/:slug/queue
pub async fn enqueue_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(slug): Path<String>,
    Json(body): Json<TrackBody>,
) -> ApiResult<(StatusCode, Json<QueueItem>)> {
    let session = state.sessions.get(&slug).await?;
    let item = state.queue.enqueue(session.id, user_id, body.track_uri).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// GET /queue/:id
pub async fn get_queue_item_handler(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(id): Path<Id>,
) -> ApiResult<Json<QueueItem>> {
    Ok(Json(state.queue.get(id).await?))
}

/// PATCH /queue/:id - Submitter only
pub async fn update_queue_item_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Id>,
    Json(body): Json<TrackBody>,
) -> ApiResult<Json<QueueItem>> {
    Ok(Json(state.queue.update_track(id, user_id, body.track_uri).await?))
}

/// DELETE /queue/:id - Submitter or host
pub async fn delete_queue_item_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Id>,
) -> ApiResult<StatusCode> {
    state.queue.remove(id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct VoteBody {
    pub vote_type: VoteType,
}

/// PUT /queue/:id/vote
pub async fn vote_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Id>,
    Json(body): Json<VoteBody>,
) -> ApiResult<Json<QueueItem>> {
    Ok(Json(state.queue.cast_vote(id, user_id, body.vote_type).await?))
}

/// DELETE /queue/:id/vote
pub async fn retract_vote_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Id>,
) -> ApiResult<Json<QueueItem>> {
    Ok(Json(state.queue.retract_vote(id, user_id).await?))
}

/// GET /sessions/:slug/provider-token - Host only
pub async fn provider_token_handler(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(slug): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.sessions.get(&slug).await?;
    if session.host_id != user_id {
        return Err(Error::Forbidden("only the host can use the provider token"));
    }

    let access_token = state
        .token_manager
        .get_access_token(user_id, session.id)
        .await?;
    let expires_in = state
        .token_manager
        .time_until_expiration(user_id, session.id)
        .await?;

    Ok(Json(json!({
        "access_token": access_token,
        "expires_in": expires_in,
    })))
}
