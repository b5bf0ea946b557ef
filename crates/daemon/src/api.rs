//! Control API
//!
//! Everything lives under `/api/v1`. Health and the login endpoints are
//! public; every other route passes through [`require_permission`], which
//! derives the required permission from the method and matched route.

use crate::auth::Principal;
use crate::controller::{Controller, Health, PeerInit, ServerInfo, SyncSummary};
use crate::permission::Permission;
use crate::pushbus::PollOutcome;
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Extension, Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wgctl_common::crypto::{encode_token, generate_token};
use wgctl_common::{Account, AccountRole, ApiKey, Error, NewPeer, PeerUpdate, PeerView};

/// Cookie carrying the session token
pub const SESSION_COOKIE: &str = "sessionId";

/// Request failure rendered as `{"error": ...}`
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not logged in")]
    Unauthenticated,
    #[error(transparent)]
    Core(#[from] Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "not logged in".to_string()),
            ApiError::Core(e) => match e {
                Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
                e @ Error::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
                e @ Error::AlreadyExists { .. } => (StatusCode::CONFLICT, e.to_string()),
                Error::Auth(reason) => {
                    warn!("Rejected request: {}", reason);
                    (StatusCode::FORBIDDEN, "forbidden".to_string())
                }
                e => {
                    error!("Request failed: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_string(),
                    )
                }
            },
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Run password hashing off the async workers
async fn run_blocking<T, F>(controller: &Arc<Controller>, f: F) -> wgctl_common::Result<T>
where
    F: FnOnce(&Controller) -> wgctl_common::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let controller = controller.clone();
    tokio::task::spawn_blocking(move || f(&controller))
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

/// Build the API router
pub fn router(controller: Arc<Controller>) -> Router {
    let public_routes = Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/prelogin", post(prelogin_handler))
        .route("/api/v1/login", post(login_handler))
        .route("/api/v1/logout", post(logout_handler));

    let protected_routes = Router::new()
        // Peers
        .route("/api/v1/peers", get(list_peers_handler))
        .route("/api/v1/peers/init", get(init_peer_handler))
        .route(
            "/api/v1/peers/:uuid",
            get(get_peer_handler)
                .put(put_peer_handler)
                .patch(patch_peer_handler)
                .delete(delete_peer_handler),
        )
        // Accounts
        .route("/api/v1/accounts", get(list_accounts_handler))
        .route(
            "/api/v1/accounts/:email",
            put(put_account_handler)
                .patch(patch_account_handler)
                .delete(delete_account_handler),
        )
        .route(
            "/api/v1/accounts/:email/password",
            patch(patch_password_handler),
        )
        // API keys
        .route("/api/v1/apikeys", get(list_api_keys_handler))
        .route("/api/v1/apikeys/init", get(init_api_key_handler))
        .route(
            "/api/v1/apikeys/:uuid",
            put(put_api_key_handler)
                .patch(patch_api_key_handler)
                .delete(delete_api_key_handler),
        )
        // Server
        .route("/api/v1/serverinfo", get(server_info_handler))
        .route("/api/v1/poll", get(poll_handler))
        .route("/api/v1/resync", post(resync_handler))
        .route_layer(middleware::from_fn_with_state(
            controller.clone(),
            require_permission,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

/// Serve the API until the controller shuts down
pub async fn serve(controller: Arc<Controller>, listen: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("Control API listening on {}", listener.local_addr()?);

    let shutdown = controller.shutdown_token().clone();
    axum::serve(listener, router(controller))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ============================================================================
// Authentication middleware
// ============================================================================

/// Authenticate the caller and check the permission for the matched route
async fn require_permission(
    State(controller): State<Arc<Controller>>,
    matched: MatchedPath,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> ApiResult<Response> {
    let permission = Permission::for_request(request.method(), matched.as_str()).ok_or_else(
        || Error::Auth(format!("no permission defined for {}", matched.as_str())),
    )?;
    let auth = controller.auth();

    // A session cookie wins; a stale one falls back to the API key header
    let session = jar.get(SESSION_COOKIE).map(|cookie| {
        auth.check_session(cookie.value()).and_then(|account| {
            auth.authorize_account(&account, &permission)?;
            Ok(Principal::Account(account))
        })
    });
    let principal = match session {
        Some(Ok(principal)) => principal,
        Some(Err(e)) => match api_key_principal(&controller, &request, &permission) {
            Some(result) => {
                debug!("Session rejected ({}), trying API key", e);
                result?
            }
            None => return Err(e.into()),
        },
        None => match api_key_principal(&controller, &request, &permission) {
            Some(result) => result?,
            None => return Err(ApiError::Unauthenticated),
        },
    };

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Authenticate the `Authorization` header, if the request carries one
fn api_key_principal(
    controller: &Controller,
    request: &Request,
    permission: &Permission,
) -> Option<wgctl_common::Result<Principal>> {
    let value = request.headers().get(header::AUTHORIZATION)?;
    Some(
        value
            .to_str()
            .map_err(|_| Error::Auth("authorization header is not ASCII".to_string()))
            .and_then(|value| {
                let token = value.strip_prefix("Bearer ").unwrap_or(value);
                controller.auth().check_api_key(token, permission)
            })
            .map(Principal::ApiKey),
    )
}

// ============================================================================
// Public handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
}

impl StatusResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            status: "ok",
            email: None,
        })
    }

    fn for_email(email: String) -> Json<Self> {
        Json(Self {
            status: "ok",
            email: Some(email),
        })
    }
}

async fn health_handler(State(controller): State<Arc<Controller>>) -> Json<Health> {
    Json(controller.health().await)
}

async fn prelogin_handler(
    State(controller): State<Arc<Controller>>,
    jar: CookieJar,
) -> ApiResult<Json<StatusResponse>> {
    let cookie = jar.get(SESSION_COOKIE).ok_or(ApiError::Unauthenticated)?;
    let account = controller.auth().check_session(cookie.value())?;
    Ok(StatusResponse::for_email(account.email))
}

async fn login_handler(
    State(controller): State<Arc<Controller>>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<StatusResponse>)> {
    if req.email.is_empty() || req.password.is_empty() {
        return Err(Error::Validation("malformed request".to_string()).into());
    }

    let session =
        run_blocking(&controller, move |c| c.auth().login(&req.email, &req.password)).await?;
    let cookie = Cookie::build((SESSION_COOKIE, session.token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict);

    Ok((jar.add(cookie), StatusResponse::for_email(session.email)))
}

async fn logout_handler(
    State(controller): State<Arc<Controller>>,
    jar: CookieJar,
) -> ApiResult<(CookieJar, Json<StatusResponse>)> {
    let cookie = jar.get(SESSION_COOKIE).ok_or(ApiError::Unauthenticated)?;
    controller.auth().logout(cookie.value())?;
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    Ok((jar, StatusResponse::ok()))
}

// ============================================================================
// Peer handlers
// ============================================================================

async fn list_peers_handler(State(controller): State<Arc<Controller>>) -> ApiResult<Json<Vec<PeerView>>> {
    Ok(Json(controller.list_peers().await?))
}

async fn init_peer_handler(State(controller): State<Arc<Controller>>) -> ApiResult<Json<PeerInit>> {
    Ok(Json(controller.init_peer()?))
}

async fn get_peer_handler(
    State(controller): State<Arc<Controller>>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<PeerView>> {
    Ok(Json(controller.get_peer(uuid).await?))
}

async fn put_peer_handler(
    State(controller): State<Arc<Controller>>,
    Path(uuid): Path<Uuid>,
    Json(mut peer): Json<NewPeer>,
) -> ApiResult<Json<PeerView>> {
    peer.uuid = uuid;
    Ok(Json(controller.create_peer(peer).await?))
}

async fn patch_peer_handler(
    State(controller): State<Arc<Controller>>,
    Path(uuid): Path<Uuid>,
    Json(update): Json<PeerUpdate>,
) -> ApiResult<Json<PeerView>> {
    Ok(Json(controller.update_peer(uuid, update).await?))
}

async fn delete_peer_handler(
    State(controller): State<Arc<Controller>>,
    Extension(principal): Extension<Principal>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<PeerView>> {
    let view = controller.delete_peer(uuid).await?;
    info!("Peer {} deleted by {}", view.hostname, principal.name());
    Ok(Json(view))
}

// ============================================================================
// Account handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct NewAccountRequest {
    #[serde(default)]
    role: AccountRole,
    password: String,
}

#[derive(Debug, Deserialize)]
struct AccountUpdateRequest {
    role: Option<AccountRole>,
    /// Clears a login suspension when true
    #[serde(default)]
    unlock: bool,
}

#[derive(Debug, Deserialize)]
struct PasswordRequest {
    password: String,
}

async fn list_accounts_handler(State(controller): State<Arc<Controller>>) -> ApiResult<Json<Vec<Account>>> {
    Ok(Json(controller.list_accounts()?))
}

async fn put_account_handler(
    State(controller): State<Arc<Controller>>,
    Path(email): Path<String>,
    Json(req): Json<NewAccountRequest>,
) -> ApiResult<Json<Account>> {
    let account = run_blocking(&controller, move |c| {
        c.create_account(&email, req.role, &req.password)
    })
    .await?;
    Ok(Json(account))
}

async fn patch_account_handler(
    State(controller): State<Arc<Controller>>,
    Path(email): Path<String>,
    Json(req): Json<AccountUpdateRequest>,
) -> ApiResult<Json<Account>> {
    if req.unlock {
        controller.auth().unlock(&email)?;
    }
    let account = match req.role {
        Some(role) => controller.update_account_role(&email, role)?,
        None => controller
            .db()
            .get_account(&email)?
            .ok_or_else(|| Error::not_found("account", &email))?,
    };
    Ok(Json(account))
}

async fn patch_password_handler(
    State(controller): State<Arc<Controller>>,
    Path(email): Path<String>,
    Json(req): Json<PasswordRequest>,
) -> ApiResult<Json<StatusResponse>> {
    run_blocking(&controller, move |c| c.auth().change_password(&email, &req.password)).await?;
    Ok(StatusResponse::ok())
}

async fn delete_account_handler(
    State(controller): State<Arc<Controller>>,
    Extension(principal): Extension<Principal>,
    Path(email): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    controller.delete_account(&email)?;
    info!("Account {} deleted by {}", email, principal.name());
    Ok(StatusResponse::ok())
}

// ============================================================================
// API key handlers
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiKeyInit {
    uuid: Uuid,
    token: String,
}

#[derive(Debug, Deserialize)]
struct NewApiKeyRequest {
    name: String,
    #[serde(default)]
    expires_at: i64,
    #[serde(default)]
    attributes: Vec<String>,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiKeyUpdateRequest {
    name: String,
    #[serde(default)]
    expires_at: i64,
    #[serde(default)]
    attributes: Vec<String>,
}

async fn list_api_keys_handler(State(controller): State<Arc<Controller>>) -> ApiResult<Json<Vec<ApiKey>>> {
    Ok(Json(controller.db().list_api_keys()?))
}

async fn init_api_key_handler() -> Json<ApiKeyInit> {
    Json(ApiKeyInit {
        uuid: Uuid::new_v4(),
        token: encode_token(&generate_token()),
    })
}

async fn put_api_key_handler(
    State(controller): State<Arc<Controller>>,
    Path(uuid): Path<Uuid>,
    Json(req): Json<NewApiKeyRequest>,
) -> ApiResult<Json<ApiKey>> {
    let key = ApiKey {
        uuid,
        name: req.name,
        expires_at: req.expires_at,
        attributes: req.attributes,
    };
    controller.auth().create_api_key(&key, &req.token)?;
    Ok(Json(key))
}

async fn patch_api_key_handler(
    State(controller): State<Arc<Controller>>,
    Path(uuid): Path<Uuid>,
    Json(req): Json<ApiKeyUpdateRequest>,
) -> ApiResult<Json<ApiKey>> {
    let key = ApiKey {
        uuid,
        name: req.name,
        expires_at: req.expires_at,
        attributes: req.attributes,
    };
    controller.auth().update_api_key(&key)?;
    Ok(Json(key))
}

async fn delete_api_key_handler(
    State(controller): State<Arc<Controller>>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<StatusResponse>> {
    controller.auth().delete_api_key(uuid)?;
    Ok(StatusResponse::ok())
}

// ============================================================================
// Server handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct PollQuery {
    uuid: Uuid,
}

async fn server_info_handler(State(controller): State<Arc<Controller>>) -> Json<ServerInfo> {
    Json(controller.server_info())
}

/// Long-poll; a dropped connection drops this future, which leaves any
/// queued message in place
async fn poll_handler(
    State(controller): State<Arc<Controller>>,
    Query(query): Query<PollQuery>,
) -> Response {
    let cancel = controller.shutdown_token().child_token();
    match controller.push().poll(query.uuid, &cancel).await {
        PollOutcome::Message(message) => Json(message).into_response(),
        PollOutcome::NoContent | PollOutcome::Cancelled => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn resync_handler(
    State(controller): State<Arc<Controller>>,
    Extension(principal): Extension<Principal>,
) -> Json<SyncSummary> {
    info!("Resync requested by {}", principal.name());
    Json(controller.resync().await)
}
