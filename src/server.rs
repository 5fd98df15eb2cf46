use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info};

use crate::auth;
use crate::db::{Database, DbError, User};
use crate::extract::CountMismatch;
use crate::models::{
    CheckLinkRequest, CheckUsernameRequest, DeleteLinkRequest, EditLinkRequest, LinksResponse,
    LoginRequest, LoginResponse, MessageResponse, RegisterRequest, UploadLinkRequest,
    ValidResponse,
};
use crate::pipeline::{scrape_link, validate_link, InvalidLink, PipelineError};
use crate::render::PageRenderer;

// ── App state ────────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Database,
    pub renderer: Arc<dyn PageRenderer>,
    pub render_timeout: Duration,
    pub allowed_hosts: Vec<String>,
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    InvalidLink(#[from] InvalidLink),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Mismatch(#[from] CountMismatch),
    #[error(transparent)]
    Database(#[from] DbError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::InvalidLink(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Pipeline(PipelineError::Render(e)) => (
                StatusCode::BAD_GATEWAY,
                format!("Link could not be loaded: {}", e),
            ),
            ApiError::Pipeline(PipelineError::Extract(e)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Link has no readable conversation: {}", e),
            ),
            ApiError::Mismatch(e) => (StatusCode::BAD_REQUEST, format!("Length mismatch: {}", e)),
            ApiError::Database(DbError::Conflict(what)) => {
                (StatusCode::CONFLICT, format!("The {} is already taken", what))
            }
            ApiError::Database(e) => {
                error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(MessageResponse::failed(message))).into_response()
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/check-username", post(check_username))
        .route("/check-link", post(check_link))
        .route("/links", get(list_links))
        .route("/upload-link", post(upload_link))
        .route("/edit-link", post(edit_link))
        .route("/delete-link", post(delete_link))
        .with_state(Arc::new(state))
}

pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ── Authentication ───────────────────────────────────────────────────────────

fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()
        .and_then(auth::bearer_token)
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let not_logged_in = || ApiError::Unauthorized("User not logged in".to_string());
    let token = session_token(headers).ok_or_else(not_logged_in)?;
    let user_id = state
        .db
        .session_user(token, Utc::now().timestamp())?
        .ok_or_else(not_logged_in)?;
    state
        .db
        .find_user(user_id)?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    auth::validate_registration(&req.name, &req.username, &req.password)
        .map_err(ApiError::BadRequest)?;
    let hash = auth::hash_password(&req.password);
    state
        .db
        .create_user(req.name.trim(), &req.username, &hash)?;
    info!(username = %req.username, "registered user");
    Ok(Json(MessageResponse::ok("User registered successfully")))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state
        .db
        .find_user_by_username(&req.username)?
        .filter(|u| auth::verify_password(&req.password, &u.password_hash))
        .ok_or_else(|| ApiError::Unauthorized("Invalid username or password".to_string()))?;

    let token = auth::new_token();
    let expires_at = Utc::now().timestamp() + auth::SESSION_TTL_SECS;
    state.db.create_session(&token, user.id, expires_at)?;

    Ok(Json(LoginResponse {
        success: true,
        message: "User logged in successfully".to_string(),
        token,
        expires_at,
    }))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<MessageResponse>, ApiError> {
    if let Some(token) = session_token(&headers) {
        state.db.delete_session(token)?;
    }
    Ok(Json(MessageResponse::ok("User logged out successfully")))
}

async fn check_username(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckUsernameRequest>,
) -> Result<Json<ValidResponse>, ApiError> {
    let taken = state.db.username_exists(&req.username)?;
    Ok(Json(ValidResponse { valid: !taken }))
}

async fn check_link(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckLinkRequest>,
) -> Result<Json<ValidResponse>, ApiError> {
    let taken = state.db.link_exists(req.link.trim())?;
    Ok(Json(ValidResponse { valid: !taken }))
}

async fn list_links(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<LinksResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let links = state.db.list_links(user.id)?;
    Ok(Json(LinksResponse {
        name: user.name,
        username: user.username,
        links,
    }))
}

async fn upload_link(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<UploadLinkRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let link = req.link.trim();
    validate_link(link, &state.allowed_hosts)?;
    if state.db.link_exists(link)? {
        return Err(ApiError::Conflict("Link already uploaded".to_string()));
    }

    let transcript = scrape_link(state.renderer.as_ref(), link, state.render_timeout).await?;
    let title = transcript.title.clone();
    let pairs = transcript.into_pairs()?;

    state.db.insert_link(user.id, &title, link, &pairs)?;
    info!(username = %user.username, link, pairs = pairs.len(), "saved link");
    Ok(Json(MessageResponse::ok("Link uploaded successfully")))
}

async fn edit_link(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EditLinkRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let link = req.link.trim();
    validate_link(link, &state.allowed_hosts)?;
    let link_not_found = || ApiError::NotFound("Link not found".to_string());
    if !state.db.link_owned_by(req.id, user.id)? {
        return Err(link_not_found());
    }

    let transcript = scrape_link(state.renderer.as_ref(), link, state.render_timeout).await?;
    let title = transcript.title.clone();
    let pairs = transcript.into_pairs()?;

    if !state.db.replace_link(req.id, user.id, &title, link, &pairs)? {
        return Err(link_not_found());
    }
    info!(username = %user.username, id = req.id, link, pairs = pairs.len(), "updated link");
    Ok(Json(MessageResponse::ok("Link edited successfully")))
}

async fn delete_link(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DeleteLinkRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    if !state.db.delete_link(req.id, user.id)? {
        return Err(ApiError::NotFound("Link not found".to_string()));
    }
    info!(username = %user.username, id = req.id, "deleted link");
    Ok(Json(MessageResponse::ok("Link deleted successfully")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{share_page, StaticRenderer};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(html: Option<String>) -> Router {
        router(AppState {
            db: Database::open_in_memory().unwrap(),
            renderer: Arc::new(StaticRenderer(html)),
            render_timeout: Duration::from_secs(1),
            allowed_hosts: vec!["chatgpt.com".to_string()],
        })
    }

    fn two_turns() -> Option<String> {
        Some(share_page("My Chat", &["Hello", "Why?"], &["Hi", "Because"]))
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn post(app: &Router, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        send(app, Method::POST, uri, token, Some(body)).await
    }

    async fn signed_in(app: &Router, username: &str) -> String {
        let (status, _) = post(
            app,
            "/register",
            None,
            json!({"name": "Test User", "username": username, "password": "secret1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = post(
            app,
            "/login",
            None,
            json!({"username": username, "password": "secret1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (status, body) = send(&app(None), Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn upload_then_list() {
        let app = app(two_turns());
        let token = signed_in(&app, "ana").await;

        let (status, body) = post(
            &app,
            "/upload-link",
            Some(&token),
            json!({"link": "https://chatgpt.com/share/one"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);

        let (status, body) = send(&app, Method::GET, "/links", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["username"], "ana");
        let link = &body["links"][0];
        assert_eq!(link["title"], "My Chat");
        assert_eq!(link["link"], "https://chatgpt.com/share/one");
        assert_eq!(link["user"]["name"], "Test User");
        let convs = link["conversations"].as_array().unwrap();
        assert_eq!(convs.len(), 2);
        assert_eq!(convs[0]["prompt"], "Hello");
        assert_eq!(convs[0]["response"], "<p>Hi</p>");
        assert_eq!(convs[1]["pp_prompt"], "why?");
        assert_eq!(convs[1]["pp_response"], "because");
    }

    #[tokio::test]
    async fn duplicate_upload_is_conflict() {
        let app = app(two_turns());
        let token = signed_in(&app, "ana").await;
        let body = json!({"link": "https://chatgpt.com/share/one"});

        let (status, _) = post(&app, "/upload-link", Some(&token), body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post(&app, "/upload-link", Some(&token), body).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn mismatched_counts_are_rejected_and_not_stored() {
        let app = app(Some(share_page("Uneven", &["a", "b", "c"], &["x", "y"])));
        let token = signed_in(&app, "ana").await;

        let (status, body) = post(
            &app,
            "/upload-link",
            Some(&token),
            json!({"link": "https://chatgpt.com/share/uneven"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().starts_with("Length mismatch"));

        let (_, body) = post(
            &app,
            "/check-link",
            None,
            json!({"link": "https://chatgpt.com/share/uneven"}),
        )
        .await;
        assert_eq!(body["valid"], true);
    }

    #[tokio::test]
    async fn render_and_extract_failures_are_distinguishable() {
        let link = json!({"link": "https://chatgpt.com/share/x"});

        let broken = app(None);
        let token = signed_in(&broken, "ana").await;
        let (status, body) = post(&broken, "/upload-link", Some(&token), link.clone()).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["success"], false);

        let empty = app(Some(share_page("Empty", &[], &["x"])));
        let token = signed_in(&empty, "ana").await;
        let (status, _) = post(&empty, "/upload-link", Some(&token), link).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn disallowed_host_is_rejected() {
        let app = app(two_turns());
        let token = signed_in(&app, "ana").await;
        let (status, _) = post(
            &app,
            "/upload-link",
            Some(&token),
            json!({"link": "https://example.com/share/x"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn link_routes_require_a_session() {
        let app = app(two_turns());
        let (status, body) = post(
            &app,
            "/upload-link",
            None,
            json!({"link": "https://chatgpt.com/share/x"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "User not logged in");

        let (status, _) = send(&app, Method::GET, "/links", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn registration_and_login_errors() {
        let app = app(None);
        signed_in(&app, "ana").await;

        let (status, _) = post(
            &app,
            "/register",
            None,
            json!({"name": "Again", "username": "ana", "password": "secret1"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = post(
            &app,
            "/register",
            None,
            json!({"name": "Short", "username": "bo", "password": "secret1"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post(
            &app,
            "/login",
            None,
            json!({"username": "ana", "password": "wrong-password"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid username or password");
    }

    #[tokio::test]
    async fn availability_checks() {
        let app = app(two_turns());
        let token = signed_in(&app, "ana").await;
        post(
            &app,
            "/upload-link",
            Some(&token),
            json!({"link": "https://chatgpt.com/share/one"}),
        )
        .await;

        let (_, body) = post(&app, "/check-username", None, json!({"username": "ana"})).await;
        assert_eq!(body["valid"], false);
        let (_, body) = post(&app, "/check-username", None, json!({"username": "bob"})).await;
        assert_eq!(body["valid"], true);
        let (_, body) = post(
            &app,
            "/check-link",
            None,
            json!({"link": "https://chatgpt.com/share/one"}),
        )
        .await;
        assert_eq!(body["valid"], false);
    }

    #[tokio::test]
    async fn edit_and_delete_own_links_only() {
        let app = app(two_turns());
        let ana = signed_in(&app, "ana").await;
        let bob = signed_in(&app, "bob").await;
        post(
            &app,
            "/upload-link",
            Some(&ana),
            json!({"link": "https://chatgpt.com/share/one"}),
        )
        .await;
        let (_, body) = send(&app, Method::GET, "/links", Some(&ana), None).await;
        let id = body["links"][0]["id"].as_i64().unwrap();

        let edit = json!({"id": id, "link": "https://chatgpt.com/share/two"});
        let (status, _) = post(&app, "/edit-link", Some(&bob), edit.clone()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = post(&app, "/edit-link", Some(&ana), edit).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, Method::GET, "/links", Some(&ana), None).await;
        assert_eq!(body["links"][0]["link"], "https://chatgpt.com/share/two");
        assert_eq!(body["links"][0]["conversations"].as_array().unwrap().len(), 2);

        let (status, _) = post(&app, "/delete-link", Some(&bob), json!({"id-link": id})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = post(&app, "/delete-link", Some(&ana), json!({"id-link": id})).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, Method::GET, "/links", Some(&ana), None).await;
        assert!(body["links"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn logout_ends_the_session() {
        let app = app(None);
        let token = signed_in(&app, "ana").await;

        let (status, _) = send(&app, Method::POST, "/logout", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, Method::GET, "/links", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
