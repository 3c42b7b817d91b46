//! Authentication API Endpoints
//! Mission: JSON surface for sign-up, login, refresh, logout and account management

use crate::app::AppState;
use crate::auth::{
    error::AccessError,
    middleware::bearer_token,
    models::{
        AuthUser, ChangePasswordRequest, LoginRequest, LoginResponse, MessageResponse,
        RefreshRequest, RefreshResponse, RegisterRequest, RegistrationToggleRequest, UserResponse,
    },
};
use crate::middleware::ClientIp;
use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::info;

/// Register endpoint - POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>), AccessError> {
    let user = state
        .access
        .register(&payload.username, &payload.password, payload.email)
        .await?;

    info!("📝 Registered user: {} ({})", user.username, user.role.as_str());
    Ok((StatusCode::CREATED, Json(UserResponse::from_user(&user))))
}

/// Login endpoint - POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AccessError> {
    info!("🔐 Login attempt: {} from {}", payload.username, ip);

    let session = state
        .access
        .login(&payload.username, &payload.password, &ip)
        .await?;

    Ok(Json(LoginResponse {
        tokens: session.tokens,
        user: UserResponse::from_user(&session.user),
    }))
}

/// Refresh endpoint - POST /api/auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, AccessError> {
    let access_token = state.access.refresh(&payload.refresh_token).await?;

    Ok(Json(RefreshResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: state.access.issuer().access_ttl_secs(),
    }))
}

/// Logout endpoint - POST /api/auth/logout
/// Always succeeds, with or without a usable token.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<MessageResponse> {
    if let Some(token) = bearer_token(&headers) {
        state.access.logout(token).await;
    }
    Json(MessageResponse::new("logged out"))
}

/// Change password - PUT /api/auth/password
pub async fn change_password(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, AccessError> {
    state
        .access
        .change_password(user.user_id, &payload.old_password, &payload.new_password)
        .await?;

    Ok(Json(MessageResponse::new(
        "password changed, please login again",
    )))
}

/// Current user - GET /api/auth/me
pub async fn me(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UserResponse>, AccessError> {
    let user = state.access.current_user(user.user_id).await?;
    Ok(Json(UserResponse::from_user(&user)))
}

/// Toggle self-service registration - PUT /api/admin/settings/registration (Admin only)
pub async fn set_registration(
    State(state): State<AppState>,
    admin: AuthUser,
    Json(payload): Json<RegistrationToggleRequest>,
) -> Result<Json<Value>, AccessError> {
    state.access.set_registration_enabled(payload.enabled)?;
    info!(
        "⚙️ Registration {} by {}",
        if payload.enabled { "enabled" } else { "disabled" },
        admin.username
    );
    Ok(Json(json!({ "registration_enabled": payload.enabled })))
}
