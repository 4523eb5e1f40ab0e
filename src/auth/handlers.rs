use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            MessageResponse, Pagination, PasswordResetBody, PasswordResetRequest,
            PublicUser, RegisterRequest, TokenResponse,
        },
        error::AuthError,
        extractors::{CurrentUser, LoginCredentials},
        repo_types::UserPatch,
    },
    state::AppState,
};

const RESET_ACK: &str = "If your email is registered, a password reset link has been sent";

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(register).get(list_users))
        .route("/token", post(login))
        .route("/request-password-reset", post(request_password_reset))
        .route("/reset-password", post(reset_password))
}

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users/me", get(get_me))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    if payload.password.is_empty() {
        warn!("empty password");
        return Err(AuthError::Validation("Password must not be empty".into()));
    }

    let user = state
        .auth
        .register(&payload.email, &payload.password, payload.profile)
        .await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    LoginCredentials(payload): LoginCredentials,
) -> Result<Json<TokenResponse>, AuthError> {
    let issued = state.auth.login(&payload.email, &payload.password).await?;
    Ok(Json(TokenResponse {
        access_token: issued.token,
        token_type: "bearer",
        expires_in: issued.ttl.whole_seconds(),
        user_id: issued.user_id,
    }))
}

#[instrument(skip(state, payload))]
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<PasswordResetRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    state.auth.request_reset(&payload.email).await?;
    Ok(Json(MessageResponse { message: RESET_ACK }))
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<PasswordResetBody>,
) -> Result<Json<MessageResponse>, AuthError> {
    if payload.new_password.is_empty() {
        return Err(AuthError::Validation("Password must not be empty".into()));
    }
    state
        .auth
        .perform_reset(&payload.token, &payload.new_password)
        .await?;
    Ok(Json(MessageResponse {
        message: "Password has been reset successfully",
    }))
}

#[instrument(skip_all)]
pub async fn get_me(CurrentUser(user): CurrentUser) -> Json<PublicUser> {
    Json(user.into())
}

#[instrument(skip(state, _me))]
pub async fn list_users(
    State(state): State<AppState>,
    _me: CurrentUser,
    Query(p): Query<Pagination>,
) -> Result<Json<Vec<PublicUser>>, AuthError> {
    let users = state.auth.list_users(p.skip, p.limit).await?;
    Ok(Json(users.into_iter().map(PublicUser::from).collect()))
}

#[instrument(skip(state, _me))]
pub async fn get_user(
    State(state): State<AppState>,
    _me: CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<PublicUser>, AuthError> {
    let user = state.auth.get_user(id).await?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, me, patch))]
pub async fn update_user(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Path(id): Path<i64>,
    Json(patch): Json<UserPatch>,
) -> Result<Json<PublicUser>, AuthError> {
    if me.id != id {
        warn!(user_id = me.id, target = id, "update of another account");
        return Err(AuthError::Forbidden);
    }
    if patch.password.as_deref() == Some("") {
        return Err(AuthError::Validation("Password must not be empty".into()));
    }
    let user = state.auth.update_user(id, patch).await?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, me))]
pub async fn delete_user(
    State(state): State<AppState>,
    CurrentUser(me): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AuthError> {
    if me.id != id {
        warn!(user_id = me.id, target = id, "delete of another account");
        return Err(AuthError::Forbidden);
    }
    state.auth.delete_user(id).await?;
    info!(user_id = id, "account closed");
    Ok(Json(json!({ "ok": true })))
}
