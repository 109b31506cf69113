// src/handlers/auth.rs

use axum::{extract::State, Json};
use axum_extra::extract::WithRejection;

use crate::{
    common::error::AppError,
    config::AppState,
    middleware::auth::AuthenticatedPrincipal,
    models::auth::{
        AuthResponse, LoginUserPayload, Principal, RegisterUserPayload, SignupResponse,
    },
};

// Handler de registro. Com confirmação de e-mail ligada no identity store,
// a resposta vem com `pendingVerification: true` e sem token.
#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterUserPayload,
    responses(
        (status = 200, description = "Conta criada (com ou sem sessão imediata)", body = SignupResponse),
        (status = 400, description = "Dados inválidos"),
        (status = 403, description = "Papel não permitido no auto-registro"),
        (status = 409, description = "E-mail já em uso"),
    ),
    tag = "auth"
)]
pub async fn register(
    State(app_state): State<AppState>,
    WithRejection(Json(payload), _): WithRejection<Json<RegisterUserPayload>, AppError>,
) -> Result<Json<SignupResponse>, AppError> {
    let response = app_state.session.register(&payload).await?;
    Ok(Json(response))
}

// Handler de login. A resposta já traz o painel do papel resolvido.
#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginUserPayload,
    responses(
        (status = 200, description = "Sessão aberta", body = AuthResponse),
        (status = 401, description = "Credenciais inválidas"),
        (status = 403, description = "Conta desativada ou e-mail não confirmado"),
    ),
    tag = "auth"
)]
pub async fn login(
    State(app_state): State<AppState>,
    WithRejection(Json(payload), _): WithRejection<Json<LoginUserPayload>, AppError>,
) -> Result<Json<AuthResponse>, AppError> {
    let response = app_state.session.authenticate(&payload).await?;
    Ok(Json(response))
}

// Handler da rota protegida /me
#[utoipa::path(
    get,
    path = "/api/users/me",
    responses(
        (status = 200, description = "O principal autenticado", body = Principal),
        (status = 401, description = "Token ausente ou inválido"),
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn get_me(AuthenticatedPrincipal(principal): AuthenticatedPrincipal) -> Json<Principal> {
    Json(principal)
}
