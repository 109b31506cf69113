// src/handlers/staff.rs

use axum::{extract::State, Json};
use axum_extra::extract::WithRejection;

use crate::{
    common::error::AppError,
    config::AppState,
    middleware::auth::AuthenticatedPrincipal,
    models::staff::{CreateStaffPayload, CreateStaffResponse},
};

// POST /api/staff, a rota privilegiada de provisionamento.
// A escada de erros: 401 sem token (middleware), 403 para quem não é o
// dono certo, 400 quando o identity store recusa, 500 com a conta já
// compensada quando o vínculo falha.
#[utoipa::path(
    post,
    path = "/api/staff",
    request_body = CreateStaffPayload,
    responses(
        (status = 200, description = "Conta de staff criada e vinculada", body = CreateStaffResponse),
        (status = 400, description = "Payload inválido ou identity store recusou"),
        (status = 401, description = "Token ausente ou inválido"),
        (status = 403, description = "O caller não é o dono informado"),
        (status = 500, description = "Vínculo falhou; a conta foi removida"),
    ),
    security(("bearer_auth" = [])),
    tag = "staff"
)]
pub async fn create_staff(
    State(app_state): State<AppState>,
    AuthenticatedPrincipal(caller): AuthenticatedPrincipal,
    WithRejection(Json(payload), _): WithRejection<Json<CreateStaffPayload>, AppError>,
) -> Result<Json<CreateStaffResponse>, AppError> {
    let response = app_state.staff.create_staff(caller.id, &payload).await?;
    Ok(Json(response))
}
