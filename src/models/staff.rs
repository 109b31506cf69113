// src/models/staff.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

// Entidade de junção: liga um principal (papel staff) ao dono que o criou
// e, opcionalmente, a uma loja desse dono.
// Invariante: `shop_id`, quando presente, referencia uma loja cujo
// `owner_id` é o mesmo `owner_id` daqui.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Staff {
    pub id: Uuid,
    pub user_id: Uuid,
    pub owner_id: Uuid,
    pub shop_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Projeção com o perfil do membro (obrigatório) e o nome da loja (se houver).
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaffView {
    #[serde(flatten)]
    pub staff: Staff,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub shop_name: Option<String>,
}

// Payload da rota privilegiada POST /api/staff.
// `owner_id` precisa bater com o principal autenticado; o papel do caller
// é verificado de novo no servidor, nunca confiado do cliente.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateStaffPayload {
    #[validate(email(message = "O e-mail fornecido é inválido."))]
    pub email: String,
    #[validate(length(min = 6, message = "A senha deve ter no mínimo 6 caracteres."))]
    pub password: String,
    #[validate(length(min = 1, message = "O nome é obrigatório."))]
    pub name: String,
    pub phone: Option<String>,
    pub owner_id: Uuid,
    pub shop_id: Option<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateStaffResponse {
    pub success: bool,
    pub staff: Staff,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct UpdateStaffInput {
    pub shop_id: Option<Uuid>,
    pub is_active: Option<bool>,
}
