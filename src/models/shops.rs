// src/models/shops.rs

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

// Uma loja de aluguel. Pertence a exatamente um dono (`owner_id`).
// Na listagem pública uma loja some via `is_active = false` (desativação
// suave); nunca por DELETE.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub address: String,
    pub image_url: Option<String>,
    pub operating_hours: Option<String>,
    pub is_open: bool,
    pub is_active: bool,
    pub rating: Option<Decimal>,
    pub review_count: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateShopInput {
    #[validate(length(min = 1, message = "O nome da loja é obrigatório."))]
    pub name: String,
    #[validate(length(min = 1, message = "O endereço é obrigatório."))]
    pub address: String,
    pub image_url: Option<String>,
    pub operating_hours: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

// Atualização parcial: campo ausente = sem mudança.
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateShopInput {
    #[validate(length(min = 1, message = "O nome da loja não pode ficar vazio."))]
    pub name: Option<String>,
    pub address: Option<String>,
    pub image_url: Option<String>,
    pub operating_hours: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_open: Option<bool>,
    pub is_active: Option<bool>,
}
