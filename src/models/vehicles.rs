// src/models/vehicles.rs

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "vehicle_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Car,
    Bike,
}

// Um veículo pertence a exatamente uma loja. A disponibilidade muda por
// transições de reserva e por ações do dono.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: Uuid,
    pub shop_id: Uuid,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    pub name: String,
    pub brand: String,
    pub model: String,
    pub images: Vec<String>,
    pub price_per_hour: Decimal,
    pub price_per_day: Decimal,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub seating: Option<i32>,
    pub features: Vec<String>,
    pub is_available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Projeção com os campos da loja anexados (nome sempre que o escopo é do
// dono; endereço no detalhe de um veículo).
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VehicleView {
    #[serde(flatten)]
    pub vehicle: Vehicle,
    pub shop_name: Option<String>,
    pub shop_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateVehicleInput {
    pub shop_id: Uuid,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    #[validate(length(min = 1, message = "O nome do veículo é obrigatório."))]
    pub name: String,
    #[validate(length(min = 1, message = "A marca é obrigatória."))]
    pub brand: String,
    #[validate(length(min = 1, message = "O modelo é obrigatório."))]
    pub model: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub price_per_hour: Decimal,
    pub price_per_day: Decimal,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub seating: Option<i32>,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateVehicleInput {
    #[validate(length(min = 1, message = "O nome do veículo não pode ficar vazio."))]
    pub name: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub images: Option<Vec<String>>,
    pub price_per_hour: Option<Decimal>,
    pub price_per_day: Option<Decimal>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub seating: Option<i32>,
    pub features: Option<Vec<String>>,
    pub is_available: Option<bool>,
}
