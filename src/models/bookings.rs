// src/models/bookings.rs

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::vehicles::VehicleType;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "booking_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Upcoming,
    Active,
    Completed,
    Cancelled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InTransit,
    Delivered,
    PickedUp,
}

// Uma reserva. Criada pelo cliente; status e entrega mudam por mutações do
// dono/staff. Nunca é apagada (histórico).
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub vehicle_id: Uuid,
    pub shop_id: Uuid,
    pub staff_id: Option<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_price: Decimal,
    pub status: BookingStatus,
    pub delivery_address: Option<String>,
    pub delivery_status: Option<DeliveryStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Resumos embutidos na projeção ---

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSummary {
    pub name: String,
    pub brand: String,
    pub model: String,
    pub images: Vec<String>,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShopSummary {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSummary {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

// A projeção de reserva. `vehicle` e `shop` são joins OBRIGATÓRIOS: se a
// linha correspondente sumiu, o fetch inteiro falha em vez de entregar uma
// projeção pela metade. `customer` só aparece nos escopos de dono/staff.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    #[serde(flatten)]
    pub booking: Booking,
    pub vehicle: VehicleSummary,
    pub shop: ShopSummary,
    pub customer: Option<CustomerSummary>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateBookingInput {
    pub vehicle_id: Uuid,
    pub shop_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_price: Decimal,
    pub delivery_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct UpdateBookingInput {
    pub status: Option<BookingStatus>,
    pub delivery_status: Option<DeliveryStatus>,
    pub staff_id: Option<Uuid>,
}
