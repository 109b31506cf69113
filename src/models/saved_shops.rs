// src/models/saved_shops.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::shops::Shop;

// Marcador de favorito. No máximo uma linha por (user_id, shop_id).
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SavedShop {
    pub id: Uuid,
    pub user_id: Uuid,
    pub shop_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SavedShopView {
    #[serde(flatten)]
    pub saved: SavedShop,
    pub shop: Shop,
}

// Resultado do toggle de favorito.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToggleSavedResult {
    pub saved: bool,
    pub shop_id: Uuid,
}
