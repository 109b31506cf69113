// src/store/tables.rs

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::error::AppError;
use crate::models::auth::{Profile, Role, UpdateProfilePayload};
use crate::models::bookings::{Booking, CreateBookingInput, UpdateBookingInput};
use crate::models::saved_shops::SavedShop;
use crate::models::shops::{CreateShopInput, Shop, UpdateShopInput};
use crate::models::staff::{Staff, UpdateStaffInput};
use crate::models::vehicles::{CreateVehicleInput, UpdateVehicleInput, Vehicle};

// Todas as listagens voltam do mais novo para o mais antigo (created_at
// desc), como as telas esperam. Buscas dependentes recebem SEMPRE o
// conjunto de ids distinto, nunca uma chamada por linha.

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_profile(&self, user_id: Uuid) -> Result<Option<Profile>, AppError>;
    // Busca em lote pelos ids distintos presentes num resultado base.
    async fn find_profiles(&self, user_ids: &[Uuid]) -> Result<Vec<Profile>, AppError>;
    async fn list_profiles(&self) -> Result<Vec<Profile>, AppError>;
    async fn find_role(&self, user_id: Uuid) -> Result<Option<Role>, AppError>;
    async fn list_roles(&self) -> Result<Vec<(Uuid, Role)>, AppError>;
    async fn update_profile(
        &self,
        user_id: Uuid,
        patch: &UpdateProfilePayload,
    ) -> Result<Profile, AppError>;
    async fn set_profile_active(&self, user_id: Uuid, active: bool) -> Result<Profile, AppError>;
}

#[async_trait]
pub trait ShopStore: Send + Sync {
    // Listagem pública: só lojas ativas.
    async fn list_active_shops(&self) -> Result<Vec<Shop>, AppError>;
    async fn list_shops_by_owner(&self, owner_id: Uuid) -> Result<Vec<Shop>, AppError>;
    async fn find_shop(&self, id: Uuid) -> Result<Option<Shop>, AppError>;
    async fn find_shops(&self, ids: &[Uuid]) -> Result<Vec<Shop>, AppError>;
    async fn insert_shop(&self, owner_id: Uuid, input: &CreateShopInput)
        -> Result<Shop, AppError>;
    async fn update_shop(&self, id: Uuid, input: &UpdateShopInput) -> Result<Shop, AppError>;
}

#[async_trait]
pub trait VehicleStore: Send + Sync {
    async fn list_available_vehicles(
        &self,
        shop_id: Option<Uuid>,
    ) -> Result<Vec<Vehicle>, AppError>;
    // A segunda perna do fetch do dono: um único SELECT filtrado pelo
    // conjunto de lojas resolvido na primeira perna.
    async fn list_vehicles_in_shops(&self, shop_ids: &[Uuid]) -> Result<Vec<Vehicle>, AppError>;
    async fn find_vehicle(&self, id: Uuid) -> Result<Option<Vehicle>, AppError>;
    async fn find_vehicles(&self, ids: &[Uuid]) -> Result<Vec<Vehicle>, AppError>;
    async fn insert_vehicle(&self, input: &CreateVehicleInput) -> Result<Vehicle, AppError>;
    async fn update_vehicle(
        &self,
        id: Uuid,
        input: &UpdateVehicleInput,
    ) -> Result<Vehicle, AppError>;
    async fn set_vehicle_availability(&self, id: Uuid, available: bool)
        -> Result<Vehicle, AppError>;
    async fn delete_vehicle(&self, id: Uuid) -> Result<(), AppError>;
}

#[async_trait]
pub trait StaffStore: Send + Sync {
    async fn find_staff(&self, id: Uuid) -> Result<Option<Staff>, AppError>;
    async fn find_staff_by_user(&self, user_id: Uuid) -> Result<Option<Staff>, AppError>;
    async fn list_staff_by_owner(&self, owner_id: Uuid) -> Result<Vec<Staff>, AppError>;
    async fn list_all_staff(&self) -> Result<Vec<Staff>, AppError>;
    async fn insert_staff(
        &self,
        user_id: Uuid,
        owner_id: Uuid,
        shop_id: Option<Uuid>,
    ) -> Result<Staff, AppError>;
    async fn update_staff(&self, id: Uuid, input: &UpdateStaffInput) -> Result<Staff, AppError>;
    // Retorna a linha removida (o serviço ainda precisa do user_id dela
    // para desativar o perfil órfão).
    async fn delete_staff(&self, id: Uuid) -> Result<Staff, AppError>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_booking(&self, id: Uuid) -> Result<Option<Booking>, AppError>;
    async fn list_bookings_by_user(&self, user_id: Uuid) -> Result<Vec<Booking>, AppError>;
    async fn list_bookings_in_shops(&self, shop_ids: &[Uuid]) -> Result<Vec<Booking>, AppError>;
    // Tarefas de um staff: atribuídas a ele, ou sem atribuição na loja dele.
    async fn list_bookings_for_staff(
        &self,
        staff_id: Uuid,
        shop_id: Option<Uuid>,
    ) -> Result<Vec<Booking>, AppError>;
    // O user_id vem do principal verificado, nunca do corpo da requisição.
    async fn insert_booking(
        &self,
        user_id: Uuid,
        input: &CreateBookingInput,
    ) -> Result<Booking, AppError>;
    async fn update_booking(
        &self,
        id: Uuid,
        input: &UpdateBookingInput,
    ) -> Result<Booking, AppError>;
}

#[async_trait]
pub trait SavedShopStore: Send + Sync {
    async fn list_saved_shops(&self, user_id: Uuid) -> Result<Vec<SavedShop>, AppError>;
    async fn find_saved_shop(
        &self,
        user_id: Uuid,
        shop_id: Uuid,
    ) -> Result<Option<SavedShop>, AppError>;
    async fn insert_saved_shop(&self, user_id: Uuid, shop_id: Uuid)
        -> Result<SavedShop, AppError>;
    async fn delete_saved_shop(&self, id: Uuid) -> Result<(), AppError>;
}

// A porta completa do banco relacional. Os adaptadores (Postgres e o fake
// em memória) implementam todos os traits de tabela.
pub trait RentalStore:
    ProfileStore + ShopStore + VehicleStore + StaffStore + BookingStore + SavedShopStore
{
}

impl<T> RentalStore for T where
    T: ProfileStore + ShopStore + VehicleStore + StaffStore + BookingStore + SavedShopStore
{
}
