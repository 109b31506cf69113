// src/store/memory.rs
//
// Adaptador em memória das três portas (banco, identity store e change
// feed), para testes e desenvolvimento local. As mutações publicam eventos
// no feed igual aos triggers do Postgres fariam, então dá para exercitar a
// invalidação dirigida por feed sem banco nenhum.
//
// É um fake: as senhas ficam em texto puro e não há RLS de verdade aqui.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cache::Entity;
use crate::common::error::AppError;
use crate::models::auth::{Profile, Role, UpdateProfilePayload};
use crate::models::bookings::{
    Booking, BookingStatus, CreateBookingInput, DeliveryStatus, UpdateBookingInput,
};
use crate::models::saved_shops::SavedShop;
use crate::models::shops::{CreateShopInput, Shop, UpdateShopInput};
use crate::models::staff::{Staff, UpdateStaffInput};
use crate::models::vehicles::{CreateVehicleInput, UpdateVehicleInput, Vehicle};
use crate::store::changes::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeOp, ChangeStream, Table};
use crate::store::identity::{AuthSession, IdentityStore, NewAccount, SignUpOutcome};
use crate::store::tables::{
    BookingStore, ProfileStore, SavedShopStore, ShopStore, StaffStore, VehicleStore,
};

#[derive(Debug, Clone)]
struct MemoryAccount {
    email: String,
    password: String,
    confirmed: bool,
}

#[derive(Default)]
struct TablesState {
    accounts: HashMap<Uuid, MemoryAccount>,
    sessions: HashMap<String, Uuid>,
    profiles: Vec<Profile>,
    roles: HashMap<Uuid, Role>,
    shops: Vec<Shop>,
    vehicles: Vec<Vehicle>,
    staff: Vec<Staff>,
    bookings: Vec<Booking>,
    saved_shops: Vec<SavedShop>,
}

pub struct MemoryBackend {
    state: Mutex<TablesState>,
    feed_tx: broadcast::Sender<ChangeEvent>,
    require_email_confirmation: bool,
    // Contadores de SELECT, para afirmar planos de busca nos testes
    // (ex.: "um lookup de lojas + um lookup de veículos em lote").
    shop_queries: AtomicUsize,
    vehicle_queries: AtomicUsize,
    // Falhas injetadas: a próxima chamada da operação nomeada falha.
    fail_next: Mutex<HashSet<&'static str>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (feed_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(TablesState::default()),
            feed_tx,
            require_email_confirmation: false,
            shop_queries: AtomicUsize::new(0),
            vehicle_queries: AtomicUsize::new(0),
            fail_next: Mutex::new(HashSet::new()),
        }
    }

    // Variante que simula um identity store exigindo confirmação de e-mail.
    pub fn with_email_confirmation() -> Self {
        Self {
            require_email_confirmation: true,
            ..Self::new()
        }
    }

    pub fn shop_query_count(&self) -> usize {
        self.shop_queries.load(Ordering::SeqCst)
    }

    pub fn vehicle_query_count(&self) -> usize {
        self.vehicle_queries.load(Ordering::SeqCst)
    }

    pub fn reset_query_counts(&self) {
        self.shop_queries.store(0, Ordering::SeqCst);
        self.vehicle_queries.store(0, Ordering::SeqCst);
    }

    pub fn account_count(&self) -> usize {
        self.state.lock().unwrap().accounts.len()
    }

    // Remove só o perfil, deixando a conta viva. Simula a dessincronização
    // conta-sem-perfil que o resolvedor precisa tratar como falha.
    pub fn remove_profile(&self, user_id: Uuid) {
        self.lock().profiles.retain(|p| p.user_id != user_id);
    }

    pub fn fail_next(&self, op: &'static str) {
        self.fail_next.lock().unwrap().insert(op);
    }

    fn take_failure(&self, op: &'static str) -> bool {
        self.fail_next.lock().unwrap().remove(op)
    }

    fn publish(&self, table: Table, op: ChangeOp, keys: &[(&str, Uuid)]) {
        let keys = keys
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect::<HashMap<_, _>>();
        // Sem assinantes não é erro; o feed simplesmente cai no vazio.
        let _ = self.feed_tx.send(ChangeEvent { table, op, keys });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TablesState> {
        self.state.lock().expect("memory state lock poisoned")
    }

    fn create_account_locked(
        state: &mut TablesState,
        account: &NewAccount,
        confirmed: bool,
    ) -> Result<Uuid, AppError> {
        if state
            .accounts
            .values()
            .any(|a| a.email.eq_ignore_ascii_case(&account.email))
        {
            return Err(AppError::EmailAlreadyExists);
        }
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        state.accounts.insert(
            user_id,
            MemoryAccount {
                email: account.email.clone(),
                password: account.password.clone(),
                confirmed,
            },
        );
        state.profiles.push(Profile {
            id: Uuid::new_v4(),
            user_id,
            name: account.name.clone(),
            email: account.email.clone(),
            phone: account.phone.clone(),
            avatar_url: None,
            address: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        });
        state.roles.insert(user_id, account.role);
        Ok(user_id)
    }
}

// Listagens voltam em ordem de criação invertida (mais novo primeiro).
fn newest_first<T: Clone>(items: impl Iterator<Item = T>) -> Vec<T> {
    let mut collected: Vec<T> = items.collect();
    collected.reverse();
    collected
}

// ---
// ProfileStore
// ---

#[async_trait]
impl ProfileStore for MemoryBackend {
    async fn find_profile(&self, user_id: Uuid) -> Result<Option<Profile>, AppError> {
        let state = self.lock();
        Ok(state
            .profiles
            .iter()
            .find(|p| p.user_id == user_id)
            .cloned())
    }

    async fn find_profiles(&self, user_ids: &[Uuid]) -> Result<Vec<Profile>, AppError> {
        let state = self.lock();
        Ok(state
            .profiles
            .iter()
            .filter(|p| user_ids.contains(&p.user_id))
            .cloned()
            .collect())
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>, AppError> {
        let state = self.lock();
        Ok(newest_first(state.profiles.iter().cloned()))
    }

    async fn find_role(&self, user_id: Uuid) -> Result<Option<Role>, AppError> {
        let state = self.lock();
        Ok(state.roles.get(&user_id).copied())
    }

    async fn list_roles(&self) -> Result<Vec<(Uuid, Role)>, AppError> {
        let state = self.lock();
        Ok(state.roles.iter().map(|(k, v)| (*k, *v)).collect())
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        patch: &UpdateProfilePayload,
    ) -> Result<Profile, AppError> {
        let updated = {
            let mut state = self.lock();
            let profile = state
                .profiles
                .iter_mut()
                .find(|p| p.user_id == user_id)
                .ok_or(AppError::ProfileNotFound)?;
            if let Some(name) = &patch.name {
                profile.name = name.clone();
            }
            if let Some(phone) = &patch.phone {
                profile.phone = Some(phone.clone());
            }
            if let Some(address) = &patch.address {
                profile.address = Some(address.clone());
            }
            if let Some(avatar_url) = &patch.avatar_url {
                profile.avatar_url = Some(avatar_url.clone());
            }
            profile.updated_at = Utc::now();
            profile.clone()
        };
        self.publish(Table::Profiles, ChangeOp::Update, &[("user_id", user_id)]);
        Ok(updated)
    }

    async fn set_profile_active(&self, user_id: Uuid, active: bool) -> Result<Profile, AppError> {
        let updated = {
            let mut state = self.lock();
            let profile = state
                .profiles
                .iter_mut()
                .find(|p| p.user_id == user_id)
                .ok_or(AppError::ProfileNotFound)?;
            profile.is_active = active;
            profile.updated_at = Utc::now();
            profile.clone()
        };
        self.publish(Table::Profiles, ChangeOp::Update, &[("user_id", user_id)]);
        Ok(updated)
    }
}

// ---
// ShopStore
// ---

#[async_trait]
impl ShopStore for MemoryBackend {
    async fn list_active_shops(&self) -> Result<Vec<Shop>, AppError> {
        self.shop_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(newest_first(
            state.shops.iter().filter(|s| s.is_active).cloned(),
        ))
    }

    async fn list_shops_by_owner(&self, owner_id: Uuid) -> Result<Vec<Shop>, AppError> {
        self.shop_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(newest_first(
            state.shops.iter().filter(|s| s.owner_id == owner_id).cloned(),
        ))
    }

    async fn find_shop(&self, id: Uuid) -> Result<Option<Shop>, AppError> {
        self.shop_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(state.shops.iter().find(|s| s.id == id).cloned())
    }

    async fn find_shops(&self, ids: &[Uuid]) -> Result<Vec<Shop>, AppError> {
        self.shop_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(state
            .shops
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn insert_shop(
        &self,
        owner_id: Uuid,
        input: &CreateShopInput,
    ) -> Result<Shop, AppError> {
        let now = Utc::now();
        let shop = Shop {
            id: Uuid::new_v4(),
            owner_id,
            name: input.name.clone(),
            address: input.address.clone(),
            image_url: input.image_url.clone(),
            operating_hours: input.operating_hours.clone(),
            is_open: true,
            is_active: true,
            rating: None,
            review_count: None,
            latitude: input.latitude,
            longitude: input.longitude,
            created_at: now,
            updated_at: now,
        };
        self.lock().shops.push(shop.clone());
        self.publish(
            Table::Shops,
            ChangeOp::Insert,
            &[("id", shop.id), ("owner_id", owner_id)],
        );
        Ok(shop)
    }

    async fn update_shop(&self, id: Uuid, input: &UpdateShopInput) -> Result<Shop, AppError> {
        let updated = {
            let mut state = self.lock();
            let shop = state
                .shops
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or(AppError::NotFound("Loja"))?;
            if let Some(name) = &input.name {
                shop.name = name.clone();
            }
            if let Some(address) = &input.address {
                shop.address = address.clone();
            }
            if let Some(image_url) = &input.image_url {
                shop.image_url = Some(image_url.clone());
            }
            if let Some(operating_hours) = &input.operating_hours {
                shop.operating_hours = Some(operating_hours.clone());
            }
            if let Some(latitude) = input.latitude {
                shop.latitude = Some(latitude);
            }
            if let Some(longitude) = input.longitude {
                shop.longitude = Some(longitude);
            }
            if let Some(is_open) = input.is_open {
                shop.is_open = is_open;
            }
            if let Some(is_active) = input.is_active {
                shop.is_active = is_active;
            }
            shop.updated_at = Utc::now();
            shop.clone()
        };
        self.publish(
            Table::Shops,
            ChangeOp::Update,
            &[("id", id), ("owner_id", updated.owner_id)],
        );
        Ok(updated)
    }
}

// ---
// VehicleStore
// ---

#[async_trait]
impl VehicleStore for MemoryBackend {
    async fn list_available_vehicles(
        &self,
        shop_id: Option<Uuid>,
    ) -> Result<Vec<Vehicle>, AppError> {
        self.vehicle_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(newest_first(state.vehicles.iter().filter(|v| {
            v.is_available && shop_id.map_or(true, |s| v.shop_id == s)
        }).cloned()))
    }

    async fn list_vehicles_in_shops(&self, shop_ids: &[Uuid]) -> Result<Vec<Vehicle>, AppError> {
        self.vehicle_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(newest_first(
            state
                .vehicles
                .iter()
                .filter(|v| shop_ids.contains(&v.shop_id))
                .cloned(),
        ))
    }

    async fn find_vehicle(&self, id: Uuid) -> Result<Option<Vehicle>, AppError> {
        self.vehicle_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(state.vehicles.iter().find(|v| v.id == id).cloned())
    }

    async fn find_vehicles(&self, ids: &[Uuid]) -> Result<Vec<Vehicle>, AppError> {
        self.vehicle_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(state
            .vehicles
            .iter()
            .filter(|v| ids.contains(&v.id))
            .cloned()
            .collect())
    }

    async fn insert_vehicle(&self, input: &CreateVehicleInput) -> Result<Vehicle, AppError> {
        let now = Utc::now();
        let vehicle = Vehicle {
            id: Uuid::new_v4(),
            shop_id: input.shop_id,
            vehicle_type: input.vehicle_type,
            name: input.name.clone(),
            brand: input.brand.clone(),
            model: input.model.clone(),
            images: input.images.clone(),
            price_per_hour: input.price_per_hour,
            price_per_day: input.price_per_day,
            fuel_type: input.fuel_type.clone(),
            transmission: input.transmission.clone(),
            seating: input.seating,
            features: input.features.clone(),
            is_available: true,
            created_at: now,
            updated_at: now,
        };
        self.lock().vehicles.push(vehicle.clone());
        self.publish(
            Table::Vehicles,
            ChangeOp::Insert,
            &[("id", vehicle.id), ("shop_id", vehicle.shop_id)],
        );
        Ok(vehicle)
    }

    async fn update_vehicle(
        &self,
        id: Uuid,
        input: &UpdateVehicleInput,
    ) -> Result<Vehicle, AppError> {
        let updated = {
            let mut state = self.lock();
            let vehicle = state
                .vehicles
                .iter_mut()
                .find(|v| v.id == id)
                .ok_or(AppError::NotFound("Veículo"))?;
            if let Some(name) = &input.name {
                vehicle.name = name.clone();
            }
            if let Some(brand) = &input.brand {
                vehicle.brand = brand.clone();
            }
            if let Some(model) = &input.model {
                vehicle.model = model.clone();
            }
            if let Some(images) = &input.images {
                vehicle.images = images.clone();
            }
            if let Some(price_per_hour) = input.price_per_hour {
                vehicle.price_per_hour = price_per_hour;
            }
            if let Some(price_per_day) = input.price_per_day {
                vehicle.price_per_day = price_per_day;
            }
            if let Some(fuel_type) = &input.fuel_type {
                vehicle.fuel_type = Some(fuel_type.clone());
            }
            if let Some(transmission) = &input.transmission {
                vehicle.transmission = Some(transmission.clone());
            }
            if let Some(seating) = input.seating {
                vehicle.seating = Some(seating);
            }
            if let Some(features) = &input.features {
                vehicle.features = features.clone();
            }
            if let Some(is_available) = input.is_available {
                vehicle.is_available = is_available;
            }
            vehicle.updated_at = Utc::now();
            vehicle.clone()
        };
        self.publish(
            Table::Vehicles,
            ChangeOp::Update,
            &[("id", id), ("shop_id", updated.shop_id)],
        );
        Ok(updated)
    }

    async fn set_vehicle_availability(
        &self,
        id: Uuid,
        available: bool,
    ) -> Result<Vehicle, AppError> {
        self.update_vehicle(
            id,
            &UpdateVehicleInput {
                is_available: Some(available),
                ..Default::default()
            },
        )
        .await
    }

    async fn delete_vehicle(&self, id: Uuid) -> Result<(), AppError> {
        let shop_id = {
            let mut state = self.lock();
            let pos = state
                .vehicles
                .iter()
                .position(|v| v.id == id)
                .ok_or(AppError::NotFound("Veículo"))?;
            state.vehicles.remove(pos).shop_id
        };
        self.publish(
            Table::Vehicles,
            ChangeOp::Delete,
            &[("id", id), ("shop_id", shop_id)],
        );
        Ok(())
    }
}

// ---
// StaffStore
// ---

#[async_trait]
impl StaffStore for MemoryBackend {
    async fn find_staff(&self, id: Uuid) -> Result<Option<Staff>, AppError> {
        let state = self.lock();
        Ok(state.staff.iter().find(|s| s.id == id).cloned())
    }

    async fn find_staff_by_user(&self, user_id: Uuid) -> Result<Option<Staff>, AppError> {
        let state = self.lock();
        Ok(state.staff.iter().find(|s| s.user_id == user_id).cloned())
    }

    async fn list_staff_by_owner(&self, owner_id: Uuid) -> Result<Vec<Staff>, AppError> {
        let state = self.lock();
        Ok(newest_first(
            state.staff.iter().filter(|s| s.owner_id == owner_id).cloned(),
        ))
    }

    async fn list_all_staff(&self) -> Result<Vec<Staff>, AppError> {
        let state = self.lock();
        Ok(newest_first(state.staff.iter().cloned()))
    }

    async fn insert_staff(
        &self,
        user_id: Uuid,
        owner_id: Uuid,
        shop_id: Option<Uuid>,
    ) -> Result<Staff, AppError> {
        if self.take_failure("insert_staff") {
            return Err(AppError::MutationFailed {
                entity: Entity::Staff,
                reason: "falha injetada".into(),
            });
        }
        let now = Utc::now();
        let staff = Staff {
            id: Uuid::new_v4(),
            user_id,
            owner_id,
            shop_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.lock().staff.push(staff.clone());
        self.publish(
            Table::Staff,
            ChangeOp::Insert,
            &[("id", staff.id), ("user_id", user_id), ("owner_id", owner_id)],
        );
        Ok(staff)
    }

    async fn update_staff(&self, id: Uuid, input: &UpdateStaffInput) -> Result<Staff, AppError> {
        let updated = {
            let mut state = self.lock();
            let staff = state
                .staff
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or(AppError::NotFound("Staff"))?;
            if let Some(shop_id) = input.shop_id {
                staff.shop_id = Some(shop_id);
            }
            if let Some(is_active) = input.is_active {
                staff.is_active = is_active;
            }
            staff.updated_at = Utc::now();
            staff.clone()
        };
        self.publish(
            Table::Staff,
            ChangeOp::Update,
            &[("id", id), ("owner_id", updated.owner_id)],
        );
        Ok(updated)
    }

    async fn delete_staff(&self, id: Uuid) -> Result<Staff, AppError> {
        let removed = {
            let mut state = self.lock();
            let pos = state
                .staff
                .iter()
                .position(|s| s.id == id)
                .ok_or(AppError::NotFound("Staff"))?;
            state.staff.remove(pos)
        };
        self.publish(
            Table::Staff,
            ChangeOp::Delete,
            &[("id", id), ("owner_id", removed.owner_id)],
        );
        Ok(removed)
    }
}

// ---
// BookingStore
// ---

#[async_trait]
impl BookingStore for MemoryBackend {
    async fn find_booking(&self, id: Uuid) -> Result<Option<Booking>, AppError> {
        let state = self.lock();
        Ok(state.bookings.iter().find(|b| b.id == id).cloned())
    }

    async fn list_bookings_by_user(&self, user_id: Uuid) -> Result<Vec<Booking>, AppError> {
        let state = self.lock();
        Ok(newest_first(
            state
                .bookings
                .iter()
                .filter(|b| b.user_id == user_id)
                .cloned(),
        ))
    }

    async fn list_bookings_in_shops(&self, shop_ids: &[Uuid]) -> Result<Vec<Booking>, AppError> {
        let state = self.lock();
        Ok(newest_first(
            state
                .bookings
                .iter()
                .filter(|b| shop_ids.contains(&b.shop_id))
                .cloned(),
        ))
    }

    async fn list_bookings_for_staff(
        &self,
        staff_id: Uuid,
        shop_id: Option<Uuid>,
    ) -> Result<Vec<Booking>, AppError> {
        let state = self.lock();
        Ok(newest_first(state.bookings.iter().filter(|b| {
            b.staff_id == Some(staff_id)
                || (b.staff_id.is_none() && shop_id.is_some_and(|s| b.shop_id == s))
        }).cloned()))
    }

    async fn insert_booking(
        &self,
        user_id: Uuid,
        input: &CreateBookingInput,
    ) -> Result<Booking, AppError> {
        let now = Utc::now();
        let booking = Booking {
            id: Uuid::new_v4(),
            user_id,
            vehicle_id: input.vehicle_id,
            shop_id: input.shop_id,
            staff_id: None,
            start_date: input.start_date,
            end_date: input.end_date,
            total_price: input.total_price,
            status: BookingStatus::Upcoming,
            delivery_address: input.delivery_address.clone(),
            delivery_status: input
                .delivery_address
                .as_ref()
                .map(|_| DeliveryStatus::Pending),
            created_at: now,
            updated_at: now,
        };
        self.lock().bookings.push(booking.clone());
        self.publish(
            Table::Bookings,
            ChangeOp::Insert,
            &[
                ("id", booking.id),
                ("user_id", user_id),
                ("shop_id", booking.shop_id),
            ],
        );
        Ok(booking)
    }

    async fn update_booking(
        &self,
        id: Uuid,
        input: &UpdateBookingInput,
    ) -> Result<Booking, AppError> {
        let updated = {
            let mut state = self.lock();
            let booking = state
                .bookings
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or(AppError::NotFound("Reserva"))?;
            if let Some(status) = input.status {
                booking.status = status;
            }
            if let Some(delivery_status) = input.delivery_status {
                booking.delivery_status = Some(delivery_status);
            }
            if let Some(staff_id) = input.staff_id {
                booking.staff_id = Some(staff_id);
            }
            booking.updated_at = Utc::now();
            booking.clone()
        };
        self.publish(
            Table::Bookings,
            ChangeOp::Update,
            &[
                ("id", id),
                ("user_id", updated.user_id),
                ("shop_id", updated.shop_id),
            ],
        );
        Ok(updated)
    }
}

// ---
// SavedShopStore
// ---

#[async_trait]
impl SavedShopStore for MemoryBackend {
    async fn list_saved_shops(&self, user_id: Uuid) -> Result<Vec<SavedShop>, AppError> {
        let state = self.lock();
        Ok(newest_first(
            state
                .saved_shops
                .iter()
                .filter(|s| s.user_id == user_id)
                .cloned(),
        ))
    }

    async fn find_saved_shop(
        &self,
        user_id: Uuid,
        shop_id: Uuid,
    ) -> Result<Option<SavedShop>, AppError> {
        let state = self.lock();
        Ok(state
            .saved_shops
            .iter()
            .find(|s| s.user_id == user_id && s.shop_id == shop_id)
            .cloned())
    }

    async fn insert_saved_shop(
        &self,
        user_id: Uuid,
        shop_id: Uuid,
    ) -> Result<SavedShop, AppError> {
        let saved = {
            let mut state = self.lock();
            // Mesma restrição UNIQUE (user_id, shop_id) do banco.
            if state
                .saved_shops
                .iter()
                .any(|s| s.user_id == user_id && s.shop_id == shop_id)
            {
                return Err(AppError::MutationFailed {
                    entity: Entity::SavedShops,
                    reason: "favorito duplicado para (usuário, loja)".into(),
                });
            }
            let saved = SavedShop {
                id: Uuid::new_v4(),
                user_id,
                shop_id,
                created_at: Utc::now(),
            };
            state.saved_shops.push(saved.clone());
            saved
        };
        self.publish(
            Table::SavedShops,
            ChangeOp::Insert,
            &[("id", saved.id), ("user_id", user_id), ("shop_id", shop_id)],
        );
        Ok(saved)
    }

    async fn delete_saved_shop(&self, id: Uuid) -> Result<(), AppError> {
        let removed = {
            let mut state = self.lock();
            let pos = state
                .saved_shops
                .iter()
                .position(|s| s.id == id)
                .ok_or(AppError::NotFound("Favorito"))?;
            state.saved_shops.remove(pos)
        };
        self.publish(
            Table::SavedShops,
            ChangeOp::Delete,
            &[
                ("id", id),
                ("user_id", removed.user_id),
                ("shop_id", removed.shop_id),
            ],
        );
        Ok(())
    }
}

// ---
// IdentityStore
// ---

#[async_trait]
impl IdentityStore for MemoryBackend {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AppError> {
        let mut state = self.lock();
        let (user_id, account) = state
            .accounts
            .iter()
            .find(|(_, a)| a.email.eq_ignore_ascii_case(email))
            .map(|(id, a)| (*id, a.clone()))
            .ok_or(AppError::InvalidCredentials)?;
        if account.password != password {
            return Err(AppError::InvalidCredentials);
        }
        if !account.confirmed {
            return Err(AppError::EmailConfirmationRequired);
        }
        let token = Uuid::new_v4().to_string();
        state.sessions.insert(token.clone(), user_id);
        Ok(AuthSession {
            access_token: token,
            user_id,
            expires_at: Utc::now() + chrono::Duration::days(7),
        })
    }

    async fn sign_up(&self, account: NewAccount) -> Result<SignUpOutcome, AppError> {
        let (user_id, confirmed) = {
            let mut state = self.lock();
            let confirmed = !self.require_email_confirmation;
            let user_id = Self::create_account_locked(&mut state, &account, confirmed)?;
            (user_id, confirmed)
        };
        self.publish(Table::Profiles, ChangeOp::Insert, &[("user_id", user_id)]);
        self.publish(Table::UserRoles, ChangeOp::Insert, &[("user_id", user_id)]);
        if !confirmed {
            return Ok(SignUpOutcome::PendingVerification);
        }
        let token = Uuid::new_v4().to_string();
        self.lock().sessions.insert(token.clone(), user_id);
        Ok(SignUpOutcome::Session(AuthSession {
            access_token: token,
            user_id,
            expires_at: Utc::now() + chrono::Duration::days(7),
        }))
    }

    async fn sign_out(&self, token: &str) -> Result<(), AppError> {
        self.lock().sessions.remove(token);
        Ok(())
    }

    async fn resolve_session(&self, token: &str) -> Result<Uuid, AppError> {
        let state = self.lock();
        let user_id = *state.sessions.get(token).ok_or(AppError::InvalidToken)?;
        if !state.accounts.contains_key(&user_id) {
            return Err(AppError::InvalidToken);
        }
        Ok(user_id)
    }

    async fn verify_password(&self, user_id: Uuid, password: &str) -> Result<bool, AppError> {
        let state = self.lock();
        Ok(state
            .accounts
            .get(&user_id)
            .is_some_and(|a| a.password == password))
    }

    async fn update_password(&self, user_id: Uuid, new_password: &str) -> Result<(), AppError> {
        let mut state = self.lock();
        let account = state
            .accounts
            .get_mut(&user_id)
            .ok_or(AppError::InvalidToken)?;
        account.password = new_password.to_string();
        Ok(())
    }

    async fn admin_create_user(&self, account: NewAccount) -> Result<Uuid, AppError> {
        let user_id = {
            let mut state = self.lock();
            // Conta criada por dono já nasce confirmada.
            Self::create_account_locked(&mut state, &account, true)
                .map_err(|e| match e {
                    AppError::EmailAlreadyExists => {
                        AppError::IdentityRejected("Este e-mail já está em uso.".into())
                    }
                    other => other,
                })?
        };
        self.publish(Table::Profiles, ChangeOp::Insert, &[("user_id", user_id)]);
        self.publish(Table::UserRoles, ChangeOp::Insert, &[("user_id", user_id)]);
        Ok(user_id)
    }

    async fn admin_delete_user(&self, user_id: Uuid) -> Result<(), AppError> {
        let mut state = self.lock();
        state.accounts.remove(&user_id);
        state.profiles.retain(|p| p.user_id != user_id);
        state.roles.remove(&user_id);
        state.sessions.retain(|_, uid| *uid != user_id);
        Ok(())
    }
}

// ---
// ChangeFeed
// ---

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(
        &self,
        table: Table,
        filter: Option<ChangeFilter>,
    ) -> Result<ChangeStream, AppError> {
        Ok(ChangeStream::new(self.feed_tx.subscribe(), table, filter))
    }
}
