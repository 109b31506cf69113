// src/store/postgres.rs
//
// Adaptadores Postgres das três portas. `PgStore` cobre as tabelas de
// domínio, `PgIdentityStore` cuida de conta/sessão (bcrypt + JWT) e
// `PgChangeFeed` transforma NOTIFYs dos triggers em eventos do feed.

use std::collections::HashMap;

use async_trait::async_trait;
use bcrypt::{hash, verify};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cache::Entity;
use crate::common::error::AppError;
use crate::models::auth::{Claims, Profile, Role, UpdateProfilePayload};
use crate::models::bookings::{Booking, CreateBookingInput, UpdateBookingInput};
use crate::models::saved_shops::SavedShop;
use crate::models::shops::{CreateShopInput, Shop, UpdateShopInput};
use crate::models::staff::{Staff, UpdateStaffInput};
use crate::models::vehicles::{CreateVehicleInput, UpdateVehicleInput, Vehicle};
use crate::store::changes::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeOp, ChangeStream, Table};
use crate::store::identity::{AuthSession, IdentityStore, NewAccount, SignUpOutcome};
use crate::store::tables::{
    BookingStore, ProfileStore, SavedShopStore, ShopStore, StaffStore, VehicleStore,
};

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn find_profile(&self, user_id: Uuid) -> Result<Option<Profile>, AppError> {
        let profile = sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(profile)
    }

    async fn find_profiles(&self, user_ids: &[Uuid]) -> Result<Vec<Profile>, AppError> {
        let profiles =
            sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE user_id = ANY($1)")
                .bind(user_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(profiles)
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>, AppError> {
        let profiles =
            sqlx::query_as::<_, Profile>("SELECT * FROM profiles ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(profiles)
    }

    async fn find_role(&self, user_id: Uuid) -> Result<Option<Role>, AppError> {
        let role = sqlx::query_scalar::<_, Role>("SELECT role FROM user_roles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role)
    }

    async fn list_roles(&self) -> Result<Vec<(Uuid, Role)>, AppError> {
        let roles = sqlx::query_as::<_, (Uuid, Role)>("SELECT user_id, role FROM user_roles")
            .fetch_all(&self.pool)
            .await?;
        Ok(roles)
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        patch: &UpdateProfilePayload,
    ) -> Result<Profile, AppError> {
        let profile = sqlx::query_as::<_, Profile>(
            r#"
            UPDATE profiles SET
                name       = COALESCE($2, name),
                phone      = COALESCE($3, phone),
                address    = COALESCE($4, address),
                avatar_url = COALESCE($5, avatar_url),
                updated_at = now()
            WHERE user_id = $1
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(patch.name.as_deref())
        .bind(patch.phone.as_deref())
        .bind(patch.address.as_deref())
        .bind(patch.avatar_url.as_deref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::ProfileNotFound)?;
        Ok(profile)
    }

    async fn set_profile_active(&self, user_id: Uuid, active: bool) -> Result<Profile, AppError> {
        let profile = sqlx::query_as::<_, Profile>(
            "UPDATE profiles SET is_active = $2, updated_at = now() WHERE user_id = $1 RETURNING *",
        )
        .bind(user_id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::ProfileNotFound)?;
        Ok(profile)
    }
}

#[async_trait]
impl ShopStore for PgStore {
    async fn list_active_shops(&self) -> Result<Vec<Shop>, AppError> {
        let shops = sqlx::query_as::<_, Shop>(
            "SELECT * FROM shops WHERE is_active = TRUE ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(shops)
    }

    async fn list_shops_by_owner(&self, owner_id: Uuid) -> Result<Vec<Shop>, AppError> {
        let shops = sqlx::query_as::<_, Shop>(
            "SELECT * FROM shops WHERE owner_id = $1 ORDER BY created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(shops)
    }

    async fn find_shop(&self, id: Uuid) -> Result<Option<Shop>, AppError> {
        let shop = sqlx::query_as::<_, Shop>("SELECT * FROM shops WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(shop)
    }

    async fn find_shops(&self, ids: &[Uuid]) -> Result<Vec<Shop>, AppError> {
        let shops = sqlx::query_as::<_, Shop>("SELECT * FROM shops WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(shops)
    }

    async fn insert_shop(
        &self,
        owner_id: Uuid,
        input: &CreateShopInput,
    ) -> Result<Shop, AppError> {
        let shop = sqlx::query_as::<_, Shop>(
            r#"
            INSERT INTO shops (owner_id, name, address, image_url, operating_hours, latitude, longitude)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(owner_id)
        .bind(&input.name)
        .bind(&input.address)
        .bind(input.image_url.as_deref())
        .bind(input.operating_hours.as_deref())
        .bind(input.latitude)
        .bind(input.longitude)
        .fetch_one(&self.pool)
        .await?;
        Ok(shop)
    }

    async fn update_shop(&self, id: Uuid, input: &UpdateShopInput) -> Result<Shop, AppError> {
        let shop = sqlx::query_as::<_, Shop>(
            r#"
            UPDATE shops SET
                name            = COALESCE($2, name),
                address         = COALESCE($3, address),
                image_url       = COALESCE($4, image_url),
                operating_hours = COALESCE($5, operating_hours),
                latitude        = COALESCE($6, latitude),
                longitude       = COALESCE($7, longitude),
                is_open         = COALESCE($8, is_open),
                is_active       = COALESCE($9, is_active),
                updated_at      = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.name.as_deref())
        .bind(input.address.as_deref())
        .bind(input.image_url.as_deref())
        .bind(input.operating_hours.as_deref())
        .bind(input.latitude)
        .bind(input.longitude)
        .bind(input.is_open)
        .bind(input.is_active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("Loja"))?;
        Ok(shop)
    }
}

#[async_trait]
impl VehicleStore for PgStore {
    async fn list_available_vehicles(
        &self,
        shop_id: Option<Uuid>,
    ) -> Result<Vec<Vehicle>, AppError> {
        let vehicles = sqlx::query_as::<_, Vehicle>(
            r#"
            SELECT * FROM vehicles
            WHERE is_available = TRUE
              AND ($1::uuid IS NULL OR shop_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(shop_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(vehicles)
    }

    async fn list_vehicles_in_shops(&self, shop_ids: &[Uuid]) -> Result<Vec<Vehicle>, AppError> {
        let vehicles = sqlx::query_as::<_, Vehicle>(
            "SELECT * FROM vehicles WHERE shop_id = ANY($1) ORDER BY created_at DESC",
        )
        .bind(shop_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(vehicles)
    }

    async fn find_vehicle(&self, id: Uuid) -> Result<Option<Vehicle>, AppError> {
        let vehicle = sqlx::query_as::<_, Vehicle>("SELECT * FROM vehicles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(vehicle)
    }

    async fn find_vehicles(&self, ids: &[Uuid]) -> Result<Vec<Vehicle>, AppError> {
        let vehicles = sqlx::query_as::<_, Vehicle>("SELECT * FROM vehicles WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(vehicles)
    }

    async fn insert_vehicle(&self, input: &CreateVehicleInput) -> Result<Vehicle, AppError> {
        let vehicle = sqlx::query_as::<_, Vehicle>(
            r#"
            INSERT INTO vehicles
                (shop_id, "type", name, brand, model, images, price_per_hour,
                 price_per_day, fuel_type, transmission, seating, features)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(input.shop_id)
        .bind(input.vehicle_type)
        .bind(&input.name)
        .bind(&input.brand)
        .bind(&input.model)
        .bind(&input.images)
        .bind(input.price_per_hour)
        .bind(input.price_per_day)
        .bind(input.fuel_type.as_deref())
        .bind(input.transmission.as_deref())
        .bind(input.seating)
        .bind(&input.features)
        .fetch_one(&self.pool)
        .await?;
        Ok(vehicle)
    }

    async fn update_vehicle(
        &self,
        id: Uuid,
        input: &UpdateVehicleInput,
    ) -> Result<Vehicle, AppError> {
        let vehicle = sqlx::query_as::<_, Vehicle>(
            r#"
            UPDATE vehicles SET
                name           = COALESCE($2, name),
                brand          = COALESCE($3, brand),
                model          = COALESCE($4, model),
                images         = COALESCE($5, images),
                price_per_hour = COALESCE($6, price_per_hour),
                price_per_day  = COALESCE($7, price_per_day),
                fuel_type      = COALESCE($8, fuel_type),
                transmission   = COALESCE($9, transmission),
                seating        = COALESCE($10, seating),
                features       = COALESCE($11, features),
                is_available   = COALESCE($12, is_available),
                updated_at     = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.name.as_deref())
        .bind(input.brand.as_deref())
        .bind(input.model.as_deref())
        .bind(input.images.as_ref())
        .bind(input.price_per_hour)
        .bind(input.price_per_day)
        .bind(input.fuel_type.as_deref())
        .bind(input.transmission.as_deref())
        .bind(input.seating)
        .bind(input.features.as_ref())
        .bind(input.is_available)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("Veículo"))?;
        Ok(vehicle)
    }

    async fn set_vehicle_availability(
        &self,
        id: Uuid,
        available: bool,
    ) -> Result<Vehicle, AppError> {
        let vehicle = sqlx::query_as::<_, Vehicle>(
            "UPDATE vehicles SET is_available = $2, updated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(available)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("Veículo"))?;
        Ok(vehicle)
    }

    async fn delete_vehicle(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM vehicles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Veículo"));
        }
        Ok(())
    }
}

#[async_trait]
impl StaffStore for PgStore {
    async fn find_staff(&self, id: Uuid) -> Result<Option<Staff>, AppError> {
        let staff = sqlx::query_as::<_, Staff>("SELECT * FROM staff WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(staff)
    }

    async fn find_staff_by_user(&self, user_id: Uuid) -> Result<Option<Staff>, AppError> {
        let staff = sqlx::query_as::<_, Staff>("SELECT * FROM staff WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(staff)
    }

    async fn list_staff_by_owner(&self, owner_id: Uuid) -> Result<Vec<Staff>, AppError> {
        let staff = sqlx::query_as::<_, Staff>(
            "SELECT * FROM staff WHERE owner_id = $1 ORDER BY created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(staff)
    }

    async fn list_all_staff(&self) -> Result<Vec<Staff>, AppError> {
        let staff = sqlx::query_as::<_, Staff>("SELECT * FROM staff ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(staff)
    }

    async fn insert_staff(
        &self,
        user_id: Uuid,
        owner_id: Uuid,
        shop_id: Option<Uuid>,
    ) -> Result<Staff, AppError> {
        let staff = sqlx::query_as::<_, Staff>(
            "INSERT INTO staff (user_id, owner_id, shop_id) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(user_id)
        .bind(owner_id)
        .bind(shop_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::MutationFailed {
                    entity: Entity::Staff,
                    reason: "este usuário já é staff".into(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(staff)
    }

    async fn update_staff(&self, id: Uuid, input: &UpdateStaffInput) -> Result<Staff, AppError> {
        let staff = sqlx::query_as::<_, Staff>(
            r#"
            UPDATE staff SET
                shop_id    = COALESCE($2, shop_id),
                is_active  = COALESCE($3, is_active),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.shop_id)
        .bind(input.is_active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("Staff"))?;
        Ok(staff)
    }

    async fn delete_staff(&self, id: Uuid) -> Result<Staff, AppError> {
        let staff = sqlx::query_as::<_, Staff>("DELETE FROM staff WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound("Staff"))?;
        Ok(staff)
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn find_booking(&self, id: Uuid) -> Result<Option<Booking>, AppError> {
        let booking = sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(booking)
    }

    async fn list_bookings_by_user(&self, user_id: Uuid) -> Result<Vec<Booking>, AppError> {
        let bookings = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookings)
    }

    async fn list_bookings_in_shops(&self, shop_ids: &[Uuid]) -> Result<Vec<Booking>, AppError> {
        let bookings = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE shop_id = ANY($1) ORDER BY created_at DESC",
        )
        .bind(shop_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookings)
    }

    async fn list_bookings_for_staff(
        &self,
        staff_id: Uuid,
        shop_id: Option<Uuid>,
    ) -> Result<Vec<Booking>, AppError> {
        // Atribuídas ao staff, ou sem atribuição na loja dele.
        let bookings = sqlx::query_as::<_, Booking>(
            r#"
            SELECT * FROM bookings
            WHERE staff_id = $1
               OR ($2::uuid IS NOT NULL AND shop_id = $2 AND staff_id IS NULL)
            ORDER BY created_at DESC
            "#,
        )
        .bind(staff_id)
        .bind(shop_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookings)
    }

    async fn insert_booking(
        &self,
        user_id: Uuid,
        input: &CreateBookingInput,
    ) -> Result<Booking, AppError> {
        // delivery_status só nasce quando há endereço de entrega.
        let booking = sqlx::query_as::<_, Booking>(
            r#"
            INSERT INTO bookings
                (user_id, vehicle_id, shop_id, start_date, end_date, total_price,
                 delivery_address, delivery_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7,
                    CASE WHEN $7::text IS NULL THEN NULL ELSE 'pending'::delivery_status END)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(input.vehicle_id)
        .bind(input.shop_id)
        .bind(input.start_date)
        .bind(input.end_date)
        .bind(input.total_price)
        .bind(input.delivery_address.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(booking)
    }

    async fn update_booking(
        &self,
        id: Uuid,
        input: &UpdateBookingInput,
    ) -> Result<Booking, AppError> {
        let booking = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings SET
                status          = COALESCE($2, status),
                delivery_status = COALESCE($3, delivery_status),
                staff_id        = COALESCE($4, staff_id),
                updated_at      = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.status)
        .bind(input.delivery_status)
        .bind(input.staff_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("Reserva"))?;
        Ok(booking)
    }
}

#[async_trait]
impl SavedShopStore for PgStore {
    async fn list_saved_shops(&self, user_id: Uuid) -> Result<Vec<SavedShop>, AppError> {
        let saved = sqlx::query_as::<_, SavedShop>(
            "SELECT * FROM saved_shops WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(saved)
    }

    async fn find_saved_shop(
        &self,
        user_id: Uuid,
        shop_id: Uuid,
    ) -> Result<Option<SavedShop>, AppError> {
        let saved = sqlx::query_as::<_, SavedShop>(
            "SELECT * FROM saved_shops WHERE user_id = $1 AND shop_id = $2",
        )
        .bind(user_id)
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(saved)
    }

    async fn insert_saved_shop(
        &self,
        user_id: Uuid,
        shop_id: Uuid,
    ) -> Result<SavedShop, AppError> {
        let saved = sqlx::query_as::<_, SavedShop>(
            "INSERT INTO saved_shops (user_id, shop_id) VALUES ($1, $2) RETURNING *",
        )
        .bind(user_id)
        .bind(shop_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            // A UNIQUE (user_id, shop_id) segura corrida de duplo toggle.
            if is_unique_violation(&e) {
                AppError::MutationFailed {
                    entity: Entity::SavedShops,
                    reason: "favorito duplicado para (usuário, loja)".into(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(saved)
    }

    async fn delete_saved_shop(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM saved_shops WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Favorito"));
        }
        Ok(())
    }
}

// ---
// Identity store (contas, bcrypt, JWT)
// ---

#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
    jwt_secret: String,
    require_email_confirmation: bool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool, jwt_secret: String, require_email_confirmation: bool) -> Self {
        Self {
            pool,
            jwt_secret,
            require_email_confirmation,
        }
    }

    fn create_session(&self, user_id: Uuid) -> Result<AuthSession, AppError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::days(7);

        let claims = Claims {
            sub: user_id,
            exp: expires_at.timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_ref()),
        )?;

        Ok(AuthSession {
            access_token: token,
            user_id,
            expires_at,
        })
    }

    async fn hash_password(password: &str) -> Result<String, AppError> {
        let password = password.to_owned();
        let hashed = tokio::task::spawn_blocking(move || hash(&password, bcrypt::DEFAULT_COST))
            .await
            .map_err(|e| anyhow::anyhow!("Falha na task de hashing: {}", e))??;
        Ok(hashed)
    }

    async fn verify_hash(password: &str, password_hash: &str) -> Result<bool, AppError> {
        let password = password.to_owned();
        let password_hash = password_hash.to_owned();
        let valid = tokio::task::spawn_blocking(move || verify(&password, &password_hash))
            .await
            .map_err(|e| anyhow::anyhow!("Falha na task de verificação de senha: {}", e))??;
        Ok(valid)
    }

    // Conta + perfil + papel numa transação só: se o perfil falhar, a
    // conta é desfeita junto no rollback.
    async fn create_account(
        &self,
        account: &NewAccount,
        confirmed: bool,
    ) -> Result<Uuid, AppError> {
        let hashed = Self::hash_password(&account.password).await?;

        let mut tx = self.pool.begin().await?;

        let user_id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO accounts (email, password_hash, email_confirmed) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&account.email)
        .bind(&hashed)
        .bind(confirmed)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::EmailAlreadyExists
            } else {
                e.into()
            }
        })?;

        sqlx::query("INSERT INTO profiles (user_id, name, email, phone) VALUES ($1, $2, $3, $4)")
            .bind(user_id)
            .bind(&account.name)
            .bind(&account.email)
            .bind(account.phone.as_deref())
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO user_roles (user_id, role) VALUES ($1, $2)")
            .bind(user_id)
            .bind(account.role)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(user_id)
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AppError> {
        let row = sqlx::query_as::<_, (Uuid, String, bool)>(
            "SELECT id, password_hash, email_confirmed FROM accounts WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        let (user_id, password_hash, confirmed) = row.ok_or(AppError::InvalidCredentials)?;

        if !Self::verify_hash(password, &password_hash).await? {
            return Err(AppError::InvalidCredentials);
        }
        if !confirmed {
            return Err(AppError::EmailConfirmationRequired);
        }

        self.create_session(user_id)
    }

    async fn sign_up(&self, account: NewAccount) -> Result<SignUpOutcome, AppError> {
        let confirmed = !self.require_email_confirmation;
        let user_id = self.create_account(&account, confirmed).await?;

        if !confirmed {
            tracing::info!("📧 Cadastro de {} aguardando confirmação de e-mail", user_id);
            return Ok(SignUpOutcome::PendingVerification);
        }

        Ok(SignUpOutcome::Session(self.create_session(user_id)?))
    }

    async fn sign_out(&self, _token: &str) -> Result<(), AppError> {
        // JWT é stateless: não há sessão no servidor para revogar. O token
        // expira sozinho; o cliente só descarta a cópia dele.
        Ok(())
    }

    async fn resolve_session(&self, token: &str) -> Result<Uuid, AppError> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_ref()),
            &Validation::default(),
        )
        .map_err(|_| AppError::InvalidToken)?;

        let user_id = token_data.claims.sub;

        // Um token assinado de conta já removida continua com assinatura
        // válida; o banco é quem decide se a conta ainda existe.
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(AppError::InvalidToken);
        }

        Ok(user_id)
    }

    async fn verify_password(&self, user_id: Uuid, password: &str) -> Result<bool, AppError> {
        let password_hash =
            sqlx::query_scalar::<_, String>("SELECT password_hash FROM accounts WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(AppError::InvalidToken)?;

        Self::verify_hash(password, &password_hash).await
    }

    async fn update_password(&self, user_id: Uuid, new_password: &str) -> Result<(), AppError> {
        let hashed = Self::hash_password(new_password).await?;
        let result = sqlx::query("UPDATE accounts SET password_hash = $2 WHERE id = $1")
            .bind(user_id)
            .bind(&hashed)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::InvalidToken);
        }
        Ok(())
    }

    async fn admin_create_user(&self, account: NewAccount) -> Result<Uuid, AppError> {
        // Conta criada pelo dono nasce confirmada (o staff não passa pelo
        // fluxo de verificação de e-mail).
        self.create_account(&account, true)
            .await
            .map_err(|e| match e {
                AppError::EmailAlreadyExists => {
                    AppError::IdentityRejected("Este e-mail já está em uso.".into())
                }
                other => other,
            })
    }

    async fn admin_delete_user(&self, user_id: Uuid) -> Result<(), AppError> {
        // ON DELETE CASCADE leva junto perfil, papel e linha de staff.
        sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---
// Change feed via LISTEN/NOTIFY
// ---

// Payload emitido pelos triggers: {"table": "...", "op": "INSERT", "keys": {...}}
#[derive(Debug, Deserialize)]
struct NotifyPayload {
    table: String,
    op: String,
    keys: HashMap<String, Uuid>,
}

pub struct PgChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl PgChangeFeed {
    pub const CHANNEL: &'static str = "rental_changes";

    // Abre um LISTEN dedicado e fica repassando NOTIFYs para os assinantes
    // em processo. Payload que não parseia é logado e descartado; o cache
    // se realinha no próximo evento da tabela.
    pub async fn connect(pool: &PgPool) -> Result<Self, AppError> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(Self::CHANNEL).await?;

        let (tx, _) = broadcast::channel(256);
        let feed_tx = tx.clone();

        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Some(event) = parse_notification(notification.payload()) else {
                            tracing::warn!(
                                "NOTIFY com payload inválido em {}: {}",
                                Self::CHANNEL,
                                notification.payload()
                            );
                            continue;
                        };
                        let _ = feed_tx.send(event);
                    }
                    Err(e) => {
                        // O PgListener reconecta sozinho na próxima recv;
                        // só registramos a queda.
                        tracing::warn!("Conexão do change feed caiu: {}", e);
                    }
                }
            }
        });

        Ok(Self { tx })
    }
}

fn parse_notification(payload: &str) -> Option<ChangeEvent> {
    let parsed: NotifyPayload = serde_json::from_str(payload).ok()?;
    let table = Table::from_name(&parsed.table)?;
    let op = match parsed.op.as_str() {
        "INSERT" => ChangeOp::Insert,
        "UPDATE" => ChangeOp::Update,
        "DELETE" => ChangeOp::Delete,
        _ => return None,
    };
    Some(ChangeEvent {
        table,
        op,
        keys: parsed.keys,
    })
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(
        &self,
        table: Table,
        filter: Option<ChangeFilter>,
    ) -> Result<ChangeStream, AppError> {
        Ok(ChangeStream::new(self.tx.subscribe(), table, filter))
    }
}
