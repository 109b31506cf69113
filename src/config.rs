// src/config.rs

use std::env;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::cache::CacheRegistry;
use crate::services::bookings::BookingService;
use crate::services::profiles::ProfileService;
use crate::services::saved_shops::SavedShopService;
use crate::services::session::SessionResolver;
use crate::services::shops::ShopService;
use crate::services::staff::StaffService;
use crate::services::vehicles::VehicleService;
use crate::store::memory::MemoryBackend;
use crate::store::postgres::{PgChangeFeed, PgIdentityStore, PgStore};
use crate::store::{ChangeFeed, IdentityStore, RentalStore};

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionResolver>,
    pub shops: ShopService,
    pub vehicles: VehicleService,
    pub bookings: BookingService,
    pub staff: StaffService,
    pub saved_shops: SavedShopService,
    pub profiles: ProfileService,
    pub registry: Arc<CacheRegistry>,
}

impl AppState {
    // Monta o gráfico de dependências sobre as três portas. Todos os
    // serviços compartilham o MESMO registry, para o fan-out de
    // invalidação atravessar entidades.
    pub fn from_parts(
        store: Arc<dyn RentalStore>,
        identity: Arc<dyn IdentityStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        let registry = Arc::new(CacheRegistry::new());

        let session = Arc::new(SessionResolver::new(
            identity.clone(),
            store.clone(),
            registry.clone(),
        ));
        let shops = ShopService::new(store.clone(), feed.clone(), registry.clone());
        let vehicles = VehicleService::new(store.clone(), feed.clone(), registry.clone());
        let bookings = BookingService::new(store.clone(), feed.clone(), registry.clone());
        let staff = StaffService::new(
            store.clone(),
            identity.clone(),
            feed.clone(),
            registry.clone(),
        );
        let saved_shops = SavedShopService::new(store.clone(), feed.clone(), registry.clone());
        let profiles = ProfileService::new(store, feed, registry.clone());

        Self {
            session,
            shops,
            vehicles,
            bookings,
            staff,
            saved_shops,
            profiles,
            registry,
        }
    }

    // A assinatura retorna um Result: se a configuração falhar, a
    // aplicação não deve iniciar. O pool volta junto para as migrações.
    pub async fn new() -> anyhow::Result<(Self, PgPool)> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL deve ser definida");
        let jwt_secret = env::var("JWT_SECRET").expect("JWT_SECRET deve ser definido");
        let require_email_confirmation = env::var("REQUIRE_EMAIL_CONFIRMATION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let db_pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&database_url)
            .await?;

        tracing::info!("✅ Conexão com o banco de dados estabelecida com sucesso!");

        let store: Arc<dyn RentalStore> = Arc::new(PgStore::new(db_pool.clone()));
        let identity: Arc<dyn IdentityStore> = Arc::new(PgIdentityStore::new(
            db_pool.clone(),
            jwt_secret,
            require_email_confirmation,
        ));
        let feed: Arc<dyn ChangeFeed> = Arc::new(PgChangeFeed::connect(&db_pool).await?);

        Ok((Self::from_parts(store, identity, feed), db_pool))
    }

    // Estado todo em memória, para testes de integração e demos locais.
    pub fn in_memory() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        Self::from_parts(backend.clone(), backend.clone(), backend)
    }
}
