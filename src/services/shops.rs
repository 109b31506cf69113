// src/services/shops.rs

use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use crate::cache::{CacheHandle, CacheRegistry, Entity, FetchError, Fetcher, QueryCache, Scope};
use crate::common::error::AppError;
use crate::models::auth::{Principal, Role};
use crate::models::shops::{CreateShopInput, Shop, UpdateShopInput};
use crate::services::watch_entry;
use crate::store::{ChangeFeed, ChangeFilter, RentalStore, Table};

#[derive(Clone)]
pub struct ShopService {
    store: Arc<dyn RentalStore>,
    feed: Arc<dyn ChangeFeed>,
    cache: QueryCache<Vec<Shop>>,
    registry: Arc<CacheRegistry>,
}

impl ShopService {
    pub fn new(
        store: Arc<dyn RentalStore>,
        feed: Arc<dyn ChangeFeed>,
        registry: Arc<CacheRegistry>,
    ) -> Self {
        let cache = QueryCache::new(Entity::Shops);
        registry.register(Arc::new(cache.clone()));
        Self {
            store,
            feed,
            cache,
            registry,
        }
    }

    fn fetch_public(&self) -> Fetcher<Vec<Shop>> {
        let store = self.store.clone();
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                store
                    .list_active_shops()
                    .await
                    .map_err(|e| FetchError::new(Entity::Shops, Scope::All, &e))
            })
        })
    }

    fn fetch_owned(&self, owner_id: Uuid) -> Fetcher<Vec<Shop>> {
        let store = self.store.clone();
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                store
                    .list_shops_by_owner(owner_id)
                    .await
                    .map_err(|e| FetchError::new(Entity::Shops, Scope::Owned(owner_id), &e))
            })
        })
    }

    // Listagem pública (só lojas ativas), viva sob o feed de mudanças.
    pub async fn watch_public(&self) -> Result<CacheHandle<Vec<Shop>>, AppError> {
        watch_entry(
            &self.feed,
            &self.cache,
            Scope::All,
            Table::Shops,
            None,
            self.fetch_public(),
        )
        .await
    }

    pub async fn public_shops(&self) -> Result<Vec<Shop>, AppError> {
        self.watch_public().await?.ready().await
    }

    // As lojas de um dono, inclusive as desativadas.
    pub async fn watch_owned(&self, owner_id: Uuid) -> Result<CacheHandle<Vec<Shop>>, AppError> {
        let scope = Scope::Owned(owner_id);
        watch_entry(
            &self.feed,
            &self.cache,
            scope,
            Table::Shops,
            Some(ChangeFilter::eq("owner_id", owner_id)),
            self.fetch_owned(owner_id),
        )
        .await
    }

    pub async fn owned_shops(&self, owner_id: Uuid) -> Result<Vec<Shop>, AppError> {
        self.watch_owned(owner_id).await?.ready().await
    }

    pub async fn shop(&self, id: Uuid) -> Result<Shop, AppError> {
        self.store
            .find_shop(id)
            .await?
            .ok_or(AppError::NotFound("Loja"))
    }

    pub async fn create_shop(
        &self,
        caller: &Principal,
        input: &CreateShopInput,
    ) -> Result<Shop, AppError> {
        input.validate()?;
        if !matches!(caller.role, Role::Owner | Role::Admin) {
            return Err(AppError::Forbidden(
                "Apenas donos de loja podem criar lojas.".to_string(),
            ));
        }
        let shop = self.store.insert_shop(caller.id, input).await?;
        self.registry.invalidate(Entity::Shops);
        Ok(shop)
    }

    pub async fn update_shop(
        &self,
        caller: &Principal,
        id: Uuid,
        input: &UpdateShopInput,
    ) -> Result<Shop, AppError> {
        input.validate()?;
        let shop = self.shop(id).await?;
        ensure_owns(caller, &shop)?;

        // Nome/endereço aparecem embutidos nas projeções de veículos e
        // reservas; quando mudam (ou a loja some da vitrine), essas
        // projeções também estão sujas.
        let touches_joins =
            input.name.is_some() || input.address.is_some() || input.is_active.is_some();

        let updated = self.store.update_shop(id, input).await?;
        self.registry.invalidate(Entity::Shops);
        if touches_joins {
            self.registry
                .invalidate_many(&[Entity::Vehicles, Entity::Bookings]);
        }
        Ok(updated)
    }

    // Desativação suave: a loja sai da vitrine mas as reservas históricas
    // continuam resolvendo o join.
    pub async fn deactivate_shop(&self, caller: &Principal, id: Uuid) -> Result<Shop, AppError> {
        let shop = self.shop(id).await?;
        ensure_owns(caller, &shop)?;

        let updated = self
            .store
            .update_shop(
                id,
                &UpdateShopInput {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        self.registry
            .invalidate_many(&[Entity::Shops, Entity::Vehicles, Entity::Bookings]);
        Ok(updated)
    }
}

fn ensure_owns(caller: &Principal, shop: &Shop) -> Result<(), AppError> {
    if caller.role == Role::Admin || shop.owner_id == caller.id {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Esta loja pertence a outro dono.".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{principal, wait_until};
    use crate::store::memory::MemoryBackend;
    use crate::store::tables::ShopStore;

    fn service_with(backend: Arc<MemoryBackend>) -> ShopService {
        ShopService::new(backend.clone(), backend, Arc::new(CacheRegistry::new()))
    }

    fn shop_input(name: &str) -> CreateShopInput {
        CreateShopInput {
            name: name.to_string(),
            address: "Rua das Locadoras, 100".to_string(),
            image_url: None,
            operating_hours: Some("08:00-18:00".to_string()),
            latitude: None,
            longitude: None,
        }
    }

    #[tokio::test]
    async fn listagem_publica_so_traz_lojas_ativas() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend.clone());
        let owner = principal(Uuid::new_v4(), Role::Owner);

        let ativa = service
            .create_shop(&owner, &shop_input("Locadora Ativa"))
            .await
            .expect("criar loja");
        let inativa = service
            .create_shop(&owner, &shop_input("Locadora Fechada"))
            .await
            .expect("criar loja");
        service
            .deactivate_shop(&owner, inativa.id)
            .await
            .expect("desativar");

        let shops = service.public_shops().await.expect("listagem pública");
        assert_eq!(shops.len(), 1);
        assert_eq!(shops[0].id, ativa.id);

        // O escopo do dono continua vendo as duas.
        let owned = service.owned_shops(owner.id).await.expect("escopo do dono");
        assert_eq!(owned.len(), 2);
    }

    #[tokio::test]
    async fn dono_nao_edita_loja_alheia() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend);
        let owner = principal(Uuid::new_v4(), Role::Owner);
        let intruso = principal(Uuid::new_v4(), Role::Owner);

        let shop = service
            .create_shop(&owner, &shop_input("Locadora do Zé"))
            .await
            .expect("criar loja");

        let err = service
            .update_shop(
                &intruso,
                shop.id,
                &UpdateShopInput {
                    name: Some("Agora é minha".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect_err("outro dono não edita");
        assert!(matches!(err, AppError::Forbidden(_)));

        // Admin pode.
        let admin = principal(Uuid::new_v4(), Role::Admin);
        service
            .update_shop(
                &admin,
                shop.id,
                &UpdateShopInput {
                    is_open: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("admin edita qualquer loja");
    }

    #[tokio::test]
    async fn escrita_de_fora_chega_pelo_change_feed() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend.clone());
        let owner_id = Uuid::new_v4();

        let mut handle = service.watch_owned(owner_id).await.expect("assinar");
        let shops = handle.ready().await.expect("primeira carga");
        assert!(shops.is_empty());

        // Escrita direto no banco (outra sessão): nada passa pelo registry
        // local, só o feed avisa.
        backend
            .insert_shop(owner_id, &shop_input("Criada em outra aba"))
            .await
            .expect("insert externo");

        let shops = wait_until(&mut handle, |s| s.len() == 1).await;
        assert_eq!(shops[0].name, "Criada em outra aba");
    }

    #[tokio::test]
    async fn desativar_loja_invalida_a_vitrine() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend);
        let owner = principal(Uuid::new_v4(), Role::Owner);

        let shop = service
            .create_shop(&owner, &shop_input("Efêmera"))
            .await
            .expect("criar loja");

        let mut handle = service.watch_public().await.expect("assinar vitrine");
        wait_until(&mut handle, |s| s.len() == 1).await;

        service
            .deactivate_shop(&owner, shop.id)
            .await
            .expect("desativar");

        let shops = wait_until(&mut handle, |s| s.is_empty()).await;
        assert!(shops.is_empty());
    }
}
