// src/services/saved_shops.rs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::cache::{CacheHandle, CacheRegistry, Entity, FetchError, Fetcher, QueryCache, Scope};
use crate::common::error::AppError;
use crate::models::auth::Principal;
use crate::models::saved_shops::{SavedShopView, ToggleSavedResult};
use crate::services::watch_entry;
use crate::store::{ChangeFeed, ChangeFilter, RentalStore, Table};

#[derive(Clone)]
pub struct SavedShopService {
    store: Arc<dyn RentalStore>,
    feed: Arc<dyn ChangeFeed>,
    cache: QueryCache<Vec<SavedShopView>>,
    registry: Arc<CacheRegistry>,
}

impl SavedShopService {
    pub fn new(
        store: Arc<dyn RentalStore>,
        feed: Arc<dyn ChangeFeed>,
        registry: Arc<CacheRegistry>,
    ) -> Self {
        let cache = QueryCache::new(Entity::SavedShops);
        registry.register(Arc::new(cache.clone()));
        Self {
            store,
            feed,
            cache,
            registry,
        }
    }

    fn fetch_mine(&self, user_id: Uuid) -> Fetcher<Vec<SavedShopView>> {
        let store = self.store.clone();
        let scope = Scope::Mine(user_id);
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let wrap = |reason: String| FetchError {
                    entity: Entity::SavedShops,
                    scope,
                    reason,
                };

                let saved = store
                    .list_saved_shops(user_id)
                    .await
                    .map_err(|e| wrap(e.to_string()))?;
                if saved.is_empty() {
                    return Ok(Vec::new());
                }

                let shop_ids: Vec<Uuid> = saved
                    .iter()
                    .map(|s| s.shop_id)
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                let shops: HashMap<Uuid, _> = store
                    .find_shops(&shop_ids)
                    .await
                    .map_err(|e| wrap(e.to_string()))?
                    .into_iter()
                    .map(|s| (s.id, s))
                    .collect();

                // Join obrigatório: favorito apontando para loja inexistente
                // é inconsistência, não uma linha a menos.
                saved
                    .into_iter()
                    .map(|s| {
                        let shop = shops.get(&s.shop_id).cloned().ok_or_else(|| {
                            wrap(format!("loja {} do favorito não encontrada", s.shop_id))
                        })?;
                        Ok(SavedShopView { saved: s, shop })
                    })
                    .collect()
            })
        })
    }

    pub async fn watch_mine(
        &self,
        user_id: Uuid,
    ) -> Result<CacheHandle<Vec<SavedShopView>>, AppError> {
        let scope = Scope::Mine(user_id);
        watch_entry(
            &self.feed,
            &self.cache,
            scope,
            Table::SavedShops,
            Some(ChangeFilter::eq("user_id", user_id)),
            self.fetch_mine(user_id),
        )
        .await
    }

    pub async fn saved_shops(&self, user_id: Uuid) -> Result<Vec<SavedShopView>, AppError> {
        self.watch_mine(user_id).await?.ready().await
    }

    pub async fn is_saved(&self, user_id: Uuid, shop_id: Uuid) -> Result<bool, AppError> {
        Ok(self.store.find_saved_shop(user_id, shop_id).await?.is_some())
    }

    // Alterna o favorito. Idempotente sob corrida: dois toggles "salvar"
    // simultâneos convergem para UMA linha (a UNIQUE do banco decide o
    // perdedor, que só assume o resultado).
    pub async fn toggle(
        &self,
        caller: &Principal,
        shop_id: Uuid,
    ) -> Result<ToggleSavedResult, AppError> {
        self.store
            .find_shop(shop_id)
            .await?
            .ok_or(AppError::NotFound("Loja"))?;

        let saved = match self.store.find_saved_shop(caller.id, shop_id).await? {
            Some(existing) => {
                self.store.delete_saved_shop(existing.id).await?;
                false
            }
            None => match self.store.insert_saved_shop(caller.id, shop_id).await {
                Ok(_) => true,
                // Perdeu a corrida para outro insert: o favorito já existe.
                Err(AppError::MutationFailed { .. }) => true,
                Err(e) => return Err(e),
            },
        };

        self.registry.invalidate(Entity::SavedShops);
        Ok(ToggleSavedResult { saved, shop_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::auth::Role;
    use crate::models::shops::CreateShopInput;
    use crate::services::testing::{principal, wait_until};
    use crate::store::memory::MemoryBackend;
    use crate::store::tables::{SavedShopStore, ShopStore};

    async fn fixture() -> (Arc<MemoryBackend>, SavedShopService, Uuid) {
        let backend = Arc::new(MemoryBackend::new());
        let service = SavedShopService::new(
            backend.clone(),
            backend.clone(),
            Arc::new(CacheRegistry::new()),
        );
        let shop_id = backend
            .insert_shop(
                Uuid::new_v4(),
                &CreateShopInput {
                    name: "Matriz".into(),
                    address: "Av. Central, 1".into(),
                    image_url: None,
                    operating_hours: None,
                    latitude: None,
                    longitude: None,
                },
            )
            .await
            .expect("seed da loja")
            .id;
        (backend, service, shop_id)
    }

    #[tokio::test]
    async fn toggle_alterna_e_a_lista_acompanha() {
        let (_backend, service, shop_id) = fixture().await;
        let user = principal(Uuid::new_v4(), Role::User);

        let result = service.toggle(&user, shop_id).await.expect("salvar");
        assert!(result.saved);
        assert!(service.is_saved(user.id, shop_id).await.expect("consulta"));

        let list = service.saved_shops(user.id).await.expect("lista");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].shop.name, "Matriz");

        let result = service.toggle(&user, shop_id).await.expect("remover");
        assert!(!result.saved);
        assert!(!service.is_saved(user.id, shop_id).await.expect("consulta"));
    }

    #[tokio::test]
    async fn corrida_de_salvar_duas_vezes_converge_para_uma_linha() {
        let (backend, service, shop_id) = fixture().await;
        let user = principal(Uuid::new_v4(), Role::User);

        // Outra sessão salvou primeiro; este toggle "salvar" chega atrasado
        // e esbarra na UNIQUE.
        backend
            .insert_saved_shop(user.id, shop_id)
            .await
            .expect("insert da outra sessão");
        let err = backend
            .insert_saved_shop(user.id, shop_id)
            .await
            .expect_err("duplicata é barrada no armazenamento");
        assert!(matches!(err, AppError::MutationFailed { .. }));

        let list = service.saved_shops(user.id).await.expect("lista");
        assert_eq!(list.len(), 1, "nunca duas linhas por (usuário, loja)");
    }

    #[tokio::test]
    async fn toggle_invalida_a_lista_assinada() {
        let (_backend, service, shop_id) = fixture().await;
        let user = principal(Uuid::new_v4(), Role::User);

        let mut handle = service.watch_mine(user.id).await.expect("assinar");
        wait_until(&mut handle, |l| l.is_empty()).await;

        service.toggle(&user, shop_id).await.expect("salvar");
        wait_until(&mut handle, |l| l.len() == 1).await;

        service.toggle(&user, shop_id).await.expect("remover");
        wait_until(&mut handle, |l| l.is_empty()).await;
    }

    #[tokio::test]
    async fn favoritar_loja_inexistente_e_erro() {
        let (_backend, service, _shop_id) = fixture().await;
        let user = principal(Uuid::new_v4(), Role::User);

        let err = service
            .toggle(&user, Uuid::new_v4())
            .await
            .expect_err("loja inexistente");
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
