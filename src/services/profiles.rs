// src/services/profiles.rs
//
// Moderação de contas (visão de admin): todos os perfis com o papel
// anexado, e o liga/desliga de contas.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::cache::{CacheHandle, CacheRegistry, Entity, FetchError, Fetcher, QueryCache, Scope};
use crate::common::error::AppError;
use crate::models::auth::{Principal, Profile, ProfileView, Role};
use crate::services::watch_entry;
use crate::store::{ChangeFeed, RentalStore, Table};

#[derive(Clone)]
pub struct ProfileService {
    store: Arc<dyn RentalStore>,
    feed: Arc<dyn ChangeFeed>,
    cache: QueryCache<Vec<ProfileView>>,
    registry: Arc<CacheRegistry>,
}

impl ProfileService {
    pub fn new(
        store: Arc<dyn RentalStore>,
        feed: Arc<dyn ChangeFeed>,
        registry: Arc<CacheRegistry>,
    ) -> Self {
        let cache = QueryCache::new(Entity::Profiles);
        registry.register(Arc::new(cache.clone()));
        Self {
            store,
            feed,
            cache,
            registry,
        }
    }

    // Perfis + papéis em dois SELECTs, casados em memória. Perfil sem linha
    // de papel aparece como cliente comum, não some da moderação.
    fn fetch_all(&self) -> Fetcher<Vec<ProfileView>> {
        let store = self.store.clone();
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let wrap = |e: &AppError| FetchError::new(Entity::Profiles, Scope::All, e);
                let profiles = store.list_profiles().await.map_err(|e| wrap(&e))?;
                let roles: HashMap<Uuid, Role> = store
                    .list_roles()
                    .await
                    .map_err(|e| wrap(&e))?
                    .into_iter()
                    .collect();
                Ok(profiles
                    .into_iter()
                    .map(|p| ProfileView {
                        role: roles.get(&p.user_id).copied().unwrap_or(Role::User),
                        profile: p,
                    })
                    .collect())
            })
        })
    }

    pub async fn watch_all(
        &self,
        caller: &Principal,
    ) -> Result<CacheHandle<Vec<ProfileView>>, AppError> {
        if caller.role != Role::Admin {
            return Err(AppError::Forbidden(
                "Apenas administradores veem todos os perfis.".to_string(),
            ));
        }
        watch_entry(
            &self.feed,
            &self.cache,
            Scope::All,
            Table::Profiles,
            None,
            self.fetch_all(),
        )
        .await
    }

    pub async fn all_profiles(&self, caller: &Principal) -> Result<Vec<ProfileView>, AppError> {
        self.watch_all(caller).await?.ready().await
    }

    pub async fn set_active(
        &self,
        caller: &Principal,
        user_id: Uuid,
        active: bool,
    ) -> Result<Profile, AppError> {
        if caller.role != Role::Admin {
            return Err(AppError::Forbidden(
                "Apenas administradores moderam contas.".to_string(),
            ));
        }
        let profile = self.store.set_profile_active(user_id, active).await?;
        // Quem embute dados de perfil (equipe, joins de cliente) está sujo.
        self.registry
            .invalidate_many(&[Entity::Profiles, Entity::Staff, Entity::Bookings]);
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{principal, wait_until};
    use crate::store::memory::MemoryBackend;
    use crate::store::{IdentityStore, NewAccount};

    async fn fixture() -> (Arc<MemoryBackend>, ProfileService, Uuid) {
        let backend = Arc::new(MemoryBackend::new());
        let service = ProfileService::new(
            backend.clone(),
            backend.clone(),
            Arc::new(CacheRegistry::new()),
        );
        let user_id = backend
            .admin_create_user(NewAccount {
                email: "cliente@example.com".into(),
                password: "senha123".into(),
                name: "Seu João".into(),
                phone: None,
                role: Role::User,
            })
            .await
            .expect("seed do cliente");
        (backend, service, user_id)
    }

    #[tokio::test]
    async fn admin_ve_perfis_com_papel_anexado() {
        let (backend, service, _user_id) = fixture().await;
        backend
            .admin_create_user(NewAccount {
                email: "dono@example.com".into(),
                password: "senha123".into(),
                name: "Dona Maria".into(),
                phone: None,
                role: Role::Owner,
            })
            .await
            .expect("seed do dono");

        let admin = principal(Uuid::new_v4(), Role::Admin);
        let profiles = service.all_profiles(&admin).await.expect("moderação");
        assert_eq!(profiles.len(), 2);

        let dona = profiles
            .iter()
            .find(|p| p.profile.email == "dono@example.com")
            .expect("dona na lista");
        assert_eq!(dona.role, Role::Owner);
    }

    #[tokio::test]
    async fn moderacao_e_exclusiva_de_admin() {
        let (_backend, service, user_id) = fixture().await;
        for role in [Role::Owner, Role::Staff, Role::User] {
            let caller = principal(Uuid::new_v4(), role);
            let err = service
                .all_profiles(&caller)
                .await
                .expect_err("só admin lista");
            assert!(matches!(err, AppError::Forbidden(_)));

            let err = service
                .set_active(&caller, user_id, false)
                .await
                .expect_err("só admin modera");
            assert!(matches!(err, AppError::Forbidden(_)));
        }
    }

    #[tokio::test]
    async fn desativacao_aparece_na_lista_assinada() {
        let (_backend, service, user_id) = fixture().await;
        let admin = principal(Uuid::new_v4(), Role::Admin);

        let mut handle = service.watch_all(&admin).await.expect("assinar");
        wait_until(&mut handle, |p| p.len() == 1 && p[0].profile.is_active).await;

        service
            .set_active(&admin, user_id, false)
            .await
            .expect("desativar");
        wait_until(&mut handle, |p| p.len() == 1 && !p[0].profile.is_active).await;
    }
}
