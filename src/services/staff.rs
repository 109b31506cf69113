// src/services/staff.rs
//
// A equipe de cada dono, e a rota privilegiada de provisionamento. Criar
// staff é a única operação aqui que toca o identity store com poderes de
// admin, então a ordem das verificações importa: NADA de conta criada
// antes de toda autorização passar, e conta desfeita se o vínculo falhar.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use crate::cache::{CacheHandle, CacheRegistry, Entity, FetchError, Fetcher, QueryCache, Scope};
use crate::common::error::AppError;
use crate::models::auth::{Principal, Role};
use crate::models::staff::{
    CreateStaffPayload, CreateStaffResponse, Staff, StaffView, UpdateStaffInput,
};
use crate::services::watch_entry;
use crate::store::{ChangeFeed, ChangeFilter, IdentityStore, NewAccount, RentalStore, Table};

#[derive(Clone)]
pub struct StaffService {
    store: Arc<dyn RentalStore>,
    identity: Arc<dyn IdentityStore>,
    feed: Arc<dyn ChangeFeed>,
    cache: QueryCache<Vec<StaffView>>,
    registry: Arc<CacheRegistry>,
}

// Projeções com o perfil do membro (join obrigatório) e o nome da loja.
async fn build_views(
    store: &Arc<dyn RentalStore>,
    scope: Scope,
    staff: Vec<Staff>,
) -> Result<Vec<StaffView>, FetchError> {
    if staff.is_empty() {
        return Ok(Vec::new());
    }
    let wrap = |reason: String| FetchError {
        entity: Entity::Staff,
        scope,
        reason,
    };

    let user_ids: Vec<Uuid> = staff
        .iter()
        .map(|s| s.user_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let shop_ids: Vec<Uuid> = staff
        .iter()
        .filter_map(|s| s.shop_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let profiles: HashMap<Uuid, _> = store
        .find_profiles(&user_ids)
        .await
        .map_err(|e| wrap(e.to_string()))?
        .into_iter()
        .map(|p| (p.user_id, p))
        .collect();
    let shop_names: HashMap<Uuid, String> = store
        .find_shops(&shop_ids)
        .await
        .map_err(|e| wrap(e.to_string()))?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();

    staff
        .into_iter()
        .map(|s| {
            let profile = profiles
                .get(&s.user_id)
                .ok_or_else(|| wrap(format!("perfil do staff {} não encontrado", s.user_id)))?;
            Ok(StaffView {
                name: profile.name.clone(),
                email: profile.email.clone(),
                phone: profile.phone.clone(),
                avatar_url: profile.avatar_url.clone(),
                shop_name: s.shop_id.and_then(|id| shop_names.get(&id).cloned()),
                staff: s,
            })
        })
        .collect()
}

impl StaffService {
    pub fn new(
        store: Arc<dyn RentalStore>,
        identity: Arc<dyn IdentityStore>,
        feed: Arc<dyn ChangeFeed>,
        registry: Arc<CacheRegistry>,
    ) -> Self {
        let cache = QueryCache::new(Entity::Staff);
        registry.register(Arc::new(cache.clone()));
        Self {
            store,
            identity,
            feed,
            cache,
            registry,
        }
    }

    fn fetch_owned(&self, owner_id: Uuid) -> Fetcher<Vec<StaffView>> {
        let store = self.store.clone();
        let scope = Scope::Owned(owner_id);
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let staff = store
                    .list_staff_by_owner(owner_id)
                    .await
                    .map_err(|e| FetchError::new(Entity::Staff, scope, &e))?;
                build_views(&store, scope, staff).await
            })
        })
    }

    fn fetch_all(&self) -> Fetcher<Vec<StaffView>> {
        let store = self.store.clone();
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let staff = store
                    .list_all_staff()
                    .await
                    .map_err(|e| FetchError::new(Entity::Staff, Scope::All, &e))?;
                build_views(&store, Scope::All, staff).await
            })
        })
    }

    pub async fn watch_owned(
        &self,
        owner_id: Uuid,
    ) -> Result<CacheHandle<Vec<StaffView>>, AppError> {
        let scope = Scope::Owned(owner_id);
        watch_entry(
            &self.feed,
            &self.cache,
            scope,
            Table::Staff,
            Some(ChangeFilter::eq("owner_id", owner_id)),
            self.fetch_owned(owner_id),
        )
        .await
    }

    pub async fn owner_staff(&self, owner_id: Uuid) -> Result<Vec<StaffView>, AppError> {
        self.watch_owned(owner_id).await?.ready().await
    }

    // Visão de moderação: toda a tabela, só para admin.
    pub async fn all_staff(&self, caller: &Principal) -> Result<Vec<StaffView>, AppError> {
        if caller.role != Role::Admin {
            return Err(AppError::Forbidden(
                "Apenas administradores veem toda a equipe.".to_string(),
            ));
        }
        let mut handle = watch_entry(
            &self.feed,
            &self.cache,
            Scope::All,
            Table::Staff,
            None,
            self.fetch_all(),
        )
        .await?;
        handle.ready().await
    }

    // A rota privilegiada. `caller_id` vem do token verificado; o papel é
    // re-checado no banco aqui dentro, nunca confiado do cliente.
    pub async fn create_staff(
        &self,
        caller_id: Uuid,
        payload: &CreateStaffPayload,
    ) -> Result<CreateStaffResponse, AppError> {
        payload.validate()?;

        let caller_role = self
            .store
            .find_role(caller_id)
            .await?
            .ok_or_else(|| AppError::Forbidden("Principal sem papel atribuído.".to_string()))?;
        if caller_role != Role::Owner {
            return Err(AppError::Forbidden(
                "Apenas donos de loja podem criar staff.".to_string(),
            ));
        }

        // O corpo não escolhe o dono: owner_id precisa ser o próprio caller.
        if payload.owner_id != caller_id {
            return Err(AppError::Forbidden(
                "O owner_id precisa ser o do principal autenticado.".to_string(),
            ));
        }

        // Invariante do vínculo: a loja (se houver) é do mesmo dono.
        if let Some(shop_id) = payload.shop_id {
            let shop = self
                .store
                .find_shop(shop_id)
                .await?
                .ok_or(AppError::NotFound("Loja"))?;
            if shop.owner_id != caller_id {
                return Err(AppError::Forbidden(
                    "A loja informada pertence a outro dono.".to_string(),
                ));
            }
        }

        // Toda autorização passou: agora sim a conta nasce (já confirmada).
        let user_id = self
            .identity
            .admin_create_user(NewAccount {
                email: payload.email.clone(),
                password: payload.password.clone(),
                name: payload.name.clone(),
                phone: payload.phone.clone(),
                role: Role::Staff,
            })
            .await?;

        let staff = match self
            .store
            .insert_staff(user_id, payload.owner_id, payload.shop_id)
            .await
        {
            Ok(staff) => staff,
            Err(e) => {
                // Compensação: a conta recém-criada não pode ficar órfã.
                tracing::error!(
                    "Vínculo de staff falhou ({}); removendo a conta {}",
                    e,
                    user_id
                );
                if let Err(cleanup) = self.identity.admin_delete_user(user_id).await {
                    tracing::error!("Compensação da conta {} falhou: {}", user_id, cleanup);
                }
                return Err(AppError::StaffProvisioningFailed(e.to_string()));
            }
        };

        self.registry
            .invalidate_many(&[Entity::Staff, Entity::Profiles]);
        tracing::info!("👷 Staff {} criado pelo dono {}", staff.id, caller_id);
        Ok(CreateStaffResponse {
            success: true,
            user_id,
            staff,
        })
    }

    pub async fn update_staff(
        &self,
        caller: &Principal,
        id: Uuid,
        input: &UpdateStaffInput,
    ) -> Result<Staff, AppError> {
        let staff = self
            .store
            .find_staff(id)
            .await?
            .ok_or(AppError::NotFound("Staff"))?;
        ensure_manages(caller, &staff)?;

        if let Some(shop_id) = input.shop_id {
            let shop = self
                .store
                .find_shop(shop_id)
                .await?
                .ok_or(AppError::NotFound("Loja"))?;
            if shop.owner_id != staff.owner_id {
                return Err(AppError::Forbidden(
                    "A loja informada pertence a outro dono.".to_string(),
                ));
            }
        }

        let updated = self.store.update_staff(id, input).await?;
        self.registry.invalidate(Entity::Staff);
        Ok(updated)
    }

    // Remove o vínculo E desativa o perfil: uma conta de staff sem vínculo
    // não deve conseguir logar.
    pub async fn remove_staff(&self, caller: &Principal, id: Uuid) -> Result<(), AppError> {
        let staff = self
            .store
            .find_staff(id)
            .await?
            .ok_or(AppError::NotFound("Staff"))?;
        ensure_manages(caller, &staff)?;

        let removed = self.store.delete_staff(id).await?;
        self.store.set_profile_active(removed.user_id, false).await?;
        self.registry
            .invalidate_many(&[Entity::Staff, Entity::Profiles]);
        Ok(())
    }
}

fn ensure_manages(caller: &Principal, staff: &Staff) -> Result<(), AppError> {
    if caller.role == Role::Admin || staff.owner_id == caller.id {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Este membro de staff pertence a outro dono.".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shops::CreateShopInput;
    use crate::services::testing::principal;
    use crate::store::memory::MemoryBackend;
    use crate::store::tables::{ProfileStore, ShopStore};

    struct Fixture {
        backend: Arc<MemoryBackend>,
        service: StaffService,
        owner_id: Uuid,
        shop_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let service = StaffService::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            Arc::new(CacheRegistry::new()),
        );
        let owner_id = backend
            .admin_create_user(NewAccount {
                email: "dono@example.com".into(),
                password: "senha123".into(),
                name: "Dona Maria".into(),
                phone: None,
                role: Role::Owner,
            })
            .await
            .expect("seed do dono");
        let shop_id = backend
            .insert_shop(
                owner_id,
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
        Fixture {
            backend,
            service,
            owner_id,
            shop_id,
        }
    }

    fn staff_payload(fx: &Fixture) -> CreateStaffPayload {
        CreateStaffPayload {
            email: "staff@example.com".into(),
            password: "senha123".into(),
            name: "Zé da Entrega".into(),
            phone: Some("11988887777".into()),
            owner_id: fx.owner_id,
            shop_id: Some(fx.shop_id),
        }
    }

    #[tokio::test]
    async fn dono_provisiona_staff_completo() {
        let fx = fixture().await;

        let response = fx
            .service
            .create_staff(fx.owner_id, &staff_payload(&fx))
            .await
            .expect("criar staff");
        assert!(response.success);
        assert_eq!(response.staff.owner_id, fx.owner_id);

        // Conta nasceu confirmada: o staff loga direto.
        fx.backend
            .sign_in("staff@example.com", "senha123")
            .await
            .expect("login do staff recém-criado");

        // A listagem do dono traz o join de perfil e o nome da loja.
        let team = fx
            .service
            .owner_staff(fx.owner_id)
            .await
            .expect("equipe do dono");
        assert_eq!(team.len(), 1);
        assert_eq!(team[0].name, "Zé da Entrega");
        assert_eq!(team[0].shop_name.as_deref(), Some("Matriz"));
    }

    #[tokio::test]
    async fn quem_nao_e_dono_nao_cria_conta_nenhuma() {
        let fx = fixture().await;
        let customer_id = fx
            .backend
            .admin_create_user(NewAccount {
                email: "cliente@example.com".into(),
                password: "senha123".into(),
                name: "Seu João".into(),
                phone: None,
                role: Role::User,
            })
            .await
            .expect("seed do cliente");
        let before = fx.backend.account_count();

        let mut payload = staff_payload(&fx);
        payload.owner_id = customer_id;
        let err = fx
            .service
            .create_staff(customer_id, &payload)
            .await
            .expect_err("cliente não cria staff");
        assert!(matches!(err, AppError::Forbidden(_)));

        // A recusa vem ANTES de qualquer conta ser criada.
        assert_eq!(fx.backend.account_count(), before);
    }

    #[tokio::test]
    async fn owner_id_do_corpo_precisa_ser_o_caller() {
        let fx = fixture().await;
        let before = fx.backend.account_count();

        let mut payload = staff_payload(&fx);
        payload.owner_id = Uuid::new_v4();
        let err = fx
            .service
            .create_staff(fx.owner_id, &payload)
            .await
            .expect_err("owner_id forjado");
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(fx.backend.account_count(), before);
    }

    #[tokio::test]
    async fn email_em_uso_vira_recusa_do_identity_store() {
        let fx = fixture().await;
        let mut payload = staff_payload(&fx);
        payload.email = "dono@example.com".into();

        let err = fx
            .service
            .create_staff(fx.owner_id, &payload)
            .await
            .expect_err("e-mail duplicado");
        assert!(matches!(err, AppError::IdentityRejected(_)));
    }

    #[tokio::test]
    async fn falha_no_vinculo_compensa_a_conta() {
        let fx = fixture().await;
        let before = fx.backend.account_count();
        fx.backend.fail_next("insert_staff");

        let err = fx
            .service
            .create_staff(fx.owner_id, &staff_payload(&fx))
            .await
            .expect_err("vínculo falhou");
        assert!(matches!(err, AppError::StaffProvisioningFailed(_)));

        // A conta criada no meio do caminho foi removida.
        assert_eq!(fx.backend.account_count(), before);
    }

    #[tokio::test]
    async fn loja_de_outro_dono_nao_recebe_staff() {
        let fx = fixture().await;
        let outro_dono = Uuid::new_v4();
        let loja_alheia = fx
            .backend
            .insert_shop(
                outro_dono,
                &CreateShopInput {
                    name: "Concorrente".into(),
                    address: "Rua de Lá, 2".into(),
                    image_url: None,
                    operating_hours: None,
                    latitude: None,
                    longitude: None,
                },
            )
            .await
            .expect("loja alheia")
            .id;

        let mut payload = staff_payload(&fx);
        payload.shop_id = Some(loja_alheia);
        let err = fx
            .service
            .create_staff(fx.owner_id, &payload)
            .await
            .expect_err("loja alheia");
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn remover_staff_desativa_o_perfil_orfao() {
        let fx = fixture().await;
        let response = fx
            .service
            .create_staff(fx.owner_id, &staff_payload(&fx))
            .await
            .expect("criar staff");

        let owner = principal(fx.owner_id, Role::Owner);
        fx.service
            .remove_staff(&owner, response.staff.id)
            .await
            .expect("remover staff");

        let team = fx.service.owner_staff(fx.owner_id).await.expect("equipe");
        assert!(team.is_empty());

        let profile = fx
            .backend
            .find_profile(response.user_id)
            .await
            .expect("buscar perfil")
            .expect("perfil continua existindo");
        assert!(!profile.is_active, "perfil órfão fica desativado");
    }

    #[tokio::test]
    async fn dono_nao_mexe_na_equipe_alheia() {
        let fx = fixture().await;
        let response = fx
            .service
            .create_staff(fx.owner_id, &staff_payload(&fx))
            .await
            .expect("criar staff");

        let intruso = principal(Uuid::new_v4(), Role::Owner);
        let err = fx
            .service
            .update_staff(
                &intruso,
                response.staff.id,
                &UpdateStaffInput {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect_err("equipe alheia");
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
