// src/services/vehicles.rs

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use crate::cache::{CacheHandle, CacheRegistry, Entity, FetchError, Fetcher, QueryCache, Scope};
use crate::common::error::AppError;
use crate::models::auth::{Principal, Role};
use crate::models::vehicles::{CreateVehicleInput, UpdateVehicleInput, Vehicle, VehicleView};
use crate::services::watch_entry;
use crate::store::{ChangeFeed, ChangeFilter, RentalStore, Table};

#[derive(Clone)]
pub struct VehicleService {
    store: Arc<dyn RentalStore>,
    feed: Arc<dyn ChangeFeed>,
    // Vitrine (veículos disponíveis) e frota do dono são projeções
    // diferentes; cada uma tem seu cache, ambos sob Entity::Vehicles.
    available: QueryCache<Vec<Vehicle>>,
    fleet: QueryCache<Vec<VehicleView>>,
    registry: Arc<CacheRegistry>,
}

impl VehicleService {
    pub fn new(
        store: Arc<dyn RentalStore>,
        feed: Arc<dyn ChangeFeed>,
        registry: Arc<CacheRegistry>,
    ) -> Self {
        let available = QueryCache::new(Entity::Vehicles);
        let fleet = QueryCache::new(Entity::Vehicles);
        registry.register(Arc::new(available.clone()));
        registry.register(Arc::new(fleet.clone()));
        Self {
            store,
            feed,
            available,
            fleet,
            registry,
        }
    }

    fn fetch_available(&self, shop_id: Option<Uuid>, scope: Scope) -> Fetcher<Vec<Vehicle>> {
        let store = self.store.clone();
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                store
                    .list_available_vehicles(shop_id)
                    .await
                    .map_err(|e| FetchError::new(Entity::Vehicles, scope, &e))
            })
        })
    }

    // A frota do dono em dois passos: as lojas dele, depois UM SELECT em
    // lote pelos ids. As lojas da primeira perna também anotam o nome nas
    // projeções, sem nenhuma consulta extra.
    fn fetch_fleet(&self, owner_id: Uuid) -> Fetcher<Vec<VehicleView>> {
        let store = self.store.clone();
        let scope = Scope::Owned(owner_id);
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let wrap = |e: &AppError| FetchError::new(Entity::Vehicles, scope, e);

                let shops = store.list_shops_by_owner(owner_id).await.map_err(|e| wrap(&e))?;
                if shops.is_empty() {
                    return Ok(Vec::new());
                }

                let shop_ids: Vec<Uuid> = shops.iter().map(|s| s.id).collect();
                let vehicles = store
                    .list_vehicles_in_shops(&shop_ids)
                    .await
                    .map_err(|e| wrap(&e))?;

                let shop_info: HashMap<Uuid, (String, String)> = shops
                    .into_iter()
                    .map(|s| (s.id, (s.name, s.address)))
                    .collect();

                Ok(vehicles
                    .into_iter()
                    .map(|v| {
                        let info = shop_info.get(&v.shop_id);
                        VehicleView {
                            shop_name: info.map(|i| i.0.clone()),
                            shop_address: info.map(|i| i.1.clone()),
                            vehicle: v,
                        }
                    })
                    .collect())
            })
        })
    }

    // Vitrine: todos os veículos disponíveis, ou só os de uma loja.
    pub async fn watch_available(
        &self,
        shop_id: Option<Uuid>,
    ) -> Result<CacheHandle<Vec<Vehicle>>, AppError> {
        let scope = shop_id.map(Scope::Shop).unwrap_or(Scope::All);
        let filter = shop_id.map(|id| ChangeFilter::eq("shop_id", id));
        watch_entry(
            &self.feed,
            &self.available,
            scope,
            Table::Vehicles,
            filter,
            self.fetch_available(shop_id, scope),
        )
        .await
    }

    pub async fn available_vehicles(
        &self,
        shop_id: Option<Uuid>,
    ) -> Result<Vec<Vehicle>, AppError> {
        self.watch_available(shop_id).await?.ready().await
    }

    pub async fn watch_fleet(
        &self,
        owner_id: Uuid,
    ) -> Result<CacheHandle<Vec<VehicleView>>, AppError> {
        let scope = Scope::Owned(owner_id);
        // O evento de veículo carrega shop_id, não owner_id: o filtro
        // fino não é exprimível aqui, então a escuta é da tabela toda.
        watch_entry(
            &self.feed,
            &self.fleet,
            scope,
            Table::Vehicles,
            None,
            self.fetch_fleet(owner_id),
        )
        .await
    }

    pub async fn owner_vehicles(&self, owner_id: Uuid) -> Result<Vec<VehicleView>, AppError> {
        self.watch_fleet(owner_id).await?.ready().await
    }

    // Detalhe de um veículo com a loja anexada. O join é obrigatório: sem a
    // loja, o detalhe inteiro falha em vez de sair pela metade.
    pub async fn vehicle(&self, id: Uuid) -> Result<VehicleView, AppError> {
        let vehicle = self
            .store
            .find_vehicle(id)
            .await?
            .ok_or(AppError::NotFound("Veículo"))?;
        let shop = self
            .store
            .find_shop(vehicle.shop_id)
            .await?
            .ok_or(AppError::DataFetchFailed {
                entity: Entity::Vehicles,
                scope: Scope::One(id),
                reason: "loja do veículo não encontrada".to_string(),
            })?;
        Ok(VehicleView {
            vehicle,
            shop_name: Some(shop.name),
            shop_address: Some(shop.address),
        })
    }

    pub async fn create_vehicle(
        &self,
        caller: &Principal,
        input: &CreateVehicleInput,
    ) -> Result<Vehicle, AppError> {
        input.validate()?;
        self.ensure_owns_shop(caller, input.shop_id).await?;

        let vehicle = self.store.insert_vehicle(input).await?;
        self.registry.invalidate(Entity::Vehicles);
        Ok(vehicle)
    }

    pub async fn update_vehicle(
        &self,
        caller: &Principal,
        id: Uuid,
        input: &UpdateVehicleInput,
    ) -> Result<Vehicle, AppError> {
        input.validate()?;
        let current = self
            .store
            .find_vehicle(id)
            .await?
            .ok_or(AppError::NotFound("Veículo"))?;
        self.ensure_owns_shop(caller, current.shop_id).await?;

        let updated = self.store.update_vehicle(id, input).await?;
        // As projeções de reserva embutem o resumo do veículo.
        self.registry
            .invalidate_many(&[Entity::Vehicles, Entity::Bookings]);
        Ok(updated)
    }

    pub async fn set_availability(
        &self,
        caller: &Principal,
        id: Uuid,
        available: bool,
    ) -> Result<Vehicle, AppError> {
        let current = self
            .store
            .find_vehicle(id)
            .await?
            .ok_or(AppError::NotFound("Veículo"))?;
        self.ensure_owns_shop(caller, current.shop_id).await?;

        let updated = self.store.set_vehicle_availability(id, available).await?;
        self.registry.invalidate(Entity::Vehicles);
        Ok(updated)
    }

    pub async fn delete_vehicle(&self, caller: &Principal, id: Uuid) -> Result<(), AppError> {
        let current = self
            .store
            .find_vehicle(id)
            .await?
            .ok_or(AppError::NotFound("Veículo"))?;
        self.ensure_owns_shop(caller, current.shop_id).await?;

        self.store.delete_vehicle(id).await?;
        self.registry
            .invalidate_many(&[Entity::Vehicles, Entity::Bookings]);
        Ok(())
    }

    async fn ensure_owns_shop(&self, caller: &Principal, shop_id: Uuid) -> Result<(), AppError> {
        if caller.role == Role::Admin {
            return Ok(());
        }
        let shop = self
            .store
            .find_shop(shop_id)
            .await?
            .ok_or(AppError::NotFound("Loja"))?;
        if shop.owner_id != caller.id {
            return Err(AppError::Forbidden(
                "Este veículo pertence à loja de outro dono.".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use tokio::sync::Notify;

    use crate::models::shops::CreateShopInput;
    use crate::models::vehicles::VehicleType;
    use crate::services::testing::{principal, wait_until};
    use crate::store::memory::MemoryBackend;
    use crate::store::tables::{ShopStore, VehicleStore};
    use crate::store::ChangeStream;

    fn service_with(backend: Arc<MemoryBackend>) -> VehicleService {
        VehicleService::new(backend.clone(), backend, Arc::new(CacheRegistry::new()))
    }

    async fn seed_shop(backend: &MemoryBackend, owner_id: Uuid, name: &str) -> Uuid {
        backend
            .insert_shop(
                owner_id,
                &CreateShopInput {
                    name: name.to_string(),
                    address: "Av. Central, 1".to_string(),
                    image_url: None,
                    operating_hours: None,
                    latitude: None,
                    longitude: None,
                },
            )
            .await
            .expect("seed de loja")
            .id
    }

    fn vehicle_input(shop_id: Uuid, name: &str) -> CreateVehicleInput {
        CreateVehicleInput {
            shop_id,
            vehicle_type: VehicleType::Car,
            name: name.to_string(),
            brand: "Fiat".to_string(),
            model: "Uno".to_string(),
            images: vec![],
            price_per_hour: Decimal::new(1500, 2),
            price_per_day: Decimal::new(12000, 2),
            fuel_type: Some("flex".to_string()),
            transmission: Some("manual".to_string()),
            seating: Some(5),
            features: vec!["ar-condicionado".to_string()],
        }
    }

    #[tokio::test]
    async fn frota_do_dono_usa_um_lote_por_tabela() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend.clone());
        let owner = principal(Uuid::new_v4(), Role::Owner);

        let shop_a = seed_shop(&backend, owner.id, "Matriz").await;
        let shop_b = seed_shop(&backend, owner.id, "Filial").await;
        service
            .create_vehicle(&owner, &vehicle_input(shop_a, "Uno 1"))
            .await
            .expect("veículo");
        service
            .create_vehicle(&owner, &vehicle_input(shop_a, "Uno 2"))
            .await
            .expect("veículo");
        service
            .create_vehicle(&owner, &vehicle_input(shop_b, "Uno 3"))
            .await
            .expect("veículo");

        backend.reset_query_counts();
        let fleet = service.owner_vehicles(owner.id).await.expect("frota");

        assert_eq!(fleet.len(), 3);
        // Um SELECT de lojas + um SELECT de veículos pelo conjunto de ids.
        // Nunca uma consulta por loja.
        assert_eq!(backend.shop_query_count(), 1);
        assert_eq!(backend.vehicle_query_count(), 1);

        // O nome da loja vem anotado a partir da primeira perna.
        let filial = fleet
            .iter()
            .find(|v| v.vehicle.name == "Uno 3")
            .expect("Uno 3 na frota");
        assert_eq!(filial.shop_name.as_deref(), Some("Filial"));
    }

    #[tokio::test]
    async fn dono_sem_lojas_tem_frota_vazia_sem_segunda_perna() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend.clone());

        backend.reset_query_counts();
        let fleet = service
            .owner_vehicles(Uuid::new_v4())
            .await
            .expect("frota vazia");
        assert!(fleet.is_empty());
        assert_eq!(backend.shop_query_count(), 1);
        assert_eq!(backend.vehicle_query_count(), 0);
    }

    #[tokio::test]
    async fn vitrine_so_mostra_disponiveis() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend.clone());
        let owner = principal(Uuid::new_v4(), Role::Owner);
        let shop = seed_shop(&backend, owner.id, "Matriz").await;

        let v1 = service
            .create_vehicle(&owner, &vehicle_input(shop, "Disponível"))
            .await
            .expect("veículo");
        let v2 = service
            .create_vehicle(&owner, &vehicle_input(shop, "Na oficina"))
            .await
            .expect("veículo");
        service
            .set_availability(&owner, v2.id, false)
            .await
            .expect("tirar da vitrine");

        let available = service.available_vehicles(None).await.expect("vitrine");
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, v1.id);

        let in_shop = service
            .available_vehicles(Some(shop))
            .await
            .expect("vitrine da loja");
        assert_eq!(in_shop.len(), 1);
    }

    #[tokio::test]
    async fn mutacao_local_invalida_a_vitrine_assinada() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend.clone());
        let owner = principal(Uuid::new_v4(), Role::Owner);
        let shop = seed_shop(&backend, owner.id, "Matriz").await;

        let mut handle = service.watch_available(None).await.expect("assinar");
        wait_until(&mut handle, |v| v.is_empty()).await;

        service
            .create_vehicle(&owner, &vehicle_input(shop, "Recém-chegado"))
            .await
            .expect("veículo");

        let vehicles = wait_until(&mut handle, |v| v.len() == 1).await;
        assert_eq!(vehicles[0].name, "Recém-chegado");
    }

    // Feed que só completa a assinatura depois de liberado, para prender
    // um assinante na janela entre a assinatura e a primeira carga.
    struct GatedFeed {
        inner: Arc<MemoryBackend>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ChangeFeed for GatedFeed {
        async fn subscribe(
            &self,
            table: Table,
            filter: Option<ChangeFilter>,
        ) -> Result<ChangeStream, AppError> {
            self.gate.notified().await;
            self.inner.subscribe(table, filter).await
        }
    }

    #[tokio::test]
    async fn escrita_durante_a_ligacao_do_feed_nao_se_perde() {
        let backend = Arc::new(MemoryBackend::new());
        let gate = Arc::new(Notify::new());
        let feed = Arc::new(GatedFeed {
            inner: backend.clone(),
            gate: gate.clone(),
        });
        let service = VehicleService::new(backend.clone(), feed, Arc::new(CacheRegistry::new()));
        let owner = principal(Uuid::new_v4(), Role::Owner);
        let shop = seed_shop(&backend, owner.id, "Matriz").await;

        // A assinatura fica presa esperando o feed ligar; a primeira
        // carga não pode ter acontecido ainda.
        let watcher = tokio::spawn({
            let service = service.clone();
            async move { service.watch_available(None).await }
        });
        tokio::task::yield_now().await;

        // Escrita direto no banco enquanto o feed ainda não está ligado.
        backend
            .insert_vehicle(&vehicle_input(shop, "Na janela"))
            .await
            .expect("veículo");

        gate.notify_one();
        let mut handle = watcher.await.expect("join").expect("assinar");
        let vehicles = wait_until(&mut handle, |v| v.len() == 1).await;
        assert_eq!(vehicles[0].name, "Na janela");
    }

    #[tokio::test]
    async fn dono_nao_mexe_em_veiculo_de_loja_alheia() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend.clone());
        let owner = principal(Uuid::new_v4(), Role::Owner);
        let intruso = principal(Uuid::new_v4(), Role::Owner);
        let shop = seed_shop(&backend, owner.id, "Matriz").await;

        let vehicle = service
            .create_vehicle(&owner, &vehicle_input(shop, "Uno"))
            .await
            .expect("veículo");

        let err = service
            .create_vehicle(&intruso, &vehicle_input(shop, "Pirata"))
            .await
            .expect_err("loja alheia");
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = service
            .delete_vehicle(&intruso, vehicle.id)
            .await
            .expect_err("delete alheio");
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn detalhe_sem_loja_e_erro_de_join_obrigatorio() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(backend.clone());
        let owner = principal(Uuid::new_v4(), Role::Owner);
        let shop = seed_shop(&backend, owner.id, "Matriz").await;
        let vehicle = service
            .create_vehicle(&owner, &vehicle_input(shop, "Uno"))
            .await
            .expect("veículo");

        let view = service.vehicle(vehicle.id).await.expect("detalhe");
        assert_eq!(view.shop_name.as_deref(), Some("Matriz"));

        let err = service
            .vehicle(Uuid::new_v4())
            .await
            .expect_err("id inexistente");
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
