// src/services/bookings.rs
//
// Reservas nas três perspectivas: as do cliente, as das lojas de um dono e
// as tarefas de um staff. Todas saem do mesmo cache (Entity::Bookings), uma
// entrada por escopo, então uma mutação invalida as três de uma vez.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::cache::{CacheHandle, CacheRegistry, Entity, FetchError, Fetcher, QueryCache, Scope};
use crate::common::error::AppError;
use crate::models::auth::{Principal, Role};
use crate::models::bookings::{
    Booking, BookingStatus, BookingView, CreateBookingInput, CustomerSummary, ShopSummary,
    UpdateBookingInput, VehicleSummary,
};
use crate::services::watch_entry;
use crate::store::{ChangeFeed, ChangeFilter, RentalStore, Table};

#[derive(Clone)]
pub struct BookingService {
    store: Arc<dyn RentalStore>,
    feed: Arc<dyn ChangeFeed>,
    cache: QueryCache<Vec<BookingView>>,
    registry: Arc<CacheRegistry>,
}

// Monta as projeções com joins em lote: UM SELECT de veículos, UM de lojas
// e (nos escopos de dono/staff) UM de perfis, sempre pelos ids distintos.
// Veículo e loja são obrigatórios: linha órfã derruba o fetch inteiro.
async fn build_views(
    store: &Arc<dyn RentalStore>,
    scope: Scope,
    bookings: Vec<Booking>,
    include_customer: bool,
) -> Result<Vec<BookingView>, FetchError> {
    if bookings.is_empty() {
        return Ok(Vec::new());
    }
    let wrap = |reason: String| FetchError {
        entity: Entity::Bookings,
        scope,
        reason,
    };

    let vehicle_ids: Vec<Uuid> = bookings
        .iter()
        .map(|b| b.vehicle_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let shop_ids: Vec<Uuid> = bookings
        .iter()
        .map(|b| b.shop_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let vehicles = store
        .find_vehicles(&vehicle_ids)
        .await
        .map_err(|e| wrap(e.to_string()))?;
    let shops = store
        .find_shops(&shop_ids)
        .await
        .map_err(|e| wrap(e.to_string()))?;

    let customers: HashMap<Uuid, CustomerSummary> = if include_customer {
        let user_ids: Vec<Uuid> = bookings
            .iter()
            .map(|b| b.user_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        store
            .find_profiles(&user_ids)
            .await
            .map_err(|e| wrap(e.to_string()))?
            .into_iter()
            .map(|p| {
                (
                    p.user_id,
                    CustomerSummary {
                        name: p.name,
                        email: p.email,
                        phone: p.phone,
                    },
                )
            })
            .collect()
    } else {
        HashMap::new()
    };

    let vehicles: HashMap<Uuid, VehicleSummary> = vehicles
        .into_iter()
        .map(|v| {
            (
                v.id,
                VehicleSummary {
                    name: v.name,
                    brand: v.brand,
                    model: v.model,
                    images: v.images,
                    vehicle_type: v.vehicle_type,
                },
            )
        })
        .collect();
    let shops: HashMap<Uuid, ShopSummary> = shops
        .into_iter()
        .map(|s| {
            (
                s.id,
                ShopSummary {
                    name: s.name,
                    address: s.address,
                },
            )
        })
        .collect();

    bookings
        .into_iter()
        .map(|b| {
            let vehicle = vehicles
                .get(&b.vehicle_id)
                .cloned()
                .ok_or_else(|| wrap(format!("veículo {} da reserva não encontrado", b.vehicle_id)))?;
            let shop = shops
                .get(&b.shop_id)
                .cloned()
                .ok_or_else(|| wrap(format!("loja {} da reserva não encontrada", b.shop_id)))?;
            let customer = customers.get(&b.user_id).cloned();
            Ok(BookingView {
                booking: b,
                vehicle,
                shop,
                customer,
            })
        })
        .collect()
}

impl BookingService {
    pub fn new(
        store: Arc<dyn RentalStore>,
        feed: Arc<dyn ChangeFeed>,
        registry: Arc<CacheRegistry>,
    ) -> Self {
        let cache = QueryCache::new(Entity::Bookings);
        registry.register(Arc::new(cache.clone()));
        Self {
            store,
            feed,
            cache,
            registry,
        }
    }

    fn fetch_mine(&self, user_id: Uuid) -> Fetcher<Vec<BookingView>> {
        let store = self.store.clone();
        let scope = Scope::Mine(user_id);
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let bookings = store
                    .list_bookings_by_user(user_id)
                    .await
                    .map_err(|e| FetchError::new(Entity::Bookings, scope, &e))?;
                build_views(&store, scope, bookings, false).await
            })
        })
    }

    fn fetch_owned(&self, owner_id: Uuid) -> Fetcher<Vec<BookingView>> {
        let store = self.store.clone();
        let scope = Scope::Owned(owner_id);
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let wrap = |e: &AppError| FetchError::new(Entity::Bookings, scope, e);
                let shops = store.list_shops_by_owner(owner_id).await.map_err(|e| wrap(&e))?;
                if shops.is_empty() {
                    return Ok(Vec::new());
                }
                let shop_ids: Vec<Uuid> = shops.iter().map(|s| s.id).collect();
                let bookings = store
                    .list_bookings_in_shops(&shop_ids)
                    .await
                    .map_err(|e| wrap(&e))?;
                build_views(&store, scope, bookings, true).await
            })
        })
    }

    fn fetch_assigned(&self, user_id: Uuid) -> Fetcher<Vec<BookingView>> {
        let store = self.store.clone();
        let scope = Scope::Assigned(user_id);
        Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let wrap = |e: &AppError| FetchError::new(Entity::Bookings, scope, e);
                // Principal sem registro de staff não tem tarefas.
                let Some(staff) = store.find_staff_by_user(user_id).await.map_err(|e| wrap(&e))?
                else {
                    return Ok(Vec::new());
                };
                let bookings = store
                    .list_bookings_for_staff(staff.id, staff.shop_id)
                    .await
                    .map_err(|e| wrap(&e))?;
                build_views(&store, scope, bookings, true).await
            })
        })
    }

    pub async fn watch_mine(
        &self,
        user_id: Uuid,
    ) -> Result<CacheHandle<Vec<BookingView>>, AppError> {
        let scope = Scope::Mine(user_id);
        watch_entry(
            &self.feed,
            &self.cache,
            scope,
            Table::Bookings,
            Some(ChangeFilter::eq("user_id", user_id)),
            self.fetch_mine(user_id),
        )
        .await
    }

    pub async fn user_bookings(&self, user_id: Uuid) -> Result<Vec<BookingView>, AppError> {
        self.watch_mine(user_id).await?.ready().await
    }

    pub async fn watch_owned(
        &self,
        owner_id: Uuid,
    ) -> Result<CacheHandle<Vec<BookingView>>, AppError> {
        let scope = Scope::Owned(owner_id);
        // O conjunto de lojas do dono não cabe num filtro de coluna;
        // escuta a tabela toda e deixa o refetch recortar.
        watch_entry(
            &self.feed,
            &self.cache,
            scope,
            Table::Bookings,
            None,
            self.fetch_owned(owner_id),
        )
        .await
    }

    pub async fn shop_bookings(&self, owner_id: Uuid) -> Result<Vec<BookingView>, AppError> {
        self.watch_owned(owner_id).await?.ready().await
    }

    pub async fn watch_assigned(
        &self,
        user_id: Uuid,
    ) -> Result<CacheHandle<Vec<BookingView>>, AppError> {
        let scope = Scope::Assigned(user_id);
        watch_entry(
            &self.feed,
            &self.cache,
            scope,
            Table::Bookings,
            None,
            self.fetch_assigned(user_id),
        )
        .await
    }

    pub async fn staff_tasks(&self, user_id: Uuid) -> Result<Vec<BookingView>, AppError> {
        self.watch_assigned(user_id).await?.ready().await
    }

    pub async fn create_booking(
        &self,
        caller: &Principal,
        input: &CreateBookingInput,
    ) -> Result<Booking, AppError> {
        if input.end_date <= input.start_date {
            return Err(AppError::MutationFailed {
                entity: Entity::Bookings,
                reason: "o fim da reserva deve ser depois do início".to_string(),
            });
        }

        let vehicle = self
            .store
            .find_vehicle(input.vehicle_id)
            .await?
            .ok_or(AppError::NotFound("Veículo"))?;
        if vehicle.shop_id != input.shop_id {
            return Err(AppError::MutationFailed {
                entity: Entity::Bookings,
                reason: "o veículo não pertence à loja informada".to_string(),
            });
        }
        if !vehicle.is_available {
            return Err(AppError::MutationFailed {
                entity: Entity::Bookings,
                reason: "o veículo não está disponível".to_string(),
            });
        }

        // O user_id é o do principal verificado; o corpo nunca escolhe.
        let booking = self.store.insert_booking(caller.id, input).await?;
        self.registry.invalidate(Entity::Bookings);
        Ok(booking)
    }

    pub async fn update_booking(
        &self,
        caller: &Principal,
        id: Uuid,
        input: &UpdateBookingInput,
    ) -> Result<Booking, AppError> {
        let booking = self
            .store
            .find_booking(id)
            .await?
            .ok_or(AppError::NotFound("Reserva"))?;
        self.authorize_update(caller, &booking, input).await?;

        let updated = self.store.update_booking(id, input).await?;

        // Transições de status arrastam a disponibilidade do veículo:
        // em uso -> indisponível; devolvido/cancelado -> de volta à vitrine.
        let touched_vehicle = match input.status {
            Some(BookingStatus::Active) => {
                self.store
                    .set_vehicle_availability(updated.vehicle_id, false)
                    .await?;
                true
            }
            Some(BookingStatus::Completed) | Some(BookingStatus::Cancelled) => {
                self.store
                    .set_vehicle_availability(updated.vehicle_id, true)
                    .await?;
                true
            }
            _ => false,
        };

        self.registry.invalidate(Entity::Bookings);
        if touched_vehicle {
            self.registry.invalidate(Entity::Vehicles);
        }
        Ok(updated)
    }

    async fn authorize_update(
        &self,
        caller: &Principal,
        booking: &Booking,
        input: &UpdateBookingInput,
    ) -> Result<(), AppError> {
        match caller.role {
            Role::Admin => Ok(()),
            Role::Owner => {
                let shop = self
                    .store
                    .find_shop(booking.shop_id)
                    .await?
                    .ok_or(AppError::NotFound("Loja"))?;
                if shop.owner_id == caller.id {
                    Ok(())
                } else {
                    Err(AppError::Forbidden(
                        "Esta reserva é de uma loja de outro dono.".to_string(),
                    ))
                }
            }
            Role::Staff => {
                let staff = self
                    .store
                    .find_staff_by_user(caller.id)
                    .await?
                    .ok_or_else(|| {
                        AppError::Forbidden("Principal sem registro de staff.".to_string())
                    })?;
                let assigned = booking.staff_id == Some(staff.id);
                let unassigned_in_shop =
                    booking.staff_id.is_none() && staff.shop_id == Some(booking.shop_id);
                if assigned || unassigned_in_shop {
                    Ok(())
                } else {
                    Err(AppError::Forbidden(
                        "Esta reserva não está nas suas tarefas.".to_string(),
                    ))
                }
            }
            Role::User => {
                // Cliente só cancela a própria reserva.
                let cancelling = booking.user_id == caller.id
                    && input.status == Some(BookingStatus::Cancelled)
                    && input.delivery_status.is_none()
                    && input.staff_id.is_none();
                if cancelling {
                    Ok(())
                } else {
                    Err(AppError::Forbidden(
                        "Clientes só podem cancelar as próprias reservas.".to_string(),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use crate::models::shops::CreateShopInput;
    use crate::models::vehicles::{CreateVehicleInput, VehicleType};
    use crate::services::testing::{principal, wait_until};
    use crate::store::memory::MemoryBackend;
    use crate::store::tables::{BookingStore, ShopStore, StaffStore, VehicleStore};
    use crate::store::{IdentityStore, NewAccount};

    struct Fixture {
        backend: Arc<MemoryBackend>,
        service: BookingService,
        owner: Principal,
        customer: Principal,
        shop_id: Uuid,
        vehicle_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let service = BookingService::new(
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
        let customer_id = backend
            .admin_create_user(NewAccount {
                email: "cliente@example.com".into(),
                password: "senha123".into(),
                name: "Seu João".into(),
                phone: Some("11999990000".into()),
                role: Role::User,
            })
            .await
            .expect("seed do cliente");

        let shop = backend
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
            .expect("seed da loja");
        let vehicle = backend
            .insert_vehicle(&CreateVehicleInput {
                shop_id: shop.id,
                vehicle_type: VehicleType::Car,
                name: "Uno".into(),
                brand: "Fiat".into(),
                model: "Uno".into(),
                images: vec![],
                price_per_hour: Decimal::new(1500, 2),
                price_per_day: Decimal::new(12000, 2),
                fuel_type: None,
                transmission: None,
                seating: Some(5),
                features: vec![],
            })
            .await
            .expect("seed do veículo");

        Fixture {
            owner: principal(owner_id, Role::Owner),
            customer: principal(customer_id, Role::User),
            shop_id: shop.id,
            vehicle_id: vehicle.id,
            backend,
            service,
        }
    }

    fn booking_input(fx: &Fixture) -> CreateBookingInput {
        let start = Utc::now() + Duration::days(1);
        CreateBookingInput {
            vehicle_id: fx.vehicle_id,
            shop_id: fx.shop_id,
            start_date: start,
            end_date: start + Duration::days(2),
            total_price: Decimal::new(24000, 2),
            delivery_address: None,
        }
    }

    #[tokio::test]
    async fn criar_reserva_atualiza_os_tres_escopos() {
        let fx = fixture().await;
        let staff_user = Uuid::new_v4();
        fx.backend
            .insert_staff(staff_user, fx.owner.id, Some(fx.shop_id))
            .await
            .expect("seed do staff");

        let mut mine = fx.service.watch_mine(fx.customer.id).await.expect("cliente");
        let mut owned = fx.service.watch_owned(fx.owner.id).await.expect("dono");
        let mut tasks = fx.service.watch_assigned(staff_user).await.expect("staff");
        wait_until(&mut mine, |b| b.is_empty()).await;
        wait_until(&mut owned, |b| b.is_empty()).await;
        wait_until(&mut tasks, |b| b.is_empty()).await;

        // Mutação local: o fan-out do registry suja os três escopos.
        fx.service
            .create_booking(&fx.customer, &booking_input(&fx))
            .await
            .expect("criar reserva");

        let mine_views = wait_until(&mut mine, |b| b.len() == 1).await;
        wait_until(&mut owned, |b| b.len() == 1).await;
        wait_until(&mut tasks, |b| b.len() == 1).await;

        // Projeção do cliente: joins completos, sem dados de outros clientes.
        assert_eq!(mine_views[0].vehicle.name, "Uno");
        assert_eq!(mine_views[0].shop.name, "Matriz");
        assert!(mine_views[0].customer.is_none());

        // Escrita de outra sessão: só o change feed avisa estes caches.
        fx.backend
            .insert_booking(fx.customer.id, &booking_input(&fx))
            .await
            .expect("insert externo");

        wait_until(&mut mine, |b| b.len() == 2).await;
        let owned_views = wait_until(&mut owned, |b| b.len() == 2).await;
        wait_until(&mut tasks, |b| b.len() == 2).await;

        // Dono enxerga o cliente no join.
        let customer = owned_views[0].customer.as_ref().expect("cliente no join");
        assert_eq!(customer.name, "Seu João");
    }

    #[tokio::test]
    async fn join_obrigatorio_falha_fechado() {
        let fx = fixture().await;
        fx.service
            .create_booking(&fx.customer, &booking_input(&fx))
            .await
            .expect("criar reserva");

        // A linha do veículo some por baixo (inconsistência real).
        fx.backend
            .delete_vehicle(fx.vehicle_id)
            .await
            .expect("sumir com o veículo");

        let err = fx
            .service
            .user_bookings(fx.customer.id)
            .await
            .expect_err("join órfão derruba o fetch");
        assert!(matches!(err, AppError::DataFetchFailed { .. }));
    }

    #[tokio::test]
    async fn transicao_de_status_arrasta_a_disponibilidade() {
        let fx = fixture().await;
        let booking = fx
            .service
            .create_booking(&fx.customer, &booking_input(&fx))
            .await
            .expect("criar reserva");

        fx.service
            .update_booking(
                &fx.owner,
                booking.id,
                &UpdateBookingInput {
                    status: Some(BookingStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .expect("ativar");
        let vehicle = fx
            .backend
            .find_vehicle(fx.vehicle_id)
            .await
            .expect("buscar veículo")
            .expect("veículo existe");
        assert!(!vehicle.is_available, "em uso sai da vitrine");

        fx.service
            .update_booking(
                &fx.owner,
                booking.id,
                &UpdateBookingInput {
                    status: Some(BookingStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .expect("concluir");
        let vehicle = fx
            .backend
            .find_vehicle(fx.vehicle_id)
            .await
            .expect("buscar veículo")
            .expect("veículo existe");
        assert!(vehicle.is_available, "devolvido volta à vitrine");
    }

    #[tokio::test]
    async fn cliente_so_cancela_a_propria_reserva() {
        let fx = fixture().await;
        let booking = fx
            .service
            .create_booking(&fx.customer, &booking_input(&fx))
            .await
            .expect("criar reserva");

        // Outro cliente não toca.
        let outro = principal(Uuid::new_v4(), Role::User);
        let err = fx
            .service
            .update_booking(
                &outro,
                booking.id,
                &UpdateBookingInput {
                    status: Some(BookingStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await
            .expect_err("reserva alheia");
        assert!(matches!(err, AppError::Forbidden(_)));

        // O próprio cliente não promove a Active.
        let err = fx
            .service
            .update_booking(
                &fx.customer,
                booking.id,
                &UpdateBookingInput {
                    status: Some(BookingStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .expect_err("cliente não ativa");
        assert!(matches!(err, AppError::Forbidden(_)));

        // Cancelar a própria, pode.
        let updated = fx
            .service
            .update_booking(
                &fx.customer,
                booking.id,
                &UpdateBookingInput {
                    status: Some(BookingStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await
            .expect("cancelar a própria");
        assert_eq!(updated.status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn staff_de_outra_loja_nao_atualiza() {
        let fx = fixture().await;
        let booking = fx
            .service
            .create_booking(&fx.customer, &booking_input(&fx))
            .await
            .expect("criar reserva");

        // Staff de outra loja (sem atribuição à reserva).
        let staff_user = Uuid::new_v4();
        fx.backend
            .insert_staff(staff_user, fx.owner.id, None)
            .await
            .expect("staff sem loja");
        let staff = principal(staff_user, Role::Staff);

        let err = fx
            .service
            .update_booking(
                &staff,
                booking.id,
                &UpdateBookingInput {
                    status: Some(BookingStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .expect_err("fora das tarefas dele");
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn datas_invertidas_sao_recusadas() {
        let fx = fixture().await;
        let mut input = booking_input(&fx);
        std::mem::swap(&mut input.start_date, &mut input.end_date);

        let err = fx
            .service
            .create_booking(&fx.customer, &input)
            .await
            .expect_err("fim antes do início");
        assert!(matches!(err, AppError::MutationFailed { .. }));
    }

    #[tokio::test]
    async fn reserva_com_entrega_nasce_pendente() {
        let fx = fixture().await;
        let mut input = booking_input(&fx);
        input.delivery_address = Some("Rua do Cliente, 42".into());

        let booking = fx
            .service
            .create_booking(&fx.customer, &input)
            .await
            .expect("criar com entrega");
        assert_eq!(
            booking.delivery_status,
            Some(crate::models::bookings::DeliveryStatus::Pending)
        );

        let sem_entrega = fx
            .service
            .create_booking(&fx.customer, &booking_input(&fx))
            .await
            .expect("criar sem entrega");
        assert!(sem_entrega.delivery_status.is_none());
    }
}
