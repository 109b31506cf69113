// src/services/mod.rs
//
// A camada de serviços: o resolvedor de sessão, o roteador de papéis e um
// serviço por entidade. Cada serviço possui seu QueryCache e liga o change
// feed à invalidação; os handlers HTTP só orquestram.

pub mod access;
pub mod bookings;
pub mod profiles;
pub mod saved_shops;
pub mod session;
pub mod shops;
pub mod staff;
pub mod vehicles;

use std::sync::Arc;

use crate::cache::{CacheHandle, Fetcher, QueryCache, Scope};
use crate::common::error::AppError;
use crate::store::{ChangeFeed, ChangeFilter, Table};

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use uuid::Uuid;

    use crate::cache::{CacheHandle, EntryState};
    use crate::models::auth::{Principal, Role};

    // Espera a entrada chegar num Ready que satisfaça o predicado (as
    // invalidações via feed são assíncronas).
    pub async fn wait_until<T, F>(handle: &mut CacheHandle<T>, pred: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let EntryState::Ready(value) = handle.state() {
                    if pred(&value) {
                        return value;
                    }
                }
                assert!(handle.changed().await, "entrada de cache sumiu");
            }
        })
        .await
        .expect("timeout esperando o cache")
    }

    pub fn principal(id: Uuid, role: Role) -> Principal {
        Principal {
            id,
            name: "Fulano de Tal".into(),
            email: "fulano@example.com".into(),
            phone: None,
            avatar_url: None,
            role,
            is_active: true,
        }
    }
}

// O caminho único de assinatura de uma projeção: registra o assinante,
// liga o change feed (se ainda não há escuta) e só ENTÃO dispara a
// primeira carga. A ordem importa: com o feed ligado antes da leitura,
// uma escrita entre a leitura e a assinatura vira evento, não dado
// perdido.
pub(crate) async fn watch_entry<T: Clone + Send + Sync + 'static>(
    feed: &Arc<dyn ChangeFeed>,
    cache: &QueryCache<T>,
    scope: Scope,
    table: Table,
    filter: Option<ChangeFilter>,
    fetcher: Fetcher<T>,
) -> Result<CacheHandle<T>, AppError> {
    let (handle, needs_feed) = cache.subscribe(scope, fetcher);
    if needs_feed {
        wire_feed(feed, cache, scope, table, filter).await?;
    }
    cache.prime(scope);
    Ok(handle)
}

// Liga o change feed a uma entrada de cache: qualquer evento da tabela
// (passando pelo filtro) marca a entrada como suja. A task fica pendurada
// na entrada e morre quando o último assinante solta o handle.
async fn wire_feed<T: Clone + Send + Sync + 'static>(
    feed: &Arc<dyn ChangeFeed>,
    cache: &QueryCache<T>,
    scope: Scope,
    table: Table,
    filter: Option<ChangeFilter>,
) -> Result<(), AppError> {
    let mut stream = feed.subscribe(table, filter).await?;
    let cache_for_task = cache.clone();
    let task = tokio::spawn(async move {
        while stream.recv().await.is_some() {
            cache_for_task.invalidate(scope);
        }
    });
    cache.attach_feed_task(scope, task);
    Ok(())
}
