// src/cache/mod.rs
//
// O coordenador de cache/invalidação. Cada projeção fica guardada sob uma
// chave (entidade, escopo); a entrada anda pela máquina de estados
// Empty -> Loading -> {Ready, Error}, e volta para Loading quando alguém
// invalida. Regras centrais:
//
//  - refetch só acontece com pelo menos um assinante ativo;
//  - no máximo UM fetch em voo por chave: invalidações durante o voo são
//    absorvidas num único refetch posterior;
//  - Error é um estado de primeira classe, nunca "ausência de dado";
//  - o conteúdo é last-writer-wins (a fonte de verdade é o banco).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common::error::AppError;

// ---
// Chaves
// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Profiles,
    Shops,
    Vehicles,
    Staff,
    Bookings,
    SavedShops,
}

impl Entity {
    pub const ALL: [Entity; 6] = [
        Entity::Profiles,
        Entity::Shops,
        Entity::Vehicles,
        Entity::Staff,
        Entity::Bookings,
        Entity::SavedShops,
    ];
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Entity::Profiles => "profiles",
            Entity::Shops => "shops",
            Entity::Vehicles => "vehicles",
            Entity::Staff => "staff",
            Entity::Bookings => "bookings",
            Entity::SavedShops => "saved_shops",
        };
        f.write_str(s)
    }
}

// O discriminador de escopo de uma consulta. O id embutido é o "dono" do
// escopo (principal ou loja), para que dois usuários nunca compartilhem a
// mesma entrada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    // Listagem pública, sem filtro por principal
    All,
    // "Meus" registros (o id é o principal)
    Mine(Uuid),
    // Registros das lojas de um dono (o id é o dono)
    Owned(Uuid),
    // Uma loja específica
    Shop(Uuid),
    // Um registro único
    One(Uuid),
    // Tarefas atribuídas a um membro de staff (o id é o usuário do staff)
    Assigned(Uuid),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::Mine(id) => write!(f, "mine:{}", id),
            Scope::Owned(id) => write!(f, "owned:{}", id),
            Scope::Shop(id) => write!(f, "shop:{}", id),
            Scope::One(id) => write!(f, "one:{}", id),
            Scope::Assigned(id) => write!(f, "assigned:{}", id),
        }
    }
}

// ---
// Estados
// ---

// Erro de fetch clonável (o watch distribui clones do estado para todos os
// assinantes). Carrega a chave para reconstruir o AppError completo.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchError {
    pub entity: Entity,
    pub scope: Scope,
    pub reason: String,
}

impl FetchError {
    pub fn new(entity: Entity, scope: Scope, source: &AppError) -> Self {
        Self {
            entity,
            scope,
            reason: source.to_string(),
        }
    }
}

impl From<FetchError> for AppError {
    fn from(e: FetchError) -> Self {
        AppError::DataFetchFailed {
            entity: e.entity,
            scope: e.scope,
            reason: e.reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryState<T: Clone> {
    Empty,
    Loading,
    Ready(T),
    Error(FetchError),
}

impl<T: Clone> EntryState<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, EntryState::Ready(_))
    }
}

// ---
// O cache em si
// ---

pub type FetchFuture<T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send>>;
pub type Fetcher<T> = Arc<dyn Fn() -> FetchFuture<T> + Send + Sync>;

struct Entry<T: Clone> {
    tx: watch::Sender<EntryState<T>>,
    fetcher: Fetcher<T>,
    subscribers: usize,
    in_flight: bool,
    stale: bool,
    feed_task: Option<JoinHandle<()>>,
}

// Um cache tipado, com uma entrada por escopo, todas da mesma entidade.
// Clonar é barato (Arc interno); o mutex nunca atravessa um await.
pub struct QueryCache<T: Clone + Send + Sync + 'static> {
    entity: Entity,
    entries: Arc<Mutex<HashMap<Scope, Entry<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            entity: self.entity,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> QueryCache<T> {
    pub fn new(entity: Entity) -> Self {
        Self {
            entity,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    // Registra um assinante para o escopo, SEM disparar o fetch (isso é
    // `prime`, chamado depois de ligar o change feed). Retorna também se o
    // chamador precisa ligar o feed para essa entrada (nenhuma task de
    // feed ativa no momento).
    pub fn subscribe(&self, scope: Scope, fetcher: Fetcher<T>) -> (CacheHandle<T>, bool) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let entry = entries.entry(scope).or_insert_with(|| {
            let (tx, _rx) = watch::channel(EntryState::Empty);
            Entry {
                tx,
                fetcher: fetcher.clone(),
                subscribers: 0,
                in_flight: false,
                stale: false,
                feed_task: None,
            }
        });

        entry.subscribers += 1;
        entry.fetcher = fetcher;
        let needs_feed = entry.feed_task.is_none();
        let rx = entry.tx.subscribe();

        (
            CacheHandle {
                cache: self.clone(),
                scope,
                rx,
                released: false,
            },
            needs_feed,
        )
    }

    // Dispara o fetch se a entrada precisa de um: primeira carga, estado
    // de erro ou entrada suja. Chamar só DEPOIS de ligar o change feed,
    // senão uma escrita entre a leitura inicial e a assinatura do feed
    // passa despercebida.
    pub fn prime(&self, scope: Scope) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let Some(entry) = entries.get_mut(&scope) else {
            return;
        };
        if entry.subscribers == 0 || entry.in_flight {
            return;
        }
        if entry.stale
            || matches!(
                &*entry.tx.borrow(),
                EntryState::Empty | EntryState::Error(_)
            )
        {
            self.begin_fetch(scope, entry);
        }
    }

    // Marca a entrada como suja. Refetch imediato só com assinante ativo e
    // sem fetch em voo; um fetch em voo absorve o sinal (a flag `stale`
    // garante exatamente um refetch posterior).
    pub fn invalidate(&self, scope: Scope) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let Some(entry) = entries.get_mut(&scope) else {
            return;
        };
        entry.stale = true;
        if entry.subscribers > 0 && !entry.in_flight {
            self.begin_fetch(scope, entry);
        }
    }

    // Invalida todas as entradas desta entidade (fan-out de mutações).
    pub fn invalidate_all(&self) {
        let scopes: Vec<Scope> = {
            let entries = self.entries.lock().expect("cache lock poisoned");
            entries.keys().copied().collect()
        };
        for scope in scopes {
            self.invalidate(scope);
        }
    }

    // Pendura a task que escuta o change feed desta entrada. Ela é
    // abortada quando o último assinante solta a entrada.
    pub fn attach_feed_task(&self, scope: Scope, task: JoinHandle<()>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get_mut(&scope) {
            if let Some(old) = entry.feed_task.replace(task) {
                old.abort();
            }
        } else {
            // Entrada já foi embora (assinante desistiu antes do feed ligar).
            task.abort();
        }
    }

    pub fn state(&self, scope: Scope) -> EntryState<T> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries
            .get(&scope)
            .map(|e| e.tx.borrow().clone())
            .unwrap_or(EntryState::Empty)
    }

    // Pré-condição: lock do mapa em mãos.
    fn begin_fetch(&self, scope: Scope, entry: &mut Entry<T>) {
        entry.in_flight = true;
        entry.stale = false;
        entry.tx.send_replace(EntryState::Loading);

        let fetcher = entry.fetcher.clone();
        let cache = self.clone();
        tokio::spawn(async move {
            let result = fetcher().await;
            cache.finish_fetch(scope, result);
        });
    }

    fn finish_fetch(&self, scope: Scope, result: Result<T, FetchError>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let Some(entry) = entries.get_mut(&scope) else {
            // Entrada desmontada durante o voo: resultado descartado.
            return;
        };
        entry.in_flight = false;
        match result {
            Ok(value) => {
                entry.tx.send_replace(EntryState::Ready(value));
            }
            Err(e) => {
                tracing::warn!("fetch de {} ({}) falhou: {}", e.entity, e.scope, e.reason);
                entry.tx.send_replace(EntryState::Error(e));
            }
        }
        // Invalidações chegadas durante o voo: um único refetch agora.
        if entry.stale && entry.subscribers > 0 {
            self.begin_fetch(scope, entry);
        }
    }

    fn release(&self, scope: Scope) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let Some(entry) = entries.get_mut(&scope) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers == 0 {
            // Último assinante saiu: cancela a escuta do feed e desmonta a
            // entrada (escopos por usuário não podem se acumular num
            // processo de vida longa). Um fetch em voo descarta o
            // resultado ao terminar.
            if let Some(task) = entry.feed_task.take() {
                task.abort();
            }
            entries.remove(&scope);
        }
    }
}

// A assinatura de um assinante. Soltar o handle desregistra o assinante;
// com zero assinantes a escuta do change feed é desligada.
pub struct CacheHandle<T: Clone + Send + Sync + 'static> {
    cache: QueryCache<T>,
    scope: Scope,
    rx: watch::Receiver<EntryState<T>>,
    released: bool,
}

impl<T: Clone + Send + Sync + 'static> CacheHandle<T> {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn state(&self) -> EntryState<T> {
        self.rx.borrow().clone()
    }

    // Espera a próxima transição de estado. `false` quando a entrada sumiu.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    // Espera até Ready ou Error. Loading/Empty são estados de carregamento
    // definidos, nunca tratados como ausência.
    pub async fn ready(&mut self) -> Result<T, AppError> {
        loop {
            match self.state() {
                EntryState::Ready(value) => return Ok(value),
                EntryState::Error(e) => return Err(e.into()),
                EntryState::Empty | EntryState::Loading => {
                    if self.rx.changed().await.is_err() {
                        return Err(AppError::InternalServerError(anyhow::anyhow!(
                            "entrada de cache desmontada durante a espera"
                        )));
                    }
                }
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for CacheHandle<T> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.cache.release(self.scope);
        }
    }
}

// ---
// Registro para invalidação entre entidades
// ---

// Uma mutação em X invalida todo cache cuja entidade é X ou cujo join
// embute X (ex.: criar reserva invalida as listas de reserva do cliente,
// da loja e do staff; mudar veículo invalida também as reservas, que
// embutem o resumo do veículo).
pub trait EntityInvalidator: Send + Sync {
    fn entity(&self) -> Entity;
    fn invalidate_entity(&self);
}

impl<T: Clone + Send + Sync + 'static> EntityInvalidator for QueryCache<T> {
    fn entity(&self) -> Entity {
        self.entity
    }

    fn invalidate_entity(&self) {
        self.invalidate_all();
    }
}

#[derive(Default)]
pub struct CacheRegistry {
    sinks: Mutex<Vec<Arc<dyn EntityInvalidator>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn EntityInvalidator>) {
        self.sinks.lock().expect("registry lock poisoned").push(sink);
    }

    pub fn invalidate(&self, entity: Entity) {
        let sinks: Vec<Arc<dyn EntityInvalidator>> = {
            let sinks = self.sinks.lock().expect("registry lock poisoned");
            sinks.iter().cloned().collect()
        };
        for sink in sinks {
            if sink.entity() == entity {
                sink.invalidate_entity();
            }
        }
    }

    pub fn invalidate_many(&self, entities: &[Entity]) {
        for entity in entities {
            self.invalidate(*entity);
        }
    }
}
