// src/store/changes.rs

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::common::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Profiles,
    UserRoles,
    Shops,
    Vehicles,
    Staff,
    Bookings,
    SavedShops,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::UserRoles => "user_roles",
            Table::Shops => "shops",
            Table::Vehicles => "vehicles",
            Table::Staff => "staff",
            Table::Bookings => "bookings",
            Table::SavedShops => "saved_shops",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        match name {
            "profiles" => Some(Table::Profiles),
            "user_roles" => Some(Table::UserRoles),
            "shops" => Some(Table::Shops),
            "vehicles" => Some(Table::Vehicles),
            "staff" => Some(Table::Staff),
            "bookings" => Some(Table::Bookings),
            "saved_shops" => Some(Table::SavedShops),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

// Um evento de linha. Carrega só as colunas-chave (para casar filtros),
// nunca o payload novo: quem recebe refaz o fetch, o evento não é fonte
// de estado.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: Table,
    pub op: ChangeOp,
    pub keys: HashMap<String, Uuid>,
}

// Filtro no estilo "owner_id=eq.<uuid>" das assinaturas originais.
#[derive(Debug, Clone, Copy)]
pub struct ChangeFilter {
    pub column: &'static str,
    pub equals: Uuid,
}

impl ChangeFilter {
    pub fn eq(column: &'static str, equals: Uuid) -> Self {
        Self { column, equals }
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        event.keys.get(self.column) == Some(&self.equals)
    }
}

// Uma assinatura viva do feed. `recv` devolve só os eventos da tabela (e
// do filtro) desta assinatura; None quando o feed fechou.
pub struct ChangeStream {
    rx: broadcast::Receiver<ChangeEvent>,
    table: Table,
    filter: Option<ChangeFilter>,
}

impl ChangeStream {
    pub fn new(
        rx: broadcast::Receiver<ChangeEvent>,
        table: Table,
        filter: Option<ChangeFilter>,
    ) -> Self {
        Self { rx, table, filter }
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.table != self.table {
                        continue;
                    }
                    if let Some(filter) = &self.filter {
                        if !filter.matches(&event) {
                            continue;
                        }
                    }
                    return Some(event);
                }
                // Perder eventos por atraso não perde escrita nenhuma: o
                // próximo evento (ou o refetch) realinha com o banco.
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("change feed atrasado, {} eventos pulados", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(
        &self,
        table: Table,
        filter: Option<ChangeFilter>,
    ) -> Result<ChangeStream, AppError>;
}
