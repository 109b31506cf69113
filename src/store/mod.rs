// src/store/mod.rs
//
// A camada de dados. Os três colaboradores externos viram "portas" (traits):
// o identity store, o banco relacional (um trait por tabela de domínio) e o
// change feed. As políticas de autorização por linha vivem do lado do
// adaptador concreto: qualquer filtro de escopo passado pelo serviço é
// conveniência de UX, nunca a fronteira de segurança.

pub mod changes;
pub mod identity;
pub mod memory;
pub mod postgres;
pub mod tables;

pub use changes::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeOp, ChangeStream, Table};
pub use identity::{AuthSession, IdentityStore, NewAccount, SignUpOutcome};
pub use tables::RentalStore;
