// src/store/identity.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::common::error::AppError;
use crate::models::auth::Role;

// Uma sessão emitida pelo identity store. A sessão tem vida própria,
// independente do Principal: ela existe antes do join perfil+papel
// terminar, e "ter sessão" nunca autoriza nada sozinho.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub access_token: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

// Dados para criar uma conta. O papel entra como metadado da conta e é
// materializado na tabela user_roles pelo adaptador (o cliente nunca
// escreve papel direto).
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
    pub name: String,
    pub phone: Option<String>,
    pub role: Role,
}

// Resultado de um cadastro: sessão imediata, ou "confirme seu e-mail"
// como um desfecho distinto (nunca sucesso disfarçado).
#[derive(Debug, Clone)]
pub enum SignUpOutcome {
    Session(AuthSession),
    PendingVerification,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    // Verifica credenciais e confirmação de e-mail. NÃO verifica
    // `is_active`; isso é papel do resolver, que enxerga o perfil.
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AppError>;

    // Cria conta + perfil + papel de uma vez (o equivalente do trigger de
    // cadastro do banco original).
    async fn sign_up(&self, account: NewAccount) -> Result<SignUpOutcome, AppError>;

    async fn sign_out(&self, token: &str) -> Result<(), AppError>;

    // Token -> user_id, validando assinatura/expiração e que a conta
    // ainda existe.
    async fn resolve_session(&self, token: &str) -> Result<Uuid, AppError>;

    async fn verify_password(&self, user_id: Uuid, password: &str) -> Result<bool, AppError>;

    async fn update_password(&self, user_id: Uuid, new_password: &str) -> Result<(), AppError>;

    // --- Operações privilegiadas (rota create-staff) ---

    // Cria uma conta já confirmada (staff criado pelo dono não passa por
    // verificação de e-mail).
    async fn admin_create_user(&self, account: NewAccount) -> Result<Uuid, AppError>;

    // Compensação: remove a conta (e perfil/papel em cascata) quando o
    // insert de staff falha depois da conta criada.
    async fn admin_delete_user(&self, user_id: Uuid) -> Result<(), AppError>;
}
