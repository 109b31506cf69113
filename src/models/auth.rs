// src/models/auth.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

// O papel de um usuário. Um único papel ativo por principal; o valor é
// autoritativo no servidor e nunca pode ser definido pelo cliente.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Owner,
    Staff,
    User,
}

// Linha da tabela 'profiles', espelhando o perfil público de uma conta.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub address: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Projeção para a moderação do admin: perfil + papel (join batched).
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    #[serde(flatten)]
    pub profile: Profile,
    pub role: Role,
}

// O principal resolvido: identidade autenticada + perfil + papel.
// Só o SessionResolver constrói e muta isso.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Role,
    pub is_active: bool,
}

// O estado observável do principal. "Sessão presente" NÃO é "autorizado":
// entre o login e o join perfil+papel o estado é `Resolving`, e os guards
// devem esperar em vez de renderizar ou redirecionar.
#[derive(Debug, Clone, PartialEq)]
pub enum PrincipalState {
    Resolving,
    Guest,
    SignedIn(Principal),
}

impl PrincipalState {
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            PrincipalState::SignedIn(p) => Some(p),
            _ => None,
        }
    }
}

// Estrutura de dados ("claims") dentro do JWT de sessão
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,  // Subject (ID do usuário)
    pub exp: usize, // Expiration time (quando o token expira)
    pub iat: usize, // Issued At (quando o token foi criado)
}

// Dados para registro de um novo usuário (cliente ou dono de loja)
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterUserPayload {
    #[validate(email(message = "O e-mail fornecido é inválido."))]
    pub email: String,
    #[validate(length(min = 6, message = "A senha deve ter no mínimo 6 caracteres."))]
    pub password: String,
    #[validate(length(min = 1, message = "O nome é obrigatório."))]
    pub name: String,
    pub phone: Option<String>,
    // Só `user` e `owner` podem se auto-registrar; staff nasce pela rota
    // privilegiada e admin nunca via API.
    pub role: Option<Role>,
}

// Dados para login
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginUserPayload {
    #[validate(email(message = "O e-mail fornecido é inválido."))]
    pub email: String,
    #[validate(length(min = 6, message = "A senha deve ter no mínimo 6 caracteres."))]
    pub password: String,
}

// Resposta de autenticação com o token e o destino pós-login
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub redirect_path: String,
    pub principal: Principal,
}

// Resposta de registro. Quando o identity store exige confirmação de
// e-mail, não há sessão: `pendingVerification` vem true e o resto nulo.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignupResponse {
    pub pending_verification: bool,
    pub token: Option<String>,
    pub redirect_path: Option<String>,
    pub principal: Option<Principal>,
}

// Edição do próprio perfil
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct UpdateProfilePayload {
    #[validate(length(min = 1, message = "O nome não pode ficar vazio."))]
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ChangePasswordPayload {
    pub current_password: String,
    #[validate(length(min = 6, message = "A nova senha deve ter no mínimo 6 caracteres."))]
    pub new_password: String,
}
