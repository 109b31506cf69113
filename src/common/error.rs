use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::cache::{Entity, Scope};

// Nosso tipo de erro central, com `thiserror` para melhor ergonomia.
// Cobre as três famílias: autenticação, autorização e sincronização de dados.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Erro de validação")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Campos obrigatórios ausentes")]
    MissingFields,

    #[error("E-mail já existe")]
    EmailAlreadyExists,

    #[error("Credenciais inválidas")]
    InvalidCredentials,

    // A conta existe e a senha está correta, mas o perfil foi desativado
    // por um admin. O login nunca pode completar nesse estado.
    #[error("Conta desativada")]
    AccountDeactivated,

    #[error("E-mail ainda não confirmado")]
    EmailConfirmationRequired,

    #[error("Token inválido")]
    InvalidToken,

    // O join perfil+papel voltou vazio para uma sessão válida.
    // Isso é falha de resolução, não "visitante".
    #[error("Perfil do usuário não encontrado")]
    ProfileNotFound,

    #[error("Acesso negado: {0}")]
    Forbidden(String),

    #[error("{0} não encontrado")]
    NotFound(&'static str),

    // O identity store recusou a criação da conta (e-mail duplicado,
    // senha fraca, etc). Vira 400 na rota privilegiada de staff.
    #[error("Identity store recusou a operação: {0}")]
    IdentityRejected(String),

    // A conta foi criada mas o registro de staff falhou; a conta já foi
    // removida (compensação) quando este erro chega ao cliente.
    #[error("Falha ao provisionar staff: {0}")]
    StaffProvisioningFailed(String),

    #[error("Falha ao buscar {entity} (escopo {scope}): {reason}")]
    DataFetchFailed {
        entity: Entity,
        scope: Scope,
        reason: String,
    },

    #[error("Falha ao mutar {entity}: {reason}")]
    MutationFailed { entity: Entity, reason: String },

    // Variante para erros de banco de dados
    #[error("Erro de banco de dados")]
    DatabaseError(#[from] sqlx::Error),

    // Variante genérica para qualquer outro erro inesperado
    #[error("Erro interno do servidor")]
    InternalServerError(#[from] anyhow::Error),

    #[error("Erro de Bcrypt: {0}")]
    BcryptError(#[from] bcrypt::BcryptError),

    #[error("Erro de JWT: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),
}

// Corpo JSON malformado ou com campo faltando: o extrator padrão
// devolveria 422, aqui vira o 400 de campos obrigatórios.
impl From<JsonRejection> for AppError {
    fn from(_: JsonRejection) -> Self {
        AppError::MissingFields
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            // Retorna todos os detalhes da validação, campo a campo.
            AppError::ValidationError(errors) => {
                let mut details = std::collections::HashMap::new();
                for (field, field_errors) in errors.field_errors() {
                    let messages: Vec<String> = field_errors
                        .iter()
                        .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
                        .collect();
                    details.insert(field.to_string(), messages);
                }
                let body = Json(json!({
                    "error": "Um ou mais campos são inválidos.",
                    "details": details,
                }));
                return (StatusCode::BAD_REQUEST, body).into_response();
            }
            AppError::MissingFields => (
                StatusCode::BAD_REQUEST,
                "Campos obrigatórios ausentes.".to_string(),
            ),
            AppError::EmailAlreadyExists => (
                StatusCode::CONFLICT,
                "Este e-mail já está em uso.".to_string(),
            ),
            AppError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "E-mail ou senha inválidos.".to_string(),
            ),
            AppError::AccountDeactivated => (
                StatusCode::FORBIDDEN,
                "Esta conta foi desativada. Entre em contato com o suporte.".to_string(),
            ),
            AppError::EmailConfirmationRequired => (
                StatusCode::FORBIDDEN,
                "Confirme seu e-mail antes de entrar.".to_string(),
            ),
            AppError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "Token de autenticação inválido ou ausente.".to_string(),
            ),
            AppError::ProfileNotFound => (
                StatusCode::NOT_FOUND,
                "Perfil do usuário não encontrado.".to_string(),
            ),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(what) => {
                (StatusCode::NOT_FOUND, format!("{} não encontrado.", what))
            }
            AppError::IdentityRejected(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::StaffProvisioningFailed(msg) => {
                tracing::error!("Provisionamento de staff compensado: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }

            // Todos os outros erros (DatabaseError, InternalServerError, fetch)
            // viram 500. O `tracing` loga a mensagem detalhada do `thiserror`.
            ref e => {
                tracing::error!("Erro Interno do Servidor: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Ocorreu um erro inesperado.".to_string(),
                )
            }
        };

        // Resposta padrão para erros simples que só têm uma mensagem.
        let body = Json(json!({ "error": error_message }));
        (status, body).into_response()
    }
}
