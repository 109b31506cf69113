// src/services/session.rs
//
// O resolvedor de sessão: a ÚNICA peça que transforma "tem token" em "tem
// principal". Sessão e principal são coisas distintas: entre o sign-in e o
// join perfil+papel o estado observável é `Resolving`, e nada autoriza.
//
// A API tem duas faces: a stateless (authenticate/register/
// principal_for_token), usada pelos handlers HTTP que atendem N usuários,
// e a stateful (login/signup/bootstrap/logout), que mantém o estado
// observável de UM principal via canal watch.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use uuid::Uuid;
use validator::Validate;

use crate::cache::{CacheRegistry, Entity};
use crate::common::error::AppError;
use crate::models::auth::{
    AuthResponse, ChangePasswordPayload, LoginUserPayload, Principal, PrincipalState,
    RegisterUserPayload, Role, SignupResponse, UpdateProfilePayload,
};
use crate::services::access::dashboard_path;
use crate::store::{IdentityStore, NewAccount, RentalStore, SignUpOutcome};

pub struct SessionResolver {
    identity: Arc<dyn IdentityStore>,
    store: Arc<dyn RentalStore>,
    registry: Arc<CacheRegistry>,
    state_tx: watch::Sender<PrincipalState>,
    // Token da sessão stateful corrente (se houver).
    token: Mutex<Option<String>>,
}

impl SessionResolver {
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        store: Arc<dyn RentalStore>,
        registry: Arc<CacheRegistry>,
    ) -> Self {
        // Nasce `Resolving`: na carga há um token armazenado em potencial, e
        // até o bootstrap decidir, os guards esperam.
        let (state_tx, _) = watch::channel(PrincipalState::Resolving);
        Self {
            identity,
            store,
            registry,
            state_tx,
            token: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PrincipalState {
        self.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PrincipalState> {
        self.state_tx.subscribe()
    }

    // ---
    // Face stateless
    // ---

    // Monta o principal de um user_id: perfil + papel, ambos obrigatórios.
    // Join vazio com sessão válida é FALHA de resolução, nunca "visitante".
    pub async fn resolve_principal(&self, user_id: Uuid) -> Result<Principal, AppError> {
        let profile = self
            .store
            .find_profile(user_id)
            .await?
            .ok_or(AppError::ProfileNotFound)?;
        let role = self
            .store
            .find_role(user_id)
            .await?
            .ok_or(AppError::ProfileNotFound)?;

        Ok(Principal {
            id: user_id,
            name: profile.name,
            email: profile.email,
            phone: profile.phone,
            avatar_url: profile.avatar_url,
            role,
            is_active: profile.is_active,
        })
    }

    // Token -> principal verificado. É o que o middleware de auth usa.
    pub async fn principal_for_token(&self, token: &str) -> Result<Principal, AppError> {
        let user_id = self.identity.resolve_session(token).await?;
        let principal = self.resolve_principal(user_id).await?;
        if !principal.is_active {
            return Err(AppError::AccountDeactivated);
        }
        Ok(principal)
    }

    pub async fn authenticate(&self, payload: &LoginUserPayload) -> Result<AuthResponse, AppError> {
        payload.validate()?;

        let session = self
            .identity
            .sign_in(&payload.email, &payload.password)
            .await?;

        let principal = match self.resolve_principal(session.user_id).await {
            Ok(p) => p,
            Err(e) => {
                // Sessão emitida mas principal irresolúvel: desfaz a sessão
                // antes de propagar, para não vazar um token meio-vivo.
                let _ = self.identity.sign_out(&session.access_token).await;
                return Err(e);
            }
        };

        // Conta desativada por moderação: o login NUNCA completa.
        if !principal.is_active {
            let _ = self.identity.sign_out(&session.access_token).await;
            return Err(AppError::AccountDeactivated);
        }

        tracing::info!("🔓 Login de {} ({:?})", principal.email, principal.role);
        Ok(AuthResponse {
            token: session.access_token,
            redirect_path: dashboard_path(principal.role).to_string(),
            principal,
        })
    }

    pub async fn register(&self, payload: &RegisterUserPayload) -> Result<SignupResponse, AppError> {
        payload.validate()?;

        // Só cliente e dono se auto-registram. Staff nasce pela rota
        // privilegiada; admin nunca nasce via API.
        let role = payload.role.unwrap_or(Role::User);
        if !matches!(role, Role::User | Role::Owner) {
            return Err(AppError::Forbidden(
                "Apenas clientes e donos de loja podem se cadastrar.".to_string(),
            ));
        }

        let outcome = self
            .identity
            .sign_up(NewAccount {
                email: payload.email.clone(),
                password: payload.password.clone(),
                name: payload.name.clone(),
                phone: payload.phone.clone(),
                role,
            })
            .await?;

        match outcome {
            // Confirmação de e-mail pendente é um desfecho próprio: sem
            // token, sem principal, sem fingir sucesso de login.
            SignUpOutcome::PendingVerification => Ok(SignupResponse {
                pending_verification: true,
                token: None,
                redirect_path: None,
                principal: None,
            }),
            SignUpOutcome::Session(session) => {
                let principal = self.resolve_principal(session.user_id).await?;
                Ok(SignupResponse {
                    pending_verification: false,
                    token: Some(session.access_token),
                    redirect_path: Some(dashboard_path(principal.role).to_string()),
                    principal: Some(principal),
                })
            }
        }
    }

    // ---
    // Face stateful (estado observável de um principal)
    // ---

    // Resolução de carga: decide Guest/SignedIn a partir de um token
    // armazenado (ou da ausência dele). Token inválido/expirado é só um
    // visitante; perfil irresolúvel é erro de verdade.
    pub async fn bootstrap(&self, stored_token: Option<&str>) -> Result<(), AppError> {
        let Some(token) = stored_token else {
            self.state_tx.send_replace(PrincipalState::Guest);
            return Ok(());
        };

        self.state_tx.send_replace(PrincipalState::Resolving);

        let user_id = match self.identity.resolve_session(token).await {
            Ok(id) => id,
            Err(_) => {
                self.state_tx.send_replace(PrincipalState::Guest);
                return Ok(());
            }
        };

        match self.resolve_principal(user_id).await {
            Ok(principal) if principal.is_active => {
                *self.token.lock().expect("token lock poisoned") = Some(token.to_string());
                self.state_tx
                    .send_replace(PrincipalState::SignedIn(principal));
                Ok(())
            }
            Ok(_) => {
                let _ = self.identity.sign_out(token).await;
                self.state_tx.send_replace(PrincipalState::Guest);
                Err(AppError::AccountDeactivated)
            }
            Err(e) => {
                self.state_tx.send_replace(PrincipalState::Guest);
                Err(e)
            }
        }
    }

    pub async fn login(&self, payload: &LoginUserPayload) -> Result<AuthResponse, AppError> {
        self.state_tx.send_replace(PrincipalState::Resolving);
        match self.authenticate(payload).await {
            Ok(response) => {
                *self.token.lock().expect("token lock poisoned") = Some(response.token.clone());
                self.state_tx
                    .send_replace(PrincipalState::SignedIn(response.principal.clone()));
                Ok(response)
            }
            Err(e) => {
                self.state_tx.send_replace(PrincipalState::Guest);
                Err(e)
            }
        }
    }

    pub async fn signup(&self, payload: &RegisterUserPayload) -> Result<SignupResponse, AppError> {
        self.state_tx.send_replace(PrincipalState::Resolving);
        match self.register(payload).await {
            Ok(response) => {
                match (&response.token, &response.principal) {
                    (Some(token), Some(principal)) => {
                        *self.token.lock().expect("token lock poisoned") = Some(token.clone());
                        self.state_tx
                            .send_replace(PrincipalState::SignedIn(principal.clone()));
                    }
                    // Pendente de verificação: continua visitante.
                    _ => {
                        self.state_tx.send_replace(PrincipalState::Guest);
                    }
                }
                Ok(response)
            }
            Err(e) => {
                self.state_tx.send_replace(PrincipalState::Guest);
                Err(e)
            }
        }
    }

    pub async fn logout(&self) -> Result<(), AppError> {
        let token = self.token.lock().expect("token lock poisoned").take();
        if let Some(token) = token {
            self.identity.sign_out(&token).await?;
        }
        self.state_tx.send_replace(PrincipalState::Guest);
        // Nada em cache pode sobreviver à troca de principal.
        self.registry.invalidate_many(&Entity::ALL);
        Ok(())
    }

    // Re-resolve o principal corrente (depois de editar perfil, por exemplo).
    pub async fn refresh(&self) -> Result<(), AppError> {
        let token = self.token.lock().expect("token lock poisoned").clone();
        let Some(token) = token else {
            return Ok(());
        };
        match self.principal_for_token(&token).await {
            Ok(principal) => {
                self.state_tx
                    .send_replace(PrincipalState::SignedIn(principal));
                Ok(())
            }
            Err(AppError::AccountDeactivated) => {
                // Desativado no meio da sessão: derruba na hora.
                self.logout().await?;
                Err(AppError::AccountDeactivated)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update_profile(
        &self,
        payload: &UpdateProfilePayload,
    ) -> Result<Principal, AppError> {
        payload.validate()?;
        let principal = self
            .state()
            .principal()
            .cloned()
            .ok_or(AppError::InvalidToken)?;

        self.store.update_profile(principal.id, payload).await?;
        self.registry.invalidate(Entity::Profiles);

        let refreshed = self.resolve_principal(principal.id).await?;
        self.state_tx
            .send_replace(PrincipalState::SignedIn(refreshed.clone()));
        Ok(refreshed)
    }

    pub async fn change_password(&self, payload: &ChangePasswordPayload) -> Result<(), AppError> {
        payload.validate()?;
        let principal = self
            .state()
            .principal()
            .cloned()
            .ok_or(AppError::InvalidToken)?;

        let current_ok = self
            .identity
            .verify_password(principal.id, &payload.current_password)
            .await?;
        if !current_ok {
            return Err(AppError::InvalidCredentials);
        }

        self.identity
            .update_password(principal.id, &payload.new_password)
            .await
    }
}
