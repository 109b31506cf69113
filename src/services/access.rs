// src/services/access.rs
//
// O roteador de papéis: cada papel tem um painel canônico, e a decisão de
// um guard é uma função pura do estado do principal + papéis exigidos.
// A regra de ouro: com o estado ainda `Resolving`, a resposta é ESPERAR;
// nunca redirecionar nem renderizar por palpite.

use crate::models::auth::{PrincipalState, Role};

// O destino pós-login (e pós-guard) de cada papel.
pub fn dashboard_path(role: Role) -> &'static str {
    match role {
        Role::Admin => "/admin",
        Role::Owner => "/owner",
        Role::Staff => "/staff",
        Role::User => "/home",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Render,
    Wait,
    RedirectToLogin,
    // Papel errado: manda para o painel do papel REAL, nunca para o login.
    RedirectTo(&'static str),
}

// `allowed` vazio significa "qualquer principal autenticado".
pub fn evaluate(state: &PrincipalState, allowed: &[Role]) -> GuardDecision {
    match state {
        PrincipalState::Resolving => GuardDecision::Wait,
        PrincipalState::Guest => GuardDecision::RedirectToLogin,
        PrincipalState::SignedIn(principal) => {
            if allowed.is_empty() || allowed.contains(&principal.role) {
                GuardDecision::Render
            } else {
                GuardDecision::RedirectTo(dashboard_path(principal.role))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::auth::Principal;
    use uuid::Uuid;

    fn signed_in(role: Role) -> PrincipalState {
        PrincipalState::SignedIn(Principal {
            id: Uuid::new_v4(),
            name: "Fulano".into(),
            email: "fulano@example.com".into(),
            phone: None,
            avatar_url: None,
            role,
            is_active: true,
        })
    }

    #[test]
    fn resolvendo_espera_nunca_redireciona() {
        assert_eq!(
            evaluate(&PrincipalState::Resolving, &[Role::Admin]),
            GuardDecision::Wait
        );
        assert_eq!(
            evaluate(&PrincipalState::Resolving, &[]),
            GuardDecision::Wait
        );
    }

    #[test]
    fn visitante_vai_para_o_login() {
        assert_eq!(
            evaluate(&PrincipalState::Guest, &[]),
            GuardDecision::RedirectToLogin
        );
        assert_eq!(
            evaluate(&PrincipalState::Guest, &[Role::Owner]),
            GuardDecision::RedirectToLogin
        );
    }

    #[test]
    fn papel_certo_renderiza() {
        assert_eq!(
            evaluate(&signed_in(Role::Owner), &[Role::Owner]),
            GuardDecision::Render
        );
        assert_eq!(
            evaluate(&signed_in(Role::Admin), &[Role::Admin, Role::Owner]),
            GuardDecision::Render
        );
    }

    #[test]
    fn lista_vazia_aceita_qualquer_autenticado() {
        for role in [Role::Admin, Role::Owner, Role::Staff, Role::User] {
            assert_eq!(evaluate(&signed_in(role), &[]), GuardDecision::Render);
        }
    }

    #[test]
    fn papel_errado_vai_para_o_proprio_painel() {
        // A matriz completa: cada papel barrado numa rota alheia cai no
        // SEU painel, não no login.
        let cases = [
            (Role::Admin, "/admin"),
            (Role::Owner, "/owner"),
            (Role::Staff, "/staff"),
            (Role::User, "/home"),
        ];
        for (role, own_path) in cases {
            let required = if role == Role::Admin {
                [Role::User]
            } else {
                [Role::Admin]
            };
            assert_eq!(
                evaluate(&signed_in(role), &required),
                GuardDecision::RedirectTo(own_path),
                "papel {:?}",
                role
            );
        }
    }
}
