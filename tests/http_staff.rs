// tests/http_staff.rs
//
// Testes de integração da fatia HTTP, rodando contra o backend em
// memória: registro/login reais, middleware de auth e a rota
// privilegiada de provisionamento de staff.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use rental_backend::config::AppState;

fn test_app() -> Router {
    rental_backend::app(AppState::in_memory())
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, json)
}

// Registra um dono e devolve (token, user_id).
async fn register_owner(app: &Router, email: &str) -> (String, String) {
    let (status, body) = send(
        app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({
            "email": email,
            "password": "senha123",
            "name": "Dono de Teste",
            "role": "owner",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().expect("registro devia abrir sessão");
    let user_id = body["principal"]["id"].as_str().unwrap();
    (token.to_string(), user_id.to_string())
}

#[tokio::test]
async fn health_responde_ok() {
    let app = test_app();
    let (status, _) = send(&app, "GET", "/api/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn rota_de_staff_sem_token_devolve_401() {
    let app = test_app();
    let (status, _) = send(
        &app,
        "POST",
        "/api/staff",
        None,
        Some(json!({
            "email": "staff@teste.com",
            "password": "senha123",
            "name": "Funcionário",
            "owner_id": "00000000-0000-0000-0000-000000000000",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn token_invalido_devolve_401() {
    let app = test_app();
    let (status, _) = send(&app, "GET", "/api/users/me", Some("token-falso"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn fluxo_completo_de_provisionamento_de_staff() {
    let app = test_app();
    let (owner_token, owner_id) = register_owner(&app, "dono@teste.com").await;

    // /me reflete o principal do dono
    let (status, me) = send(&app, "GET", "/api/users/me", Some(&owner_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["role"], "owner");
    assert_eq!(me["id"], owner_id.as_str());

    // O dono provisiona um membro de staff
    let (status, body) = send(
        &app,
        "POST",
        "/api/staff",
        Some(&owner_token),
        Some(json!({
            "email": "staff@teste.com",
            "password": "senha123",
            "name": "Funcionário Novo",
            "owner_id": owner_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["staff"]["ownerId"], owner_id.as_str());

    // A conta criada já consegue logar, com papel staff
    let (status, login) = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "staff@teste.com", "password": "senha123" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(login["principal"]["role"], "staff");
    assert_eq!(login["redirectPath"], "/staff");
}

#[tokio::test]
async fn cliente_comum_nao_provisiona_staff() {
    let app = test_app();

    let (status, body) = send(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({
            "email": "cliente@teste.com",
            "password": "senha123",
            "name": "Cliente Comum",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();
    let user_id = body["principal"]["id"].as_str().unwrap().to_string();

    // Mesmo apontando owner_id para si, o papel errado barra em 403...
    let (status, _) = send(
        &app,
        "POST",
        "/api/staff",
        Some(&token),
        Some(json!({
            "email": "staff2@teste.com",
            "password": "senha123",
            "name": "Tentativa",
            "owner_id": user_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // ...e nenhuma conta chegou a existir no identity store
    let (status, _) = send(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "staff2@teste.com", "password": "senha123" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn owner_id_de_terceiro_e_recusado() {
    let app = test_app();
    let (token_a, _) = register_owner(&app, "dono-a@teste.com").await;
    let (_token_b, owner_b) = register_owner(&app, "dono-b@teste.com").await;

    // Dono A tenta criar staff em nome do dono B
    let (status, _) = send(
        &app,
        "POST",
        "/api/staff",
        Some(&token_a),
        Some(json!({
            "email": "staff3@teste.com",
            "password": "senha123",
            "name": "Intruso",
            "owner_id": owner_b,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn campo_ausente_devolve_400() {
    let app = test_app();
    let (token, _) = register_owner(&app, "dono-e@teste.com").await;

    // Sem owner_id no corpo: 400, nunca o 422 do extrator padrão.
    let (status, body) = send(
        &app,
        "POST",
        "/api/staff",
        Some(&token),
        Some(json!({
            "email": "staff5@teste.com",
            "password": "senha123",
            "name": "Sem Dono",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Campos obrigatórios ausentes.");
}

#[tokio::test]
async fn payload_invalido_devolve_400() {
    let app = test_app();
    let (token, owner_id) = register_owner(&app, "dono-c@teste.com").await;

    // Senha curta demais
    let (status, _) = send(
        &app,
        "POST",
        "/api/staff",
        Some(&token),
        Some(json!({
            "email": "staff4@teste.com",
            "password": "123",
            "name": "Curto",
            "owner_id": owner_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
