use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::api::{self, ApiState, IDEMPOTENCY_KEY_HEADER};
use crate::auth::{GATEWAY_TOKEN_HEADER, OWNER_ID_HEADER, OWNER_ROLE_HEADER};
use crate::test_support::setup;

const TOKEN: &str = "test-gateway-token";
const OPERATOR: i64 = 900;
const ALICE: i64 = 1;

#[derive(Clone, Copy)]
enum Caller {
    Anonymous,
    Investor(i64),
    Admin(i64),
}

async fn app() -> (TempDir, SqlitePool, axum::Router) {
    let (dir, pool) = setup().await;
    let router = api::router(Arc::new(ApiState {
        pool: pool.clone(),
        gateway_token: TOKEN.to_string(),
    }));
    (dir, pool, router)
}

async fn call(
    router: &axum::Router,
    caller: Caller,
    method: &str,
    uri: &str,
    body: Option<Value>,
    idempotency_key: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    match caller {
        Caller::Anonymous => {}
        Caller::Investor(id) => {
            builder = builder
                .header(GATEWAY_TOKEN_HEADER, TOKEN)
                .header(OWNER_ID_HEADER, id.to_string());
        }
        Caller::Admin(id) => {
            builder = builder
                .header(GATEWAY_TOKEN_HEADER, TOKEN)
                .header(OWNER_ID_HEADER, id.to_string())
                .header(OWNER_ROLE_HEADER, "admin");
        }
    }
    if let Some(key) = idempotency_key {
        builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
    }
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    let body = match body {
        Some(v) => Body::from(serde_json::to_string(&v).unwrap()),
        None => Body::empty(),
    };
    let req = builder.body(body).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        json!(null)
    } else {
        serde_json::from_slice(&bytes).unwrap_or(json!(null))
    };
    (status, json)
}

async fn create_chicken_batch(router: &axum::Router) -> i64 {
    let (status, batch) = call(
        router,
        Caller::Admin(OPERATOR),
        "POST",
        "/admin/batches",
        Some(json!({
            "product_kind": "CHICKEN",
            "unit_price": "50.00",
            "target_units": 100,
            "mortality_rate": "0.05",
            "expected_roi": "0.10"
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{batch}");
    assert_eq!(batch["status"], "OPEN");
    batch["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_health_and_public_routes() {
    let (_dir, _pool, router) = app().await;

    let (status, body) = call(&router, Caller::Anonymous, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    create_chicken_batch(&router).await;

    let (status, body) = call(&router, Caller::Anonymous, "GET", "/products", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["items"][0]["unit_price"], "50.00");

    let (status, body) = call(&router, Caller::Anonymous, "GET", "/overview", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["batches_chicken"], 1);
    assert_eq!(body["batches_egg"], 0);
    assert_eq!(body["open_batches"], 1);
}

#[tokio::test]
async fn test_identity_is_required() {
    let (_dir, _pool, router) = app().await;

    let (status, body) = call(&router, Caller::Anonymous, "GET", "/wallet", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let req = Request::builder()
        .uri("/wallet")
        .header(GATEWAY_TOKEN_HEADER, "wrong")
        .header(OWNER_ID_HEADER, "1")
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let (status, body) = call(
        &router,
        Caller::Investor(ALICE),
        "GET",
        "/admin/batches",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn test_wallet_flow_with_idempotency() {
    let (_dir, _pool, router) = app().await;
    let alice = Caller::Investor(ALICE);

    let deposit = Some(json!({ "amount": "100.00" }));
    let (status, first) = call(&router, alice, "POST", "/wallet/deposit", deposit.clone(), Some("d-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["amount"], "100.00");
    assert_eq!(first["kind"], "DEPOSIT");

    let (status, replay) = call(&router, alice, "POST", "/wallet/deposit", deposit, Some("d-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["id"], first["id"]);

    let (status, body) = call(
        &router,
        alice,
        "POST",
        "/wallet/deposit",
        Some(json!({ "amount": "5.00" })),
        Some("d-1"),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "idempotency_conflict");

    let (status, body) = call(
        &router,
        alice,
        "POST",
        "/wallet/withdraw",
        Some(json!({ "amount": "150.00" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "insufficient_balance");

    let (status, body) = call(&router, alice, "GET", "/wallet", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], "100.00");

    let (_, body) = call(&router, alice, "GET", "/wallet/transactions", None, None).await;
    assert_eq!(body["count"], 1);

    // Sub-cent amounts never reach the ledger.
    let (status, body) = call(
        &router,
        alice,
        "POST",
        "/wallet/deposit",
        Some(json!({ "amount": "0.001" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid_body");
}

#[tokio::test]
async fn test_invest_and_settle_end_to_end() {
    let (_dir, _pool, router) = app().await;
    let admin = Caller::Admin(OPERATOR);
    let alice = Caller::Investor(ALICE);
    let batch_id = create_chicken_batch(&router).await;

    call(&router, alice, "POST", "/wallet/deposit", Some(json!({ "amount": "1000.00" })), None).await;

    let (status, inv) = call(
        &router,
        alice,
        "POST",
        "/investments",
        Some(json!({ "batch_id": batch_id, "units": 20 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{inv}");
    assert_eq!(inv["amount"], "1000.00");
    let investment_id = inv["id"].as_i64().unwrap();

    let (status, body) = call(
        &router,
        Caller::Investor(2),
        "POST",
        "/investments",
        Some(json!({ "batch_id": batch_id, "units": 81 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "capacity_exceeded");

    for to in ["ACTIVE", "HARVESTED"] {
        let (status, body) = call(
            &router,
            admin,
            "POST",
            &format!("/admin/batches/{batch_id}/transition"),
            Some(json!({ "status": to })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], to);
    }

    let (status, plan) = call(
        &router,
        admin,
        "GET",
        &format!("/admin/batches/{batch_id}/cycles/harvest/simulate"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plan["total"], "95.00");
    assert_eq!(plan["per_investment"][0]["investment_id"], investment_id);

    let execute = format!("/admin/batches/{batch_id}/cycles/harvest/execute");
    let (status, summary) = call(&router, admin, "POST", &execute, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["count"], 1);
    assert_eq!(summary["total"], "95.00");

    let (_, summary) = call(&router, admin, "POST", &execute, None, None).await;
    assert_eq!(summary["count"], 0);
    assert_eq!(summary["total"], "0.00");

    let (_, wallet) = call(&router, alice, "GET", "/wallet", None, None).await;
    assert_eq!(wallet["balance"], "95.00");

    let (_, payouts) = call(
        &router,
        alice,
        "GET",
        &format!("/investments/{investment_id}/payouts"),
        None,
        None,
    )
    .await;
    assert_eq!(payouts["count"], 1);

    let (_, investments) = call(&router, alice, "GET", "/investments", None, None).await;
    assert_eq!(investments["items"][0]["status"], "PAID");

    let (status, report) = call(&router, admin, "GET", "/admin/audit", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["violations"], json!([]));
}

#[tokio::test]
async fn test_admin_batch_management_errors() {
    let (_dir, _pool, router) = app().await;
    let admin = Caller::Admin(OPERATOR);
    let batch_id = create_chicken_batch(&router).await;

    let (status, body) = call(&router, admin, "GET", "/admin/batches/4040", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "batch_not_found");

    let (status, body) = call(
        &router,
        admin,
        "POST",
        &format!("/admin/batches/{batch_id}/transition"),
        Some(json!({ "status": "CLOSED" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transition");

    let (status, body) = call(
        &router,
        admin,
        "PUT",
        &format!("/admin/batches/{batch_id}/terms"),
        Some(json!({
            "unit_price": "40.00",
            "target_units": 150,
            "mortality_rate": "1.5",
            "expected_roi": "0.10"
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_terms");

    let (status, body) = call(
        &router,
        admin,
        "POST",
        &format!("/admin/batches/{batch_id}/cycles/harvest/execute"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "batch_not_harvestable");

    let (_, list) = call(&router, admin, "GET", "/admin/batches", None, None).await;
    assert_eq!(list["count"], 1);
}

#[tokio::test]
async fn test_exit_routes() {
    let (_dir, _pool, router) = app().await;
    let alice = Caller::Investor(ALICE);
    let batch_id = create_chicken_batch(&router).await;
    call(&router, alice, "POST", "/wallet/deposit", Some(json!({ "amount": "500.00" })), None).await;
    let (_, inv) = call(
        &router,
        alice,
        "POST",
        "/investments",
        Some(json!({ "batch_id": batch_id, "units": 10 })),
        None,
    )
    .await;
    let investment_id = inv["id"].as_i64().unwrap();

    let (status, req) = call(
        &router,
        alice,
        "POST",
        &format!("/investments/{investment_id}/exit"),
        Some(json!({ "units": 4 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(req["status"], "PENDING");

    let (status, body) = call(
        &router,
        alice,
        "POST",
        &format!("/investments/{investment_id}/exit"),
        Some(json!({ "units": 7 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "units_exceed_holding");

    let request_id = req["id"].as_i64().unwrap();
    let (status, body) = call(
        &router,
        alice,
        "POST",
        &format!("/exits/{request_id}/cancel"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");

    let (_, exits) = call(&router, alice, "GET", "/exits", None, None).await;
    assert_eq!(exits["count"], 1);
}

#[tokio::test]
async fn test_malformed_requests_get_error_body() {
    let (_dir, _pool, router) = app().await;
    let alice = Caller::Investor(ALICE);
    let admin = Caller::Admin(OPERATOR);
    let batch_id = create_chicken_batch(&router).await;

    let (status, body) = call(
        &router,
        alice,
        "POST",
        "/wallet/deposit",
        Some(json!({ "amount": "1.234" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid_body");
    assert_eq!(body["retryable"], false);
    assert!(body["error"].is_string());

    let (status, body) = call(
        &router,
        alice,
        "POST",
        "/investments",
        Some(json!({ "batch_id": batch_id, "units": "x" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid_body");

    let (status, body) = call(&router, alice, "GET", "/investments/abc/payouts", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_path");

    let (status, body) = call(
        &router,
        admin,
        "GET",
        &format!("/admin/batches/{batch_id}/cycles/harvest/simulate?roi_override=lots"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_query");

    // Domain rejections carry the same shape.
    let (status, body) = call(
        &router,
        alice,
        "POST",
        "/investments",
        Some(json!({ "batch_id": batch_id, "units": 0 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_units");
    assert_eq!(body["retryable"], false);
}
