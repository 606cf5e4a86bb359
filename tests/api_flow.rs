//! End-to-end HTTP workflow through the full application router.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tower::ServiceExt;

use leadflow::crm::api::AppState;
use leadflow::crm::auth::Identity;
use leadflow::crm::db::{CrmDb, DbHandle};
use leadflow::crm::server::build_router;
use leadflow::crm::ws::OrgEvent;
use leadflow_core::{IncentiveRules, Role};

struct Caller {
    id: i64,
    role: &'static str,
    org: i64,
}

struct Harness {
    router: Router,
    events: broadcast::Receiver<OrgEvent>,
    admin: Caller,
}

fn harness() -> Harness {
    let db = CrmDb::new_in_memory().unwrap();
    let org = db.create_organization("Acme Motors").unwrap();
    let admin = db
        .create_user(org.id, "Admin", "+919700000001", None, Role::Admin)
        .unwrap();
    let (events, rx) = broadcast::channel(64);
    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        events,
        default_rules: IncentiveRules::default(),
    });
    Harness {
        router: build_router(state),
        events: rx,
        admin: Caller {
            id: admin.id,
            role: "admin",
            org: org.id,
        },
    }
}

async fn send(router: &Router, as_user: &Caller, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", as_user.id.to_string())
        .header("x-user-role", as_user.role)
        .header("x-organization-id", as_user.org.to_string());
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn caller_from(created: &Value, role: &'static str, org: i64) -> Caller {
    Caller {
        id: created["data"]["id"].as_i64().unwrap(),
        role,
        org,
    }
}

#[tokio::test]
async fn test_month_from_leads_to_paid_incentive() {
    let mut h = harness();
    let org = h.admin.org;

    // Staff the organization.
    let (status, manager) = send(
        &h.router,
        &h.admin,
        "POST",
        "/api/users",
        Some(json!({"name": "Meera", "phone": "+919700000002", "role": "manager"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let manager = caller_from(&manager, "manager", org);

    let (status, rep) = send(
        &h.router,
        &h.admin,
        "POST",
        "/api/users",
        Some(json!({"name": "Asha", "phone": "+919700000004", "role": "sales_rep"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let rep = caller_from(&rep, "sales_rep", org);

    let (status, category) = send(
        &h.router,
        &h.admin,
        "POST",
        "/api/categories",
        Some(json!({"name": "SUV", "commission_bps": 800})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let category_id = category["data"]["id"].as_i64().unwrap();

    // Three consecutive won days, one in an 8% category, all reviewed positively.
    let sales = [
        (1_000_000, Some(category_id), "2024-06-10"),
        (500_000, None, "2024-06-11"),
        (500_000, None, "2024-06-12"),
    ];
    for (deal_size, category, date) in sales {
        let (status, lead) = send(
            &h.router,
            &rep,
            "POST",
            "/api/leads",
            Some(json!({
                "customer_name": "Customer",
                "customer_phone": "9811111111",
                "deal_size": deal_size,
                "category_id": category,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(lead["data"]["sales_rep_id"], rep.id);
        let id = lead["data"]["id"].as_i64().unwrap();

        let (status, _) = send(
            &h.router,
            &rep,
            "PATCH",
            &format!("/api/leads/{}/status", id),
            Some(json!({"status": "won", "sale_date": date})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Review outcomes are recorded by the manager, never by the rep.
        let review_uri = format!("/api/leads/{}/review", id);
        let body = json!({"review_status": "positive"});
        let (status, _) = send(&h.router, &rep, "PATCH", &review_uri, Some(body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&h.router, &manager, "PATCH", &review_uri, Some(body)).await;
        assert_eq!(status, StatusCode::OK);
    }

    // The rep can preview their own month but not calculate it.
    let (status, preview) = send(&h.router, &rep, "GET", "/api/incentives/preview?month=2024-06", None).await;
    assert_eq!(status, StatusCode::OK);
    // 8% of 10,000.00 + 5% of 10,000.00 = 1,300.00
    assert_eq!(preview["data"]["gross_commission"], 130_000);
    assert_eq!(preview["data"]["streak_days"], 3);
    // 3-day tier: 5% of gross
    assert_eq!(preview["data"]["streak_bonus"], 6_500);
    // 3 positive reviews meet the minimum: 3 x 100.00
    assert_eq!(preview["data"]["review_bonus"], 30_000);
    assert_eq!(preview["data"]["capped_amount"], 166_500);

    let (status, _) = send(
        &h.router,
        &rep,
        "POST",
        "/api/incentives/calculate",
        Some(json!({"month": "2024-06"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, outcomes) = send(
        &h.router,
        &manager,
        "POST",
        "/api/incentives/calculate",
        Some(json!({"month": "2024-06"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let outcomes = outcomes["data"].as_array().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0]["outcome"], "calculated");
    assert_eq!(outcomes[0]["incentive"]["status"], "pending_review");
    let incentive_id = outcomes[0]["incentive"]["id"].as_i64().unwrap();

    // Approve below the computed amount, then pay.
    let (status, approved) = send(
        &h.router,
        &manager,
        "POST",
        &format!("/api/incentives/{}/approve", incentive_id),
        Some(json!({"amount": 150_000, "notes": "rounded down"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approved["data"]["status"], "approved");
    assert_eq!(approved["data"]["final_approved_amount"], 150_000);
    assert_eq!(approved["data"]["reviewed_by"], manager.id);

    let (status, _) = send(
        &h.router,
        &manager,
        "POST",
        "/api/incentives/calculate",
        Some(json!({"month": "2024-06", "user_id": rep.id})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, paid) = send(
        &h.router,
        &h.admin,
        "POST",
        &format!("/api/incentives/{}/mark-paid", incentive_id),
        Some(json!({"payment_reference": "NEFT-0042"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paid["data"]["status"], "paid");
    assert_eq!(paid["data"]["payment_reference"], "NEFT-0042");

    // The rep sees their paid record.
    let (status, mine) = send(&h.router, &rep, "GET", "/api/incentives?month=2024-06", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine["data"][0]["status"], "paid");
    assert_eq!(mine["data"][0]["final_approved_amount"], 150_000);

    // Every change was broadcast to the organization.
    let mut kinds = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        assert_eq!(event.organization_id, org);
        let payload: Value = serde_json::from_str(&event.payload).unwrap();
        kinds.push(payload["type"].as_str().unwrap().to_string());
    }
    assert!(kinds.contains(&"LeadCreated".to_string()));
    assert!(kinds.contains(&"IncentiveCalculated".to_string()));
    assert!(kinds.contains(&"IncentiveApproved".to_string()));
    assert!(kinds.contains(&"IncentivePaid".to_string()));
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let h = harness();
    let (status, created) = send(
        &h.router,
        &h.admin,
        "POST",
        "/api/leads",
        Some(json!({"customer_name": "C", "customer_phone": "9811111111", "deal_size": 1000})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "admins have no sales_rep_id of their own: {}", created);

    let outsider = Caller {
        id: h.admin.id,
        role: "admin",
        org: h.admin.org + 1,
    };
    let (status, json) = send(&h.router, &outsider, "GET", "/api/organization", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_missing_identity_headers() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(Request::builder().uri("/api/leads").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["success"], false);
    assert!(json["data"].is_null());
}

#[test]
fn test_org_event_visibility() {
    let event = OrgEvent {
        organization_id: 1,
        owner_id: 7,
        action: leadflow_core::Action::ViewLeads,
        payload: "{}".to_string(),
    };
    let rep = Identity {
        user_id: 7,
        role: Role::SalesRep,
        organization_id: 1,
    };
    let other_rep = Identity { user_id: 8, ..rep };
    let manager = Identity {
        user_id: 9,
        role: Role::Manager,
        organization_id: 1,
    };
    let other_org = Identity {
        organization_id: 2,
        ..manager
    };
    assert!(event.visible_to(&rep));
    assert!(!event.visible_to(&other_rep));
    assert!(event.visible_to(&manager));
    assert!(!event.visible_to(&other_org));
}
