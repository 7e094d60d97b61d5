use super::*;
use crate::catalog::{Capability, ExternalModel, InternalModel, ModelDescriptor};
use crate::dispatch::template::{PathExpr, ResponseMapping};
use crate::metering::TokenUsage;
use crate::usage::{AttemptContext, ClientMeta, Endpoint, ModelRef, Outcome, UsageRecord};
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

fn internal(id: &str, slug: &str) -> InternalModel {
    InternalModel {
        id: id.to_string(),
        slug: slug.to_string(),
        upstream_model: format!("{}-upstream", slug),
        prompt_price_per_1k: 0.01,
        completion_price_per_1k: 0.03,
        markup_percent: 20.0,
        capabilities: vec![Capability::Chat],
        context_window: 8192,
        active: true,
    }
}

fn external(id: &str, owner: &str, name: &str) -> ExternalModel {
    ExternalModel {
        id: id.to_string(),
        owner_id: owner.to_string(),
        model_name: name.to_string(),
        endpoint_url: "http://localhost:9000/generate".to_string(),
        credential: "aes256:opaque".to_string(),
        prompt_price_per_1k: 0.002,
        completion_price_per_1k: 0.004,
        request_template: Some(serde_json::from_value(serde_json::json!({"stream": false})).unwrap()),
        response_mapping: Some(ResponseMapping {
            usage: Some(PathExpr::parse("result.tokenCounts").unwrap()),
            ..ResponseMapping::default()
        }),
        custom_headers: BTreeMap::from([("x-team".to_string(), "search".to_string())]),
        capabilities: vec![Capability::Chat, Capability::Embed],
        active: true,
    }
}

fn record(caller: &str, descriptor: &ModelDescriptor, tokens: TokenUsage, outcome: Outcome) -> UsageRecord {
    let ctx = AttemptContext {
        caller_id: caller.to_string(),
        request_id: uuid::Uuid::new_v4().to_string(),
        endpoint: Endpoint::ChatCompletions,
        client: ClientMeta {
            ip: Some("10.0.0.1".to_string()),
            user_agent: Some("test-agent".to_string()),
        },
    };
    UsageRecord::meter(&ctx, descriptor, tokens, 7, outcome)
}

#[tokio::test]
async fn authenticates_by_hashed_key() {
    let db = GatewayDb::in_memory().unwrap();
    db.insert_api_key("sk-live-123", "caller-1").unwrap();

    assert_eq!(db.authenticate("sk-live-123").await.unwrap().as_deref(), Some("caller-1"));
    assert_eq!(db.authenticate("sk-live-999").await.unwrap(), None);

    assert!(db.revoke_api_key("sk-live-123").unwrap());
    assert_eq!(db.authenticate("sk-live-123").await.unwrap(), None);
}

#[test]
fn api_key_hash_is_stable_hex() {
    let digest = hash_api_key("abc");
    assert_eq!(digest.len(), 64);
    assert_eq!(digest, hash_api_key("abc"));
    assert_ne!(digest, hash_api_key("abd"));
}

#[tokio::test]
async fn plan_round_trips_and_missing_plan_is_not_found() {
    let db = GatewayDb::in_memory().unwrap();
    let plan = Plan {
        requests_per_minute: Some(60),
        requests_per_day: None,
        token_allowance: Some(1_000_000),
        pay_as_you_go: true,
        byom_enabled: true,
    };
    db.upsert_plan("caller-1", &plan).unwrap();

    assert_eq!(db.get_plan("caller-1").await.unwrap(), plan);
    assert!(matches!(db.get_plan("nobody").await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn internal_lookup_by_id_or_slug_skips_inactive() {
    let db = GatewayDb::in_memory().unwrap();
    db.upsert_internal_model(&internal("im-1", "small")).unwrap();
    let mut retired = internal("im-2", "retired");
    retired.active = false;
    db.upsert_internal_model(&retired).unwrap();

    assert_eq!(db.find_internal_model("im-1").await.unwrap().unwrap().slug, "small");
    assert_eq!(db.find_internal_model("small").await.unwrap().unwrap().id, "im-1");
    assert_eq!(db.find_internal_model("retired").await.unwrap(), None);
    assert_eq!(db.list_internal_models().await.unwrap().len(), 1);
}

#[tokio::test]
async fn external_lookup_is_scoped_to_owner() {
    let db = GatewayDb::in_memory().unwrap();
    let model = external("em-1", "caller-1", "my-llama");
    db.upsert_external_model(&model).unwrap();

    let found = db.find_external_model("my-llama", "caller-1").await.unwrap().unwrap();
    assert_eq!(found, model);
    assert_eq!(db.find_external_model("em-1", "caller-1").await.unwrap().unwrap().id, "em-1");
    assert_eq!(db.find_external_model("my-llama", "caller-2").await.unwrap(), None);
    assert!(db.list_external_models("caller-2").await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_ledger_reads_as_zero() {
    let db = GatewayDb::in_memory().unwrap();
    assert_eq!(db.get_monthly_usage("caller-1").await.unwrap(), LedgerSnapshot::default());
}

#[tokio::test]
async fn ledger_increments_accumulate() {
    let db = GatewayDb::in_memory().unwrap();
    db.set_credit_balance("caller-1", 500).unwrap();

    db.increment_monthly_usage("caller-1", 150).await.unwrap();
    db.increment_monthly_usage("caller-1", 50).await.unwrap();

    let snapshot = db.get_monthly_usage("caller-1").await.unwrap();
    assert_eq!(snapshot.monthly_tokens, 200);
    assert_eq!(snapshot.credit_balance, 500);
    assert_eq!(snapshot.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn subscription_status_is_kept_alongside_usage() {
    let db = GatewayDb::in_memory().unwrap();
    db.increment_monthly_usage("caller-1", 40).await.unwrap();

    db.set_subscription_status("caller-1", SubscriptionStatus::PastDue).unwrap();
    let snapshot = db.get_monthly_usage("caller-1").await.unwrap();
    assert_eq!(snapshot.status, SubscriptionStatus::PastDue);
    assert_eq!(snapshot.monthly_tokens, 40);

    db.set_subscription_status("caller-2", SubscriptionStatus::Trialing).unwrap();
    let fresh = db.get_monthly_usage("caller-2").await.unwrap();
    assert_eq!(fresh.status, SubscriptionStatus::Trialing);
    assert_eq!(fresh.monthly_tokens, 0);
}

#[tokio::test]
async fn concurrent_increments_are_not_lost() {
    let db = std::sync::Arc::new(GatewayDb::in_memory().unwrap());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.increment_monthly_usage("caller-1", 10).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(db.get_monthly_usage("caller-1").await.unwrap().monthly_tokens, 200);
}

#[tokio::test]
async fn appended_records_are_counted_and_listed() {
    let db = GatewayDb::in_memory().unwrap();
    let descriptor = ModelDescriptor::Internal(internal("im-1", "small"));

    db.append(&record("caller-1", &descriptor, TokenUsage::new(100, 50), Outcome::Succeeded))
        .await
        .unwrap();
    db.append(&record(
        "caller-1",
        &descriptor,
        TokenUsage::zero(),
        Outcome::Failed { error: "upstream returned 500".to_string() },
    ))
    .await
    .unwrap();
    db.append(&record("caller-2", &descriptor, TokenUsage::new(1, 1), Outcome::Succeeded))
        .await
        .unwrap();

    let since = Utc::now() - Duration::hours(1);
    assert_eq!(db.count_since("caller-1", since).await.unwrap(), 2);
    assert_eq!(db.count_since("caller-1", Utc::now() + Duration::hours(1)).await.unwrap(), 0);

    let rows = db.usage_records("caller-1").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].model, Some(ModelRef::Internal("im-1".to_string())));
    assert_eq!(rows[0].total_tokens, 150);
    assert!(rows[0].succeeded);
    assert!(!rows[1].succeeded);
    assert_eq!(rows[1].error_message.as_deref(), Some("upstream returned 500"));
    assert_eq!(rows[1].total_cost, 0.0);
}

#[tokio::test]
async fn summary_groups_by_model() {
    let db = GatewayDb::in_memory().unwrap();
    let inner = ModelDescriptor::Internal(internal("im-1", "small"));
    let outer = ModelDescriptor::External(external("em-1", "caller-1", "my-llama"));

    db.append(&record("caller-1", &inner, TokenUsage::new(100, 50), Outcome::Succeeded))
        .await
        .unwrap();
    db.append(&record("caller-1", &inner, TokenUsage::new(100, 50), Outcome::Succeeded))
        .await
        .unwrap();
    db.append(&record("caller-1", &outer, TokenUsage::new(1000, 0), Outcome::Succeeded))
        .await
        .unwrap();
    db.append(&record(
        "caller-1",
        &outer,
        TokenUsage::zero(),
        Outcome::Failed { error: "timeout".to_string() },
    ))
    .await
    .unwrap();

    let summary = db.summarize("caller-1", None, None).await.unwrap();

    assert_eq!(summary.total_requests, 4);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.total_tokens, 1300);
    assert!((summary.total_cost - 0.008).abs() < 1e-9, "cost was {}", summary.total_cost);
    assert_eq!(summary.by_model.len(), 2);
    assert_eq!(summary.by_model[0].model_id, "em-1");
    assert_eq!(summary.by_model[0].kind, "external");
    assert_eq!(summary.by_model[0].requests, 2);
    assert_eq!(summary.by_model[1].model_id, "im-1");
    assert_eq!(summary.by_model[1].total_tokens, 300);

    let empty = db
        .summarize("caller-1", Some(Utc::now() + Duration::hours(1)), None)
        .await
        .unwrap();
    assert_eq!(empty.total_requests, 0);
    assert!(empty.by_model.is_empty());
}

#[test]
fn opens_file_database_in_nested_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("gateway.db");

    let db = GatewayDb::open(&path).unwrap();
    db.insert_api_key("k", "c").unwrap();
    drop(db);

    assert!(path.exists());
}
