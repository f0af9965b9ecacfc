//! Router tests against a temp data dir and an in-memory warm cache.

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tower::ServiceExt;

use payout_api::{AppState, SharedState, router};
use payout_engine::config::{Config, FileConfig};
use payout_engine::error::ExplorerError;
use payout_engine::explorer::{PageRequest, RawTransfer, TransferKind, TransferPage, TransferSource};
use payout_engine::normalize::Payout;
use payout_engine::snapshot::build;
use payout_engine::store::SnapshotStore;
use payout_engine::tokens::PaymentMethod;
use payout_engine::warm::{WarmCache, WarmCacheRow};

const FIRM: &str = "0x1111111111111111111111111111111111111111";

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 10, 12, 0, 0).unwrap()
}

/// Explorer with no history
struct EmptySource;

#[async_trait]
impl TransferSource for EmptySource {
    async fn fetch_page(&self, _request: &PageRequest<'_>) -> Result<TransferPage, ExplorerError> {
        Ok(TransferPage {
            transfers: Vec::new(),
            next_cursor: None,
        })
    }
}

/// Explorer holding a single April USDC payout of $250
struct AprilSource;

#[async_trait]
impl TransferSource for AprilSource {
    async fn fetch_page(&self, _request: &PageRequest<'_>) -> Result<TransferPage, ExplorerError> {
        Ok(TransferPage {
            transfers: vec![RawTransfer {
                hash: "0xapril".to_string(),
                from: FIRM.to_string(),
                to: Some("0x2222222222222222222222222222222222222222".to_string()),
                kind: TransferKind::Token,
                symbol: Some("USDC".to_string()),
                raw_value: Some("250000000".to_string()),
                decimals: Some(6),
                value: Some(250.0),
                block_number: None,
                block_timestamp: Some(Utc.with_ymd_and_hms(2025, 4, 8, 9, 0, 0).unwrap()),
            }],
            next_cursor: None,
        })
    }
}

/// Explorer that is down, counting every request it refuses
#[derive(Default)]
struct DownSource {
    calls: AtomicUsize,
}

#[async_trait]
impl TransferSource for DownSource {
    async fn fetch_page(&self, _request: &PageRequest<'_>) -> Result<TransferPage, ExplorerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ExplorerError::Http { status: 503 })
    }
}

fn payout(hash: &str, at: DateTime<Utc>, usd: f64) -> Payout {
    Payout {
        tx_hash: hash.to_string(),
        entity_id: "acme".to_string(),
        amount_usd: usd,
        payment_method: PaymentMethod::Crypto,
        timestamp: at,
        from_address: FIRM.to_string(),
        to_address: None,
    }
}

fn march(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, d, 12, 0, 0).unwrap()
}

fn config(data_dir: &std::path::Path) -> Config {
    let toml = format!(
        r#"
        [explorer]
        api_key = "test-key"

        [[entities]]
        id = "acme"
        name = "Acme Trading"
        addresses = ["{}"]
        "#,
        FIRM
    );
    let mut config = Config::from_file(&FileConfig::parse(&toml).unwrap(), None).unwrap();
    config.data_dir = data_dir.to_path_buf();
    config
}

/// State with a March snapshot (one payout inside the last 30 days, one before)
async fn setup() -> (TempDir, SharedState) {
    setup_with(Arc::new(EmptySource)).await
}

async fn setup_with(source: Arc<dyn TransferSource>) -> (TempDir, SharedState) {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());

    SnapshotStore::new(config.snapshot_dir())
        .write(&build(
            "acme",
            "2025-03".parse().unwrap(),
            Tz::UTC,
            &[payout("0xold", march(5), 300.0), payout("0xnew", march(20), 500.0)],
            march(31),
        ))
        .unwrap();

    let warm = WarmCache::in_memory().await.unwrap();
    let mut state = AppState::with_warm(config, source, 3000.0, warm);
    state.clock = fixed_now;
    (dir, Arc::new(state))
}

async fn get_json(state: &SharedState, uri: &str) -> (StatusCode, Value) {
    let response = router(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn warm_row(total: f64, synced: DateTime<Utc>) -> WarmCacheRow {
    WarmCacheRow {
        entity_id: "acme".to_string(),
        total_usd: total,
        last_30d_usd: 500.0,
        avg_usd: total / 3.0,
        payout_count: 3,
        last_synced_at: synced,
        sync_error: None,
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let (_dir, state) = setup().await;
    let (status, body) = get_json(&state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn thirty_day_period_only_counts_payouts_in_window() {
    let (_dir, state) = setup().await;
    let (status, body) = get_json(&state, "/api/entities/acme/period/30d").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["period"], "30d");
    assert_eq!(body["summary"]["totalPayouts"], 500.0);
    assert_eq!(body["summary"]["payoutCount"], 1);
    assert_eq!(body["transactions"][0]["txHash"], "0xnew");
    assert!(body.get("warm").is_none());
}

#[tokio::test]
async fn period_includes_warm_row_when_present() {
    let (_dir, state) = setup().await;
    state.warm.upsert(&warm_row(800.0, fixed_now())).await.unwrap();

    let (_, body) = get_json(&state, "/api/entities/acme/period/30d").await;
    assert_eq!(body["summary"]["payoutCount"], 1);
    assert_eq!(body["warm"]["totalUsd"], 800.0);
}

#[tokio::test]
async fn current_month_payouts_show_up_after_a_sync() {
    let (_dir, state) = setup_with(Arc::new(AprilSource)).await;

    let (_, week) = get_json(&state, "/api/entities/acme/period/7d").await;
    assert_eq!(week["summary"]["payoutCount"], 0);

    // Stale snapshots and no warm row: the totals request reconciles live
    let (_, totals) = get_json(&state, "/api/entities/acme/totals").await;
    assert_eq!(totals["source"], "live");
    assert_eq!(totals["totalUsd"], 1050.0);
    assert_eq!(totals["last30dUsd"], 750.0);

    let (_, week) = get_json(&state, "/api/entities/acme/period/7d").await;
    assert_eq!(week["summary"]["payoutCount"], 1);
    assert_eq!(week["summary"]["totalPayouts"], 250.0);
    assert_eq!(week["transactions"][0]["txHash"], "0xapril");

    let (_, month) = get_json(&state, "/api/entities/acme/period/30d").await;
    assert_eq!(month["summary"]["totalPayouts"], 750.0);
    assert_eq!(month["warm"]["last30dUsd"], 750.0);
}

#[tokio::test]
async fn failing_explorer_is_not_queried_on_every_totals_request() {
    let source = Arc::new(DownSource::default());
    let (_dir, state) = setup_with(source.clone()).await;

    let (status, first) = get_json(&state, "/api/entities/acme/totals").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["totalUsd"], 800.0);
    let calls = source.calls.load(Ordering::SeqCst);
    assert!(calls > 0);

    let (status, second) = get_json(&state, "/api/entities/acme/totals").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["source"], "warm");
    assert_eq!(second["totalUsd"], 800.0);
    assert_eq!(source.calls.load(Ordering::SeqCst), calls);

    let stored = state.warm.get("acme").await.unwrap().unwrap();
    assert!(stored.sync_error.is_some());
}

#[tokio::test]
async fn unknown_entity_and_bad_period_are_rejected() {
    let (_dir, state) = setup().await;

    let (status, body) = get_json(&state, "/api/entities/nobody/period/30d").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nobody"));

    let (status, _) = get_json(&state, "/api/entities/acme/period/90d").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn twelve_month_period_has_a_bucket_per_completed_month() {
    let (_dir, state) = setup().await;
    let (status, body) = get_json(&state, "/api/entities/acme/period/12m").await;

    assert_eq!(status, StatusCode::OK);
    let buckets = body["monthlyBuckets"].as_array().unwrap();
    assert_eq!(buckets.len(), 12);
    assert_eq!(buckets[0]["month"], "2024-04");
    assert_eq!(buckets[11]["month"], "2025-03");
    assert_eq!(buckets[11]["hasData"], true);
    assert_eq!(buckets[0]["hasData"], false);
    assert_eq!(body["summary"]["totalPayouts"], 800.0);
}

#[tokio::test]
async fn totals_prefer_fresh_warm_row_over_stale_snapshots() {
    let (_dir, state) = setup().await;
    state
        .warm
        .upsert(&warm_row(1250.0, fixed_now() - Duration::hours(1)))
        .await
        .unwrap();

    let (status, body) = get_json(&state, "/api/entities/acme/totals").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "warm");
    assert_eq!(body["totalUsd"], 1250.0);
}

#[tokio::test]
async fn totals_fall_through_to_live_sync() {
    let (_dir, state) = setup().await;

    let (_, body) = get_json(&state, "/api/entities/acme/totals").await;
    assert_eq!(body["source"], "live");
    assert_eq!(body["totalUsd"], 800.0);
    assert_eq!(body["payoutCount"], 2);

    let stored = state.warm.get("acme").await.unwrap().unwrap();
    assert_eq!(stored.total_usd, 800.0);
}

#[tokio::test]
async fn overview_is_cached_until_invalidated() {
    let (_dir, state) = setup().await;

    let (_, first) = get_json(&state, "/api/overview").await;
    assert_eq!(first["week"], "2025-W15");
    assert_eq!(first["entities"][0]["name"], "Acme Trading");
    assert!(first["entities"][0]["warm"].is_null());

    state.warm.upsert(&warm_row(900.0, fixed_now())).await.unwrap();
    let (_, cached) = get_json(&state, "/api/overview").await;
    assert!(cached["entities"][0]["warm"].is_null());

    let response = router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/cache/invalidate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (_, fresh) = get_json(&state, "/api/overview").await;
    assert_eq!(fresh["entities"][0]["warm"]["totalUsd"], 900.0);
    assert_eq!(fresh["entities"][0]["last30d"]["totalPayouts"], 500.0);
}
