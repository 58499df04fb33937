//! End-to-end gameplay flows through the dispatcher, the completion
//! worker, and the write-behind sync workers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use wk_bridge::dispatcher::dispatch;
use wk_bridge::protocol::ApiRequest;
use wk_bridge::AppState;
use wk_core::catalog::{
    AllianceLevelSpec, BuffSpec, BuildingLevel, GameCatalog, ResearchLevel, ResearchSpec, UnitSpec,
};
use wk_core::config::ServerConfig;
use wk_core::types::{ResourceBundle, SyncClass, ValueKind};
use wk_daemon::sync_worker::SyncWorker;
use wk_daemon::task_worker::TaskWorker;
use wk_game::Deps;
use wk_store::{CacheStore, PersistentStore};

fn catalog() -> GameCatalog {
    let mut c = GameCatalog::default();

    // Building 201: L1 costs 500/500, L2 costs 800/800 and takes 60 s.
    let mut levels = BTreeMap::new();
    levels.insert(
        1,
        BuildingLevel {
            cost: ResourceBundle {
                food: 500,
                wood: 500,
                ..ResourceBundle::default()
            },
            build_secs: 0,
            requires: vec![],
            power: 10,
        },
    );
    levels.insert(
        2,
        BuildingLevel {
            cost: ResourceBundle {
                food: 800,
                wood: 800,
                ..ResourceBundle::default()
            },
            build_secs: 60,
            requires: vec![],
            power: 20,
        },
    );
    c.buildings.insert(201, levels);

    // Unit 5: 10 food each, 5 s each.
    c.units.insert(
        5,
        UnitSpec {
            unit_idx: 5,
            tier: 1,
            train_secs: 5,
            cost: ResourceBundle {
                food: 10,
                ..ResourceBundle::default()
            },
            attack: 3,
            defense: 2,
            health: 10,
            speed: 4,
            category: "infantry".into(),
        },
    );

    // Research 10 gates research 20.
    let mut r10 = BTreeMap::new();
    r10.insert(
        1,
        ResearchLevel {
            cost: ResourceBundle {
                food: 100,
                ..ResourceBundle::default()
            },
            research_secs: 10,
            buff_idx: 0,
            buff_value: 0,
        },
    );
    c.researches.insert(
        10,
        ResearchSpec {
            research_idx: 10,
            levels: r10,
            prerequisite: None,
            repeatable: false,
        },
    );
    let mut r20 = BTreeMap::new();
    r20.insert(
        1,
        ResearchLevel {
            cost: ResourceBundle {
                food: 100,
                ..ResourceBundle::default()
            },
            research_secs: 10,
            buff_idx: 0,
            buff_value: 0,
        },
    );
    c.researches.insert(
        20,
        ResearchSpec {
            research_idx: 20,
            levels: r20,
            prerequisite: Some((10, 1)),
            repeatable: false,
        },
    );

    // Alliance levels: 100 exp reaches level 2; both grant buff 401.
    c.buffs.insert(
        401,
        BuffSpec {
            buff_idx: 401,
            target_type: "resource".into(),
            target_sub: 0,
            stat: "production".into(),
            value: 5,
            value_kind: ValueKind::Percent,
            duration_secs: 0,
            ruby_cost: 0,
        },
    );
    c.alliance_levels.insert(
        1,
        AllianceLevelSpec {
            level: 1,
            required_exp: 0,
            buff_idx: 401,
            buff_value: 5,
        },
    );
    c.alliance_levels.insert(
        2,
        AllianceLevelSpec {
            level: 2,
            required_exp: 100,
            buff_idx: 401,
            buff_value: 10,
        },
    );
    c
}

async fn fresh_server() -> (Arc<Deps>, Arc<AppState>) {
    let deps = Deps::in_memory(catalog(), ServerConfig::default())
        .await
        .unwrap();
    let state = Arc::new(AppState::new(deps.clone()));
    (deps, state)
}

async fn call(deps: &Arc<Deps>, user_no: i64, api_code: i64, data: Value) -> Value {
    let (_, resp) = dispatch(
        deps,
        &ApiRequest {
            user_no,
            api_code,
            data,
        },
    )
    .await;
    assert!(resp.success, "api {api_code} failed: {}", resp.message);
    resp.data
}

async fn call_err(deps: &Arc<Deps>, user_no: i64, api_code: i64, data: Value) -> String {
    let (_, resp) = dispatch(
        deps,
        &ApiRequest {
            user_no,
            api_code,
            data,
        },
    )
    .await;
    assert!(!resp.success, "api {api_code} unexpectedly succeeded");
    resp.message
}

#[tokio::test]
async fn build_then_upgrade_completes_through_worker() {
    let (deps, state) = fresh_server().await;
    let worker = TaskWorker::new(deps.clone(), state.push.clone(), state.health.clone());
    let push_rx = state.push.connect(1001);

    call(&deps, 1001, 1010, json!({})).await;

    let out = call(&deps, 1001, 2002, json!({ "building_idx": 201 })).await;
    assert_eq!(out["building"]["level"], 1);
    assert_eq!(out["building"]["status"], "idle");
    let res = call(&deps, 1001, 1011, json!({})).await;
    assert_eq!(res["resources"]["food"], 4500);
    assert_eq!(res["resources"]["wood"], 4500);

    let out = call(&deps, 1001, 2003, json!({ "building_idx": 201 })).await;
    assert_eq!(out["building"]["status"], "upgrading");
    let res = call(&deps, 1001, 1011, json!({})).await;
    assert_eq!(res["resources"]["food"], 3700);
    assert_eq!(res["resources"]["wood"], 3700);

    // Advance the clock past the 60 s duration.
    let applied = worker
        .process_tick(Utc::now() + ChronoDuration::seconds(61))
        .await;
    assert_eq!(applied, 1);

    let out = call(&deps, 1001, 2001, json!({})).await;
    assert_eq!(out["buildings"][0]["level"], 2);
    assert_eq!(out["buildings"][0]["status"], "idle");

    let pushed = push_rx.try_recv().unwrap();
    assert!(pushed.contains("building_complete"));
}

#[tokio::test]
async fn insufficient_resources_leave_everything_unchanged() {
    let mut config = ServerConfig::default();
    config.game.starter_food = 100;
    config.game.starter_wood = 100;
    let deps = Deps::in_memory(catalog(), config).await.unwrap();

    call(&deps, 1, 1010, json!({})).await;
    let msg = call_err(&deps, 1, 2002, json!({ "building_idx": 201 })).await;
    assert!(msg.contains("insufficient"));

    let res = call(&deps, 1, 1011, json!({})).await;
    assert_eq!(res["resources"]["food"], 100);
    let out = call(&deps, 1, 2001, json!({})).await;
    assert!(out["buildings"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unit_train_then_cancel_restores_everything() {
    let (deps, _state) = fresh_server().await;
    call(&deps, 1, 1010, json!({})).await;

    call(&deps, 1, 4002, json!({ "unit_idx": 5, "quantity": 10 })).await;
    let res = call(&deps, 1, 1011, json!({})).await;
    assert_eq!(res["resources"]["food"], 4900);
    let out = call(&deps, 1, 4001, json!({})).await;
    assert_eq!(out["units"][0]["training"], 10);

    call(&deps, 1, 4005, json!({ "unit_idx": 5 })).await;
    let res = call(&deps, 1, 1011, json!({})).await;
    assert_eq!(res["resources"]["food"], 5000);
    let out = call(&deps, 1, 4001, json!({})).await;
    assert_eq!(out["units"][0]["training"], 0);
    assert_eq!(out["units"][0]["total"], 0);
}

#[tokio::test]
async fn research_prerequisite_gate() {
    let (deps, state) = fresh_server().await;
    let worker = TaskWorker::new(deps.clone(), state.push.clone(), state.health.clone());
    call(&deps, 1, 1010, json!({})).await;

    let msg = call_err(&deps, 1, 3002, json!({ "research_idx": 20 })).await;
    assert!(msg.contains("prerequisite"));

    call(&deps, 1, 3002, json!({ "research_idx": 10 })).await;
    worker
        .process_tick(Utc::now() + ChronoDuration::seconds(11))
        .await;

    call(&deps, 1, 3002, json!({ "research_idx": 20 })).await;
}

#[tokio::test]
async fn alliance_donation_levels_up_and_updates_buffs() {
    let mut config = ServerConfig::default();
    config.game.starter_food = 20_000;
    let deps = Deps::in_memory(catalog(), config).await.unwrap();
    call(&deps, 1001, 1010, json!({})).await;
    call(&deps, 1002, 1010, json!({})).await;

    let out = call(&deps, 1001, 7002, json!({ "name": "Iron Pact" })).await;
    let alliance_id = out["alliance"]["alliance_id"].as_i64().unwrap();
    call(&deps, 1002, 7003, json!({ "alliance_id": alliance_id })).await;

    // 10,000 food → 100 exp → level 2.
    let out = call(&deps, 1002, 7011, json!({ "amount": 5000 })).await;
    assert_eq!(out["exp_gained"], 50);
    assert_eq!(out["alliance_level"], 1);
    let out = call(&deps, 1002, 7011, json!({ "amount": 5000 })).await;
    assert_eq!(out["alliance_level"], 2);
    assert_eq!(out["leveled_up"], true);

    // Both members see the level-2 buff value on their next query.
    for user_no in [1001, 1002] {
        let out = call(&deps, user_no, 9001, json!({})).await;
        let permanent = out["permanent"].as_array().unwrap();
        assert_eq!(permanent.len(), 1);
        assert_eq!(permanent[0]["record"]["value"], 10);
    }
}

#[tokio::test]
async fn restart_recovers_inflight_training() {
    // First server generation: shared system-of-record, private cache.
    let db = Arc::new(PersistentStore::open_in_memory().await.unwrap());
    let config = Arc::new(ServerConfig::default());
    let catalog = Arc::new(catalog());
    let deps1 = Deps::wire(
        Arc::new(CacheStore::new()),
        db.clone(),
        catalog.clone(),
        config.clone(),
    )
    .await
    .unwrap();

    call(&deps1, 7, 1010, json!({})).await;
    call(&deps1, 7, 4002, json!({ "unit_idx": 5, "quantity": 5 })).await;

    // Let the write-behind flush before the "crash".
    let state1 = Arc::new(AppState::new(deps1.clone()));
    SyncWorker::new(deps1.clone(), SyncClass::Unit, state1.health.clone())
        .flush_pending()
        .await;
    SyncWorker::new(deps1.clone(), SyncClass::Resources, state1.health.clone())
        .flush_pending()
        .await;
    drop(deps1);

    // Second generation: cold cache, same database. Login re-registers
    // the in-flight batch at its stored end time.
    let deps2 = Deps::wire(Arc::new(CacheStore::new()), db, catalog, config)
        .await
        .unwrap();
    let state2 = Arc::new(AppState::new(deps2.clone()));
    call(&deps2, 7, 1010, json!({})).await;
    assert_eq!(deps2.queues.unit.len(), 1);

    // Maturity fires through the worker as if 25 s passed.
    let worker = TaskWorker::new(deps2.clone(), state2.push.clone(), state2.health.clone());
    let applied = worker
        .process_tick(Utc::now() + ChronoDuration::seconds(26))
        .await;
    assert_eq!(applied, 1);

    let out = call(&deps2, 7, 4001, json!({})).await;
    assert_eq!(out["units"][0]["ready"], 5);
    assert_eq!(out["units"][0]["training"], 0);
}

#[tokio::test]
async fn instant_complete_matches_maturity_outcome() {
    let (deps, state) = fresh_server().await;
    let worker = TaskWorker::new(deps.clone(), state.push.clone(), state.health.clone());

    // Maturity path on user 1.
    call(&deps, 1, 1010, json!({})).await;
    call(&deps, 1, 3002, json!({ "research_idx": 10 })).await;
    worker
        .process_tick(Utc::now() + ChronoDuration::seconds(11))
        .await;

    // Instant path on user 2.
    call(&deps, 2, 1010, json!({})).await;
    call(&deps, 2, 3002, json!({ "research_idx": 10 })).await;
    let out = call(&deps, 2, 3005, json!({ "research_idx": 10 })).await;
    assert_eq!(out["ruby_cost"], 1);

    // Same final research state for both users; only rubies differ.
    let a = call(&deps, 1, 3001, json!({})).await;
    let b = call(&deps, 2, 3001, json!({})).await;
    let row = |v: &Value| {
        v["researches"]
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["research_idx"] == 10)
            .cloned()
            .unwrap()
    };
    assert_eq!(row(&a)["level"], row(&b)["level"]);
    assert_eq!(row(&a)["status"], row(&b)["status"]);

    let res_a = call(&deps, 1, 1011, json!({})).await;
    let res_b = call(&deps, 2, 1011, json!({})).await;
    assert_eq!(res_a["resources"]["ruby"], 100);
    assert_eq!(res_b["resources"]["ruby"], 99);
}
