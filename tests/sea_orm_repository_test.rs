//! Cart flows against the SeaORM repositories on in-memory SQLite.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestApp;
use rust_decimal_macros::dec;
use stateset_cart::{
    config::AppConfig,
    entities::commerce::{AbandonmentStage, CartStatus},
    errors::ServiceError,
    repositories::{AbandonmentFilter, Storage},
    services::commerce::{AddItemInput, CartOwner},
};
use uuid::Uuid;

fn sqlite_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.storage_backend = "database".to_string();
    cfg.database_url = Some("sqlite::memory:".to_string());
    cfg.auto_migrate = true;
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg
}

async fn sqlite_app() -> TestApp {
    let cfg = sqlite_config();
    let storage = Storage::from_config(&cfg)
        .await
        .expect("sqlite storage with migrations");
    TestApp::with_storage(cfg, storage).await
}

fn add(product_id: Uuid, quantity: i32) -> AddItemInput {
    AddItemInput {
        product_id,
        variant_id: None,
        quantity,
        is_gift: false,
        gift_message: None,
    }
}

fn guest(session: &str) -> CartOwner {
    CartOwner {
        user_id: None,
        session_id: Some(session.to_string()),
    }
}

#[tokio::test]
async fn aggregate_round_trips_through_sqlite() {
    let app = sqlite_app().await;
    let lamp = app.add_product("Lamp", dec!(30.00));
    let rug = app.add_product("Rug", dec!(45.50));
    let carts = &app.services().carts;

    let (cart, _) = carts.get_or_create(guest("db-1"), None).await.unwrap();
    carts.add_item(cart.cart.id, add(lamp.id, 2)).await.unwrap();
    let written = carts.add_item(cart.cart.id, add(rug.id, 1)).await.unwrap();

    let loaded = carts.get_cart(cart.cart.id).await.unwrap();
    assert_eq!(loaded.cart.version, written.cart.version);
    assert_eq!(loaded.cart.version, 3);
    assert_eq!(loaded.items.len(), 2);
    assert_eq!(loaded.items[0].product_id, lamp.id);
    assert_eq!(loaded.items[1].product_id, rug.id);
    assert_eq!(loaded.cart.subtotal.round_dp(2), dec!(105.50));
    assert_eq!(loaded.cart.item_count, 3);
    assert_eq!(loaded.cart.session_id.as_deref(), Some("db-1"));

    let (again, created) = carts.get_or_create(guest("db-1"), None).await.unwrap();
    assert!(!created);
    assert_eq!(again.cart.id, cart.cart.id);
}

#[tokio::test]
async fn stale_version_is_rejected_by_database() {
    let app = sqlite_app().await;
    let lamp = app.add_product("Lamp", dec!(30.00));
    let carts = &app.services().carts;

    let (cart, _) = carts.get_or_create(guest("db-stale"), None).await.unwrap();
    let stale = carts.get_cart(cart.cart.id).await.unwrap();
    carts.add_item(cart.cart.id, add(lamp.id, 1)).await.unwrap();

    assert_matches!(
        app.state.storage.carts.save(stale).await,
        Err(ServiceError::ConcurrentModification(_))
    );
    assert_eq!(carts.get_cart(cart.cart.id).await.unwrap().items.len(), 1);
}

#[tokio::test]
async fn merge_commits_target_and_deletes_guest() {
    let app = sqlite_app().await;
    let pen = app.add_product("Pen", dec!(5.00));
    let carts = &app.services().carts;

    let (guest_cart, _) = carts.get_or_create(guest("db-guest"), None).await.unwrap();
    carts.add_item(guest_cart.cart.id, add(pen.id, 2)).await.unwrap();
    let (user_cart, _) = carts
        .get_or_create(
            CartOwner {
                user_id: Some(Uuid::new_v4()),
                session_id: None,
            },
            None,
        )
        .await
        .unwrap();
    carts.add_item(user_cart.cart.id, add(pen.id, 1)).await.unwrap();

    let merged = carts
        .merge_carts(user_cart.cart.id, guest_cart.cart.id)
        .await
        .unwrap();
    assert_eq!(merged.items.len(), 1);
    assert_eq!(merged.items[0].quantity, 3);

    assert_matches!(
        carts.get_cart(guest_cart.cart.id).await,
        Err(ServiceError::NotFound(_))
    );
    let reloaded = carts.get_cart(user_cart.cart.id).await.unwrap();
    assert_eq!(reloaded.items[0].quantity, 3);
}

#[tokio::test]
async fn stale_merge_rolls_back_both_carts() {
    let app = sqlite_app().await;
    let pen = app.add_product("Pen", dec!(5.00));
    let carts = &app.services().carts;

    let (guest_cart, _) = carts.get_or_create(guest("db-rb-g"), None).await.unwrap();
    let (user_cart, _) = carts.get_or_create(guest("db-rb-u"), None).await.unwrap();
    carts.add_item(guest_cart.cart.id, add(pen.id, 1)).await.unwrap();
    let target = carts.add_item(user_cart.cart.id, add(pen.id, 1)).await.unwrap();
    let guest_before = carts.get_cart(guest_cart.cart.id).await.unwrap();

    let result = app
        .state
        .storage
        .carts
        .save_merged(target.clone(), guest_cart.cart.id, guest_before.cart.version - 1)
        .await;
    assert_matches!(result, Err(ServiceError::ConcurrentModification(_)));

    let user_after = carts.get_cart(user_cart.cart.id).await.unwrap();
    assert_eq!(user_after.cart.version, target.cart.version);
    assert!(carts.get_cart(guest_cart.cart.id).await.is_ok());
}

#[tokio::test]
async fn expiry_sweep_updates_only_due_guest_carts() {
    let app = sqlite_app().await;
    let carts = &app.services().carts;
    let (due, _) = carts.get_or_create(guest("db-due"), None).await.unwrap();

    let expired = carts
        .cleanup_expired_carts(Utc::now() + Duration::days(8))
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let reloaded = carts.get_cart(due.cart.id).await.unwrap();
    assert_eq!(reloaded.cart.status, CartStatus::Expired);
    assert_eq!(reloaded.cart.version, due.cart.version + 1);
}

#[tokio::test]
async fn abandonment_tracking_upserts_and_filters() {
    let app = sqlite_app().await;
    let chair = app.add_product("Chair", dec!(150.00));
    let services = app.services();

    let (cart, _) = services
        .carts
        .get_or_create(guest("db-abandon"), None)
        .await
        .unwrap();
    services
        .carts
        .add_item(cart.cart.id, add(chair.id, 1))
        .await
        .unwrap();

    let first = services
        .abandonment
        .track_abandonment(cart.cart.id, AbandonmentStage::Cart, None)
        .await
        .unwrap();
    let second = services
        .abandonment
        .track_abandonment(
            cart.cart.id,
            AbandonmentStage::Payment,
            Some("/checkout/pay".into()),
        )
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.stage, AbandonmentStage::Payment);

    let filter = AbandonmentFilter {
        min_value: Some(dec!(100)),
        ..Default::default()
    };
    assert_eq!(services.abandonment.list_abandoned(&filter).await.unwrap().len(), 1);

    let filter = AbandonmentFilter {
        min_value: Some(dec!(1000)),
        ..Default::default()
    };
    assert!(services.abandonment.list_abandoned(&filter).await.unwrap().is_empty());

    services
        .abandonment
        .mark_recovered(cart.cart.id, Uuid::new_v4())
        .await
        .unwrap();
    let unrecovered = services
        .abandonment
        .get_unrecovered(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert!(unrecovered.is_empty());
}
