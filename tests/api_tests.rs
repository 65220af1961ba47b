use std::sync::Arc;

use actix_web::{App, test, web};
use serde_json::Value;
use zonebridge::ClassificationMap;
use zonebridge::backend::MockGpioBackend;
use zonebridge::config::AppConfig;
use zonebridge::faults::{ErrorBus, Priority, keys};
use zonebridge::gpio::{GpioBackend, GpioEngine};
use zonebridge::registry::ZoneRegistry;
use zonebridge::routes::{AppState, api_scope};

fn sample_config() -> AppConfig {
    serde_json::from_str(
        r#"
        {
            "device_id": "Hall Panel",
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1"
            },
            "zones": [
                { "key": "zone1", "name": "Front Door", "line": 22, "class": "door" },
                { "key": "zone2", "name": "Garage Opener", "line": 25, "class": "output_tap" },
                { "key": "zone3", "name": "Back Window", "chip": "/dev/gpiochip1", "line": 5 }
            ]
        }
        "#,
    )
    .expect("valid sample config")
}

fn sample_state(backend: MockGpioBackend) -> AppState {
    let cfg = sample_config();
    let backend: Arc<dyn GpioBackend> = Arc::new(backend);
    let registry = Arc::new(ZoneRegistry::new(&cfg.zones, &ClassificationMap::new()));
    let faults = Arc::new(ErrorBus::default());
    let engine = Arc::new(GpioEngine::new(
        backend,
        registry.clone(),
        faults.clone(),
        cfg.timing.debounce(),
        cfg.event_broadcast_capacity,
    ));
    engine.setup_all().expect("mock setup");

    AppState {
        registry,
        faults,
        engine,
    }
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state))
                .service(api_scope("/api/v1")),
        )
        .await
    };
}

#[actix_rt::test]
async fn list_zones_returns_catalog_in_order() {
    let backend = MockGpioBackend::default();
    backend.disable_edges(5);
    let app = app!(sample_state(backend));

    let req = test::TestRequest::get().uri("/api/v1/zones").to_request();
    let zones: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(zones.len(), 3);

    let keys: Vec<&str> = zones.iter().map(|z| z["key"].as_str().unwrap()).collect();
    assert_eq!(keys, ["zone1", "zone2", "zone3"]);

    assert_eq!(zones[0]["class"], "door");
    assert_eq!(zones[0]["observer"], "interrupt");
    assert_eq!(zones[1]["class"], "output_tap");
    assert_eq!(zones[1]["observer"], Value::Null);
    assert_eq!(zones[2]["class"], "opening");
    assert_eq!(zones[2]["observer"], "poll");
    assert_eq!(zones[2]["pin"]["chip"], "/dev/gpiochip1");
}

#[actix_rt::test]
async fn zone_detail_reports_live_state() {
    let state = sample_state(MockGpioBackend::default());
    state.registry.set_state("zone1", true).unwrap();
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/zones/zone1")
        .to_request();
    let zone: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(zone["name"], "Front Door");
    assert_eq!(zone["state"], true);
    assert_eq!(zone["generation"], 0);
    assert!(zone.get("pending_pulse").is_none());
}

#[actix_rt::test]
async fn unknown_zone_returns_404() {
    let app = app!(sample_state(MockGpioBackend::default()));

    let req = test::TestRequest::get()
        .uri("/api/v1/zones/zone9")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Zone not found: zone9");
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let app = app!(sample_state(MockGpioBackend::default()));

    let req = test::TestRequest::post()
        .uri("/api/v1/zones/zone1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::get()
        .uri("/api/v1/faults/top/ack")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn top_fault_hides_state_notices() {
    let state = sample_state(MockGpioBackend::default());
    let faults = state.faults.clone();
    faults.raise(keys::ZONES_OPEN, "Doors/Windows open: 1 (Front Door)", Priority::LOW, None);
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/v1/faults/top").to_request();
    let top: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(top["item"], Value::Null);
    assert_eq!(top["dirty"], true);

    let req = test::TestRequest::get().uri("/api/v1/faults").to_request();
    let items: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["key"], keys::ZONES_OPEN);
    assert_eq!(items[0]["priority"], 90);
}

#[actix_rt::test]
async fn ack_marks_top_fault_clean() {
    let state = sample_state(MockGpioBackend::default());
    let faults = state.faults.clone();
    faults.raise(keys::MQTT_DOWN, "MQTT disconnected: eof", Priority::HIGH, None);
    faults.raise(keys::STORE_WRITE, "write failed", Priority::MEDIUM_HIGH, None);
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/v1/faults/top").to_request();
    let top: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(top["item"]["key"], keys::MQTT_DOWN);
    assert_eq!(top["item"]["count"], 1);
    assert_eq!(top["dirty"], true);

    let req = test::TestRequest::post()
        .uri("/api/v1/faults/top/ack")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    let req = test::TestRequest::get().uri("/api/v1/faults/top").to_request();
    let top: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(top["dirty"], false);

    faults.clear(keys::MQTT_DOWN);
    let req = test::TestRequest::get().uri("/api/v1/faults/top").to_request();
    let top: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(top["item"]["key"], keys::STORE_WRITE);
    assert_eq!(top["dirty"], true);
}
