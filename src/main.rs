use log::{error, info, warn};
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use actix_web::{App, HttpServer, dev::ServerHandle, web};

use zonebridge::discovery::Topics;
use zonebridge::faults::keys;
use zonebridge::{
    AppConfig, AppState, Bridge, ClassificationMap, ErrorBus, GpioBackend, GpioEngine, HttpConfig,
    JsonFileStore, MqttTransport, Outbox, PersistenceStore, Priority, ZoneRegistry,
};

#[cfg(feature = "hardware-gpio")]
use zonebridge::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use zonebridge::MockGpioBackend;

const EXIT_CONFIG: u8 = 1;
const EXIT_GPIO: u8 = 2;

#[actix_web::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ZONEBRIDGE_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = match AppConfig::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {config_path}: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let device_id = config.device_id();
    let persist_path = config.resolve_persist_path(&device_id);
    info!(
        "Starting zonebridge device={device_id} broker={}:{} persist={}",
        config.mqtt.host,
        config.mqtt.port,
        persist_path.display()
    );

    let zone_keys = config.zones.iter().map(|z| z.key.clone());
    let store = Arc::new(JsonFileStore::new(persist_path, zone_keys));
    let persisted = store.load().unwrap_or_else(|e| {
        warn!("Ignoring persisted classes: {e}");
        ClassificationMap::new()
    });

    let registry = Arc::new(ZoneRegistry::new(&config.zones, &persisted));
    let faults = Arc::new(ErrorBus::default());

    let backend: Arc<dyn GpioBackend> = {
        #[cfg(feature = "hardware-gpio")]
        {
            match LibgpiodBackend::new(config.timing.edge_settle()) {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    error!("Failed to init libgpiod backend: {e}");
                    return ExitCode::from(EXIT_GPIO);
                }
            }
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::default())
        }
    };

    let engine = Arc::new(GpioEngine::new(
        backend,
        registry.clone(),
        faults.clone(),
        config.timing.debounce(),
        config.event_broadcast_capacity,
    ));
    if let Err(e) = engine.setup_all() {
        faults.raise(keys::GPIO_INIT, format!("GPIO init failed: {e}"), Priority::HIGH, None);
        error!("GPIO setup failed: {e}");
        engine.release();
        return ExitCode::from(EXIT_GPIO);
    }

    let topics = Topics::new(config.mqtt.discovery_prefix.clone(), device_id.clone());
    let (transport, transport_events) =
        MqttTransport::start(&config.mqtt, &device_id, &topics.availability());
    let outbox = Outbox::new(Arc::new(transport), faults.clone());

    let bridge = Arc::new(Bridge::new(
        registry.clone(),
        engine.clone(),
        faults.clone(),
        store,
        outbox,
        topics,
        config.timing.clone(),
    ));

    let http = match &config.http {
        Some(http_cfg) => {
            let state = AppState {
                registry,
                faults,
                engine: engine.clone(),
            };
            match start_http(http_cfg, state) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("Failed to start status API: {e}");
                    engine.release();
                    return ExitCode::from(EXIT_CONFIG);
                }
            }
        }
        None => None,
    };

    tokio::spawn(bridge.clone().run_transport(transport_events));
    tokio::spawn(bridge.clone().run_zone_events(engine.subscribe_events()));
    tokio::spawn(bridge.clone().run_poll_loop());

    wait_for_signal().await;
    info!("Shutdown requested");

    bridge.shutdown().await;
    if let Some(handle) = http {
        handle.stop(true).await;
    }
    ExitCode::SUCCESS
}

fn start_http(http_cfg: &HttpConfig, state: AppState) -> std::io::Result<ServerHandle> {
    let scope_path = http_cfg.path.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(zonebridge::routes::api_scope(&scope_path))
    })
    .disable_signals();

    let bind_addrs: String;
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{socket_path} and {host}");

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        (None, None) => {
            return Err(std::io::Error::other(
                "http needs 'unix_socket' or 'host' to be set",
            ));
        }
    };

    info!("Status API listening on {bind_addrs}");
    let server = server.run();
    let handle = server.handle();
    actix_web::rt::spawn(server);
    Ok(handle)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
    }
}
