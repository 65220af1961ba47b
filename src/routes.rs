use log::warn;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::AppError;
use crate::faults::{ErrorBus, ErrorItem};
use crate::gpio::{GpioEngine, ObserverKind, ZoneEvent};
use crate::registry::ZoneRegistry;
use crate::zone::Zone;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ZoneRegistry>,
    pub faults: Arc<ErrorBus>,
    pub engine: Arc<GpioEngine>,
}

#[derive(Serialize)]
struct ZoneView {
    #[serde(flatten)]
    zone: Zone,
    observer: Option<ObserverKind>,
}

#[derive(Serialize)]
struct TopFault {
    item: Option<ErrorItem>,
    dirty: bool,
}

impl AppState {
    fn view(&self, zone: Zone) -> ZoneView {
        let observer = self.engine.observer_kind(&zone.key);
        ZoneView { zone, observer }
    }
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<ZoneEvent>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = AppError::InvalidState(format!("Event stream lagged by {n} messages"));
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Read-mostly view over zones and faults, mounted under `base_path`.
pub fn api_scope(base_path: &str) -> actix_web::Scope {
    web::scope(base_path)
        .service(
            web::resource("/zones")
                .route(web::get().to(list_zones))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET]))
                        .to(method_not_allowed),
                ),
        )
        .service(
            web::resource("/zones/events")
                .route(web::get().to(zone_events_ws))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET]))
                        .to(method_not_allowed),
                ),
        )
        .service(
            web::resource("/zones/{key}")
                .route(web::get().to(zone_detail))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET]))
                        .to(method_not_allowed),
                ),
        )
        .service(
            web::resource("/faults")
                .route(web::get().to(list_faults))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET]))
                        .to(method_not_allowed),
                ),
        )
        .service(
            web::resource("/faults/top")
                .route(web::get().to(top_fault))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET]))
                        .to(method_not_allowed),
                ),
        )
        .service(
            web::resource("/faults/top/ack")
                .route(web::post().to(ack_top_fault))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::POST]))
                        .to(method_not_allowed),
                ),
        )
}

async fn list_zones(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let zones: Vec<ZoneView> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|zone| state.view(zone))
        .collect();

    Ok(web::Json(zones))
}

async fn zone_detail(
    key: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let zone = state.registry.get(key.trim())?;

    Ok(web::Json(state.view(zone)))
}

async fn list_faults(state: web::Data<AppState>) -> impl Responder {
    web::Json(state.faults.items())
}

async fn top_fault(state: web::Data<AppState>) -> impl Responder {
    let (item, dirty) = state.faults.display_top();
    web::Json(TopFault { item, dirty })
}

async fn ack_top_fault(state: web::Data<AppState>) -> HttpResponse {
    state.faults.mark_clean();
    HttpResponse::NoContent().finish()
}

async fn zone_events_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let rx = state.engine.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::InvalidState(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx).await;
    });

    Ok(response)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
