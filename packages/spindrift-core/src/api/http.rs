//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the player manager and backend
//! and wrap results in the uniform envelope. Status-code mapping lives on
//! [`SpindriftError`]; handlers just bubble it up.

use std::path::Path as FsPath;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::response::{api_data, api_ok};
use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::{SpindriftError, SpindriftResult};
use crate::player::capabilities::read_card_capabilities;
use crate::state::{PlayerConfiguration, OFFSET_RANGE_MS};

/// Highest ALSA card index probed for `/api/cards`.
const MAX_CARD_INDEX: u32 = 7;

/// Builds the REST + WebSocket router.
pub fn build_router(state: AppState) -> Router {
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/api/players", get(list_players).post(create_player))
        .route(
            "/api/players/{name}",
            get(get_player).put(update_player).delete(delete_player),
        )
        .route("/api/players/{name}/start", post(start_player))
        .route("/api/players/{name}/stop", post(stop_player))
        .route(
            "/api/players/{name}/volume",
            get(get_volume).post(set_volume),
        )
        .route("/api/players/{name}/offset", put(set_offset))
        .route("/api/devices", get(list_devices))
        .route("/api/cards", get(list_cards))
        .route("/api/providers", get(list_providers))
        .route("/ws", any(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Players
// ─────────────────────────────────────────────────────────────────────────────

async fn list_players(State(state): State<AppState>) -> Response {
    api_data(state.manager.list())
}

async fn create_player(
    State(state): State<AppState>,
    Json(config): Json<PlayerConfiguration>,
) -> SpindriftResult<Response> {
    let created = state.manager.create(config)?;
    Ok(api_data(created))
}

async fn get_player(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> SpindriftResult<Response> {
    let config = state.manager.get(&name)?;
    let status = state.manager.status(&name)?;
    Ok(api_data(json!({ "config": config, "status": status })))
}

async fn update_player(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(config): Json<PlayerConfiguration>,
) -> SpindriftResult<Response> {
    state.manager.update(&name, config)?;
    Ok(api_ok(format!("player `{name}` updated")))
}

async fn delete_player(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> SpindriftResult<Response> {
    state.manager.delete(&name).await?;
    Ok(api_ok(format!("player `{name}` deleted")))
}

async fn start_player(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> SpindriftResult<Response> {
    state.manager.start(&name).await?;
    Ok(api_ok(format!("player `{name}` started")))
}

async fn stop_player(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> SpindriftResult<Response> {
    state.manager.stop(&name).await?;
    Ok(api_ok(format!("player `{name}` stopped")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Volume / offset
// ─────────────────────────────────────────────────────────────────────────────

/// Wide integer bodies so out-of-range values reach our validation (and its
/// 400) instead of failing JSON deserialization.
#[derive(Deserialize)]
struct VolumeBody {
    volume: i64,
}

#[derive(Deserialize)]
struct OffsetBody {
    delay_ms: i64,
}

async fn get_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> SpindriftResult<Response> {
    let config = state.manager.get(&name)?;
    Ok(api_data(json!({ "volume": config.volume })))
}

async fn set_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<VolumeBody>,
) -> SpindriftResult<Response> {
    let volume = u8::try_from(body.volume)
        .ok()
        .filter(|v| *v <= 100)
        .ok_or_else(|| {
            SpindriftError::InvalidRequest(format!("volume {} outside 0..=100", body.volume))
        })?;
    state.manager.set_volume(&name, volume)?;
    Ok(api_ok(format!("volume set to {volume}")))
}

async fn set_offset(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<OffsetBody>,
) -> SpindriftResult<Response> {
    let delay_ms = i32::try_from(body.delay_ms)
        .ok()
        .filter(|d| OFFSET_RANGE_MS.contains(d))
        .ok_or_else(|| {
            SpindriftError::InvalidRequest(format!(
                "delay_ms {} outside -1000..=1000",
                body.delay_ms
            ))
        })?;
    state.manager.set_offset(&name, delay_ms)?;
    Ok(api_ok(format!("offset set to {delay_ms}ms")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Enumeration
// ─────────────────────────────────────────────────────────────────────────────

async fn list_devices(State(state): State<AppState>) -> SpindriftResult<Response> {
    let devices = state
        .manager
        .backend()
        .list_devices()
        .map_err(SpindriftError::from)?;
    Ok(api_data(devices))
}

async fn list_cards(State(_state): State<AppState>) -> Response {
    let proc_root = FsPath::new("/proc/asound");
    let mut cards = Vec::new();
    for index in 0..=MAX_CARD_INDEX {
        if let Some(caps) = read_card_capabilities(proc_root, index) {
            cards.push(json!({ "index": index, "capabilities": caps }));
        }
    }
    api_data(cards)
}

async fn list_providers(State(_state): State<AppState>) -> Response {
    let mut providers = vec!["mock"];
    #[cfg(feature = "pulse")]
    providers.push("pulseaudio");
    #[cfg(feature = "alsa-backend")]
    providers.push("alsa");
    api_data(providers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AppStateBuilder;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn test_router() -> Router {
        build_router(AppStateBuilder::mock().build())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn create_with_slash_in_name_is_400() {
        let router = test_router();
        let response = router
            .oneshot(post_json(
                "/api/players",
                serde_json::json!({"name": "kitchen/main", "server": "ma.local:8097"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], body["message"]);
    }

    #[tokio::test]
    async fn create_with_64_char_name_succeeds() {
        let router = test_router();
        // "kitchen main" padded to exactly 64 characters.
        let name = format!("kitchen main{}", " x".repeat(26));
        assert_eq!(name.chars().count(), 64);
        let response = router
            .oneshot(post_json(
                "/api/players",
                serde_json::json!({"name": name, "server": "ma.local:8097"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_player_is_404() {
        let router = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/players/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn volume_out_of_range_is_400() {
        let state = AppStateBuilder::mock().build();
        state
            .manager
            .create(PlayerConfiguration::new("kitchen", "s"))
            .unwrap();
        let router = build_router(state);

        let response = router
            .oneshot(post_json(
                "/api/players/kitchen/volume",
                serde_json::json!({"volume": 101}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn offset_boundaries_accepted() {
        let state = AppStateBuilder::mock().build();
        state
            .manager
            .create(PlayerConfiguration::new("kitchen", "s"))
            .unwrap();
        let router = build_router(state);

        for (delay, expected) in [
            (-1000, StatusCode::OK),
            (1000, StatusCode::OK),
            (1001, StatusCode::BAD_REQUEST),
        ] {
            let request = Request::builder()
                .method("PUT")
                .uri("/api/players/kitchen/offset")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"delay_ms": delay}).to_string(),
                ))
                .unwrap();
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), expected, "delay_ms={delay}");
        }
    }

    #[tokio::test]
    async fn providers_always_include_mock() {
        let router = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/providers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["data"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("mock")));
    }
}
