mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use futures_util::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use chattin_api::auth::{self, AppState, AppStateInner};
use chattin_api::middleware::require_auth;
use chattin_api::tokens::TokenIssuer;
use chattin_api::{avatars, channels, configuration, files, users};
use chattin_db::Database;
use chattin_gateway::{GatewayContext, Hub, session};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chattin=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    // Nobody is connected yet, whatever the last run left behind.
    let stale = db.reset_presence()?;
    if stale > 0 {
        info!("Cleared {} stale online flags", stale);
    }
    let channels = db.list_channels()?;
    info!("Loaded {} channels", channels.len());

    let gateway = Arc::new(GatewayContext::new(
        db.clone(),
        channels,
        config.gateway.clone(),
    ));
    let hub = Hub::spawn(gateway.clone());

    let state: AppState = Arc::new(AppStateInner {
        db,
        gateway,
        hub,
        tokens: TokenIssuer::from_os_rng(),
    });

    let app = router(state, config.max_upload_bytes);

    let addr = config.addr()?;
    info!("Chattin server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let public_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/configuration", get(configuration::get_configuration))
        .route("/avatars/{avatar_id}", get(avatars::get_avatar))
        .route("/files/{file_id}", get(files::get_file))
        .route("/files/{file_id}/info", get(files::file_info))
        .route("/files/{file_id}/download", get(files::download_file))
        .route("/ws", get(ws_upgrade));

    let protected_routes = Router::new()
        .route("/users", get(users::list_users))
        .route("/user/profile", post(users::update_profile))
        .route("/user/avatar", put(avatars::select_avatar))
        .route("/channels", get(channels::list_channels))
        .route("/channels/{channel_id}/messages", get(channels::get_messages))
        .route(
            "/avatars",
            get(avatars::list_avatars).post(avatars::upload_avatar),
        )
        .route("/avatars/{avatar_id}", delete(avatars::delete_avatar))
        .route("/files", post(files::upload_file))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let hub = state.hub.clone();
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| {
        let (sink, stream) = socket.split();
        session::run(stream, sink, hub, gateway)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use chattin_gateway::GatewaySettings;
    use chattin_types::api::TokenResponse;

    fn app() -> Router {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let channels = db.list_channels().unwrap();
        let gateway = Arc::new(GatewayContext::new(
            db.clone(),
            channels,
            GatewaySettings::default(),
        ));
        let hub = Hub::spawn(gateway.clone());
        let state = Arc::new(AppStateInner {
            db,
            gateway,
            hub,
            tokens: TokenIssuer::from_os_rng(),
        });
        router(state, 1024)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn register(app: &Router, login: &str) -> TokenResponse {
        let body = format!(r#"{{"login":"{}","password":"pw"}}"#, login);
        let response = app.clone().oneshot(post_json("/register", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn protected_routes_need_a_token() {
        let app = app();
        let request = Request::get("/users").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::get("/users")
            .header(header::AUTHORIZATION, "Bearer forged")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn registered_token_opens_protected_routes() {
        let app = app();
        let issued = register(&app, "alice").await;

        let request = Request::get("/channels")
            .header(header::AUTHORIZATION, format!("Bearer {}", issued.token))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::get("/users")
            .header("token", issued.token)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn second_registration_conflicts() {
        let app = app();
        register(&app, "alice").await;
        let response = app
            .oneshot(post_json("/register", r#"{"login":"Alice","password":"pw"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let app = app();
        let issued = register(&app, "alice").await;
        let request = Request::post("/files?name=big.bin")
            .header(header::AUTHORIZATION, format!("Bearer {}", issued.token))
            .body(Body::from(vec![0u8; 4096]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn configuration_is_public() {
        let response = app()
            .oneshot(Request::get("/configuration").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
