//! HTTP 서버 모듈 (axum 기반)
//!
//! REST API 와 내장 대시보드 화면을 인트라넷에서 제공합니다.

use axum::{
    extract::Path,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use rust_embed::Embed;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::SessionStore;
use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::web_api::{create_web_api_router, ApiState};

/// 내장 정적 파일
#[derive(Embed)]
#[folder = "static/"]
struct StaticAssets;

/// 라우터 생성
pub fn create_router(state: ApiState, cors_allow_any: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/", get(index_handler))
        .route("/static/{*path}", get(static_handler))
        .nest("/api", create_web_api_router(state));

    if cors_allow_any {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

/// HTTP 서버 시작 (SIGINT/SIGTERM 까지 실행)
pub async fn start_server(config: &Config, db: Arc<Database>) -> AppResult<()> {
    let state = ApiState::new(db, SessionStore::new(config.session_ttl_hours));
    let app = create_router(state, config.cors_allow_any);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| AppError::Custom(format!("Invalid listen address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Custom(format!("Server bind error: {}", e)))?;
    log::info!("HTTP 서버 시작: http://{}", addr);

    serve(listener, app, shutdown_signal()).await?;
    log::info!("HTTP 서버 종료");
    Ok(())
}

/// 이미 바인드된 리스너로 서비스 (종료 신호가 오면 진행 중 요청 처리 후 종료)
pub async fn serve<F>(listener: tokio::net::TcpListener, app: Router, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AppError::Custom(format!("Server error: {}", e)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Ctrl+C 핸들러 등록 실패: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("SIGTERM 핸들러 등록 실패: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("SIGINT 수신, 서버를 종료합니다"),
        _ = terminate => log::info!("SIGTERM 수신, 서버를 종료합니다"),
    }
}

// ============ 핸들러 ============

/// 헬스 체크 (DB 호출 없음 - 서버 동작 확인용)
async fn health_handler() -> &'static str {
    "OK"
}

/// 대시보드 화면
async fn index_handler() -> Response {
    asset_response("index.html")
}

async fn static_handler(Path(path): Path<String>) -> Response {
    asset_response(&path)
}

fn asset_response(path: &str) -> Response {
    match StaticAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref())],
                content.data.into_owned(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web_api::tests::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(test_state(), true);
        let response = get(&app, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_embedded_dashboard() {
        let app = create_router(test_state(), false);

        let response = get(&app, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));

        let response = get(&app, "/static/app.js").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = get(&app, "/static/missing.js").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_is_nested() {
        let app = create_router(test_state(), true);
        let response = get(&app, "/api/auth/me").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
