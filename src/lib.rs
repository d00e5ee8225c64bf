pub mod auth;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod forms;
pub mod listing;
pub mod models;
pub mod permissions;
pub mod server;
pub mod validation;
pub mod web_api;

use std::sync::Arc;

use crate::config::{Config, DEFAULT_ADMIN_PASSWORD};
use crate::db::Database;
use crate::error::AppResult;

/// DB 준비 후 HTTP 서버 실행 (종료 신호까지 대기)
pub async fn run(config: Config) -> AppResult<()> {
    let db_path = config.resolve_database_path()?;
    let db = Database::open(&db_path)?;

    let admin = &config.bootstrap_admin;
    db.ensure_bootstrap_admin(&admin.username, &admin.password)?;
    if db.password_still_matches(&admin.username, DEFAULT_ADMIN_PASSWORD)? {
        log::warn!(
            "관리자 계정 '{}' 이 기본 비밀번호를 사용 중입니다. 로그인 후 변경하세요",
            admin.username
        );
    }

    server::start_server(&config, Arc::new(db)).await
}
