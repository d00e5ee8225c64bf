//! 인증 모듈
//!
//! 비밀번호 해시(bcrypt)와 Bearer 토큰 세션을 관리합니다.

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::UserAccount;
use crate::permissions::{has_permission, Action, Module, Role};

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

/// 비밀번호 해시 생성
pub fn hash_password(password: &str) -> AppResult<String> {
    bcrypt::hash(password, HASH_COST)
        .map_err(|e| AppError::Custom(format!("Password hash error: {}", e)))
}

/// 비밀번호 검증 (해시 형식이 잘못되면 false)
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// 로그인 세션
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    #[serde(skip)]
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub role: Role,
    pub patient_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// 권한 확인 (없으면 403)
    pub fn require(&self, module: Module, action: Action) -> AppResult<()> {
        if has_permission(self.role, module, action) {
            Ok(())
        } else {
            log::warn!(
                "권한 거부: {} ({}) {} {}",
                self.username,
                self.role,
                module,
                action.as_str()
            );
            Err(AppError::Forbidden(format!("{} {}", module, action.as_str())))
        }
    }

    /// 환자 계정은 자신의 기록만 조회 가능
    pub fn ensure_patient_access(&self, patient_id: &str) -> AppResult<()> {
        if self.role != Role::Patient {
            return Ok(());
        }
        match self.patient_id.as_deref() {
            Some(own) if own == patient_id => Ok(()),
            _ => Err(AppError::Forbidden("other patient's record".to_string())),
        }
    }

    /// 목록 조회 시 환자 계정의 범위 (직원은 None)
    pub fn patient_scope(&self) -> Option<&str> {
        if self.role == Role::Patient {
            // 연결된 환자가 없는 환자 계정은 빈 목록
            Some(self.patient_id.as_deref().unwrap_or(""))
        } else {
            None
        }
    }
}

/// 세션 저장소 (token -> Session)
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    ttl_hours: i64,
}

impl SessionStore {
    pub fn new(ttl_hours: i64) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl_hours,
        }
    }

    /// 세션 생성
    pub fn create(&self, account: &UserAccount) -> Session {
        let session = Session {
            token: generate_token(),
            user_id: account.id.clone(),
            username: account.username.clone(),
            full_name: account.full_name.clone(),
            role: account.role,
            patient_id: account.patient_id.clone(),
            created_at: Utc::now(),
        };

        if let Ok(mut sessions) = self.sessions.lock() {
            // 다시 제시되지 않는 토큰도 쌓이지 않도록 생성 시 만료 세션 정리
            let now = Utc::now();
            sessions.retain(|_, s| !self.is_expired(s, now));
            sessions.insert(session.token.clone(), session.clone());
        }
        session
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(session.created_at).num_hours() >= self.ttl_hours
    }

    /// 세션 검증 (만료된 세션은 제거)
    pub fn verify(&self, token: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().ok()?;
        let session = sessions.get(token)?;

        if self.is_expired(session, Utc::now()) {
            sessions.remove(token);
            return None;
        }
        Some(session.clone())
    }

    /// 저장된 세션 수 (만료 포함)
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 세션 삭제
    pub fn remove(&self, token: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(token);
        }
    }

    /// 사용자의 모든 세션 삭제 (비활성화/삭제/권한 변경 시)
    pub fn remove_user_sessions(&self, user_id: &str) -> usize {
        match self.sessions.lock() {
            Ok(mut sessions) => {
                let before = sessions.len();
                sessions.retain(|_, s| s.user_id != user_id);
                before - sessions.len()
            }
            Err(_) => 0,
        }
    }

    /// Authorization 헤더로 세션 확인
    pub fn authenticate(&self, headers: &HeaderMap) -> AppResult<Session> {
        bearer_token(headers)
            .and_then(|t| self.verify(t))
            .ok_or(AppError::NotAuthenticated)
    }
}

/// `Authorization: Bearer <token>` 에서 토큰 추출
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// 아이디/비밀번호 로그인
pub fn login(db: &Database, store: &SessionStore, username: &str, password: &str) -> AppResult<Session> {
    let account = match db.get_user_by_username(username.trim())? {
        Some(a) => a,
        None => {
            log::warn!("로그인 실패: 존재하지 않는 아이디 {}", username);
            return Err(AppError::InvalidCredentials);
        }
    };

    if !verify_password(password, &account.password_hash) {
        log::warn!("로그인 실패: 비밀번호 불일치 {}", account.username);
        return Err(AppError::InvalidCredentials);
    }
    if !account.is_active {
        log::warn!("로그인 실패: 비활성 계정 {}", account.username);
        return Err(AppError::Forbidden("account is deactivated".to_string()));
    }

    db.update_last_login(&account.id)?;
    let session = store.create(&account);
    log::info!("로그인 성공: {} ({})", account.username, account.role);
    Ok(session)
}

fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..64)
        .map(|_| {
            let idx = rng.gen_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn account(role: Role) -> UserAccount {
        UserAccount::new(
            "tester".to_string(),
            "Test User".to_string(),
            hash_password("secret123").unwrap(),
            role,
        )
    }

    #[test]
    fn test_password_hash() {
        let hash = hash_password("secret123").unwrap();
        assert!(verify_password("secret123", &hash));
        assert!(!verify_password("secret124", &hash));
        assert!(!verify_password("secret123", "not-a-hash"));
    }

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_session_lifecycle() {
        let store = SessionStore::new(24);
        let user = account(Role::Nurse);
        let session = store.create(&user);

        assert_eq!(store.verify(&session.token).unwrap().user_id, user.id);
        store.remove(&session.token);
        assert!(store.verify(&session.token).is_none());

        store.create(&user);
        store.create(&user);
        assert_eq!(store.remove_user_sessions(&user.id), 2);
    }

    #[test]
    fn test_expired_session_rejected() {
        let store = SessionStore::new(0);
        let session = store.create(&account(Role::Doctor));
        assert!(store.verify(&session.token).is_none());
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_unused_expired_sessions_purged_on_create() {
        let store = SessionStore::new(0);
        let user = account(Role::Doctor);
        for _ in 0..5 {
            store.create(&user);
        }
        // 이전 토큰은 한 번도 검증되지 않았지만 남지 않음
        assert_eq!(store.session_count(), 1);

        let live = SessionStore::new(24);
        live.create(&user);
        live.create(&user);
        assert_eq!(live.session_count(), 2);
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers), Some("abc123"));
    }

    #[test]
    fn test_require_and_patient_scope() {
        let store = SessionStore::new(24);
        let nurse = store.create(&account(Role::Nurse));
        assert!(nurse.require(Module::Patients, Action::View).is_ok());
        assert!(matches!(
            nurse.require(Module::Billing, Action::View),
            Err(AppError::Forbidden(_))
        ));
        assert!(nurse.ensure_patient_access("any").is_ok());
        assert_eq!(nurse.patient_scope(), None);

        let mut user = account(Role::Patient);
        user.patient_id = Some("p-1".to_string());
        let patient = store.create(&user);
        assert!(patient.ensure_patient_access("p-1").is_ok());
        assert!(patient.ensure_patient_access("p-2").is_err());
        assert_eq!(patient.patient_scope(), Some("p-1"));
    }

    #[test]
    fn test_login_rules() {
        let db = Database::open_in_memory().unwrap();
        let store = SessionStore::new(24);
        let mut user = account(Role::Receptionist);
        db.create_user(&user).unwrap();

        assert!(matches!(
            login(&db, &store, "tester", "wrong1234"),
            Err(AppError::InvalidCredentials)
        ));
        assert!(matches!(
            login(&db, &store, "nobody", "secret123"),
            Err(AppError::InvalidCredentials)
        ));
        let session = login(&db, &store, "tester", "secret123").unwrap();
        assert_eq!(session.role, Role::Receptionist);
        assert!(db.get_user(&user.id).unwrap().unwrap().last_login_at.is_some());

        user.is_active = false;
        db.update_user(&user).unwrap();
        assert!(matches!(
            login(&db, &store, "tester", "secret123"),
            Err(AppError::Forbidden(_))
        ));
    }
}
