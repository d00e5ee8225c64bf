//! 서버 설정
//!
//! 기본값 -> JSON 설정 파일 -> 환경 변수(CLINIC_DESK_*) 순으로 덮어씁니다.

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

const APP_DIR: &str = "clinic-desk";
const ENV_PREFIX: &str = "CLINIC_DESK";

/// 설정 파일 경로를 지정하는 환경 변수
pub const CONFIG_PATH_ENV: &str = "CLINIC_DESK_CONFIG";

pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "changeme123";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite 파일 경로 (None 이면 데이터 디렉토리 기본 경로)
    pub database_path: Option<PathBuf>,
    pub session_ttl_hours: i64,
    /// 모든 출처 CORS 허용 (별도 출처의 개발용 프론트엔드)
    pub cors_allow_any: bool,
    /// 사용자가 한 명도 없을 때 생성되는 최고 관리자 계정
    pub bootstrap_admin: BootstrapAdmin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
}

impl Default for BootstrapAdmin {
    fn default() -> Self {
        Self {
            username: DEFAULT_ADMIN_USERNAME.to_string(),
            password: DEFAULT_ADMIN_PASSWORD.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3030,
            database_path: None,
            session_ttl_hours: 24,
            cors_allow_any: false,
            bootstrap_admin: BootstrapAdmin::default(),
        }
    }
}

impl Config {
    /// 설정 파일 + 환경 변수로 설정 로드
    pub fn load() -> AppResult<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .or_else(default_config_path);
        Self::build(path.as_deref(), env_source())
    }

    /// 기본값 위에 파일(있으면)과 환경 변수 소스를 차례로 덮어씀
    pub fn build(file: Option<&Path>, env: Environment) -> AppResult<Self> {
        let defaults = Config::default();
        let mut builder = config::Config::builder()
            .set_default("host", defaults.host.as_str())?
            .set_default("port", i64::from(defaults.port))?
            .set_default("session_ttl_hours", defaults.session_ttl_hours)?
            .set_default("cors_allow_any", defaults.cors_allow_any)?
            .set_default("bootstrap_admin.username", DEFAULT_ADMIN_USERNAME)?
            .set_default("bootstrap_admin.password", DEFAULT_ADMIN_PASSWORD)?;

        if let Some(path) = file {
            if path.exists() {
                log::info!("설정 파일 로드: {:?}", path);
                builder = builder.add_source(File::from(path).format(FileFormat::Json));
            }
        }

        let config: Config = builder.add_source(env).build()?.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> AppResult<()> {
        if self.session_ttl_hours < 1 {
            return Err(AppError::Custom(format!(
                "session_ttl_hours 는 1 이상이어야 합니다: {}",
                self.session_ttl_hours
            )));
        }
        if self.bootstrap_admin.username.trim().is_empty() {
            return Err(AppError::Custom("bootstrap_admin.username 이 비어있습니다".to_string()));
        }
        Ok(())
    }

    /// 데이터베이스 경로 (필요 시 디렉토리 생성)
    pub fn resolve_database_path(&self) -> AppResult<PathBuf> {
        if let Some(p) = &self.database_path {
            return Ok(p.clone());
        }
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| AppError::Custom("Cannot find data directory".to_string()))?;
        let app_dir = data_dir.join(APP_DIR);
        std::fs::create_dir_all(&app_dir)?;
        Ok(app_dir.join("clinic.db"))
    }
}

/// `CLINIC_DESK_PORT`, `CLINIC_DESK_BOOTSTRAP_ADMIN__PASSWORD` 형태
pub fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env_source().source(Some(map))
    }

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = Config::build(None, env(&[])).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3030);
        assert!(!config.cors_allow_any);
        assert_eq!(config.database_path, None);
        assert_eq!(config.bootstrap_admin.password, DEFAULT_ADMIN_PASSWORD);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::build(
            None,
            env(&[
                ("CLINIC_DESK_PORT", "8080"),
                ("CLINIC_DESK_DATABASE_PATH", "/tmp/clinic-test.db"),
                ("CLINIC_DESK_BOOTSTRAP_ADMIN__USERNAME", "root"),
                ("CLINIC_DESK_CORS_ALLOW_ANY", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "127.0.0.1");
        assert!(config.cors_allow_any);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/clinic-test.db")));
        assert_eq!(config.bootstrap_admin.username, "root");
        assert_eq!(config.bootstrap_admin.password, DEFAULT_ADMIN_PASSWORD);
    }

    #[test]
    fn test_bad_port_is_error() {
        let result = Config::build(None, env(&[("CLINIC_DESK_PORT", "http")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_file_then_env() {
        let path = temp_file("config.json", r#"{ "port": 9000, "host": "0.0.0.0", "session_ttl_hours": 8 }"#);
        let config = Config::build(Some(&path), env(&[("CLINIC_DESK_HOST", "10.0.0.5")])).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.port, 9000);
        assert_eq!(config.session_ttl_hours, 8);
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.bootstrap_admin.username, DEFAULT_ADMIN_USERNAME);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join(format!("{}-absent.json", uuid::Uuid::new_v4()));
        let config = Config::build(Some(&path), env(&[])).unwrap();
        assert_eq!(config.port, 3030);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let result = Config::build(None, env(&[("CLINIC_DESK_SESSION_TTL_HOURS", "0")]));
        assert!(result.is_err());
    }
}
