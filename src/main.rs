use clinic_desk::config::Config;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            log::error!("설정 로드 실패: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = clinic_desk::run(config).await {
        log::error!("서버 실행 실패: {}", e);
        std::process::exit(1);
    }
}
