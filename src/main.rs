use actix_cors::Cors;
use actix_files as fs;
use actix_web::{App, HttpServer, middleware, web};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use rust_image_scraper::api::{self, AppState, ErrorResponse, ScrapeResponse, build_limiter};
use rust_image_scraper::render::browser::{BrowserSession, find_chromium};
use rust_image_scraper::security::PublicUrlGuard;
use rust_image_scraper::{AppConfig, Orchestrator, ScrapeMode, logging};

#[derive(Parser, Debug)]
#[command(
    name = "rust-image-scraper",
    version,
    about = "Extract every image from a web page, statically or through a headless browser"
)]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scrape a single URL, print the JSON result and exit
    #[arg(long)]
    url: Option<String>,

    #[arg(long, value_enum, default_value_t = ScrapeMode::Auto)]
    mode: ScrapeMode,

    /// Ignore lazy-loading attributes on <img> elements
    #[arg(long)]
    no_lazy: bool,

    /// Check that a browser can be found and launched
    #[arg(long)]
    doctor: bool,
}

#[actix_web::main]
async fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    if cli.doctor {
        return doctor(&config).await;
    }

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);

    if let Some(url) = cli.url {
        return run_once(&orchestrator, &url, !cli.no_lazy, cli.mode, &config).await;
    }

    serve(config, orchestrator).await
}

async fn run_once(
    orchestrator: &Orchestrator,
    url: &str,
    lazy: bool,
    mode: ScrapeMode,
    config: &AppConfig,
) -> Result<()> {
    match orchestrator.scrape(url, lazy, mode).await {
        Ok(outcome) => {
            let response = ScrapeResponse::from_outcome(outcome, config.diagnostics_enabled());
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(failure) => {
            let response = ErrorResponse::from_failure(failure, config.diagnostics_enabled());
            println!("{}", serde_json::to_string_pretty(&response)?);
            std::process::exit(1);
        }
    }
}

async fn doctor(config: &AppConfig) -> Result<()> {
    match find_chromium(config.chrome_path.as_deref()) {
        Some(path) => println!("Browser binary: {}", path.display()),
        None => println!("Browser binary: not on PATH, relying on auto-detection"),
    }

    match BrowserSession::launch(config.chrome_path.as_deref(), None).await {
        Ok(session) => {
            session.teardown().await;
            println!("Launch check: ok");
            Ok(())
        }
        Err(e) => {
            println!("Launch check: failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn serve(config: AppConfig, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let state = web::Data::new(AppState::new(
        orchestrator,
        Arc::new(PublicUrlGuard),
        build_limiter(config.rate_limit_per_window, config.rate_limit_window()),
        config.diagnostics_enabled(),
    ));

    let static_dir = config.static_dir.clone();
    let serve_static = static_dir.is_dir();
    if !serve_static {
        log::warn!("Static directory {} not found, UI disabled", static_dir.display());
    }

    log::info!("🚀 Starting Rust Image Scraper");
    log::info!("🌐 Server running at http://{}:{}", config.host, config.port);
    log::info!(
        "🧭 Human-like interaction: {}, diagnostics: {}",
        if config.human_mode { "on" } else { "off" },
        if config.diagnostics_enabled() { "on" } else { "off" }
    );

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let static_dir = static_dir.clone();
        App::new()
            .app_data(state.clone())
            .wrap(api::security_headers())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(cors)
            .configure(api::configure)
            .configure(move |cfg| {
                if serve_static {
                    cfg.service(fs::Files::new("/", static_dir).index_file("index.html"));
                }
            })
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
