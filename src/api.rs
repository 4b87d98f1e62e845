use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse, Result, middleware, web};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::images::ImageRecord;
use crate::orchestrator::{
    Method, Orchestrator, PhaseDiagnostics, ScrapeFailure, ScrapeMode, ScrapeOutcome,
};
use crate::probe::MAX_IMAGE_BYTES;
use crate::security::UrlGuard;
use crate::utils::{DEFAULT_USER_AGENT, file_name_from_url, read_body_capped};

/// Per-client limiter keyed on the peer IP address.
pub type Limiter = DefaultKeyedRateLimiter<IpAddr>;

/// Tracked clients before idle entries are pruned.
const LIMITER_PRUNE_THRESHOLD: usize = 10_000;

/// `per_window` requests per `window` for each client, replenished evenly, all
/// usable as a burst.
pub fn build_limiter(per_window: u32, window: Duration) -> Limiter {
    let burst = NonZeroU32::new(per_window).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(window / burst.get())
        .map(|q| q.allow_burst(burst))
        .unwrap_or_else(|| Quota::per_second(burst));
    RateLimiter::keyed(quota)
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub guard: Arc<dyn UrlGuard>,
    pub limiter: Arc<Limiter>,
    pub download_client: reqwest::Client,
    /// Include phase diagnostics in responses (non-production only).
    pub diagnostics: bool,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        guard: Arc<dyn UrlGuard>,
        limiter: Limiter,
        diagnostics: bool,
    ) -> Self {
        let download_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(8))
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            orchestrator,
            guard,
            limiter: Arc::new(limiter),
            download_client,
            diagnostics,
        }
    }
}

/// Response headers applied to every route, static files included.
pub fn security_headers() -> middleware::DefaultHeaders {
    middleware::DefaultHeaders::new()
        .add(("X-Content-Type-Options", "nosniff"))
        .add(("X-Frame-Options", "SAMEORIGIN"))
        .add((
            header::CONTENT_SECURITY_POLICY,
            "default-src 'self'; img-src * data:; object-src 'none'",
        ))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/health", web::get().to(health_check))
        .route("/api/scrape", web::post().to(scrape_handler))
        .route("/api/download", web::get().to(download_handler));
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapeRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_lazy")]
    pub lazy: bool,
    #[serde(default)]
    pub mode: ScrapeMode,
}

fn default_lazy() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResponse {
    pub images: Vec<ImageRecord>,
    pub head_content: String,
    pub method: Method,
    pub fallback_used: bool,
    pub total_images: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<PhaseDiagnostics>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDiagnostics {
    pub method: Method,
    pub fallback_used: bool,
    pub error_message: String,
    #[serde(flatten)]
    pub phases: PhaseDiagnostics,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<FailureDiagnostics>,
}

impl ScrapeResponse {
    pub fn from_outcome(outcome: ScrapeOutcome, diagnostics: bool) -> Self {
        Self {
            total_images: outcome.result.image_count(),
            images: outcome.result.images,
            head_content: outcome.result.head_content,
            method: outcome.method,
            fallback_used: outcome.fallback_used,
            warning: outcome.warning,
            diagnostics: diagnostics.then_some(outcome.phases),
        }
    }
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            diagnostics: None,
        }
    }

    pub fn from_failure(failure: ScrapeFailure, diagnostics: bool) -> Self {
        match failure {
            ScrapeFailure::Validation(msg) => Self::new(msg),
            ScrapeFailure::Exhausted {
                error,
                method,
                fallback_used,
                phases,
            } => Self {
                error: format!("Failed to scrape images: {}", error),
                diagnostics: diagnostics.then(|| FailureDiagnostics {
                    method,
                    fallback_used,
                    error_message: error,
                    phases,
                }),
            },
        }
    }
}

/// Clients without a known peer address share one bucket.
fn client_key(req: &HttpRequest) -> IpAddr {
    req.peer_addr()
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn too_many_requests(state: &AppState, req: &HttpRequest) -> Option<HttpResponse> {
    if state.limiter.len() > LIMITER_PRUNE_THRESHOLD {
        state.limiter.retain_recent();
    }
    state
        .limiter
        .check_key(&client_key(req))
        .is_err()
        .then(|| HttpResponse::TooManyRequests().json(ErrorResponse::new("Too many requests")))
}

pub async fn health_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "rust-image-scraper",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

pub async fn scrape_handler(
    state: web::Data<AppState>,
    http: HttpRequest,
    req: web::Json<ScrapeRequest>,
) -> Result<HttpResponse> {
    if let Some(limited) = too_many_requests(&state, &http) {
        return Ok(limited);
    }

    let ScrapeRequest { url, lazy, mode } = req.into_inner();
    let url = url.unwrap_or_default();

    match state.orchestrator.scrape(&url, lazy, mode).await {
        Ok(outcome) => Ok(HttpResponse::Ok().json(ScrapeResponse::from_outcome(outcome, state.diagnostics))),
        Err(failure @ ScrapeFailure::Validation(_)) => Ok(HttpResponse::BadRequest()
            .json(ErrorResponse::from_failure(failure, state.diagnostics))),
        Err(failure) => Ok(HttpResponse::InternalServerError()
            .json(ErrorResponse::from_failure(failure, state.diagnostics))),
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "imgUrl")]
    pub img_url: Option<String>,
}

/// Re-serve a remote image as an attachment so the browser saves it.
pub async fn download_handler(
    state: web::Data<AppState>,
    http: HttpRequest,
    query: web::Query<DownloadQuery>,
) -> Result<HttpResponse> {
    if let Some(limited) = too_many_requests(&state, &http) {
        return Ok(limited);
    }

    let Some(img_url) = query.img_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse::new("No image URL provided")));
    };
    if !state.guard.is_safe(img_url).await {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse::new("URL not allowed")));
    }

    let response = match state.download_client.get(img_url).send().await {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            log::warn!("Download of {} returned {}", img_url, r.status());
            return Ok(HttpResponse::InternalServerError()
                .json(ErrorResponse::new("Failed to download image")));
        }
        Err(e) => {
            log::warn!("Download of {} failed: {}", img_url, e);
            return Ok(HttpResponse::InternalServerError()
                .json(ErrorResponse::new("Failed to download image")));
        }
    };

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let body = match read_body_capped(response, MAX_IMAGE_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            log::warn!("Download of {} aborted: {}", img_url, e);
            return Ok(HttpResponse::InternalServerError()
                .json(ErrorResponse::new("Failed to download image")));
        }
    };

    let filename = file_name_from_url(img_url).replace(['"', '\\', '\r', '\n'], "_");
    Ok(HttpResponse::Ok()
        .content_type(content_type)
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        ))
        .body(body))
}
