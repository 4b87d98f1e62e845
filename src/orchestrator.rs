//! Chooses between the static and rendered extraction paths for a request.
//!
//! Phases always run one after the other. `auto` runs both and keeps the
//! rendered result only when it found strictly more images; `dynamic` falls
//! back to one static attempt when rendering fails.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::error::ScrapeError;
use crate::identity::IdentityPool;
use crate::images::ExtractionResult;
use crate::logging::{self, log_scraping_error};
use crate::probe::{EnrichConfig, HttpImageProbe, ImageEnricher};
use crate::proxy::ProxyManager;
use crate::render::RenderExtractor;
use crate::security::{PublicUrlGuard, UrlGuard};
use crate::static_extractor::{StaticConfig, StaticExtractor};

/// One way of turning a URL into images.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str, lazy: bool) -> Result<ExtractionResult, ScrapeError>;
}

#[async_trait]
impl Extractor for StaticExtractor {
    async fn extract(&self, url: &str, lazy: bool) -> Result<ExtractionResult, ScrapeError> {
        StaticExtractor::extract(self, url, lazy).await
    }
}

#[async_trait]
impl Extractor for RenderExtractor {
    /// Lazy attributes are always consulted on rendered pages.
    async fn extract(&self, url: &str, _lazy: bool) -> Result<ExtractionResult, ScrapeError> {
        RenderExtractor::extract(self, url).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeMode {
    Static,
    Dynamic,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Static,
    Dynamic,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Static => "static",
            Method::Dynamic => "dynamic",
        }
    }
}

/// Attempted/succeeded/error state of both phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseDiagnostics {
    pub static_attempted: bool,
    pub static_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_error: Option<String>,
    pub dynamic_attempted: bool,
    pub dynamic_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_error: Option<String>,
}

impl PhaseDiagnostics {
    fn record(&mut self, method: Method, outcome: &Result<ExtractionResult, ScrapeError>) {
        let error = outcome.as_ref().err().map(|e| e.to_string());
        match method {
            Method::Static => {
                self.static_attempted = true;
                self.static_success = outcome.is_ok();
                self.static_error = error;
            }
            Method::Dynamic => {
                self.dynamic_attempted = true;
                self.dynamic_success = outcome.is_ok();
                self.dynamic_error = error;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOutcome {
    pub method: Method,
    pub fallback_used: bool,
    /// Set when the result came from the static fallback after rendering failed.
    pub warning: Option<String>,
    pub result: ExtractionResult,
    pub phases: PhaseDiagnostics,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeFailure {
    /// Missing or unsafe URL; no phase ran.
    Validation(String),
    /// Every permitted phase failed.
    Exhausted {
        error: String,
        method: Method,
        fallback_used: bool,
        phases: PhaseDiagnostics,
    },
}

impl ScrapeFailure {
    pub fn message(&self) -> &str {
        match self {
            ScrapeFailure::Validation(msg) => msg,
            ScrapeFailure::Exhausted { error, .. } => error,
        }
    }
}

pub struct Orchestrator {
    static_extractor: Arc<dyn Extractor>,
    render_extractor: Arc<dyn Extractor>,
    guard: Arc<dyn UrlGuard>,
}

impl Orchestrator {
    pub fn new(
        static_extractor: Arc<dyn Extractor>,
        render_extractor: Arc<dyn Extractor>,
        guard: Arc<dyn UrlGuard>,
    ) -> Self {
        Self {
            static_extractor,
            render_extractor,
            guard,
        }
    }

    /// Wire up the production extractors. Identity and proxy state live here
    /// for the lifetime of the process.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let identities = Arc::new(IdentityPool::new());
        let proxies = Arc::new(ProxyManager::from_pool_str(
            &config.proxy_pool,
            config.sticky_ttl(),
        ));
        if proxies.has_proxies() {
            log::info!("Loaded {} proxies", proxies.len());
        }

        let enricher = ImageEnricher::new(Arc::new(HttpImageProbe::default()), EnrichConfig::default());
        let static_extractor = StaticExtractor::new(StaticConfig::default(), enricher.clone())?;
        let render_extractor =
            RenderExtractor::new(config.render_config(), identities, proxies, enricher);

        Ok(Self::new(
            Arc::new(static_extractor),
            Arc::new(render_extractor),
            Arc::new(PublicUrlGuard),
        ))
    }

    pub async fn scrape(
        &self,
        url: &str,
        lazy: bool,
        mode: ScrapeMode,
    ) -> Result<ScrapeOutcome, ScrapeFailure> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ScrapeFailure::Validation("No url provided".to_string()));
        }
        if !self.guard.is_safe(url).await {
            log::warn!("Rejected unsafe URL {}", url);
            return Err(ScrapeFailure::Validation("URL not allowed".to_string()));
        }

        let request_id = logging::request_id();
        let started = Instant::now();
        log::info!("[{}] Scraping {} (mode={:?}, lazy={})", request_id, url, mode, lazy);

        let outcome = match mode {
            ScrapeMode::Dynamic => self.dynamic_first(url, lazy).await,
            ScrapeMode::Static | ScrapeMode::Auto => self.static_first(url, lazy, mode).await,
        };

        match &outcome {
            Ok(o) => log::info!(
                "{}",
                logging::fields(
                    &format!("[{}] Scrape finished", request_id),
                    &json!({
                        "url": url,
                        "method": o.method.as_str(),
                        "fallbackUsed": o.fallback_used,
                        "images": o.result.image_count(),
                        "elapsedMs": started.elapsed().as_millis() as u64,
                    })
                )
            ),
            Err(f) => log::warn!("[{}] Scrape of {} failed: {}", request_id, url, f.message()),
        }
        outcome
    }

    async fn run_phase(
        &self,
        method: Method,
        url: &str,
        lazy: bool,
        phases: &mut PhaseDiagnostics,
    ) -> Result<ExtractionResult, ScrapeError> {
        let extractor = match method {
            Method::Static => &self.static_extractor,
            Method::Dynamic => &self.render_extractor,
        };
        let outcome = extractor.extract(url, lazy).await;
        phases.record(method, &outcome);
        if let Err(e) = &outcome {
            log_scraping_error(url, method.as_str(), e, json!({ "lazy": lazy }));
        }
        outcome
    }

    async fn static_first(
        &self,
        url: &str,
        lazy: bool,
        mode: ScrapeMode,
    ) -> Result<ScrapeOutcome, ScrapeFailure> {
        let mut phases = PhaseDiagnostics::default();
        let static_result = self.run_phase(Method::Static, url, lazy, &mut phases).await.ok();

        if mode != ScrapeMode::Auto {
            return match static_result {
                Some(result) => Ok(ScrapeOutcome {
                    method: Method::Static,
                    fallback_used: false,
                    warning: None,
                    result,
                    phases,
                }),
                None => Err(ScrapeFailure::Exhausted {
                    error: phases.static_error.clone().unwrap_or_default(),
                    method: Method::Static,
                    fallback_used: false,
                    phases,
                }),
            };
        }

        let dynamic_result = self.run_phase(Method::Dynamic, url, lazy, &mut phases).await.ok();

        let (method, result) = match (static_result, dynamic_result) {
            (Some(s), Some(d)) if d.image_count() > s.image_count() => (Method::Dynamic, d),
            (Some(s), _) => (Method::Static, s),
            (None, Some(d)) => (Method::Dynamic, d),
            (None, None) => {
                let error = phases
                    .dynamic_error
                    .clone()
                    .or_else(|| phases.static_error.clone())
                    .unwrap_or_default();
                return Err(ScrapeFailure::Exhausted {
                    error,
                    method: Method::Dynamic,
                    fallback_used: true,
                    phases,
                });
            }
        };

        Ok(ScrapeOutcome {
            method,
            fallback_used: true,
            warning: None,
            result,
            phases,
        })
    }

    async fn dynamic_first(&self, url: &str, lazy: bool) -> Result<ScrapeOutcome, ScrapeFailure> {
        let mut phases = PhaseDiagnostics::default();
        let err = match self.run_phase(Method::Dynamic, url, lazy, &mut phases).await {
            Ok(result) => {
                return Ok(ScrapeOutcome {
                    method: Method::Dynamic,
                    fallback_used: false,
                    warning: None,
                    result,
                    phases,
                });
            }
            Err(e) => e,
        };

        log::info!("Dynamic rendering of {} failed, retrying statically", url);
        match self.run_phase(Method::Static, url, lazy, &mut phases).await {
            Ok(result) => Ok(ScrapeOutcome {
                method: Method::Static,
                fallback_used: true,
                warning: Some(format!(
                    "Dynamic rendering failed ({}); showing static extraction results instead",
                    err
                )),
                result,
                phases,
            }),
            Err(e) => Err(ScrapeFailure::Exhausted {
                error: e.to_string(),
                method: Method::Static,
                fallback_used: true,
                phases,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderFailureKind;
    use crate::images::{ImageRecord, ImageSource, RemoteImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result_with(n: usize, tag: &str) -> ExtractionResult {
        ExtractionResult {
            images: (0..n)
                .map(|i| {
                    ImageRecord::Remote(RemoteImage::new(
                        format!("https://ex.com/{}/{}.png", tag, i),
                        None,
                        ImageSource::Img,
                    ))
                })
                .collect(),
            head_content: format!("<title>{}</title>", tag),
        }
    }

    enum Behaviour {
        Images(usize),
        Transport,
        LaunchFailure,
    }

    struct FakeExtractor {
        tag: &'static str,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl FakeExtractor {
        fn new(tag: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                tag,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn extract(&self, _url: &str, _lazy: bool) -> Result<ExtractionResult, ScrapeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Images(n) => Ok(result_with(n, self.tag)),
                Behaviour::Transport => Err(ScrapeError::Transport("HTTP error: 503".to_string())),
                Behaviour::LaunchFailure => Err(ScrapeError::RenderLifecycle {
                    kind: RenderFailureKind::LaunchFailed,
                    source: anyhow::anyhow!("failed to launch browser"),
                }),
            }
        }
    }

    struct AllowAll(bool);

    #[async_trait]
    impl UrlGuard for AllowAll {
        async fn is_safe(&self, _url: &str) -> bool {
            self.0
        }
    }

    fn orchestrator(
        s: &Arc<FakeExtractor>,
        d: &Arc<FakeExtractor>,
    ) -> Orchestrator {
        Orchestrator::new(s.clone(), d.clone(), Arc::new(AllowAll(true)))
    }

    const URL: &str = "https://ex.com/page";

    #[tokio::test]
    async fn test_static_mode_never_renders() {
        let s = FakeExtractor::new("static", Behaviour::Images(2));
        let d = FakeExtractor::new("dynamic", Behaviour::Images(9));
        let out = orchestrator(&s, &d).scrape(URL, true, ScrapeMode::Static).await.unwrap();
        assert_eq!(out.method, Method::Static);
        assert!(!out.fallback_used);
        assert_eq!(out.result.image_count(), 2);
        assert_eq!(d.calls(), 0);
        assert!(!out.phases.dynamic_attempted);
    }

    #[tokio::test]
    async fn test_static_mode_failure_is_terminal() {
        let s = FakeExtractor::new("static", Behaviour::Transport);
        let d = FakeExtractor::new("dynamic", Behaviour::Images(1));
        let err = orchestrator(&s, &d).scrape(URL, true, ScrapeMode::Static).await.unwrap_err();
        match err {
            ScrapeFailure::Exhausted { error, method, fallback_used, phases } => {
                assert_eq!(error, "HTTP error: 503");
                assert_eq!(method, Method::Static);
                assert!(!fallback_used);
                assert!(phases.static_attempted && !phases.static_success);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(d.calls(), 0);
    }

    #[tokio::test]
    async fn test_auto_prefers_dynamic_only_when_strictly_more() {
        let s = FakeExtractor::new("static", Behaviour::Images(3));
        let d = FakeExtractor::new("dynamic", Behaviour::Images(4));
        let out = orchestrator(&s, &d).scrape(URL, true, ScrapeMode::Auto).await.unwrap();
        assert_eq!(out.method, Method::Dynamic);
        assert!(out.fallback_used);
        assert_eq!(out.result.head_content, "<title>dynamic</title>");
    }

    #[tokio::test]
    async fn test_auto_tie_keeps_static() {
        let s = FakeExtractor::new("static", Behaviour::Images(3));
        let d = FakeExtractor::new("dynamic", Behaviour::Images(3));
        let out = orchestrator(&s, &d).scrape(URL, true, ScrapeMode::Auto).await.unwrap();
        assert_eq!(out.method, Method::Static);
        assert!(out.fallback_used);
        assert!(out.phases.dynamic_success);
    }

    #[tokio::test]
    async fn test_auto_uses_dynamic_when_static_failed() {
        let s = FakeExtractor::new("static", Behaviour::Transport);
        let d = FakeExtractor::new("dynamic", Behaviour::Images(0));
        let out = orchestrator(&s, &d).scrape(URL, true, ScrapeMode::Auto).await.unwrap();
        assert_eq!(out.method, Method::Dynamic);
        assert_eq!(out.phases.static_error.as_deref(), Some("HTTP error: 503"));
    }

    #[tokio::test]
    async fn test_auto_keeps_static_when_render_fails() {
        let s = FakeExtractor::new("static", Behaviour::Images(1));
        let d = FakeExtractor::new("dynamic", Behaviour::LaunchFailure);
        let out = orchestrator(&s, &d).scrape(URL, true, ScrapeMode::Auto).await.unwrap();
        assert_eq!(out.method, Method::Static);
        assert!(out.fallback_used);
        assert!(out.warning.is_none());
        assert_eq!(s.calls(), 1);
        assert_eq!(
            out.phases.dynamic_error.as_deref(),
            Some("render engine failed to start, missing runtime dependency")
        );
    }

    #[tokio::test]
    async fn test_dynamic_failure_falls_back_to_static_with_warning() {
        let s = FakeExtractor::new("static", Behaviour::Images(2));
        let d = FakeExtractor::new("dynamic", Behaviour::LaunchFailure);
        let out = orchestrator(&s, &d).scrape(URL, true, ScrapeMode::Dynamic).await.unwrap();
        assert_eq!(out.method, Method::Static);
        assert!(out.fallback_used);
        assert!(out.warning.as_deref().is_some_and(|w| !w.is_empty()));
        assert!(out.phases.dynamic_attempted && out.phases.static_success);
    }

    #[tokio::test]
    async fn test_dynamic_success_skips_static() {
        let s = FakeExtractor::new("static", Behaviour::Images(2));
        let d = FakeExtractor::new("dynamic", Behaviour::Images(1));
        let out = orchestrator(&s, &d).scrape(URL, true, ScrapeMode::Dynamic).await.unwrap();
        assert_eq!(out.method, Method::Dynamic);
        assert!(!out.fallback_used);
        assert_eq!(s.calls(), 0);
    }

    #[tokio::test]
    async fn test_both_failing_is_terminal() {
        let s = FakeExtractor::new("static", Behaviour::Transport);
        let d = FakeExtractor::new("dynamic", Behaviour::LaunchFailure);
        let err = orchestrator(&s, &d).scrape(URL, true, ScrapeMode::Dynamic).await.unwrap_err();
        match err {
            ScrapeFailure::Exhausted { error, fallback_used, phases, .. } => {
                assert_eq!(error, "HTTP error: 503");
                assert!(fallback_used);
                assert!(phases.dynamic_attempted && phases.static_attempted);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validation_runs_no_phase() {
        let s = FakeExtractor::new("static", Behaviour::Images(1));
        let d = FakeExtractor::new("dynamic", Behaviour::Images(1));
        let o = Orchestrator::new(s.clone(), d.clone(), Arc::new(AllowAll(false)));

        assert_eq!(
            o.scrape("  ", true, ScrapeMode::Auto).await.unwrap_err(),
            ScrapeFailure::Validation("No url provided".to_string())
        );
        assert_eq!(
            o.scrape("http://10.0.0.1/", true, ScrapeMode::Auto).await.unwrap_err(),
            ScrapeFailure::Validation("URL not allowed".to_string())
        );
        assert_eq!(s.calls() + d.calls(), 0);
    }

    #[test]
    fn test_mode_parsing() {
        let mode: ScrapeMode = serde_json::from_str(r#""dynamic""#).unwrap();
        assert_eq!(mode, ScrapeMode::Dynamic);
        assert_eq!(ScrapeMode::default(), ScrapeMode::Auto);
    }
}
