//! Headless-browser extraction for pages that build their images with script.

pub mod browser;
pub mod scripts;

use anyhow::{Context, Result, anyhow};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CreateIsolatedWorldParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use url::Url;

use crate::error::{ScrapeError, classify_render_error};
use crate::human::{ScrollOptions, human_scroll, jitter_delay, mouse_wiggle};
use crate::identity::{Identity, IdentityPool};
use crate::images::{ExtractionResult, IconKind, ImageCollector, ImageRecord, ImageSource};
use crate::logging::{log_browser_console, log_network_failure};
use crate::probe::ImageEnricher;
use crate::proxy::{Proxy, ProxyManager, is_blocking_signal};
use browser::{BrowserSession, PagePointer};

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub chrome_path: Option<PathBuf>,
    pub human_mode: bool,
    pub navigation_timeout: Duration,
    pub consent_settle: Duration,
    pub readiness_timeout: Duration,
    pub max_scroll_iterations: u32,
    pub scroll_settle: Duration,
    pub final_settle: Duration,
    pub wiggle_duration: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            human_mode: false,
            navigation_timeout: Duration::from_secs(30),
            consent_settle: Duration::from_millis(600),
            readiness_timeout: Duration::from_secs(5),
            max_scroll_iterations: 12,
            scroll_settle: Duration::from_millis(1200),
            final_settle: Duration::from_secs(2),
            wiggle_duration: Duration::from_millis(800),
        }
    }
}

/// One entry reported by the in-page extraction script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RenderedImage {
    Img {
        url: String,
        alt: Option<String>,
    },
    Background {
        url: String,
    },
    Svg {
        content: String,
        width: Option<String>,
        height: Option<String>,
    },
    Object {
        url: String,
    },
    Icon {
        url: String,
        rel: String,
        sizes: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenderedPage {
    #[serde(default)]
    pub head: String,
    #[serde(default)]
    pub images: Vec<RenderedImage>,
}

/// Resolve and deduplicate script output with the same rules the static
/// parser applies.
pub fn collect_rendered(entries: Vec<RenderedImage>, page_url: &Url) -> Vec<ImageRecord> {
    let mut images = ImageCollector::new(page_url.clone());
    for entry in entries {
        match entry {
            RenderedImage::Img { url, alt } => {
                images.add_remote(&url, alt, ImageSource::Img, None);
            }
            RenderedImage::Background { url } => {
                images.add_remote(&url, None, ImageSource::Background, None);
            }
            RenderedImage::Svg {
                content,
                width,
                height,
            } => images.add_inline(content, width.as_deref(), height.as_deref()),
            RenderedImage::Object { url } => {
                images.add_remote(&url, None, ImageSource::Object, None);
            }
            RenderedImage::Icon { url, rel, sizes } => {
                if let Some(kind) = IconKind::classify(&rel) {
                    images.add_icon(&url, kind, sizes.as_deref());
                }
            }
        }
    }
    images.into_records()
}

/// What a render attempt revealed about the proxy it went through. Only
/// navigation talks to the network, so earlier and later failures say nothing
/// about the proxy.
#[derive(Debug, Clone, PartialEq)]
enum ProxyVerdict {
    Untested,
    Reachable,
    Failed(String),
}

/// Run a best-effort step. Errors and timeouts are logged and folded into `None`.
async fn best_effort<T, F>(label: &str, limit: Duration, step: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(limit, step).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::debug!("{} skipped: {:#}", label, e);
            None
        }
        Err(_) => {
            log::debug!("{} timed out after {:?}", label, limit);
            None
        }
    }
}

/// Renders a page in a fresh Chromium process and reads images from the live DOM.
pub struct RenderExtractor {
    config: RenderConfig,
    identities: Arc<IdentityPool>,
    proxies: Arc<ProxyManager>,
    enricher: ImageEnricher,
}

impl RenderExtractor {
    pub fn new(
        config: RenderConfig,
        identities: Arc<IdentityPool>,
        proxies: Arc<ProxyManager>,
        enricher: ImageEnricher,
    ) -> Self {
        Self {
            config,
            identities,
            proxies,
            enricher,
        }
    }

    pub async fn extract(&self, url: &str) -> Result<ExtractionResult, ScrapeError> {
        let page_url =
            Url::parse(url).map_err(|e| ScrapeError::Validation(format!("Invalid URL: {}", e)))?;
        let domain = page_url.host_str().unwrap_or_default().to_string();

        let identity = self.identities.next();
        let proxy = self.proxies.for_domain(&domain);
        log::info!(
            "Rendering {} as {} via {}",
            url,
            identity.id,
            proxy.as_ref().map(|p| p.id.as_str()).unwrap_or("direct")
        );

        let mut verdict = ProxyVerdict::Untested;
        let rendered = self.render(url, identity, proxy.as_ref(), &mut verdict).await;
        if let Some(proxy) = &proxy {
            self.report_proxy(&domain, proxy, &verdict);
        }
        let rendered = rendered.map_err(classify_render_error)?;

        let images = collect_rendered(rendered.images, &page_url);
        log::debug!("Rendered DOM of {} gave {} images", url, images.len());
        Ok(ExtractionResult {
            images: self.enricher.enrich(images).await,
            head_content: rendered.head,
        })
    }

    fn report_proxy(&self, domain: &str, proxy: &Proxy, verdict: &ProxyVerdict) {
        match verdict {
            ProxyVerdict::Untested => {}
            ProxyVerdict::Reachable => self.proxies.report_success(&proxy.id),
            ProxyVerdict::Failed(reason) => {
                self.proxies.report_failure(&proxy.id, reason);
                if is_blocking_signal(reason) {
                    self.proxies.rotate_for_domain(domain);
                }
            }
        }
    }

    async fn render(
        &self,
        url: &str,
        identity: &Identity,
        proxy: Option<&Proxy>,
        verdict: &mut ProxyVerdict,
    ) -> Result<RenderedPage> {
        let mut session = BrowserSession::launch(self.config.chrome_path.as_deref(), proxy).await?;
        let outcome = self.drive(&mut session, url, identity, proxy, verdict).await;

        let diagnostics = session.teardown().await;
        log_browser_console(url, &diagnostics.console);
        log_network_failure(url, &diagnostics.failed_requests, &diagnostics.error_responses);

        outcome
    }

    async fn drive(
        &self,
        session: &mut BrowserSession,
        url: &str,
        identity: &Identity,
        proxy: Option<&Proxy>,
        verdict: &mut ProxyVerdict,
    ) -> Result<RenderedPage> {
        let page = session.open_context(identity).await?;
        session.instrument(&page).await?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
            scripts::stealth_script(identity),
        ))
        .await
        .context("failed to install stealth script")?;

        session.block_fonts(&page, proxy).await?;

        if self.config.human_mode {
            jitter_delay(200, 600).await;
        }

        if let Err(e) = self.navigate(&page, url).await {
            *verdict = ProxyVerdict::Failed(format!("{:#}", e));
            return Err(e);
        }
        *verdict = ProxyVerdict::Reachable;

        if self.config.human_mode {
            jitter_delay(600, 1500).await;
            let pointer = PagePointer::new(&page);
            let _ = best_effort(
                "mouse wiggle",
                self.config.wiggle_duration * 2,
                mouse_wiggle(&pointer, self.config.wiggle_duration),
            )
            .await;
        }

        dismiss_consent(&page).await;
        sleep(self.config.consent_settle).await;

        let _ = best_effort(
            "image readiness wait",
            self.config.readiness_timeout,
            wait_for_images(&page),
        )
        .await;

        self.trigger_lazy_load(&page).await?;

        page.evaluate(scripts::extract_script())
            .await
            .context("image extraction script failed")?
            .into_value::<RenderedPage>()
            .map_err(|e| anyhow!("unexpected extraction result: {e}"))
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<()> {
        let limit = self.config.navigation_timeout;
        let load = async {
            page.goto(url).await.context("navigation failed")?;
            page.wait_for_navigation()
                .await
                .context("navigation failed")?;
            let settled = page
                .evaluate(scripts::network_idle_script(10_000))
                .await
                .ok()
                .and_then(|v| v.into_value::<bool>().ok())
                .unwrap_or(false);
            if !settled {
                log::debug!("Network did not go idle on {}", url);
            }
            Ok::<_, anyhow::Error>(())
        };

        match timeout(limit, load).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("navigation timeout after {}ms", limit.as_millis())),
        }
    }

    async fn trigger_lazy_load(&self, page: &Page) -> Result<()> {
        if self.config.human_mode {
            let pointer = PagePointer::new(page);
            let _ = best_effort(
                "human scroll",
                Duration::from_secs(15),
                human_scroll(&pointer, ScrollOptions::default()),
            )
            .await;
        }

        let mut last_height = document_height(page).await?;
        for _ in 0..self.config.max_scroll_iterations {
            page.evaluate(scripts::SCROLL_TO_BOTTOM).await?;
            sleep(self.config.scroll_settle).await;
            let height = document_height(page).await?;
            if height <= last_height {
                break;
            }
            last_height = height;
        }

        page.evaluate(scripts::SCROLL_TO_TOP).await?;
        sleep(self.config.final_settle).await;
        Ok(())
    }
}

async fn document_height(page: &Page) -> Result<f64> {
    page.evaluate(scripts::DOCUMENT_HEIGHT)
        .await?
        .into_value::<f64>()
        .map_err(|e| anyhow!("unexpected document height: {e}"))
}

async fn wait_for_images(page: &Page) -> Result<()> {
    loop {
        let present = page
            .evaluate(scripts::IMAGES_PRESENT)
            .await?
            .into_value::<bool>()
            .unwrap_or(false);
        if present {
            return Ok(());
        }
        sleep(Duration::from_millis(250)).await;
    }
}

/// Click a consent button in the main frame, then in each child frame.
async fn dismiss_consent(page: &Page) {
    let script = scripts::consent_script();

    let clicked = best_effort("consent click", Duration::from_millis(1000), async {
        page.evaluate(script.as_str())
            .await?
            .into_value::<bool>()
            .map_err(anyhow::Error::from)
    })
    .await
    .unwrap_or(false);
    if clicked {
        log::debug!("Dismissed consent banner in main frame");
        return;
    }

    let Some(frames) = best_effort("frame listing", Duration::from_millis(500), async {
        let main = page.mainframe().await?;
        let frames = page.frames().await?;
        Ok(frames
            .into_iter()
            .filter(|f| Some(f) != main.as_ref())
            .collect::<Vec<_>>())
    })
    .await
    else {
        return;
    };

    for frame_id in frames {
        let clicked = best_effort("frame consent click", Duration::from_millis(300), async {
            let mut world = CreateIsolatedWorldParams::new(frame_id);
            world.world_name = Some("consent".to_string());
            let context_id = page.execute(world).await?.result.execution_context_id;

            let mut eval = EvaluateParams::new(script.as_str());
            eval.context_id = Some(context_id);
            eval.return_by_value = Some(true);
            let result = page.execute(eval).await?.result.result;
            Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
        })
        .await
        .unwrap_or(false);

        if clicked {
            log::debug!("Dismissed consent banner in child frame");
            return;
        }
    }
}
