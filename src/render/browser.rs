//! Chromium process lifecycle: discovery, launch, per-request context setup
//! and guaranteed teardown.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    MediaFeature, SetDeviceMetricsOverrideParams, SetEmulatedMediaParams, SetLocaleOverrideParams,
    SetTimezoneOverrideParams, SetTouchEmulationEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EventAuthRequired, EventRequestPaused, FailRequestParams,
    RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::input::{DispatchMouseEventParams, DispatchMouseEventType};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, EventLoadingFailed, EventRequestWillBeSent, EventResponseReceived, Headers,
    ResourceType, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::scripts::navigator_platform;
use crate::human::PointerInput;
use crate::identity::Identity;
use crate::proxy::Proxy;

/// Flags for running in small containers: no sandbox, no /dev/shm, no GPU.
pub const LAUNCH_FLAGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--no-zygote",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-renderer-backgrounding",
    "--disable-backgrounding-occluded-windows",
    "--disable-sync",
    "--mute-audio",
    "--hide-scrollbars",
    "--disable-blink-features=AutomationControlled",
    "--js-flags=--max-old-space-size=512",
];

const BROWSER_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

const EVENT_BUFFER: usize = 256;

/// Locate a Chromium binary. `None` leaves detection to chromiumoxide.
pub fn find_chromium(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        log::warn!("Configured browser path {} does not exist", path.display());
    }

    if let Ok(p) = std::env::var("CHROME_PATH") {
        let path = PathBuf::from(p.trim());
        if path.exists() {
            return Some(path);
        }
    }

    BROWSER_CANDIDATES
        .iter()
        .find_map(|name| which::which(name).ok())
}

/// Something that happened on the page, kept for diagnostics.
#[derive(Debug, Clone)]
enum PageEvent {
    Console(String),
    RequestFailed(FailedRequest),
    ErrorResponse(FailedRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRequest {
    pub url: String,
    pub reason: String,
}

/// Console output and network failures observed during one render.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDiagnostics {
    pub console: Vec<String>,
    pub failed_requests: Vec<FailedRequest>,
    pub error_responses: Vec<FailedRequest>,
}

impl PageDiagnostics {
    fn push(&mut self, event: PageEvent) {
        match event {
            PageEvent::Console(line) => self.console.push(line),
            PageEvent::RequestFailed(f) => self.failed_requests.push(f),
            PageEvent::ErrorResponse(f) => self.error_responses.push(f),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.console.is_empty() && self.failed_requests.is_empty() && self.error_responses.is_empty()
    }
}

/// One browser process plus the context and page opened in it.
///
/// Dropping the session aborts the CDP handler and listener tasks, and
/// dropping the inner `Browser` kills the child process, so an abandoned
/// request never leaves Chromium running.
pub struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    context_id: Option<BrowserContextId>,
    page: Option<Page>,
    events: Option<mpsc::Receiver<PageEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BrowserSession {
    pub async fn launch(chrome_path: Option<&Path>, proxy: Option<&Proxy>) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .disable_default_args()
            .viewport(None)
            .args(LAUNCH_FLAGS.iter().copied());

        if let Some(path) = find_chromium(chrome_path) {
            builder = builder.chrome_executable(path);
        }
        if let Some(proxy) = proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy.server));
        }

        let config = builder
            .build()
            .map_err(|e| anyhow!("failed to launch browser: invalid config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::debug!("CDP handler event error: {}", e);
                }
            }
        });

        Ok(Self {
            browser,
            handler,
            context_id: None,
            page: None,
            events: None,
            tasks: Vec::new(),
        })
    }

    /// Open an isolated context presenting `identity` and return its page.
    pub async fn open_context(&mut self, identity: &Identity) -> Result<Page> {
        let context_id = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .context("failed to create browser context")?
            .result
            .browser_context_id;
        self.context_id = Some(context_id.clone());

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id)
            .build()
            .map_err(|e| anyhow!("invalid target params: {e}"))?;
        let page = self
            .browser
            .new_page(target)
            .await
            .context("failed to open page")?;
        self.page = Some(page.clone());

        apply_identity(&page, identity).await?;
        Ok(page)
    }

    /// Forward console messages and network failures into a bounded channel
    /// drained at teardown.
    pub async fn instrument(&mut self, page: &Page) -> Result<()> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.events = Some(rx);

        let mut console = page.event_listener::<EventConsoleApiCalled>().await?;
        let console_tx = tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(ev) = console.next().await {
                let text = ev
                    .args
                    .iter()
                    .map(|arg| match &arg.value {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(v) => v.to_string(),
                        None => arg.description.clone().unwrap_or_default(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                let line = format!("[{}] {}", format!("{:?}", ev.r#type).to_lowercase(), text);
                let _ = console_tx.try_send(PageEvent::Console(line));
            }
        }));

        let mut sent = page.event_listener::<EventRequestWillBeSent>().await?;
        let mut failed = page.event_listener::<EventLoadingFailed>().await?;
        let failed_tx = tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut urls: HashMap<String, String> = HashMap::new();
            loop {
                tokio::select! {
                    Some(ev) = sent.next() => {
                        urls.insert(ev.request_id.inner().clone(), ev.request.url.clone());
                    }
                    Some(ev) = failed.next() => {
                        let url = urls.remove(ev.request_id.inner()).unwrap_or_default();
                        let _ = failed_tx.try_send(PageEvent::RequestFailed(FailedRequest {
                            url,
                            reason: ev.error_text.clone(),
                        }));
                    }
                    else => break,
                }
            }
        }));

        let mut responses = page.event_listener::<EventResponseReceived>().await?;
        self.tasks.push(tokio::spawn(async move {
            while let Some(ev) = responses.next().await {
                if ev.response.status >= 400 {
                    let _ = tx.try_send(PageEvent::ErrorResponse(FailedRequest {
                        url: ev.response.url.clone(),
                        reason: format!("{} {}", ev.response.status, ev.response.status_text),
                    }));
                }
            }
        }));

        Ok(())
    }

    /// Abort font requests and let everything else through. Answers proxy
    /// auth challenges when the proxy carries credentials.
    pub async fn block_fonts(&mut self, page: &Page, proxy: Option<&Proxy>) -> Result<()> {
        let mut pattern = RequestPattern::default();
        pattern.url_pattern = Some("*".to_string());

        let credentials = proxy
            .filter(|p| p.has_credentials())
            .map(|p| (p.username.clone(), p.password.clone()));

        let mut enable = fetch::EnableParams::default();
        enable.patterns = Some(vec![pattern]);
        enable.handle_auth_requests = Some(credentials.is_some());

        let mut paused = page.event_listener::<EventRequestPaused>().await?;
        let mut auth = page.event_listener::<EventAuthRequired>().await?;
        page.execute(enable)
            .await
            .context("failed to enable request interception")?;

        let page = page.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(ev) = paused.next() => {
                        let outcome = if ev.resource_type == ResourceType::Font {
                            page.execute(FailRequestParams::new(
                                ev.request_id.clone(),
                                ErrorReason::BlockedByClient,
                            ))
                            .await
                            .map(|_| ())
                        } else {
                            page.execute(ContinueRequestParams::new(ev.request_id.clone()))
                                .await
                                .map(|_| ())
                        };
                        if let Err(e) = outcome {
                            log::debug!("Intercepted request not resumed: {}", e);
                        }
                    }
                    Some(ev) = auth.next() => {
                        let mut answer =
                            AuthChallengeResponse::new(AuthChallengeResponseResponse::ProvideCredentials);
                        if let Some((username, password)) = &credentials {
                            answer.username = username.clone();
                            answer.password = password.clone();
                        } else {
                            answer.response = AuthChallengeResponseResponse::CancelAuth;
                        }
                        if let Err(e) = page
                            .execute(ContinueWithAuthParams::new(ev.request_id.clone(), answer))
                            .await
                        {
                            log::debug!("Auth challenge not answered: {}", e);
                        }
                    }
                    else => break,
                }
            }
        }));

        Ok(())
    }

    /// Close page, context and browser. Every failure is logged, never
    /// returned, so teardown cannot mask the error that led here.
    pub async fn teardown(mut self) -> PageDiagnostics {
        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                log::debug!("Page close failed: {}", e);
            }
        }
        if let Some(id) = self.context_id.take() {
            if let Err(e) = self
                .browser
                .execute(DisposeBrowserContextParams::new(id))
                .await
            {
                log::debug!("Browser context dispose failed: {}", e);
            }
        }
        if let Err(e) = self.browser.close().await {
            log::warn!("Browser close failed: {}", e);
        }
        if tokio::time::timeout(Duration::from_secs(5), self.browser.wait())
            .await
            .is_err()
        {
            log::warn!("Browser process did not exit within 5s");
        }
        self.handler.abort();

        let mut diagnostics = PageDiagnostics::default();
        if let Some(mut rx) = self.events.take() {
            while let Ok(event) = rx.try_recv() {
                diagnostics.push(event);
            }
        }
        diagnostics
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.handler.abort();
    }
}

async fn apply_identity(page: &Page, identity: &Identity) -> Result<()> {
    let (width, height) = identity.viewport;
    page.execute(SetDeviceMetricsOverrideParams::new(
        width as i64,
        height as i64,
        identity.device_scale_factor,
        identity.is_mobile,
    ))
    .await
    .context("failed to set viewport")?;

    let mut user_agent = SetUserAgentOverrideParams::new(identity.user_agent);
    user_agent.accept_language = Some(identity.accept_language());
    user_agent.platform = Some(navigator_platform(identity.user_agent));
    page.execute(user_agent)
        .await
        .context("failed to set user agent")?;

    page.execute(SetTimezoneOverrideParams::new(identity.timezone_id))
        .await
        .context("failed to set timezone")?;

    let mut locale = SetLocaleOverrideParams::default();
    locale.locale = Some(identity.locale.to_string());
    page.execute(locale).await.context("failed to set locale")?;

    let mut media = SetEmulatedMediaParams::default();
    media.features = Some(vec![MediaFeature::new(
        "prefers-color-scheme",
        identity.color_scheme,
    )]);
    page.execute(media)
        .await
        .context("failed to set color scheme")?;

    page.execute(SetTouchEmulationEnabledParams::new(identity.has_touch))
        .await
        .context("failed to set touch emulation")?;

    let headers = Headers::new(serde_json::json!({
        "Accept-Language": identity.accept_language(),
        "Upgrade-Insecure-Requests": "1",
    }));
    page.execute(SetExtraHttpHeadersParams::new(headers))
        .await
        .context("failed to set request headers")?;

    Ok(())
}

/// Drives the page's mouse through CDP input events.
pub struct PagePointer<'a> {
    page: &'a Page,
    position: Mutex<(f64, f64)>,
}

impl<'a> PagePointer<'a> {
    pub fn new(page: &'a Page) -> Self {
        Self {
            page,
            position: Mutex::new((0.0, 0.0)),
        }
    }

    fn position(&self) -> (f64, f64) {
        self.position.lock().map(|p| *p).unwrap_or((0.0, 0.0))
    }

    fn set_position(&self, x: f64, y: f64) {
        if let Ok(mut p) = self.position.lock() {
            *p = (x, y);
        }
    }
}

#[async_trait]
impl PointerInput for PagePointer<'_> {
    async fn wheel(&self, delta_y: f64) -> Result<()> {
        let (x, y) = self.position();
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x)
            .y(y)
            .delta_x(0.0)
            .delta_y(delta_y)
            .build()
            .map_err(|e| anyhow!("invalid wheel event: {e}"))?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn move_pointer(&self, x: f64, y: f64, steps: u32) -> Result<()> {
        let (from_x, from_y) = self.position();
        let steps = steps.max(1);
        for i in 1..=steps {
            let t = i as f64 / steps as f64;
            let params = DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseMoved)
                .x(from_x + (x - from_x) * t)
                .y(from_y + (y - from_y) * t)
                .build()
                .map_err(|e| anyhow!("invalid mouse event: {e}"))?;
            self.page.execute(params).await?;
        }
        self.set_position(x, y);
        Ok(())
    }
}
