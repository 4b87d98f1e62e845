use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use url::Url;

pub const DEFAULT_STICKY_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
pub const MAX_COOLDOWN: Duration = Duration::from_secs(5 * 60);

static BLOCKING_SIGNAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timeout|blocked|429|captcha").expect("valid regex"));

/// An egress proxy parsed from the pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proxy {
    pub id: String,
    /// `scheme://host[:port]`, suitable for `--proxy-server`.
    pub server: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Proxy {
    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }
}

#[derive(Debug, Clone)]
struct ProxyHealth {
    healthy: bool,
    last_failure: Option<Instant>,
    cooldown: Duration,
}

impl ProxyHealth {
    fn cooling_down(&self, now: Instant) -> bool {
        match self.last_failure {
            Some(at) => now.duration_since(at) < self.cooldown,
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
struct StickyAssignment {
    index: usize,
    expires_at: Instant,
}

#[derive(Debug)]
struct ProxyState {
    health: Vec<ProxyHealth>,
    next_index: usize,
    sticky: HashMap<String, StickyAssignment>,
}

/// Domain-sticky proxy rotation with health tracking.
///
/// All mutable state sits behind one lock, so a pick and the sticky write that
/// follows it are a single step for concurrent callers.
pub struct ProxyManager {
    proxies: Vec<Proxy>,
    sticky_ttl: Duration,
    state: Mutex<ProxyState>,
}

impl ProxyManager {
    pub fn new(proxies: Vec<Proxy>, sticky_ttl: Duration) -> Self {
        Self::with_cooldown(proxies, sticky_ttl, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(proxies: Vec<Proxy>, sticky_ttl: Duration, cooldown: Duration) -> Self {
        let health = proxies
            .iter()
            .map(|_| ProxyHealth {
                healthy: true,
                last_failure: None,
                cooldown,
            })
            .collect();

        Self {
            proxies,
            sticky_ttl,
            state: Mutex::new(ProxyState {
                health,
                next_index: 0,
                sticky: HashMap::new(),
            }),
        }
    }

    /// Parse a comma-separated list of proxy URLs. Unparseable entries are skipped.
    pub fn from_pool_str(pool: &str, sticky_ttl: Duration) -> Self {
        Self::new(parse_proxy_pool(pool), sticky_ttl)
    }

    pub fn has_proxies(&self) -> bool {
        !self.proxies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next eligible proxy after the last one handed out.
    pub fn pick_next(&self) -> Option<Proxy> {
        let mut state = self.lock();
        self.pick_index(&mut state).map(|i| self.proxies[i].clone())
    }

    fn pick_index(&self, state: &mut ProxyState) -> Option<usize> {
        if self.proxies.is_empty() {
            return None;
        }

        let now = Instant::now();
        let start = state.next_index;
        for _ in 0..self.proxies.len() {
            let index = state.next_index;
            state.next_index = (state.next_index + 1) % self.proxies.len();

            let health = &mut state.health[index];
            if !health.healthy {
                if health.cooling_down(now) {
                    continue;
                }
                health.healthy = true;
            }
            return Some(index);
        }

        // Everything is cooling down; better a tired proxy than none.
        Some(start)
    }

    /// Sticky proxy for `domain`, picking a fresh one once the assignment expired.
    pub fn for_domain(&self, domain: &str) -> Option<Proxy> {
        let mut state = self.lock();
        if let Some(assignment) = state.sticky.get(domain) {
            if assignment.expires_at > Instant::now() {
                return Some(self.proxies[assignment.index].clone());
            }
        }
        self.assign(&mut state, domain)
    }

    /// Force a new assignment for `domain`, replacing any sticky entry.
    pub fn rotate_for_domain(&self, domain: &str) -> Option<Proxy> {
        let mut state = self.lock();
        self.assign(&mut state, domain)
    }

    fn assign(&self, state: &mut ProxyState, domain: &str) -> Option<Proxy> {
        let index = self.pick_index(state)?;
        let now = Instant::now();
        state.sticky.retain(|_, a| a.expires_at > now);
        state.sticky.insert(
            domain.to_string(),
            StickyAssignment {
                index,
                expires_at: now + self.sticky_ttl,
            },
        );
        log::debug!("Assigned proxy {} to {}", self.proxies[index].id, domain);
        Some(self.proxies[index].clone())
    }

    pub fn report_success(&self, proxy_id: &str) {
        let mut state = self.lock();
        if let Some(index) = self.position(proxy_id) {
            state.health[index].healthy = true;
        }
    }

    /// Mark a proxy unhealthy. Blocking signals in `reason` double its cooldown,
    /// capped at five minutes.
    pub fn report_failure(&self, proxy_id: &str, reason: &str) {
        let mut state = self.lock();
        let Some(index) = self.position(proxy_id) else {
            return;
        };

        let health = &mut state.health[index];
        health.healthy = false;
        health.last_failure = Some(Instant::now());
        if is_blocking_signal(reason) {
            health.cooldown = (health.cooldown * 2).min(MAX_COOLDOWN);
        }

        log::warn!(
            "Proxy {} marked unhealthy for {:?}: {}",
            proxy_id,
            health.cooldown,
            reason
        );
    }

    /// Domains with a live or not yet pruned sticky assignment.
    pub fn sticky_len(&self) -> usize {
        self.lock().sticky.len()
    }

    pub fn cooldown(&self, proxy_id: &str) -> Option<Duration> {
        let state = self.lock();
        self.position(proxy_id).map(|i| state.health[i].cooldown)
    }

    pub fn is_healthy(&self, proxy_id: &str) -> Option<bool> {
        let state = self.lock();
        self.position(proxy_id).map(|i| state.health[i].healthy)
    }

    fn position(&self, proxy_id: &str) -> Option<usize> {
        self.proxies.iter().position(|p| p.id == proxy_id)
    }
}

pub fn is_blocking_signal(reason: &str) -> bool {
    BLOCKING_SIGNAL.is_match(reason)
}

pub fn parse_proxy_pool(pool: &str) -> Vec<Proxy> {
    pool.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .filter_map(|(idx, raw)| {
            let parsed = match Url::parse(raw) {
                Ok(u) => u,
                Err(e) => {
                    log::warn!("Ignoring invalid proxy entry #{}: {}", idx + 1, e);
                    return None;
                }
            };
            let host = parsed.host_str()?;
            let server = match parsed.port() {
                Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
                None => format!("{}://{}", parsed.scheme(), host),
            };
            let username = Some(parsed.username())
                .filter(|u| !u.is_empty())
                .map(str::to_string);

            Some(Proxy {
                id: format!("p{}", idx + 1),
                server,
                username,
                password: parsed.password().map(str::to_string),
            })
        })
        .collect()
}
