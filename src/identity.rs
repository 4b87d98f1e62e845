use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A consistent set of browser-observable attributes presented together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub id: &'static str,
    pub user_agent: &'static str,
    pub viewport: (u32, u32),
    pub locale: &'static str,
    pub timezone_id: &'static str,
    pub color_scheme: &'static str,
    pub device_scale_factor: f64,
    pub is_mobile: bool,
    pub has_touch: bool,
}

impl Identity {
    /// Value for `Accept-Language`, derived from the locale.
    pub fn accept_language(&self) -> String {
        let primary = self.locale.split('-').next().unwrap_or(self.locale);
        format!("{},{};q=0.9", self.locale, primary)
    }
}

pub const IDENTITIES: &[Identity] = &[
    Identity {
        id: "id1",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        viewport: (1366, 768),
        locale: "en-US",
        timezone_id: "America/New_York",
        color_scheme: "light",
        device_scale_factor: 1.0,
        is_mobile: false,
        has_touch: false,
    },
    Identity {
        id: "id2",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_4) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
        viewport: (1440, 900),
        locale: "en-US",
        timezone_id: "America/Los_Angeles",
        color_scheme: "light",
        device_scale_factor: 2.0,
        is_mobile: false,
        has_touch: false,
    },
    Identity {
        id: "id3",
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
        viewport: (1280, 800),
        locale: "en-GB",
        timezone_id: "Europe/London",
        color_scheme: "light",
        device_scale_factor: 1.0,
        is_mobile: false,
        has_touch: false,
    },
];

/// Round-robin over a fixed fingerprint pool. Collisions between concurrent
/// callers are fine, fingerprints are reused on purpose.
pub struct IdentityPool {
    identities: &'static [Identity],
    counter: AtomicUsize,
}

impl IdentityPool {
    pub fn new() -> Self {
        Self::with_identities(IDENTITIES)
    }

    pub fn with_identities(identities: &'static [Identity]) -> Self {
        assert!(!identities.is_empty(), "identity pool cannot be empty");
        Self {
            identities,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> &'static Identity {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        &self.identities[n % self.identities.len()]
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::new()
    }
}
