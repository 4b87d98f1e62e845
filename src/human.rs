//! Randomised, time-bounded scroll and pointer activity.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Probability of a small corrective scroll back up after each pass.
const CORRECTION_PROBABILITY: f64 = 0.18;

/// Low-level input a page can receive.
#[async_trait]
pub trait PointerInput: Send + Sync {
    async fn wheel(&self, delta_y: f64) -> Result<()>;
    async fn move_pointer(&self, x: f64, y: f64, steps: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ScrollOptions {
    pub passes: u32,
    pub min_step: u32,
    pub max_step: u32,
    pub min_pause_ms: u64,
    pub max_pause_ms: u64,
}

impl Default for ScrollOptions {
    fn default() -> Self {
        Self {
            passes: 8,
            min_step: 200,
            max_step: 800,
            min_pause_ms: 150,
            max_pause_ms: 700,
        }
    }
}

fn random_between(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    rand::rng().random_range(min..=max)
}

/// Sleep for a uniformly random duration in `[min_ms, max_ms]`.
pub async fn jitter_delay(min_ms: u64, max_ms: u64) {
    sleep(Duration::from_millis(random_between(min_ms, max_ms))).await;
}

/// Scroll down in `passes` randomised steps, sometimes nudging back up a little.
pub async fn human_scroll(page: &dyn PointerInput, opts: ScrollOptions) -> Result<()> {
    for _ in 0..opts.passes {
        let step = random_between(opts.min_step as u64, opts.max_step as u64) as f64;
        page.wheel(step).await?;
        jitter_delay(opts.min_pause_ms, opts.max_pause_ms).await;

        let correction = {
            let mut rng = rand::rng();
            rng.random_bool(CORRECTION_PROBABILITY)
                .then(|| (step * rng.random_range(0.1..=0.3)).round())
        };
        if let Some(back) = correction {
            page.wheel(-back).await?;
            jitter_delay(80, 180).await;
        }
    }
    Ok(())
}

/// Move the pointer around a random origin until `duration` of wall-clock time passed.
pub async fn mouse_wiggle(page: &dyn PointerInput, duration: Duration) -> Result<()> {
    const BOX_W: f64 = 300.0;
    const BOX_H: f64 = 200.0;

    let start = Instant::now();
    let (origin_x, origin_y) = {
        let mut rng = rand::rng();
        (
            rng.random_range(100..=600) as f64,
            rng.random_range(100..=400) as f64,
        )
    };
    page.move_pointer(origin_x, origin_y, 1).await?;

    while start.elapsed() < duration {
        let (x, y, steps) = {
            let mut rng = rand::rng();
            (
                origin_x + rng.random_range(-BOX_W / 2.0..=BOX_W / 2.0).round(),
                origin_y + rng.random_range(-BOX_H / 2.0..=BOX_H / 2.0).round(),
                rng.random_range(2..=6),
            )
        };
        page.move_pointer(x, y, steps).await?;
        jitter_delay(30, 120).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        wheels: Mutex<Vec<f64>>,
        moves: Mutex<Vec<(f64, f64)>>,
    }

    #[async_trait]
    impl PointerInput for Recorder {
        async fn wheel(&self, delta_y: f64) -> Result<()> {
            self.wheels.lock().unwrap().push(delta_y);
            Ok(())
        }

        async fn move_pointer(&self, x: f64, y: f64, _steps: u32) -> Result<()> {
            self.moves.lock().unwrap().push((x, y));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_jitter_delay_bounds() {
        let start = Instant::now();
        jitter_delay(20, 40).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_human_scroll_is_bounded() {
        let page = Recorder::default();
        let opts = ScrollOptions {
            passes: 5,
            min_step: 200,
            max_step: 400,
            min_pause_ms: 1,
            max_pause_ms: 2,
        };
        human_scroll(&page, opts).await.unwrap();

        let wheels = page.wheels.lock().unwrap();
        let downs: Vec<_> = wheels.iter().filter(|d| **d > 0.0).collect();
        assert_eq!(downs.len(), 5);
        assert!(downs.iter().all(|d| (200.0..=400.0).contains(*d)));
        // corrective scrolls are at most 30% of the largest step
        assert!(wheels.iter().filter(|d| **d < 0.0).all(|d| d.abs() <= 120.0));
        assert!(wheels.len() <= 10);
    }

    #[tokio::test]
    async fn test_mouse_wiggle_stays_near_origin() {
        let page = Recorder::default();
        let start = Instant::now();
        mouse_wiggle(&page, Duration::from_millis(150)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));

        let moves = page.moves.lock().unwrap();
        assert!(moves.len() >= 2);
        let (ox, oy) = moves[0];
        assert!((100.0..=600.0).contains(&ox));
        for (x, y) in moves.iter().skip(1) {
            assert!((x - ox).abs() <= 150.0);
            assert!((y - oy).abs() <= 100.0);
        }
    }

    #[test]
    fn test_random_between_degenerate_range() {
        assert_eq!(random_between(5, 5), 5);
        assert_eq!(random_between(9, 3), 9);
    }
}
