// src/search/time.rs
//
// Time budgeting with soft/hard bounds. The iterative-deepening loop owns
// the dynamic factors (falling eval, best-move stability, instability); this
// type just turns the clock situation into an optimum and a maximum budget
// and answers elapsed-time queries.

use std::time::Instant;

use crate::search::Limits;

#[derive(Clone, Copy)]
pub struct TimeManager {
    start_time: Instant,
    /// Soft bound in ms: the budget the dynamic factors scale.
    optimum_ms: f64,
    /// Hard bound in ms: never exceeded while managed time is in use.
    maximum_ms: f64,
    use_time_management: bool,
}

impl TimeManager {
    pub fn new(limits: &Limits, is_white: bool, game_ply: u32) -> TimeManager {
        let start_time = limits.start_time.unwrap_or_else(Instant::now);
        let (time_ms, inc_ms) = if is_white {
            (limits.wtime as f64, limits.winc as f64)
        } else {
            (limits.btime as f64, limits.binc as f64)
        };

        if time_ms <= 0.0 {
            return TimeManager {
                start_time,
                optimum_ms: f64::MAX,
                maximum_ms: f64::MAX,
                use_time_management: false,
            };
        }

        let overhead = limits.move_overhead as f64;
        let mtg = if limits.movestogo > 0 {
            limits.movestogo as f64
        } else {
            // Sudden death: assume the game tapers off as it progresses.
            (50.0 - game_ply as f64 * 0.4).clamp(20.0, 50.0)
        };

        let time_left = (time_ms + inc_ms * (mtg - 1.0) - overhead * mtg).max(1.0);

        let (opt, max) = if limits.movestogo == 0 {
            let ply_factor = (0.015 + (game_ply as f64 + 3.0).powf(0.45) * 0.01).min(0.20);
            let opt = ply_factor * time_left;
            let max = (5.5 * opt).min(0.80 * time_ms - overhead);
            (opt, max)
        } else {
            let opt = (0.90 + game_ply as f64 / 120.0).min(0.90) * time_left / mtg;
            let max = (1.5 + 0.12 * mtg) * opt;
            (opt, max)
        };

        let optimum = opt.max(10.0);
        let maximum = max.max(optimum).min((time_ms - overhead).max(10.0));

        TimeManager {
            start_time,
            optimum_ms: optimum,
            maximum_ms: maximum,
            use_time_management: true,
        }
    }

    /// Fixed-time and infinite searches bypass the budget entirely.
    pub fn unmanaged(limits: &Limits) -> TimeManager {
        TimeManager {
            start_time: limits.start_time.unwrap_or_else(Instant::now),
            optimum_ms: f64::MAX,
            maximum_ms: f64::MAX,
            use_time_management: false,
        }
    }

    #[inline]
    pub fn use_time_management(&self) -> bool {
        self.use_time_management
    }

    #[inline]
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn optimum(&self) -> f64 {
        self.optimum_ms
    }

    #[inline]
    pub fn maximum(&self) -> f64 {
        self.maximum_ms
    }

    /// Hard stop, checked from the node loop on the main thread.
    #[inline]
    pub fn past_maximum(&self) -> bool {
        self.use_time_management && (self.elapsed_ms() as f64) >= self.maximum_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits_with_clock(wtime: u64, winc: u64) -> Limits {
        Limits {
            wtime,
            winc,
            ..Limits::default()
        }
    }

    #[test]
    fn budgets_are_ordered_and_bounded() {
        let limits = limits_with_clock(60_000, 600);
        let tm = TimeManager::new(&limits, true, 20);
        assert!(tm.use_time_management());
        assert!(tm.optimum() >= 10.0);
        assert!(tm.maximum() >= tm.optimum());
        assert!(tm.maximum() <= 60_000.0);
    }

    #[test]
    fn more_clock_means_more_time() {
        let small = TimeManager::new(&limits_with_clock(10_000, 0), true, 20);
        let large = TimeManager::new(&limits_with_clock(600_000, 0), true, 20);
        assert!(large.optimum() > small.optimum());
    }

    #[test]
    fn unmanaged_never_stops() {
        let tm = TimeManager::unmanaged(&Limits::default());
        assert!(!tm.use_time_management());
        assert!(!tm.past_maximum());
    }
}
