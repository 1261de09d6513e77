//! Scalar liveness timer driven by the reactor's `sync(dt)` tick.

/// A counter that accumulates elapsed time while enabled.
///
/// Disabled timers hold zero, so `resume` always measures from the moment
/// of resumption rather than from stale state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    value: f32,
    enabled: bool,
}

impl Timer {
    pub fn new(enabled: bool) -> Self {
        Self {
            value: 0.0,
            enabled,
        }
    }

    /// Elapsed time since the last reset, zero while disabled.
    pub fn get(&self) -> f32 {
        self.value
    }

    /// Remaining time until `interval` elapses.
    pub fn compare(&self, interval: f32) -> f32 {
        interval - self.value
    }

    /// True when enabled and at least `interval` has accumulated.
    pub fn test(&self, interval: f32) -> bool {
        self.enabled && self.compare(interval) <= 0.0
    }

    /// Enable or disable; disabling clears the accumulated value.
    pub fn resume(&mut self, enable: bool) {
        if self.enabled != enable {
            self.enabled = enable;
            if !enable {
                self.reset();
            }
        }
    }

    pub fn suspend(&mut self) {
        self.resume(false);
    }

    /// Advance by `dt` seconds; a no-op while disabled.
    pub fn update(&mut self, dt: f32) {
        if self.enabled {
            self.value += dt;
        }
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_only_while_enabled() {
        let mut timer = Timer::new(false);
        timer.update(5.0);
        assert_eq!(timer.get(), 0.0);

        timer.resume(true);
        timer.update(5.0);
        timer.update(2.5);
        assert_eq!(timer.get(), 7.5);
    }

    #[test]
    fn test_fires_at_threshold() {
        let mut timer = Timer::new(true);
        timer.update(7.9);
        assert!(!timer.test(8.0));
        timer.update(0.1);
        assert!(timer.test(8.0));
    }

    #[test]
    fn disabled_never_fires() {
        let mut timer = Timer::new(true);
        timer.update(100.0);
        timer.suspend();
        assert!(!timer.test(8.0));
        assert_eq!(timer.get(), 0.0);
    }

    #[test]
    fn monotone_until_reset() {
        let mut timer = Timer::new(true);
        let mut previous = 0.0;
        let mut fired = 0;
        for _ in 0..100 {
            timer.update(0.5);
            assert!(timer.get() >= previous);
            previous = timer.get();
            if timer.test(12.5) {
                fired += 1;
                timer.reset();
                previous = 0.0;
            }
        }
        // 50 seconds of updates, firing every 12.5 seconds.
        assert_eq!(fired, 4);
    }

    #[test]
    fn resume_is_edge_triggered() {
        let mut timer = Timer::new(true);
        timer.update(3.0);
        // Resuming an already-enabled timer keeps the accumulated value.
        timer.resume(true);
        assert_eq!(timer.get(), 3.0);
    }
}
