use log::trace;

/// Longest step a single frame may take, in seconds. Longer gaps (a hidden
/// window, a debugger pause) are absorbed instead of simulated.
pub const MAX_DT: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pace {
    /// Too early for the fps limit. Nothing is simulated and the clock keeps
    /// accumulating.
    Skip,
    /// Simulate this many seconds.
    Advance(f32),
}

/// Frame pacing on millisecond timestamps.
#[derive(Debug, Clone)]
pub struct FrameClock {
    last_ms: f64,
}

impl FrameClock {
    pub fn starting_at(now_ms: f64) -> Self {
        FrameClock { last_ms: now_ms }
    }

    pub fn tick(&mut self, now_ms: f64, fps_limit: f32) -> Pace {
        let elapsed = ((now_ms - self.last_ms) / 1000.0).max(0.0);
        if fps_limit > 0.0 {
            let target = 1.0 / fps_limit as f64;
            if elapsed < target {
                return Pace::Skip;
            }
            let dt = elapsed.min(MAX_DT as f64);
            // Keep the remainder so the limiter stays in phase with the display.
            self.last_ms = now_ms - (dt % target) * 1000.0;
            trace!("dt: {}, carried: {}ms", dt, now_ms - self.last_ms);
            Pace::Advance(dt as f32)
        } else {
            self.last_ms = now_ms;
            Pace::Advance(elapsed.min(MAX_DT as f64) as f32)
        }
    }
}

/// The real valued active particle counter. It grows at the emission rate
/// towards `min(rate * life, max)` and snaps down when the target drops.
#[derive(Debug, Clone, Default)]
pub struct ActiveRamp {
    value: f64,
}

impl ActiveRamp {
    pub fn target(emission_rate: f32, particle_life: f32, max_particles: u32) -> f64 {
        let target = emission_rate.max(0.0) as f64 * particle_life.max(0.0) as f64;
        target.min(max_particles as f64)
    }

    pub fn update(
        &mut self,
        dt: f32,
        emission_rate: f32,
        particle_life: f32,
        max_particles: u32,
    ) -> u32 {
        let target = ActiveRamp::target(emission_rate, particle_life, max_particles);
        if self.value < target {
            self.value = (self.value + emission_rate.max(0.0) as f64 * dt as f64).min(target);
        } else if self.value > target {
            // Excess particles vanish at once, there is no fade out.
            self.value = target;
        }
        self.count()
    }

    pub fn count(&self) -> u32 {
        self.value.floor() as u32
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}
