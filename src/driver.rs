use crate::config::{EngineConfig, ParticleShape};
use crate::emitter::{self, EmitterParams};
use crate::frame_clock::{ActiveRamp, FrameClock, Pace};

/// Token for the one pending frame callback. Firing consumes it and arms the
/// next one, cancelling drops it for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct RenderParams {
    pub resolution: [f32; 2],
    pub particle_size: f32,
    pub shape: ParticleShape,
    pub background_color: [f32; 4],
}

impl Default for RenderParams {
    fn default() -> Self {
        RenderParams {
            resolution: [1.0, 1.0],
            particle_size: 0.0,
            shape: ParticleShape::default(),
            background_color: [0.0; 4],
        }
    }
}

/// Everything one frame reads from the configuration, taken once at the
/// start of the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    pub dt: f32,
    pub active_count: u32,
    pub seed: u32,
    pub emitter: EmitterParams,
    pub render: RenderParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameStart {
    /// The callback was cancelled, nothing may touch the device.
    Cancelled,
    /// Held back by the fps limit.
    Skipped,
    Run(FrameSnapshot),
}

/// Host side frame bookkeeping: pacing, the active count ramp and the
/// per frame spawn seed.
#[derive(Debug, Clone)]
pub struct FrameDriver {
    clock: FrameClock,
    ramp: ActiveRamp,
    armed: Option<FrameHandle>,
    frame_index: u32,
    seed_base: u32,
}

impl FrameDriver {
    pub fn new(start_ms: f64, seed_base: u32) -> Self {
        FrameDriver {
            clock: FrameClock::starting_at(start_ms),
            ramp: ActiveRamp::default(),
            armed: Some(FrameHandle(0)),
            frame_index: 0,
            seed_base,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn cancel(&mut self) -> Option<FrameHandle> {
        self.armed.take()
    }

    pub fn active_count(&self) -> u32 {
        self.ramp.count()
    }

    pub fn begin_frame(
        &mut self,
        now_ms: f64,
        config: &EngineConfig,
        width: u32,
        height: u32,
    ) -> FrameStart {
        let handle = match self.armed.take() {
            Some(handle) => handle,
            None => return FrameStart::Cancelled,
        };
        self.armed = Some(FrameHandle(handle.0 + 1));

        let dt = match self.clock.tick(now_ms, config.fps_limit) {
            Pace::Skip => return FrameStart::Skipped,
            Pace::Advance(dt) => dt,
        };
        let active_count = self.ramp.update(
            dt,
            config.emission_rate,
            config.particle_life,
            config.max_particles,
        );
        let seed = emitter::pcg(self.seed_base ^ emitter::pcg(self.frame_index));
        self.frame_index = self.frame_index.wrapping_add(1);

        FrameStart::Run(FrameSnapshot {
            dt,
            active_count,
            seed,
            emitter: EmitterParams::resolve(config, width, height),
            render: RenderParams {
                resolution: [width.max(1) as f32, height.max(1) as f32],
                particle_size: config.particle_size.max(0.0),
                shape: config.particle_shape,
                background_color: config.background_color,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigPatch;
    use crate::emitter::HostRandom;
    use crate::frame_clock::MAX_DT;
    use crate::particle_store::ParticleStore;
    use crate::stepper::step_particles;

    fn run(driver: &mut FrameDriver, config: &EngineConfig, now_ms: f64) -> FrameSnapshot {
        match driver.begin_frame(now_ms, config, 640, 480) {
            FrameStart::Run(snapshot) => snapshot,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn cancel_stops_frames() {
        let config = EngineConfig::default();
        let mut driver = FrameDriver::new(0.0, 1);
        assert!(driver.is_armed());
        run(&mut driver, &config, 20.0);
        assert!(driver.is_armed());
        assert!(driver.cancel().is_some());
        assert!(!driver.is_armed());
        for i in 0..10 {
            assert_eq!(
                driver.begin_frame(40.0 + i as f64 * 20.0, &config, 640, 480),
                FrameStart::Cancelled
            );
        }
        assert!(driver.cancel().is_none());
    }

    #[test]
    fn skipped_frames_stay_armed() {
        let config = EngineConfig {
            fps_limit: 30.0,
            ..EngineConfig::default()
        };
        let mut driver = FrameDriver::new(0.0, 1);
        assert_eq!(
            driver.begin_frame(10.0, &config, 640, 480),
            FrameStart::Skipped
        );
        assert!(driver.is_armed());
        assert_eq!(driver.active_count(), 0);
        let snapshot = run(&mut driver, &config, 50.0);
        assert_eq!(snapshot.active_count, 250);
    }

    #[test]
    fn snapshot_resolves_config() {
        let config = EngineConfig {
            fps_limit: 0.0,
            particle_size: 4.0,
            particle_shape: ParticleShape::Square,
            ..EngineConfig::default()
        };
        let mut driver = FrameDriver::new(0.0, 1);
        let snapshot = run(&mut driver, &config, 100.0);
        assert_eq!(snapshot.dt, MAX_DT);
        assert_eq!(snapshot.active_count, 500);
        assert_eq!(snapshot.emitter.origin, [320.0, 240.0]);
        assert_eq!(snapshot.render.resolution, [640.0, 480.0]);
        assert_eq!(snapshot.render.particle_size, 4.0);
        assert_eq!(snapshot.render.shape, ParticleShape::Square);
    }

    #[test]
    fn seeds_change_every_frame() {
        let config = EngineConfig {
            fps_limit: 0.0,
            ..EngineConfig::default()
        };
        let mut driver = FrameDriver::new(0.0, 7);
        let a = run(&mut driver, &config, 10.0);
        let b = run(&mut driver, &config, 20.0);
        assert_ne!(a.seed, b.seed);
    }

    #[test]
    fn empty_patch_keeps_trajectories() {
        let config = EngineConfig {
            max_particles: 2000,
            ..EngineConfig::default()
        };
        let mut patched = config.clone();

        let mut plain_driver = FrameDriver::new(0.0, 11);
        let mut patched_driver = FrameDriver::new(0.0, 11);
        let mut plain_store = ParticleStore::allocate(config.max_particles);
        let mut patched_store = ParticleStore::allocate(config.max_particles);
        let mut plain_rng = HostRandom::seeded(5);
        let mut patched_rng = HostRandom::seeded(5);

        for frame in 1..120 {
            let now_ms = frame as f64 * 17.0;
            if frame % 10 == 0 {
                assert!(patched.apply(ConfigPatch::default()).is_empty());
            }
            let a = run(&mut plain_driver, &config, now_ms);
            let b = run(&mut patched_driver, &patched, now_ms);
            assert_eq!(a, b);
            step_particles(plain_store.active_mut(a.active_count), a.dt, &a.emitter, &mut plain_rng);
            step_particles(patched_store.active_mut(b.active_count), b.dt, &b.emitter, &mut patched_rng);
        }
        assert_eq!(plain_store.particles(), patched_store.particles());
    }
}
