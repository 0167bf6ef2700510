use crate::config::EngineConfig;
use crate::particle_store::Particle;
use rand::{Rng, SeedableRng};

/// Lives shorter than this are raised to it so `age >= life` stays meaningful.
pub const MIN_LIFE: f32 = 1e-3;

/// A stream of uniform numbers in [0, 1). The emitter is written once against
/// this, the host and the device differ only in where the numbers come from.
pub trait RandomSource {
    fn next_unit(&mut self) -> f32;
}

/// Host randomness for the host stepped variant.
pub struct HostRandom {
    rng: rand::rngs::StdRng,
}

impl HostRandom {
    pub fn from_entropy() -> Self {
        HostRandom {
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        HostRandom {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for HostRandom {
    fn next_unit(&mut self) -> f32 {
        self.rng.gen::<f32>()
    }
}

/// PCG hash, bit-identical to `pcg` in `_random.wgsl`.
pub fn pcg(input: u32) -> u32 {
    let state = input.wrapping_mul(747796405).wrapping_add(2891336453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277803737);
    (word >> 22) ^ word
}

/// Stateless per slot randomness, the host mirror of the update shader's.
#[derive(Debug, Clone, Copy)]
pub struct HashRandom {
    state: u32,
}

impl HashRandom {
    pub fn new(seed: u32, index: u32) -> Self {
        HashRandom {
            state: pcg(seed ^ pcg(index)),
        }
    }
}

impl RandomSource for HashRandom {
    fn next_unit(&mut self) -> f32 {
        self.state = pcg(self.state);
        (self.state >> 8) as f32 / 16777216.0
    }
}

/// Spawn parameters in surface pixels and radians, resolved once per frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmitterParams {
    pub origin: [f32; 2],
    pub extent: [f32; 2],
    pub angle: f32,
    pub spread: f32,
    pub speed: f32,
    pub life: f32,
}

impl EmitterParams {
    pub fn resolve(config: &EngineConfig, width: u32, height: u32) -> Self {
        let (width, height) = (width as f32, height as f32);
        EmitterParams {
            origin: [
                config.emitter_position.x * width,
                config.emitter_position.y * height,
            ],
            extent: [
                config.emitter_size.x.max(0.0) * width,
                config.emitter_size.y.max(0.0) * height,
            ],
            angle: config.emitter_angle.to_radians(),
            spread: config.emitter_spread.max(0.0).to_radians(),
            speed: config.particle_speed.max(0.0),
            life: if config.particle_life.is_nan() {
                MIN_LIFE
            } else {
                config.particle_life.max(MIN_LIFE)
            },
        }
    }
}

/// Produces a freshly born particle. Draws are taken in a fixed order so the
/// device shader can reproduce them.
pub fn spawn<R: RandomSource>(params: &EmitterParams, rng: &mut R) -> Particle {
    let jitter_x = rng.next_unit();
    let jitter_y = rng.next_unit();
    let turn = rng.next_unit();
    let boost = rng.next_unit();
    let extra_life = rng.next_unit();

    let direction = params.angle + (turn - 0.5) * params.spread;
    let speed = params.speed + boost * params.speed * 0.5;
    Particle {
        position: [
            params.origin[0] + (jitter_x - 0.5) * params.extent[0],
            params.origin[1] + (jitter_y - 0.5) * params.extent[1],
        ],
        velocity: [direction.cos() * speed, direction.sin() * speed],
        age: 0.0,
        life: params.life + extra_life * params.life * 0.5,
    }
}

/// Deterministic spawn for slot `index` under a frame `seed`.
pub fn spawn_at(index: u32, seed: u32, params: &EmitterParams) -> Particle {
    spawn(params, &mut HashRandom::new(seed, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Vec2;

    struct Scripted(Vec<f32>);

    impl RandomSource for Scripted {
        fn next_unit(&mut self) -> f32 {
            self.0.remove(0)
        }
    }

    fn params() -> EmitterParams {
        EmitterParams {
            origin: [100.0, 50.0],
            extent: [20.0, 10.0],
            angle: 0.0,
            spread: std::f32::consts::FRAC_PI_2,
            speed: 100.0,
            life: 2.0,
        }
    }

    #[test]
    fn draws_map_to_fields() {
        let p = spawn(&params(), &mut Scripted(vec![0.5, 0.5, 0.5, 0.0, 0.0]));
        assert_eq!(p.position, [100.0, 50.0]);
        assert_eq!(p.velocity, [100.0, 0.0]);
        assert_eq!(p.age, 0.0);
        assert_eq!(p.life, 2.0);

        let p = spawn(&params(), &mut Scripted(vec![0.0, 1.0, 0.5, 1.0, 1.0]));
        assert_eq!(p.position, [90.0, 55.0]);
        assert_eq!(p.velocity, [150.0, 0.0]);
        assert_eq!(p.life, 3.0);
    }

    #[test]
    fn host_distribution_bounds() {
        let params = params();
        let mut rng = HostRandom::seeded(7);
        for _ in 0..10000 {
            let p = spawn(&params, &mut rng);
            assert!(p.position[0] >= 90.0 && p.position[0] <= 110.0);
            assert!(p.position[1] >= 45.0 && p.position[1] <= 55.0);
            let speed = (p.velocity[0].powi(2) + p.velocity[1].powi(2)).sqrt();
            assert!(speed >= 100.0 - 1e-3 && speed <= 150.0 + 1e-3, "{}", speed);
            let direction = p.velocity[1].atan2(p.velocity[0]);
            assert!(direction.abs() <= std::f32::consts::FRAC_PI_4 + 1e-5);
            assert!(p.life >= 2.0 && p.life <= 3.0);
            assert_eq!(p.age, 0.0);
        }
    }

    #[test]
    fn hash_distribution_bounds() {
        let params = params();
        let mut sum = 0.0;
        for index in 0..10000 {
            let p = spawn_at(index, 1234, &params);
            assert!(p.life >= 2.0 && p.life <= 3.0);
            assert!(p.position[0] >= 90.0 && p.position[0] <= 110.0);
            sum += p.life;
        }
        // Mean of uniform [2, 3].
        let mean = sum / 10000.0;
        assert!((mean - 2.5).abs() < 0.05, "{}", mean);
    }

    #[test]
    fn hash_spawn_is_bit_reproducible() {
        let params = params();
        for index in [0, 1, 17, 99999].iter() {
            let a = spawn_at(*index, 42, &params);
            let b = spawn_at(*index, 42, &params);
            assert_eq!(a.position[0].to_bits(), b.position[0].to_bits());
            assert_eq!(a.position[1].to_bits(), b.position[1].to_bits());
            assert_eq!(a.velocity[0].to_bits(), b.velocity[0].to_bits());
            assert_eq!(a.velocity[1].to_bits(), b.velocity[1].to_bits());
            assert_eq!(a.life.to_bits(), b.life.to_bits());
        }
        assert_ne!(spawn_at(3, 42, &params), spawn_at(4, 42, &params));
        assert_ne!(spawn_at(3, 42, &params), spawn_at(3, 43, &params));
    }

    #[test]
    fn hash_units_stay_below_one() {
        let mut rng = HashRandom::new(u32::MAX, u32::MAX);
        for _ in 0..100000 {
            let u = rng.next_unit();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn resolve_to_pixels() {
        let config = EngineConfig {
            emitter_position: Vec2::new(0.25, 0.5),
            emitter_size: Vec2::new(0.1, -1.0),
            emitter_angle: 180.0,
            emitter_spread: 90.0,
            particle_speed: -5.0,
            particle_life: 0.0,
            ..EngineConfig::default()
        };
        let params = EmitterParams::resolve(&config, 800, 600);
        assert_eq!(params.origin, [200.0, 300.0]);
        assert_eq!(params.extent, [80.0, 0.0]);
        assert!((params.angle - std::f32::consts::PI).abs() < 1e-6);
        assert!((params.spread - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
        assert_eq!(params.speed, 0.0);
        assert_eq!(params.life, MIN_LIFE);
    }
}
