/// One simulated point. Must match `Particle` in update.wgsl.
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Particle {
    pub position: [f32; 2],
    pub velocity: [f32; 2],
    pub age: f32,
    pub life: f32,
}

impl Particle {
    /// Fresh slots start out long dead, so their first step respawns them
    /// through the emitter like any other expiry.
    pub const EXPIRED: Particle = Particle {
        position: [0.0, 0.0],
        velocity: [0.0, 0.0],
        age: 9999.0,
        life: 1.0,
    };

    pub fn is_expired(&self) -> bool {
        self.age >= self.life
    }

    pub fn normalized_age(&self) -> f32 {
        (self.age / self.life).max(0.0).min(1.0)
    }
}

/// Interleaved record fields written by the capture pass, in order.
pub const CAPTURE_LAYOUT: [&str; 4] = ["position", "velocity", "age", "life"];

/// What the host stepped renderer uploads per particle.
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct ProjectedParticle {
    pub position: [f32; 2],
    pub normalized_age: f32,
}

/// Fixed capacity host copy of the particle state.
pub struct ParticleStore {
    particles: Vec<Particle>,
    projection: Vec<ProjectedParticle>,
}

impl ParticleStore {
    pub fn allocate(capacity: u32) -> Self {
        ParticleStore {
            particles: vec![Particle::EXPIRED; capacity as usize],
            projection: vec![ProjectedParticle::default(); capacity as usize],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.particles.len() as u32
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// The first `count` slots, clamped to capacity.
    pub fn active_mut(&mut self, count: u32) -> &mut [Particle] {
        let count = (count as usize).min(self.particles.len());
        &mut self.particles[..count]
    }

    /// Refreshes and returns the projection of the first `count` slots only.
    pub fn project(&mut self, count: u32) -> &[ProjectedParticle] {
        let count = (count as usize).min(self.particles.len());
        for (out, particle) in self.projection[..count]
            .iter_mut()
            .zip(self.particles[..count].iter())
        {
            *out = ProjectedParticle {
                position: particle.position,
                normalized_age: particle.normalized_age(),
            };
        }
        &self.projection[..count]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes() {
        assert_eq!(std::mem::size_of::<Particle>(), 24);
        assert_eq!(std::mem::size_of::<ProjectedParticle>(), 12);
    }

    #[test]
    fn allocate_marks_expired() {
        let store = ParticleStore::allocate(1000);
        assert_eq!(store.capacity(), 1000);
        assert!(store.particles().iter().all(|p| p.is_expired()));
    }

    #[test]
    fn project_only_touches_count() {
        let mut store = ParticleStore::allocate(10);
        for (i, p) in store.active_mut(4).iter_mut().enumerate() {
            *p = Particle {
                position: [i as f32, 2.0 * i as f32],
                velocity: [0.0, 0.0],
                age: 1.0,
                life: 4.0,
            };
        }
        let projected = store.project(4);
        assert_eq!(projected.len(), 4);
        assert_eq!(
            projected[3],
            ProjectedParticle {
                position: [3.0, 6.0],
                normalized_age: 0.25,
            }
        );
        assert_eq!(bytemuck::cast_slice::<_, u8>(projected).len(), 4 * 12);
    }

    #[test]
    fn counts_clamp_to_capacity() {
        let mut store = ParticleStore::allocate(3);
        assert_eq!(store.active_mut(10).len(), 3);
        assert_eq!(store.project(10).len(), 3);
    }
}
