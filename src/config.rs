use crate::gradient::Gradient;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticleShape {
    Circle,
    Square,
    Image,
}

impl Default for ParticleShape {
    fn default() -> Self {
        ParticleShape::Circle
    }
}

impl ParticleShape {
    pub fn name(&self) -> &'static str {
        match self {
            ParticleShape::Circle => "circle",
            ParticleShape::Square => "square",
            ParticleShape::Image => "image",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Vec2 { x, y }
    }
}

// Parameters that define the particle system. `max_particles` is fixed when the
// engine is built, everything else can be patched while it runs.
//
// Plain values are declared before tables so the struct serializes to toml.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_particles: u32,
    /// Particles per second.
    pub emission_rate: f32,
    /// Seconds.
    pub particle_life: f32,
    /// Pixels per second.
    pub particle_speed: f32,
    /// Sprite edge length in pixels.
    pub particle_size: f32,
    /// 0 means unbounded.
    pub fps_limit: f32,
    /// Degrees.
    pub emitter_angle: f32,
    /// Degrees.
    pub emitter_spread: f32,
    pub particle_shape: ParticleShape,
    pub particle_image: Option<PathBuf>,
    pub background_color: [f32; 4],
    /// Normalized to the surface, 0..1 on both axes.
    pub emitter_position: Vec2,
    /// Spawn area, normalized to the surface.
    pub emitter_size: Vec2,
    pub color_gradient: Option<Gradient>,
    pub opacity_gradient: Option<Gradient>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_particles: 100000,
            emission_rate: 5000.0,
            particle_life: 2.0,
            particle_speed: 100.0,
            particle_size: 10.0,
            fps_limit: 60.0,
            emitter_angle: 0.0,
            emitter_spread: 360.0,
            particle_shape: ParticleShape::Circle,
            particle_image: None,
            background_color: [0.0, 0.0, 0.0, 0.0],
            emitter_position: Vec2::new(0.5, 0.5),
            emitter_size: Vec2::new(0.0, 0.0),
            color_gradient: None,
            opacity_gradient: None,
        }
    }
}

impl std::str::FromStr for EngineConfig {
    type Err = toml::de::Error;
    fn from_str(serialized: &str) -> Result<Self, Self::Err> {
        let config = toml::from_str(serialized)?;
        Ok(config)
    }
}

/// A partial update. Absent keys keep their current value. The image and the
/// gradients can be cleared with `Some(None)`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ConfigPatch {
    pub max_particles: Option<u32>,
    pub emission_rate: Option<f32>,
    pub particle_life: Option<f32>,
    pub particle_speed: Option<f32>,
    pub particle_size: Option<f32>,
    pub fps_limit: Option<f32>,
    pub emitter_angle: Option<f32>,
    pub emitter_spread: Option<f32>,
    pub particle_shape: Option<ParticleShape>,
    pub particle_image: Option<Option<PathBuf>>,
    pub background_color: Option<[f32; 4]>,
    pub emitter_position: Option<Vec2>,
    pub emitter_size: Option<Vec2>,
    pub color_gradient: Option<Option<Gradient>>,
    pub opacity_gradient: Option<Option<Gradient>>,
}

impl std::str::FromStr for ConfigPatch {
    type Err = toml::de::Error;
    fn from_str(serialized: &str) -> Result<Self, Self::Err> {
        let patch = toml::from_str(serialized)?;
        Ok(patch)
    }
}

/// Device resources that have to be re-provisioned after a patch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfigChanges {
    pub shape: bool,
    pub image: bool,
    pub color_gradient: bool,
    pub opacity_gradient: bool,
}

impl ConfigChanges {
    pub fn is_empty(&self) -> bool {
        !(self.shape || self.image || self.color_gradient || self.opacity_gradient)
    }
}

impl EngineConfig {
    /// Merges `patch` in place and reports which resources it invalidated.
    pub fn apply(&mut self, patch: ConfigPatch) -> ConfigChanges {
        if let Some(max_particles) = patch.max_particles {
            if max_particles != self.max_particles {
                log::warn!(
                    "max_particles is fixed at construction, ignoring {} (keeping {})",
                    max_particles,
                    self.max_particles
                );
            }
        }

        macro_rules! assign {
            ($($field:ident),*) => {
                $(
                    if let Some(value) = patch.$field {
                        self.$field = value;
                    }
                )*
            };
        }
        assign!(
            emission_rate,
            particle_life,
            particle_speed,
            particle_size,
            fps_limit,
            emitter_angle,
            emitter_spread,
            background_color,
            emitter_position,
            emitter_size
        );

        macro_rules! assign_tracked {
            ($changes:ident, $($field:ident => $flag:ident),*) => {
                $(
                    if let Some(value) = patch.$field {
                        if value != self.$field {
                            self.$field = value;
                            $changes.$flag = true;
                        }
                    }
                )*
            };
        }
        let mut changes = ConfigChanges::default();
        assign_tracked!(changes,
            particle_shape => shape,
            particle_image => image,
            color_gradient => color_gradient,
            opacity_gradient => opacity_gradient);
        changes
    }
}

pub fn get_config_from_default_file() -> EngineConfig {
    let config_data = include_str!("../glitter.toml");
    match config_data.parse() {
        Ok(config) => config,
        Err(e) => {
            log::error!(
                "Failed to parse config file({}): {:?}",
                "../glitter.toml",
                e
            );
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient::{GradientStop, Rgba};

    fn two_stop_gradient() -> Gradient {
        Gradient::new(vec![
            GradientStop::new(0.0, Rgba::opaque(255, 0, 0)),
            GradientStop::new(1.0, Rgba::opaque(0, 0, 255)),
        ])
    }

    #[test]
    fn smoke() {
        let config = EngineConfig {
            particle_shape: ParticleShape::Square,
            particle_image: Some(PathBuf::from("sprites/star.png")),
            color_gradient: Some(two_stop_gradient()),
            ..EngineConfig::default()
        };
        let serialized = toml::to_string(&config).unwrap();
        println!("serialized = {}", serialized);
        let deserialized: EngineConfig = toml::from_str(&serialized).unwrap();
        println!("deserialized = {:?}", deserialized);
        assert_eq!(config, deserialized);
    }

    #[test]
    fn default_file_parses() {
        let config: EngineConfig = include_str!("../glitter.toml").parse().unwrap();
        assert_eq!(config.max_particles, 100000);
        assert_eq!(config.particle_shape, ParticleShape::Circle);
        assert_eq!(config.color_gradient.unwrap().stops().len(), 2);
    }

    #[test]
    fn missing_keys_take_defaults() {
        let config: EngineConfig = "emission_rate = 10.0".parse().unwrap();
        assert_eq!(config.emission_rate, 10.0);
        assert_eq!(
            EngineConfig {
                emission_rate: 10.0,
                ..EngineConfig::default()
            },
            config
        );
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let mut config = EngineConfig {
            color_gradient: Some(two_stop_gradient()),
            ..EngineConfig::default()
        };
        let before = config.clone();
        let changes = config.apply(ConfigPatch::default());
        assert!(changes.is_empty());
        assert_eq!(before, config);
    }

    #[test]
    fn scalar_keys_need_no_rebuild() {
        let mut config = EngineConfig::default();
        let changes = config.apply(ConfigPatch {
            emission_rate: Some(200.0),
            particle_size: Some(3.0),
            emitter_position: Some(Vec2::new(0.1, 0.9)),
            ..ConfigPatch::default()
        });
        assert!(changes.is_empty());
        assert_eq!(config.emission_rate, 200.0);
        assert_eq!(config.particle_size, 3.0);
        assert_eq!(config.emitter_position, Vec2::new(0.1, 0.9));
    }

    #[test]
    fn resource_keys_are_tracked() {
        let mut config = EngineConfig::default();
        let changes = config.apply(ConfigPatch {
            particle_shape: Some(ParticleShape::Image),
            particle_image: Some(Some(PathBuf::from("a.png"))),
            color_gradient: Some(Some(two_stop_gradient())),
            ..ConfigPatch::default()
        });
        assert_eq!(
            changes,
            ConfigChanges {
                shape: true,
                image: true,
                color_gradient: true,
                opacity_gradient: false,
            }
        );

        // Same values again are not a change.
        let changes = config.apply(ConfigPatch {
            particle_shape: Some(ParticleShape::Image),
            particle_image: Some(Some(PathBuf::from("a.png"))),
            ..ConfigPatch::default()
        });
        assert!(changes.is_empty());

        let changes = config.apply(ConfigPatch {
            particle_image: Some(None),
            ..ConfigPatch::default()
        });
        assert!(changes.image);
        assert_eq!(config.particle_image, None);
    }

    #[test]
    fn max_particles_is_not_patchable() {
        let mut config = EngineConfig::default();
        config.apply(ConfigPatch {
            max_particles: Some(5),
            ..ConfigPatch::default()
        });
        assert_eq!(config.max_particles, 100000);
    }

    #[test]
    fn patch_from_toml() {
        let patch: ConfigPatch = "particle_shape = \"square\"\nfps_limit = 0.0"
            .parse()
            .unwrap();
        assert_eq!(patch.particle_shape, Some(ParticleShape::Square));
        assert_eq!(patch.fps_limit, Some(0.0));
        assert_eq!(patch.emission_rate, None);
    }
}
