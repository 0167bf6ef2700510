pub mod config;
pub mod driver;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod frame_clock;
pub mod gradient;
pub mod particle_image;
pub mod particle_store;
pub mod render;
pub mod shader_utils;
pub mod stepper;

pub use config::{ConfigChanges, ConfigPatch, EngineConfig, ParticleShape};
pub use engine::{Engine, FrameOutcome, SurfaceHandle};
pub use error::EngineError;
pub use stepper::StepperKind;
