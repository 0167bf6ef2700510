//! Error types for the particle engine.

use std::{io, path::PathBuf};
use thiserror::Error;

pub use crate::shader_utils::ShaderError;

/// Errors surfaced by [`crate::engine::Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The adapter lacks a capability the engine needs. Fatal at construction.
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// A shader failed to compile or a program failed to link.
    #[error(transparent)]
    Shader(#[from] ShaderError),

    /// The particle image could not be read or decoded.
    #[error("Failed to load particle image {}: {source}", .path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The engine was used after `destroy`.
    #[error("Engine resources were already released")]
    ResourceAlreadyReleased,

    /// The presentation surface could not hand out a frame.
    #[error("Surface error: {0}")]
    Surface(#[from] wgpu::SurfaceError),

    /// Copying device memory back to the host failed.
    #[error("Read back failed: {0}")]
    ReadBack(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
