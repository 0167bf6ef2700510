use crate::config::ParticleShape;
use crate::particle_store::CAPTURE_LAYOUT;
use crate::stepper::InstanceLayout;
use std::borrow::Cow;

// Include a shader rendered by build.rs by specifying a path relative to the
// generated shader directory.
#[macro_export]
macro_rules! include_shader {
    ($path:literal) => {
        include_str!(concat!(env!("OUT_DIR"), "/shaders/", $path))
    };
}

pub fn render_shader_source(shape: ParticleShape) -> &'static str {
    match shape {
        ParticleShape::Circle => crate::include_shader!("render_circle.wgsl"),
        ParticleShape::Square => crate::include_shader!("render_square.wgsl"),
        ParticleShape::Image => crate::include_shader!("render_image.wgsl"),
    }
}

pub fn capture_shader_source() -> &'static str {
    crate::include_shader!("update.wgsl")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

/// What went wrong building a shader or program, with the validator's log.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub stage: ShaderStage,
    pub label: String,
    pub log: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} stage of '{}': {}", self.stage, self.label, self.log)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error("shader compilation failed, {0}")]
    Compile(Diagnostic),
    #[error("program link failed, {0}")]
    Link(Diagnostic),
}

impl ShaderError {
    pub fn diagnostic(&self) -> &Diagnostic {
        match self {
            ShaderError::Compile(d) | ShaderError::Link(d) => d,
        }
    }
}

pub struct CompiledUnit {
    pub stage: ShaderStage,
    pub label: String,
    pub module: wgpu::ShaderModule,
}

pub struct RenderProgram {
    pub label: String,
    pub pipeline: wgpu::RenderPipeline,
}

pub struct CaptureProgram {
    pub label: String,
    pub pipeline: wgpu::ComputePipeline,
    pub outputs: Vec<String>,
}

pub struct RenderProgramDesc<'a> {
    pub label: &'a str,
    pub bind_group_layout: &'a wgpu::BindGroupLayout,
    pub instance_layout: InstanceLayout,
    pub target_format: wgpu::TextureFormat,
}

/// Checks that the declared capture outputs are the interleaved particle record.
pub fn check_capture_outputs(outputs: &[&str]) -> Result<(), String> {
    if outputs == &CAPTURE_LAYOUT[..] {
        Ok(())
    } else {
        Err(format!(
            "capture outputs {:?} do not match the particle record {:?}",
            outputs, CAPTURE_LAYOUT
        ))
    }
}

// Runs `f` inside a validation error scope and returns the first error raised.
fn validated<T>(device: &wgpu::Device, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let error = futures::executor::block_on(device.pop_error_scope());
    (value, error)
}

/// Builds shader modules and pipelines, turning validation errors into
/// diagnostics instead of device panics.
#[derive(Debug, Clone, Copy)]
pub struct ProgramManager {
    pub diagnostics: bool,
}

impl Default for ProgramManager {
    fn default() -> Self {
        ProgramManager {
            diagnostics: cfg!(debug_assertions),
        }
    }
}

impl ProgramManager {
    pub fn new(diagnostics: bool) -> Self {
        ProgramManager { diagnostics }
    }

    fn diagnose(&self, stage: ShaderStage, label: &str, log: String) -> Diagnostic {
        let diagnostic = Diagnostic {
            stage,
            label: label.to_string(),
            log,
        };
        if self.diagnostics {
            log::error!("{}", diagnostic);
        }
        diagnostic
    }

    pub fn compile(
        &self,
        device: &wgpu::Device,
        stage: ShaderStage,
        label: &str,
        source: &str,
    ) -> Result<CompiledUnit, ShaderError> {
        let (module, error) = validated(device, || {
            device.create_shader_module(&wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            })
        });
        match error {
            Some(e) => {
                drop(module);
                Err(ShaderError::Compile(self.diagnose(
                    stage,
                    label,
                    e.to_string(),
                )))
            }
            None => Ok(CompiledUnit {
                stage,
                label: label.to_string(),
                module,
            }),
        }
    }

    pub fn link_render(
        &self,
        device: &wgpu::Device,
        vertex: &CompiledUnit,
        fragment: &CompiledUnit,
        desc: &RenderProgramDesc,
    ) -> Result<RenderProgram, ShaderError> {
        for (unit, stage) in [(vertex, ShaderStage::Vertex), (fragment, ShaderStage::Fragment)].iter() {
            if unit.stage != *stage {
                return Err(ShaderError::Link(self.diagnose(
                    *stage,
                    desc.label,
                    format!("'{}' was compiled as a {:?} unit", unit.label, unit.stage),
                )));
            }
        }

        let (pipeline, error) = validated(device, || {
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &[desc.bind_group_layout],
                push_constant_ranges: &[],
            });
            // Additive: src * SRC_ALPHA + dst * ONE on premultiplied output.
            let additive = wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::SrcAlpha,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            };
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &vertex.module,
                    entry_point: desc.instance_layout.entry_point(),
                    buffers: &[desc.instance_layout.vertex_buffer_layout()],
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleStrip,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &fragment.module,
                    entry_point: "fs_main",
                    targets: &[wgpu::ColorTargetState {
                        format: desc.target_format,
                        blend: Some(wgpu::BlendState {
                            color: additive,
                            alpha: additive,
                        }),
                        write_mask: wgpu::ColorWrites::ALL,
                    }],
                }),
                multiview: None,
            })
        });
        match error {
            Some(e) => {
                drop(pipeline);
                Err(ShaderError::Link(self.diagnose(
                    ShaderStage::Vertex,
                    desc.label,
                    e.to_string(),
                )))
            }
            None => Ok(RenderProgram {
                label: desc.label.to_string(),
                pipeline,
            }),
        }
    }

    /// Links the update program. `capture_outputs` must name the particle
    /// record fields in storage order.
    pub fn link_capture(
        &self,
        device: &wgpu::Device,
        unit: &CompiledUnit,
        capture_outputs: &[&str],
        bind_group_layout: &wgpu::BindGroupLayout,
    ) -> Result<CaptureProgram, ShaderError> {
        if unit.stage != ShaderStage::Compute {
            return Err(ShaderError::Link(self.diagnose(
                ShaderStage::Compute,
                &unit.label,
                format!("capture needs a compute unit, got {:?}", unit.stage),
            )));
        }
        if let Err(log) = check_capture_outputs(capture_outputs) {
            return Err(ShaderError::Link(self.diagnose(
                ShaderStage::Compute,
                &unit.label,
                log,
            )));
        }

        let (pipeline, error) = validated(device, || {
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&unit.label),
                bind_group_layouts: &[bind_group_layout],
                push_constant_ranges: &[],
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&unit.label),
                layout: Some(&pipeline_layout),
                module: &unit.module,
                entry_point: "main",
            })
        });
        match error {
            Some(e) => {
                drop(pipeline);
                Err(ShaderError::Link(self.diagnose(
                    ShaderStage::Compute,
                    &unit.label,
                    e.to_string(),
                )))
            }
            None => Ok(CaptureProgram {
                label: unit.label.clone(),
                pipeline,
                outputs: capture_outputs.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_shaders() {
        for shape in [ParticleShape::Circle, ParticleShape::Square, ParticleShape::Image].iter() {
            let source = render_shader_source(*shape);
            assert!(source.contains("fn vs_projected"));
            assert!(source.contains("fn vs_record"));
            assert!(source.contains("fn fs_main"));
            assert!(!source.contains("{%"));
            assert_eq!(source.contains("discard"), *shape == ParticleShape::Circle);
            assert_eq!(
                source.contains("textureSample(sprite_texture"),
                *shape == ParticleShape::Image
            );
        }
        let update = capture_shader_source();
        assert!(update.contains("fn pcg"));
        assert!(update.contains("fn main"));
    }

    #[test]
    fn capture_outputs_must_match_record() {
        assert!(check_capture_outputs(&CAPTURE_LAYOUT).is_ok());
        assert!(check_capture_outputs(&["position", "velocity", "age"]).is_err());
        assert!(check_capture_outputs(&["velocity", "position", "age", "life"]).is_err());
    }

    #[test]
    fn diagnostic_display() {
        let error = ShaderError::Compile(Diagnostic {
            stage: ShaderStage::Fragment,
            label: "render circle".to_string(),
            log: "unknown identifier".to_string(),
        });
        assert_eq!(
            error.to_string(),
            "shader compilation failed, Fragment stage of 'render circle': unknown identifier"
        );
    }

    #[test]
    #[ignore] // Requires GPU
    fn compile_reports_diagnostic() {
        let (device, _queue) = crate::engine::headless_device(wgpu::DownlevelFlags::empty());
        let manager = ProgramManager::new(true);
        let result = manager.compile(&device, ShaderStage::Vertex, "broken", "fn main( {");
        match result {
            Err(ShaderError::Compile(diagnostic)) => {
                assert_eq!(diagnostic.stage, ShaderStage::Vertex);
                assert_eq!(diagnostic.label, "broken");
                assert!(!diagnostic.log.is_empty());
            }
            _ => panic!("expected a compile error"),
        }
    }

    #[test]
    #[ignore] // Requires GPU
    fn generated_shaders_compile() {
        let (device, _queue) = crate::engine::headless_device(wgpu::DownlevelFlags::empty());
        let manager = ProgramManager::default();
        for shape in [ParticleShape::Circle, ParticleShape::Square, ParticleShape::Image].iter() {
            manager
                .compile(&device, ShaderStage::Vertex, shape.name(), render_shader_source(*shape))
                .unwrap();
        }
        manager
            .compile(&device, ShaderStage::Compute, "update", capture_shader_source())
            .unwrap();
    }
}
