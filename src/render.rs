use crate::config::ParticleShape;
use crate::driver::RenderParams;
use crate::gradient::GradientTexture;
use crate::particle_image::ParticleImage;
use crate::shader_utils::{
    self, ProgramManager, RenderProgram, RenderProgramDesc, ShaderError, ShaderStage,
};
use crate::stepper::{InstanceLayout, InstanceSource};
use wgpu::util::DeviceExt;

// This should match `RenderUniforms` in render.wgsl.
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct RenderUniforms {
    resolution: [f32; 2],
    size: f32,
    _padding: f32,
}

impl RenderUniforms {
    fn new(params: &RenderParams) -> Self {
        RenderUniforms {
            resolution: params.resolution,
            size: params.particle_size,
            _padding: 0.0,
        }
    }
}

/// The lookup tables and the sprite bound to the render program.
pub struct RenderInputs<'a> {
    pub color_table: &'a GradientTexture,
    pub opacity_table: &'a GradientTexture,
    pub sprite: &'a ParticleImage,
}

/// Draws the active particles as instanced sprite quads. The program is
/// specialized on the shape and rebuilt when it changes.
pub struct Renderer {
    shape: ParticleShape,
    instance_layout: InstanceLayout,
    target_format: wgpu::TextureFormat,
    programs: ProgramManager,
    program: Option<RenderProgram>,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    uniform_buffer: wgpu::Buffer,
    table_sampler: wgpu::Sampler,
    sprite_sampler: wgpu::Sampler,
}

fn texture_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

fn create_sampler(device: &wgpu::Device, label: &str) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(label),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

impl Renderer {
    pub fn new(
        device: &wgpu::Device,
        programs: ProgramManager,
        target_format: wgpu::TextureFormat,
        instance_layout: InstanceLayout,
        shape: ParticleShape,
        inputs: &RenderInputs,
    ) -> Self {
        Renderer::with_source(
            device,
            programs,
            target_format,
            instance_layout,
            shape,
            inputs,
            shader_utils::render_shader_source(shape),
        )
    }

    /// Like `new`, with an explicit render source for `shape`. A source that
    /// fails to build leaves the renderer without a program.
    fn with_source(
        device: &wgpu::Device,
        programs: ProgramManager,
        target_format: wgpu::TextureFormat,
        instance_layout: InstanceLayout,
        shape: ParticleShape,
        inputs: &RenderInputs,
        source: &str,
    ) -> Self {
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Render uniforms"),
            contents: bytemuck::bytes_of(&<RenderUniforms as bytemuck::Zeroable>::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Render bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<RenderUniforms>() as _,
                        ),
                    },
                    count: None,
                },
                // Lookup tables are read per vertex at the particle's normalized age.
                texture_entry(1, wgpu::ShaderStages::VERTEX),
                texture_entry(2, wgpu::ShaderStages::VERTEX),
                sampler_entry(3, wgpu::ShaderStages::VERTEX),
                texture_entry(4, wgpu::ShaderStages::FRAGMENT),
                sampler_entry(5, wgpu::ShaderStages::FRAGMENT),
            ],
        });
        let table_sampler = create_sampler(device, "Lookup table sampler");
        let sprite_sampler = create_sampler(device, "Sprite sampler");
        let bind_group = Renderer::create_bind_group(
            device,
            &bind_group_layout,
            &uniform_buffer,
            &table_sampler,
            &sprite_sampler,
            inputs,
        );

        let mut renderer = Renderer {
            shape,
            instance_layout,
            target_format,
            programs,
            program: None,
            bind_group_layout,
            bind_group,
            uniform_buffer,
            table_sampler,
            sprite_sampler,
        };
        if let Err(e) = renderer.build_program(device, shape, source) {
            log::warn!("Not rendering until a program builds: {}", e);
        }
        renderer
    }

    fn create_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        uniform_buffer: &wgpu::Buffer,
        table_sampler: &wgpu::Sampler,
        sprite_sampler: &wgpu::Sampler,
        inputs: &RenderInputs,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Render bind group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&inputs.color_table.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&inputs.opacity_table.view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(table_sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(&inputs.sprite.view),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::Sampler(sprite_sampler),
                },
            ],
        })
    }

    /// Points the program at new textures, e.g. after the sprite changed.
    pub fn rebind(&mut self, device: &wgpu::Device, inputs: &RenderInputs) {
        self.bind_group = Renderer::create_bind_group(
            device,
            &self.bind_group_layout,
            &self.uniform_buffer,
            &self.table_sampler,
            &self.sprite_sampler,
            inputs,
        );
    }

    /// Replaces the program with one specialized for `shape`. The old program
    /// is dropped first; on failure none is bound and draws become no-ops.
    pub fn rebuild_program(
        &mut self,
        device: &wgpu::Device,
        shape: ParticleShape,
    ) -> Result<(), ShaderError> {
        self.build_program(device, shape, shader_utils::render_shader_source(shape))
    }

    fn build_program(
        &mut self,
        device: &wgpu::Device,
        shape: ParticleShape,
        source: &str,
    ) -> Result<(), ShaderError> {
        self.program = None;
        self.shape = shape;

        let label = format!("Render {}", shape.name());
        let vertex = self
            .programs
            .compile(device, ShaderStage::Vertex, &label, source)?;
        let fragment = self
            .programs
            .compile(device, ShaderStage::Fragment, &label, source)?;
        let program = self.programs.link_render(
            device,
            &vertex,
            &fragment,
            &RenderProgramDesc {
                label: &label,
                bind_group_layout: &self.bind_group_layout,
                instance_layout: self.instance_layout,
                target_format: self.target_format,
            },
        )?;
        log::info!("Built {} program", label);
        self.program = Some(program);
        Ok(())
    }

    pub fn has_program(&self) -> bool {
        self.program.is_some()
    }

    pub fn shape(&self) -> ParticleShape {
        self.shape
    }

    /// Clears `view` to the background and draws `instances` in one call.
    pub fn draw(
        &self,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        instances: InstanceSource,
        params: &RenderParams,
    ) {
        queue.write_buffer(
            &self.uniform_buffer,
            0,
            bytemuck::bytes_of(&RenderUniforms::new(params)),
        );
        let [r, g, b, a] = params.background_color;
        let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Particles"),
            color_attachments: &[wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: r as f64,
                        g: g as f64,
                        b: b as f64,
                        a: a as f64,
                    }),
                    store: true,
                },
            }],
            depth_stencil_attachment: None,
        });

        let program = match &self.program {
            Some(program) => program,
            None => return,
        };
        if instances.count == 0 || instances.layout != self.instance_layout {
            return;
        }
        let stride = instances.layout.vertex_buffer_layout().array_stride;
        rpass.set_pipeline(&program.pipeline);
        rpass.set_bind_group(0, &self.bind_group, &[]);
        rpass.set_vertex_buffer(
            0,
            instances
                .buffer
                .slice(..instances.count as wgpu::BufferAddress * stride),
        );
        rpass.draw(0..4, 0..instances.count);
    }

    pub fn release(&mut self) {
        self.program = None;
        self.uniform_buffer.destroy();
    }
}
