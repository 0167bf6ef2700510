use crate::driver::FrameSnapshot;
use crate::emitter::{self, EmitterParams, HostRandom, RandomSource};
use crate::error::EngineError;
use crate::particle_store::{Particle, ParticleStore, ProjectedParticle, CAPTURE_LAYOUT};
use crate::shader_utils::{self, CaptureProgram, ProgramManager, ShaderStage};
use wgpu::util::DeviceExt;

const WORKGROUP_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepperKind {
    /// Particles live in host memory and are projected to the device each frame.
    Host,
    /// Particles live in two device buffers, stepped by a compute pass.
    Device,
}

impl StepperKind {
    /// Device capabilities the variant cannot run without.
    pub fn required_flags(&self) -> wgpu::DownlevelFlags {
        match self {
            StepperKind::Host => wgpu::DownlevelFlags::empty(),
            StepperKind::Device => wgpu::DownlevelFlags::COMPUTE_SHADERS,
        }
    }
}

impl std::str::FromStr for StepperKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(StepperKind::Host),
            "device" => Ok(StepperKind::Device),
            _ => Err(format!("unknown stepper '{}', expected host or device", s)),
        }
    }
}

/// Advances one particle by `dt`. A particle whose age would reach its life is
/// replaced by `respawn()` instead of being integrated.
pub fn advance(particle: &mut Particle, dt: f32, respawn: impl FnOnce() -> Particle) {
    let age = particle.age + dt;
    if age >= particle.life {
        *particle = respawn();
    } else {
        particle.position[0] += particle.velocity[0] * dt;
        particle.position[1] += particle.velocity[1] * dt;
        particle.age = age;
    }
}

pub fn step_particles<R: RandomSource>(
    particles: &mut [Particle],
    dt: f32,
    params: &EmitterParams,
    rng: &mut R,
) {
    for particle in particles.iter_mut() {
        advance(particle, dt, || emitter::spawn(params, rng));
    }
}

// This should match `StepUniforms` in update.wgsl.
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct StepUniforms {
    pub origin: [f32; 2],
    pub extent: [f32; 2],
    pub angle: f32,
    pub spread: f32,
    pub speed: f32,
    pub life: f32,
    pub dt: f32,
    pub seed: u32,
    pub active_count: u32,
    /// Every slot below this has been stepped at least once.
    pub touched_count: u32,
}

impl StepUniforms {
    fn new(frame: &FrameSnapshot, active_count: u32, touched_count: u32) -> Self {
        let params = &frame.emitter;
        StepUniforms {
            origin: params.origin,
            extent: params.extent,
            angle: params.angle,
            spread: params.spread,
            speed: params.speed,
            life: params.life,
            dt: frame.dt,
            seed: frame.seed,
            active_count,
            touched_count,
        }
    }
}

/// How per particle data is laid out in the instance buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLayout {
    /// `ProjectedParticle`: position, normalized age.
    Projected,
    /// The full `Particle` record, normalized age is derived in the shader.
    Record,
}

const PROJECTED_ATTRIBUTES: [wgpu::VertexAttribute; 2] = [
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Float32x2,
        offset: 0,
        shader_location: 0,
    },
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Float32,
        offset: 8,
        shader_location: 1,
    },
];

const RECORD_ATTRIBUTES: [wgpu::VertexAttribute; 3] = [
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Float32x2,
        offset: 0,
        shader_location: 0,
    },
    // Velocity at offset 8 is not needed to draw.
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Float32,
        offset: 16,
        shader_location: 1,
    },
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Float32,
        offset: 20,
        shader_location: 2,
    },
];

impl InstanceLayout {
    pub fn vertex_buffer_layout(&self) -> wgpu::VertexBufferLayout<'static> {
        match self {
            InstanceLayout::Projected => wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<ProjectedParticle>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Instance,
                attributes: &PROJECTED_ATTRIBUTES,
            },
            InstanceLayout::Record => wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<Particle>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Instance,
                attributes: &RECORD_ATTRIBUTES,
            },
        }
    }

    pub fn entry_point(&self) -> &'static str {
        match self {
            InstanceLayout::Projected => "vs_projected",
            InstanceLayout::Record => "vs_record",
        }
    }
}

/// The buffer the renderer should draw from this frame.
pub struct InstanceSource<'a> {
    pub buffer: &'a wgpu::Buffer,
    pub layout: InstanceLayout,
    pub count: u32,
}

/// One of the two simulation strategies. Both apply `advance` to the first
/// `active_count` slots and leave the rest untouched.
pub trait Stepper {
    fn kind(&self) -> StepperKind;
    fn capacity(&self) -> u32;
    fn instance_layout(&self) -> InstanceLayout;
    /// Records one step of `frame` into `encoder`, uploads go through `queue`.
    fn step(
        &mut self,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        frame: &FrameSnapshot,
    );
    fn instances(&self) -> InstanceSource;
    /// Full copy of the current particle state. Blocks on the device.
    fn read_back(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Result<Vec<Particle>, EngineError>;
    fn release(&mut self);
}

pub struct HostStepper {
    store: ParticleStore,
    rng: HostRandom,
    instance_buffer: wgpu::Buffer,
    active_count: u32,
}

impl HostStepper {
    pub fn new(device: &wgpu::Device, capacity: u32) -> Self {
        HostStepper::with_random(device, capacity, HostRandom::from_entropy())
    }

    pub fn with_random(device: &wgpu::Device, capacity: u32, rng: HostRandom) -> Self {
        let size = std::mem::size_of::<ProjectedParticle>() as u64 * capacity.max(1) as u64;
        let instance_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Projected particles"),
            size,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        log::info!("Host stepper with {} particles", capacity);
        HostStepper {
            store: ParticleStore::allocate(capacity),
            rng,
            instance_buffer,
            active_count: 0,
        }
    }
}

impl Stepper for HostStepper {
    fn kind(&self) -> StepperKind {
        StepperKind::Host
    }

    fn capacity(&self) -> u32 {
        self.store.capacity()
    }

    fn instance_layout(&self) -> InstanceLayout {
        InstanceLayout::Projected
    }

    fn step(
        &mut self,
        queue: &wgpu::Queue,
        _encoder: &mut wgpu::CommandEncoder,
        frame: &FrameSnapshot,
    ) {
        let count = frame.active_count.min(self.store.capacity());
        step_particles(
            self.store.active_mut(count),
            frame.dt,
            &frame.emitter,
            &mut self.rng,
        );
        let projected = self.store.project(count);
        if !projected.is_empty() {
            queue.write_buffer(&self.instance_buffer, 0, bytemuck::cast_slice(projected));
        }
        self.active_count = count;
    }

    fn instances(&self) -> InstanceSource {
        InstanceSource {
            buffer: &self.instance_buffer,
            layout: InstanceLayout::Projected,
            count: self.active_count,
        }
    }

    fn read_back(
        &self,
        _device: &wgpu::Device,
        _queue: &wgpu::Queue,
    ) -> Result<Vec<Particle>, EngineError> {
        Ok(self.store.particles().to_vec())
    }

    fn release(&mut self) {
        self.instance_buffer.destroy();
        self.active_count = 0;
    }
}

pub struct DeviceStepper {
    capacity: u32,
    // Ping-pong pair. `bind_groups[i]` reads `buffers[i]` and writes the other.
    buffers: [wgpu::Buffer; 2],
    bind_groups: [wgpu::BindGroup; 2],
    read_index: usize,
    uniform_buffer: wgpu::Buffer,
    program: CaptureProgram,
    touched_count: u32,
    active_count: u32,
}

impl DeviceStepper {
    pub fn new(
        device: &wgpu::Device,
        programs: &ProgramManager,
        capacity: u32,
    ) -> Result<Self, EngineError> {
        let slots = vec![Particle::EXPIRED; capacity.max(1) as usize];
        let make_buffer = |label| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(&slots),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::COPY_SRC,
            })
        };
        let buffers = [make_buffer("Particles ping"), make_buffer("Particles pong")];

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Step uniforms"),
            contents: bytemuck::bytes_of(&<StepUniforms as bytemuck::Zeroable>::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let particle_binding = |read_only| wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<Particle>() as _),
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Step bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<StepUniforms>() as _,
                        ),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: particle_binding(true),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: particle_binding(false),
                    count: None,
                },
            ],
        });

        let unit = programs.compile(
            device,
            ShaderStage::Compute,
            "Particle update",
            shader_utils::capture_shader_source(),
        )?;
        let program = programs.link_capture(device, &unit, &CAPTURE_LAYOUT, &bind_group_layout)?;

        let make_bind_group = |read: &wgpu::Buffer, write: &wgpu::Buffer| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Step bind group"),
                layout: &bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: read.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: write.as_entire_binding(),
                    },
                ],
            })
        };
        let bind_groups = [
            make_bind_group(&buffers[0], &buffers[1]),
            make_bind_group(&buffers[1], &buffers[0]),
        ];
        log::info!("Device stepper with {} particles", capacity);

        Ok(DeviceStepper {
            capacity,
            buffers,
            bind_groups,
            read_index: 0,
            uniform_buffer,
            program,
            touched_count: 0,
            active_count: 0,
        })
    }
}

impl Stepper for DeviceStepper {
    fn kind(&self) -> StepperKind {
        StepperKind::Device
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn instance_layout(&self) -> InstanceLayout {
        InstanceLayout::Record
    }

    fn step(
        &mut self,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        frame: &FrameSnapshot,
    ) {
        let active_count = frame.active_count.min(self.capacity);
        // Slots that were stepped before but are now inactive still have to be
        // copied across, otherwise the two buffers drift apart.
        let touched_count = self.touched_count.max(active_count);
        self.active_count = active_count;
        if touched_count == 0 {
            return;
        }
        let uniforms = StepUniforms::new(frame, active_count, touched_count);
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Particle update"),
            });
            cpass.set_pipeline(&self.program.pipeline);
            cpass.set_bind_group(0, &self.bind_groups[self.read_index], &[]);
            let work_groups = (touched_count + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;
            log::trace!("Dispatching {} work groups", work_groups);
            cpass.dispatch(work_groups, 1, 1);
        }
        self.touched_count = touched_count;
        self.read_index = 1 - self.read_index;
    }

    fn instances(&self) -> InstanceSource {
        InstanceSource {
            buffer: &self.buffers[self.read_index],
            layout: InstanceLayout::Record,
            count: self.active_count,
        }
    }

    fn read_back(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Result<Vec<Particle>, EngineError> {
        let size = std::mem::size_of::<Particle>() as u64 * self.capacity as u64;
        if size == 0 {
            return Ok(Vec::new());
        }
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Particle read back"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Particle read back"),
        });
        encoder.copy_buffer_to_buffer(&self.buffers[self.read_index], 0, &staging, 0, size);
        queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let mapping = slice.map_async(wgpu::MapMode::Read);
        device.poll(wgpu::Maintain::Wait);
        futures::executor::block_on(mapping)
            .map_err(|e| EngineError::ReadBack(format!("{:?}", e)))?;
        let particles = bytemuck::cast_slice::<u8, Particle>(&slice.get_mapped_range()).to_vec();
        staging.unmap();
        Ok(particles)
    }

    fn release(&mut self) {
        for buffer in self.buffers.iter() {
            buffer.destroy();
        }
        self.uniform_buffer.destroy();
        self.active_count = 0;
        self.touched_count = 0;
    }
}

pub fn create_stepper(
    device: &wgpu::Device,
    programs: &ProgramManager,
    kind: StepperKind,
    capacity: u32,
) -> Result<Box<dyn Stepper>, EngineError> {
    Ok(match kind {
        StepperKind::Host => Box::new(HostStepper::new(device, capacity)),
        StepperKind::Device => Box::new(DeviceStepper::new(device, programs, capacity)?),
    })
}
