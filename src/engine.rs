use crate::config::{ConfigChanges, ConfigPatch, EngineConfig};
use crate::driver::{FrameDriver, FrameSnapshot, FrameStart};
use crate::error::EngineError;
use crate::gradient::{GradientKind, GradientTexture};
use crate::particle_image::{ImageLoader, ParticleImage};
use crate::particle_store::Particle;
use crate::render::{RenderInputs, Renderer};
use crate::shader_utils::ProgramManager;
use crate::stepper::{self, Stepper, StepperKind};
use log::{error, info, trace, warn};

const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

fn backends() -> wgpu::Backends {
    wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::PRIMARY)
}

enum SurfaceKind {
    Window(wgpu::Surface),
    Offscreen,
}

/// Where the engine draws: a window surface or a headless texture.
pub struct SurfaceHandle {
    instance: wgpu::Instance,
    kind: SurfaceKind,
    width: u32,
    height: u32,
}

impl SurfaceHandle {
    pub fn from_window(window: &winit::window::Window) -> Self {
        let instance = wgpu::Instance::new(backends());
        let surface = unsafe { instance.create_surface(window) };
        let size = window.inner_size();
        SurfaceHandle {
            instance,
            kind: SurfaceKind::Window(surface),
            width: size.width,
            height: size.height,
        }
    }

    pub fn offscreen(width: u32, height: u32) -> Self {
        SurfaceHandle {
            instance: wgpu::Instance::new(backends()),
            kind: SurfaceKind::Offscreen,
            width,
            height,
        }
    }
}

enum RenderTarget {
    Surface {
        surface: wgpu::Surface,
        config: wgpu::SurfaceConfiguration,
    },
    Offscreen {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
        width: u32,
        height: u32,
    },
}

impl RenderTarget {
    fn offscreen(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        RenderTarget::Offscreen {
            texture,
            view,
            width,
            height,
        }
    }

    fn format(&self) -> wgpu::TextureFormat {
        match self {
            RenderTarget::Surface { config, .. } => config.format,
            RenderTarget::Offscreen { .. } => OFFSCREEN_FORMAT,
        }
    }

    fn size(&self) -> (u32, u32) {
        match self {
            RenderTarget::Surface { config, .. } => (config.width, config.height),
            RenderTarget::Offscreen { width, height, .. } => (*width, *height),
        }
    }

    fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        match self {
            RenderTarget::Surface { surface, config } => {
                config.width = width;
                config.height = height;
                surface.configure(device, config);
            }
            RenderTarget::Offscreen { texture, .. } => {
                texture.destroy();
                *self = RenderTarget::offscreen(device, width, height);
            }
        }
    }

    fn release(&self) {
        if let RenderTarget::Offscreen { texture, .. } = self {
            texture.destroy();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// One step was simulated (and drawn, if a program is bound).
    Advanced { active_count: u32 },
    /// Held back by the fps limit, try again next refresh.
    Skipped,
    /// The engine was destroyed, no further frames will run.
    Cancelled,
}

// Everything that lives on the device. Taken out as a whole on destroy.
struct Resources {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    target: RenderTarget,
    stepper: Box<dyn Stepper>,
    renderer: Renderer,
    color_table: GradientTexture,
    opacity_table: GradientTexture,
    image: Option<ParticleImage>,
    placeholder: ParticleImage,
    loader: ImageLoader,
}

impl Resources {
    fn rebind(&mut self) {
        let inputs = RenderInputs {
            color_table: &self.color_table,
            opacity_table: &self.opacity_table,
            sprite: self.image.as_ref().unwrap_or(&self.placeholder),
        };
        self.renderer.rebind(&self.device, &inputs);
    }

    fn set_image(&mut self, image: Option<ParticleImage>) {
        let previous = std::mem::replace(&mut self.image, image);
        self.rebind();
        if let Some(previous) = previous {
            previous.destroy();
        }
    }

    // Uploads a finished image load, if any.
    fn poll_image(&mut self) {
        if let Some(result) = self.loader.poll() {
            match result.image {
                Ok(image) => {
                    let image = ParticleImage::upload(&self.device, &self.queue, &image);
                    self.set_image(Some(image));
                }
                Err(e) => error!("{}, keeping the previous image", e),
            }
        }
    }

    fn run_frame(&mut self, frame: &FrameSnapshot) -> Result<(), EngineError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame"),
            });
        self.stepper.step(&self.queue, &mut encoder, frame);

        match &self.target {
            RenderTarget::Offscreen { view, .. } => {
                self.renderer.draw(
                    &self.queue,
                    &mut encoder,
                    view,
                    self.stepper.instances(),
                    &frame.render,
                );
                self.queue.submit(Some(encoder.finish()));
                Ok(())
            }
            RenderTarget::Surface { surface, config } => match surface.get_current_texture() {
                Ok(surface_texture) => {
                    let view = surface_texture
                        .texture
                        .create_view(&wgpu::TextureViewDescriptor::default());
                    self.renderer.draw(
                        &self.queue,
                        &mut encoder,
                        &view,
                        self.stepper.instances(),
                        &frame.render,
                    );
                    self.queue.submit(Some(encoder.finish()));
                    surface_texture.present();
                    Ok(())
                }
                // The simulation still advances so it does not drift from the clock.
                Err(e @ wgpu::SurfaceError::Lost) | Err(e @ wgpu::SurfaceError::Outdated) => {
                    warn!("Surface {:?}, reconfiguring", e);
                    surface.configure(&self.device, config);
                    self.queue.submit(Some(encoder.finish()));
                    Ok(())
                }
                Err(wgpu::SurfaceError::Timeout) => {
                    warn!("Timed out acquiring a frame");
                    self.queue.submit(Some(encoder.finish()));
                    Ok(())
                }
                Err(e) => {
                    self.queue.submit(Some(encoder.finish()));
                    Err(e.into())
                }
            },
        }
    }

    fn read_pixels(&self) -> Result<image::RgbaImage, EngineError> {
        let (texture, width, height) = match &self.target {
            RenderTarget::Offscreen {
                texture,
                width,
                height,
                ..
            } => (texture, *width, *height),
            RenderTarget::Surface { .. } => {
                return Err(EngineError::ReadBack(
                    "pixels can only be read from an offscreen target".to_string(),
                ))
            }
        };
        let unpadded_bytes_per_row = 4 * width;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = (unpadded_bytes_per_row + align - 1) / align * align;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Pixel read back"),
            size: padded_bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Pixel read back"),
            });
        encoder.copy_texture_to_buffer(
            texture.as_image_copy(),
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: std::num::NonZeroU32::new(padded_bytes_per_row),
                    rows_per_image: None,
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let mapping = slice.map_async(wgpu::MapMode::Read);
        self.device.poll(wgpu::Maintain::Wait);
        futures::executor::block_on(mapping)
            .map_err(|e| EngineError::ReadBack(format!("{:?}", e)))?;
        let mut pixels = Vec::with_capacity((unpadded_bytes_per_row * height) as usize);
        {
            let padded = slice.get_mapped_range();
            for row in padded.chunks(padded_bytes_per_row as usize) {
                pixels.extend_from_slice(&row[..unpadded_bytes_per_row as usize]);
            }
        }
        staging.unmap();
        image::RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| EngineError::ReadBack("pixel buffer has the wrong size".to_string()))
    }

    fn release(self) {
        // Dropping the loader drops its receiver, late decodes go nowhere.
        drop(self.loader);
        let mut stepper = self.stepper;
        stepper.release();
        let mut renderer = self.renderer;
        renderer.release();
        self.color_table.destroy();
        self.opacity_table.destroy();
        if let Some(image) = &self.image {
            image.destroy();
        }
        self.placeholder.destroy();
        self.target.release();
        self.device.poll(wgpu::Maintain::Wait);
        info!("Released device resources of {:?}", self.adapter.get_info().name);
    }
}

pub(crate) async fn request_adapter(
    instance: &wgpu::Instance,
    compatible_surface: Option<&wgpu::Surface>,
    required: wgpu::DownlevelFlags,
) -> Result<wgpu::Adapter, EngineError> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface,
        })
        .await
        .ok_or_else(|| EngineError::UnsupportedDevice("no compatible adapter".to_string()))?;
    let info = adapter.get_info();
    info!("Using {} ({:?})", info.name, info.backend);
    let capabilities = adapter.get_downlevel_properties();
    if !capabilities.flags.contains(required) {
        return Err(EngineError::UnsupportedDevice(format!(
            "{} lacks {:?}",
            info.name,
            required - capabilities.flags
        )));
    }
    Ok(adapter)
}

pub(crate) async fn request_device(
    adapter: &wgpu::Adapter,
) -> Result<(wgpu::Device, wgpu::Queue), EngineError> {
    adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Particle device"),
                features: wgpu::Features::empty(),
                limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            },
            None,
        )
        .await
        .map_err(|e| EngineError::UnsupportedDevice(e.to_string()))
}

/// The particle engine: owns the simulation, the device resources and the
/// frame loop state.
pub struct Engine {
    config: EngineConfig,
    stepper_kind: StepperKind,
    epoch: std::time::Instant,
    driver: FrameDriver,
    resources: Option<Resources>,
}

impl Engine {
    pub fn new(
        surface: SurfaceHandle,
        config: EngineConfig,
        stepper_kind: StepperKind,
    ) -> Result<Self, EngineError> {
        futures::executor::block_on(Engine::new_async(surface, config, stepper_kind))
    }

    async fn new_async(
        surface: SurfaceHandle,
        config: EngineConfig,
        stepper_kind: StepperKind,
    ) -> Result<Self, EngineError> {
        let SurfaceHandle {
            instance,
            kind,
            width,
            height,
        } = surface;
        let (width, height) = (width.max(1), height.max(1));
        let compatible_surface = match &kind {
            SurfaceKind::Window(surface) => Some(surface),
            SurfaceKind::Offscreen => None,
        };
        let adapter =
            request_adapter(&instance, compatible_surface, stepper_kind.required_flags()).await?;
        let (device, queue) = request_device(&adapter).await?;

        let target = match kind {
            SurfaceKind::Window(surface) => {
                let format = surface.get_preferred_format(&adapter).ok_or_else(|| {
                    EngineError::UnsupportedDevice(
                        "surface is incompatible with the adapter".to_string(),
                    )
                })?;
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width,
                    height,
                    present_mode: wgpu::PresentMode::Fifo,
                };
                surface.configure(&device, &config);
                RenderTarget::Surface { surface, config }
            }
            SurfaceKind::Offscreen => RenderTarget::offscreen(&device, width, height),
        };

        let programs = ProgramManager::default();
        let stepper = stepper::create_stepper(&device, &programs, stepper_kind, config.max_particles)?;
        let color_table = GradientTexture::new(
            &device,
            &queue,
            GradientKind::Color,
            config.color_gradient.as_ref(),
        );
        let opacity_table = GradientTexture::new(
            &device,
            &queue,
            GradientKind::Opacity,
            config.opacity_gradient.as_ref(),
        );
        let placeholder = ParticleImage::placeholder(&device, &queue);
        let renderer = Renderer::new(
            &device,
            programs,
            target.format(),
            stepper.instance_layout(),
            config.particle_shape,
            &RenderInputs {
                color_table: &color_table,
                opacity_table: &opacity_table,
                sprite: &placeholder,
            },
        );
        let mut loader = ImageLoader::new()?;
        if let Some(path) = &config.particle_image {
            loader.request(path);
        }
        info!(
            "Engine ready: {:?} stepper, {} particles, {}x{}",
            stepper_kind, config.max_particles, width, height
        );

        let epoch = std::time::Instant::now();
        Ok(Engine {
            config,
            stepper_kind,
            epoch,
            driver: FrameDriver::new(0.0, rand::random()),
            resources: Some(Resources {
                adapter,
                device,
                queue,
                target,
                stepper,
                renderer,
                color_table,
                opacity_table,
                image: None,
                placeholder,
                loader,
            }),
        })
    }

    fn resources(&mut self) -> Result<&mut Resources, EngineError> {
        self.resources
            .as_mut()
            .ok_or(EngineError::ResourceAlreadyReleased)
    }

    /// Milliseconds since the engine was built, the clock `on_frame` expects.
    pub fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    /// The frame callback: steps and draws once unless paced out or cancelled.
    pub fn on_frame(&mut self, now_ms: f64) -> Result<FrameOutcome, EngineError> {
        let resources = match self.resources.as_mut() {
            Some(resources) => resources,
            None => return Ok(FrameOutcome::Cancelled),
        };
        resources.poll_image();
        let (width, height) = resources.target.size();
        let frame = match self.driver.begin_frame(now_ms, &self.config, width, height) {
            FrameStart::Cancelled => return Ok(FrameOutcome::Cancelled),
            FrameStart::Skipped => return Ok(FrameOutcome::Skipped),
            FrameStart::Run(frame) => frame,
        };
        trace!("Frame dt: {}, active: {}", frame.dt, frame.active_count);
        resources.run_frame(&frame)?;
        Ok(FrameOutcome::Advanced {
            active_count: frame.active_count,
        })
    }

    /// Merges `patch` into the configuration. The next frame sees all of it.
    pub fn update_config(&mut self, patch: ConfigPatch) -> Result<ConfigChanges, EngineError> {
        let resources = self
            .resources
            .as_mut()
            .ok_or(EngineError::ResourceAlreadyReleased)?;
        let changes = self.config.apply(patch);
        if changes.is_empty() {
            return Ok(changes);
        }

        if changes.shape {
            if let Err(e) = resources
                .renderer
                .rebuild_program(&resources.device, self.config.particle_shape)
            {
                warn!("Not rendering until a program builds: {}", e);
            }
        }
        if changes.color_gradient {
            resources
                .color_table
                .update(&resources.queue, self.config.color_gradient.as_ref());
        }
        if changes.opacity_gradient {
            resources
                .opacity_table
                .update(&resources.queue, self.config.opacity_gradient.as_ref());
        }
        if changes.image {
            match &self.config.particle_image {
                Some(path) => resources.loader.request(path),
                None => {
                    resources.loader.cancel();
                    resources.set_image(None);
                    info!("Cleared particle image");
                }
            }
        }
        Ok(changes)
    }

    /// Follows the surface to a new pixel size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), EngineError> {
        let resources = self.resources()?;
        let (width, height) = (width.max(1), height.max(1));
        resources.target.resize(&resources.device, width, height);
        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    /// Cancels the frame callback and releases every device resource. A second
    /// call is an error.
    pub fn destroy(&mut self) -> Result<(), EngineError> {
        let resources = self
            .resources
            .take()
            .ok_or(EngineError::ResourceAlreadyReleased)?;
        self.driver.cancel();
        resources.release();
        Ok(())
    }

    /// Blocks until the image requested by the last config change is uploaded.
    pub fn wait_for_image(&mut self, timeout: std::time::Duration) -> Result<bool, EngineError> {
        let resources = self.resources()?;
        match resources.loader.wait(timeout) {
            Some(result) => {
                let image = result.image?;
                let image = ParticleImage::upload(&resources.device, &resources.queue, &image);
                resources.set_image(Some(image));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn read_pixels(&mut self) -> Result<image::RgbaImage, EngineError> {
        self.resources()?.read_pixels()
    }

    /// Current particle state, copied back from wherever the stepper keeps it.
    pub fn read_particles(&mut self) -> Result<Vec<Particle>, EngineError> {
        let resources = self.resources()?;
        resources
            .stepper
            .read_back(&resources.device, &resources.queue)
    }

    pub fn has_image(&self) -> bool {
        self.resources
            .as_ref()
            .map_or(false, |resources| resources.image.is_some())
    }

    pub fn is_rendering(&self) -> bool {
        self.resources
            .as_ref()
            .map_or(false, |resources| resources.renderer.has_program())
    }

    pub fn active_count(&self) -> u32 {
        self.driver.active_count()
    }

    pub fn is_frame_armed(&self) -> bool {
        self.driver.is_armed()
    }

    pub fn stepper_kind(&self) -> StepperKind {
        self.stepper_kind
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
pub(crate) fn headless_device(required: wgpu::DownlevelFlags) -> (wgpu::Device, wgpu::Queue) {
    let instance = wgpu::Instance::new(backends());
    futures::executor::block_on(async {
        let adapter = request_adapter(&instance, None, required).await.unwrap();
        request_device(&adapter).await.unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticleShape;
    use std::time::Duration;

    fn test_config() -> EngineConfig {
        EngineConfig {
            max_particles: 2000,
            emission_rate: 1000.0,
            particle_life: 1.0,
            particle_speed: 10.0,
            particle_size: 8.0,
            fps_limit: 0.0,
            ..EngineConfig::default()
        }
    }

    fn run_frames(engine: &mut Engine, frames: u32) -> u32 {
        let mut active_count = 0;
        for i in 1..=frames {
            match engine.on_frame(i as f64 * 16.0).unwrap() {
                FrameOutcome::Advanced { active_count: count } => active_count = count,
                other => panic!("unexpected {:?}", other),
            }
        }
        active_count
    }

    fn smoke(kind: StepperKind) {
        let mut engine = Engine::new(SurfaceHandle::offscreen(64, 64), test_config(), kind).unwrap();
        assert!(engine.is_rendering());
        assert_eq!(run_frames(&mut engine, 10), 160);
        assert_eq!(engine.active_count(), 160);

        for p in engine.read_particles().unwrap().iter().take(160) {
            assert!(p.age >= 0.0 && p.age < p.life);
        }

        // Particles start at the center and move at most a few pixels.
        let pixels = engine.read_pixels().unwrap();
        assert_eq!(pixels.dimensions(), (64, 64));
        assert!(pixels.get_pixel(32, 32)[3] > 0);
        assert_eq!(pixels.get_pixel(0, 0)[3], 0);

        engine.destroy().unwrap();
        assert!(!engine.is_frame_armed());
        assert_eq!(engine.on_frame(1000.0).unwrap(), FrameOutcome::Cancelled);
        assert!(matches!(
            engine.update_config(ConfigPatch::default()),
            Err(EngineError::ResourceAlreadyReleased)
        ));
        assert!(matches!(
            engine.destroy(),
            Err(EngineError::ResourceAlreadyReleased)
        ));
    }

    #[test]
    #[ignore] // Requires GPU
    fn host_engine_smoke() {
        smoke(StepperKind::Host);
    }

    #[test]
    #[ignore] // Requires GPU
    fn device_engine_smoke() {
        smoke(StepperKind::Device);
    }

    #[test]
    #[ignore] // Requires GPU
    fn gradient_bytes_reach_the_target() {
        use crate::gradient::{Gradient, GradientStop, Rgba};

        let gray = Gradient::new(vec![GradientStop::new(0.0, Rgba::new(128, 128, 128, 1.0))]);
        let config = EngineConfig {
            max_particles: 1,
            particle_life: 10.0,
            particle_speed: 0.0,
            particle_shape: ParticleShape::Square,
            color_gradient: Some(gray),
            ..test_config()
        };
        let mut engine =
            Engine::new(SurfaceHandle::offscreen(64, 64), config, StepperKind::Host).unwrap();
        assert_eq!(run_frames(&mut engine, 3), 1);

        let pixels = engine.read_pixels().unwrap();
        let center = pixels.get_pixel(32, 32);
        for channel in 0..3 {
            assert!(
                (center[channel] as i32 - 128).abs() <= 2,
                "center pixel {:?}",
                center
            );
        }
        assert_eq!(center[3], 255);
        engine.destroy().unwrap();
    }

    #[test]
    #[ignore] // Requires GPU
    fn config_updates() {
        let mut engine =
            Engine::new(SurfaceHandle::offscreen(32, 32), test_config(), StepperKind::Host)
                .unwrap();
        run_frames(&mut engine, 3);
        assert!(engine.update_config(ConfigPatch::default()).unwrap().is_empty());

        let changes = engine
            .update_config(ConfigPatch {
                particle_shape: Some(ParticleShape::Square),
                emission_rate: Some(10.0),
                ..ConfigPatch::default()
            })
            .unwrap();
        assert!(changes.shape);
        assert!(engine.is_rendering());
        assert_eq!(engine.config().particle_shape, ParticleShape::Square);

        let path = std::env::temp_dir().join(format!("glitter-engine-{}.png", std::process::id()));
        image::RgbaImage::from_pixel(4, 4, image::Rgba([255, 255, 255, 255]))
            .save(&path)
            .unwrap();
        engine
            .update_config(ConfigPatch {
                particle_shape: Some(ParticleShape::Image),
                particle_image: Some(Some(path.clone())),
                ..ConfigPatch::default()
            })
            .unwrap();
        assert!(engine.wait_for_image(Duration::from_secs(10)).unwrap());
        assert!(engine.has_image());
        run_frames(&mut engine, 2);

        let changes = engine
            .update_config(ConfigPatch {
                particle_image: Some(None),
                ..ConfigPatch::default()
            })
            .unwrap();
        assert!(changes.image);
        assert!(!engine.has_image());
        std::fs::remove_file(path).unwrap();
        engine.destroy().unwrap();
    }

    #[test]
    #[ignore] // Requires GPU
    fn fps_limit_skips() {
        let config = EngineConfig {
            fps_limit: 30.0,
            ..test_config()
        };
        let mut engine =
            Engine::new(SurfaceHandle::offscreen(16, 16), config, StepperKind::Host).unwrap();
        assert_eq!(engine.on_frame(10.0).unwrap(), FrameOutcome::Skipped);
        assert!(matches!(
            engine.on_frame(40.0).unwrap(),
            FrameOutcome::Advanced { .. }
        ));
        engine.destroy().unwrap();
    }
}
