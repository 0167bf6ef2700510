use anyhow::Context;
use glitter::{ConfigPatch, Engine, EngineConfig, FrameOutcome, ParticleShape, StepperKind};
use log::{error, info};
use winit::event::{self, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};

gflags::define! {
    --config: &str = ""
}
gflags::define! {
    --stepper: &str = "host"
}
gflags::define! {
    --log_filter: &str = "warn,glitter=info"
}
gflags::define! {
    -h, --help = false
}

fn load_config() -> anyhow::Result<EngineConfig> {
    if CONFIG.flag.is_empty() {
        return Ok(glitter::config::get_config_from_default_file());
    }
    let serialized = std::fs::read_to_string(CONFIG.flag)
        .with_context(|| format!("Failed to read config file {}", CONFIG.flag))?;
    let config = serialized
        .parse()
        .with_context(|| format!("Failed to parse config file {}", CONFIG.flag))?;
    Ok(config)
}

// Maps a key press to a config change.
fn key_patch(key: event::VirtualKeyCode, config: &EngineConfig) -> Option<ConfigPatch> {
    let shape = |shape| {
        Some(ConfigPatch {
            particle_shape: Some(shape),
            ..ConfigPatch::default()
        })
    };
    let emission_rate = |rate| {
        Some(ConfigPatch {
            emission_rate: Some(rate),
            ..ConfigPatch::default()
        })
    };
    match key {
        event::VirtualKeyCode::Key1 => shape(ParticleShape::Circle),
        event::VirtualKeyCode::Key2 => shape(ParticleShape::Square),
        event::VirtualKeyCode::Key3 => shape(ParticleShape::Image),
        event::VirtualKeyCode::Up => emission_rate(config.emission_rate * 2.0),
        event::VirtualKeyCode::Down => emission_rate(config.emission_rate * 0.5),
        _ => None,
    }
}

fn main() -> anyhow::Result<()> {
    gflags::parse();
    if HELP.flag {
        gflags::print_help_and_exit(0);
    }
    scrub_log::init_with_filter_string(LOG_FILTER.flag)
        .map_err(|e| anyhow::anyhow!("Failed to init logging: {:?}", e))?;

    let config = load_config()?;
    let stepper: StepperKind = STEPPER.flag.parse().map_err(anyhow::Error::msg)?;

    let event_loop = EventLoop::new();
    log::info!("Initializing the window...");
    let window = winit::window::WindowBuilder::new()
        .with_title("Glitter")
        .with_inner_size(winit::dpi::Size::from(winit::dpi::LogicalSize::new(
            640 * 2,
            360 * 2,
        )))
        .build(&event_loop)?;
    let mut engine = Engine::new(glitter::SurfaceHandle::from_window(&window), config, stepper)?;

    log::info!("Entering render loop...");
    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Poll;
        match event {
            event::Event::WindowEvent {
                event: WindowEvent::Resized(size),
                ..
            } => {
                if let Err(e) = engine.resize(size.width, size.height) {
                    error!("Resize failed: {}", e);
                }
            }
            event::Event::WindowEvent { event, .. } => match event {
                WindowEvent::KeyboardInput {
                    input:
                        event::KeyboardInput {
                            virtual_keycode: Some(event::VirtualKeyCode::Q),
                            state: event::ElementState::Pressed,
                            ..
                        },
                    ..
                }
                | WindowEvent::KeyboardInput {
                    input:
                        event::KeyboardInput {
                            virtual_keycode: Some(event::VirtualKeyCode::Escape),
                            state: event::ElementState::Pressed,
                            ..
                        },
                    ..
                }
                | WindowEvent::CloseRequested => {
                    if let Err(e) = engine.destroy() {
                        error!("Destroy failed: {}", e);
                    }
                    *control_flow = ControlFlow::Exit;
                }
                WindowEvent::KeyboardInput {
                    input:
                        event::KeyboardInput {
                            virtual_keycode: Some(key),
                            state: event::ElementState::Pressed,
                            ..
                        },
                    ..
                } => {
                    if let Some(patch) = key_patch(key, engine.config()) {
                        match engine.update_config(patch) {
                            Ok(changes) => info!("Applied {:?}", changes),
                            Err(e) => error!("Config update failed: {}", e),
                        }
                    }
                }
                _ => (),
            },
            event::Event::MainEventsCleared => {
                if engine.is_frame_armed() {
                    window.request_redraw();
                }
            }
            event::Event::RedrawRequested(_) => {
                let now_ms = engine.now_ms();
                match engine.on_frame(now_ms) {
                    Ok(FrameOutcome::Cancelled) => *control_flow = ControlFlow::Exit,
                    Ok(_) => (),
                    Err(e) => error!("Frame failed: {}", e),
                }
            }
            _ => (),
        }
    });
}
