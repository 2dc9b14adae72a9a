#[macro_use]
extern crate log;

use std::ffi::CString;
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use glow::HasContext;
use glutin::config::{ConfigTemplateBuilder, GlConfig};
use glutin_winit::DisplayBuilder;
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use emuhost::gl::{GlutinBackend, GlutinFactory, WinitWindow};
use emuhost::headless::{HeadlessFactory, HeadlessWindow};
use emuhost::{
    ControllerWindow, EmulationCore, Geometry, GeometrySnapshot, InputRegistry, Interrupt,
    RenderTarget, Settings, SharedPadState,
};

const FRAME: Duration = Duration::from_micros(16_667);

#[derive(Parser, Debug)]
#[command(author, version, about = "Emulator host window")]
struct Args {
    /// Settings file (JSON). Missing file means defaults
    #[arg(short, long, default_value = "emuhost.json")]
    config: PathBuf,

    /// Window placement, restored on start and saved on exit
    #[arg(short, long, default_value = "emuhost-geometry.json")]
    geometry: PathBuf,

    /// error, warn, info, debug or trace. RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,

    /// Run without a display and print the stop report
    #[arg(long)]
    headless: bool,

    /// How long a headless run lasts
    #[arg(long, default_value_t = 1000)]
    run_ms: u64,
}

struct GlState(glow::Context);

// SAFETY: created and used on the execution thread. It only crosses back to the
// controller inside a halted core, where it is dropped without GL calls.
unsafe impl Send for GlState {}

impl GlState {
    fn load(target: &dyn RenderTarget) -> Option<Self> {
        if target.get_proc_address(c"glClear").is_null() {
            return None;
        }
        let gl = unsafe {
            glow::Context::from_loader_function(|name| match CString::new(name) {
                Ok(name) => target.get_proc_address(&name),
                Err(_) => ptr::null(),
            })
        };
        Some(Self(gl))
    }
}

/// Stand-in emulated system: clears the screen, tinted by the pad state.
struct DemoCore {
    pad: SharedPadState,
    gl: Option<GlState>,
    probed: bool,
    frames: u64,
    last_frame: Instant,
}

impl DemoCore {
    fn new(pad: SharedPadState) -> Self {
        Self {
            pad,
            gl: None,
            probed: false,
            frames: 0,
            last_frame: Instant::now(),
        }
    }

    fn render(&mut self, target: &mut dyn RenderTarget) {
        if let Err(e) = target.make_current() {
            error!("Cannot render frame {}: {}", self.frames, e);
            return;
        }
        if !self.probed {
            self.probed = true;
            self.gl = GlState::load(&*target);
            if self.gl.is_none() {
                info!("No GL entry points, frames are swapped without drawing");
            }
        }
        self.frames += 1;

        if let Some(GlState(gl)) = &self.gl {
            let (width, height) = target.frame_buffer_size();
            let phase = (self.frames % 120) as f32 / 120.0;
            let (r, g, b) = if self.pad.snapshot().held != 0 {
                (0.8, 0.2, 0.2)
            } else {
                (0.1, 0.1 + 0.3 * phase, 0.3)
            };
            unsafe {
                gl.viewport(0, 0, width as i32, height as i32);
                gl.clear_color(r, g, b, 1.0);
                gl.clear(glow::COLOR_BUFFER_BIT);
            }
        }
        if let Err(e) = target.swap_buffers() {
            warn!("Swap failed: {}", e);
        }
    }
}

impl EmulationCore for DemoCore {
    fn run_iteration(&mut self, target: &mut dyn RenderTarget, interrupt: &Interrupt) {
        self.render(target);

        let next = self.last_frame + FRAME;
        let now = Instant::now();
        if next > now && !interrupt.quit_requested() {
            thread::sleep(next - now);
        }
        self.last_frame = Instant::now();
    }

    fn single_step(&mut self, target: &mut dyn RenderTarget) {
        self.render(target);
        debug!("Stepped to frame {}", self.frames);
    }

    fn halt_and_release(&mut self) {
        self.gl = None;
        self.probed = false;
        info!("Emulation halted after {} frames", self.frames);
    }
}

type HostWindow = ControllerWindow<WinitWindow, GlutinBackend, DemoCore, SharedPadState>;

struct App {
    args: Args,
    settings: Settings,
    registry: Arc<InputRegistry>,
    host: Option<HostWindow>,
    error: Option<anyhow::Error>,
}

impl App {
    fn new(args: Args, settings: Settings) -> Self {
        Self {
            args,
            settings,
            registry: InputRegistry::new(),
            host: None,
            error: None,
        }
    }

    fn create_host(&self, event_loop: &ActiveEventLoop) -> Result<HostWindow> {
        let win_attrs = Window::default_attributes()
            .with_title(self.settings.window.title.clone())
            .with_inner_size(LogicalSize::new(
                self.settings.window.width,
                self.settings.window.height,
            ));
        let template = ConfigTemplateBuilder::new();
        let display_builder = DisplayBuilder::new().with_window_attributes(Some(win_attrs));
        let (window, gl_config) = display_builder
            .build(event_loop, template, |configs| {
                configs
                    .reduce(|accum, config| {
                        if config.num_samples() > accum.num_samples() { config } else { accum }
                    })
                    .expect("display builder offered no configs")
            })
            .map_err(|e| anyhow!("Failed to create window/config: {e}"))?;
        let window = Arc::new(window.context("No window was created")?);

        let factory = GlutinFactory::new(window.clone(), gl_config);
        let pad = SharedPadState::new();
        let mut host = ControllerWindow::new(
            self.registry.clone(),
            WinitWindow::new(window),
            &factory,
            &self.settings,
            DemoCore::new(pad.clone()),
            pad,
        )
        .context("Failed to set up the render surface")?;

        match GeometrySnapshot::read_from(&self.args.geometry) {
            Ok(snapshot) => host.restore_geometry(&snapshot),
            Err(e) => debug!("No saved geometry at {}: {}", self.args.geometry.display(), e),
        }
        host.start_emulation().context("Failed to start emulation")?;
        Ok(host)
    }

    fn shutdown(&mut self) {
        if let Some(mut host) = self.host.take() {
            let snapshot = host.capture_geometry();
            if let Err(e) = snapshot.write_to(&self.args.geometry) {
                warn!("Failed to save geometry to {}: {}", self.args.geometry.display(), e);
            }
            if let Some(report) = host.close() {
                info!("Emulation stopped: {:?}", report.diagnostics);
            }
        }
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, code: KeyCode, state: ElementState) {
        let Some(host) = self.host.as_mut() else { return };
        match (code, state) {
            (KeyCode::Escape, ElementState::Pressed) => {
                self.shutdown();
                event_loop.exit();
            }
            (KeyCode::F5, ElementState::Pressed) => {
                let running = !host.execution().is_cpu_running();
                host.set_cpu_running(running);
                info!("CPU {}", if running { "resumed" } else { "paused" });
            }
            (KeyCode::F6, ElementState::Pressed) => {
                if !host.step() {
                    warn!("Step ignored in state {:?}", host.execution_state());
                }
            }
            (_, ElementState::Pressed) => {
                host.key_pressed(code);
            }
            (_, ElementState::Released) => {
                host.key_released(code);
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.host.is_some() {
            return;
        }
        match self.create_host(event_loop) {
            Ok(host) => self.host = Some(host),
            Err(e) => {
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(host) = &self.host else { return };
        if host.window().inner().id() != window_id {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                let logical: LogicalSize<u32> =
                    size.to_logical(host.window().inner().scale_factor());
                host.set_client_area(logical.width, logical.height);
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.repeat {
                    return;
                }
                if let PhysicalKey::Code(code) = event.physical_key {
                    self.handle_key(event_loop, code, event.state);
                }
            }
            _ => (),
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(host) = &self.host {
            while let Some(event) = host.poll_event() {
                debug!("Execution event: {:?}", event);
            }
        }
        event_loop.set_control_flow(ControlFlow::wait_duration(Duration::from_millis(100)));
    }
}

fn run_headless(args: &Args, settings: &Settings) -> Result<()> {
    let geometry = Geometry {
        width: settings.window.width,
        height: settings.window.height,
        ..Default::default()
    };
    let factory = HeadlessFactory::new(settings.window.width, settings.window.height);
    let pad = SharedPadState::new();
    let mut host = ControllerWindow::new(
        InputRegistry::new(),
        HeadlessWindow::new(geometry),
        &factory,
        settings,
        DemoCore::new(pad.clone()),
        pad,
    )
    .context("Failed to set up the headless surface")?;

    host.start_emulation().context("Failed to start emulation")?;
    thread::sleep(Duration::from_millis(args.run_ms));
    let frames = host.execution().iterations();
    let report = host.stop_emulation();

    let stats = factory.stats();
    println!(
        "frames: {}, swaps: {}, stop diagnostics: {:?}",
        frames,
        stats.swaps(),
        report.diagnostics
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp_millis()
        .init();

    let settings = Settings::load(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config.display()))?;

    if args.headless {
        return run_headless(&args, &settings);
    }

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(args, settings);
    event_loop.run_app(&mut app).context("Event loop failed")?;
    if let Some(e) = app.error.take() {
        return Err(e);
    }
    Ok(())
}
