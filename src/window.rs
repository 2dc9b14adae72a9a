//! The controller-side window: owns the render surface, the execution thread and the
//! key router of one emulator view.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use winit::keyboard::KeyCode;

use crate::config::{KeyBindings, Settings};
use crate::error::{Error, Result};
use crate::execution::{EmulationCore, ExecutionEvent, ExecutionState, ExecutionThread, StopReport};
use crate::keymap::{DeviceId, InputRegistry, InputSink, KeyInputRouter, LogicalButton};
use crate::surface::{ContextFactory, GlBackend, RenderSurface};

/// Position and size of a window, in logical pixels.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub maximized: bool,
    #[serde(default)]
    pub fullscreen: bool,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 400,
            height: 480,
            maximized: false,
            fullscreen: false,
        }
    }
}

/// Saved window placement. Only meaningful to [`ControllerWindow::restore_geometry`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GeometrySnapshot {
    geometry: Geometry,
}

impl GeometrySnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Geometry(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Geometry(e.to_string()))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }
}

impl From<Geometry> for GeometrySnapshot {
    fn from(geometry: Geometry) -> Self {
        Self { geometry }
    }
}

/// The platform window hosting the render surface.
pub trait NativeWindow {
    /// False while the window is embedded in a parent container.
    fn is_top_level(&self) -> bool;

    fn geometry(&self) -> Geometry;

    fn set_geometry(&mut self, geometry: &Geometry);
}

/// One emulator view.
///
/// Fields drop in declaration order, so the execution thread goes before the surface.
pub struct ControllerWindow<W, B, C, I>
where
    W: NativeWindow,
    B: GlBackend,
    C: EmulationCore,
    I: InputSink,
{
    execution: ExecutionThread<C, B>,
    surface: RenderSurface<B>,
    router: KeyInputRouter,
    input: I,
    window: W,
    geometry: GeometrySnapshot,
}

impl<W, B, C, I> ControllerWindow<W, B, C, I>
where
    W: NativeWindow,
    B: GlBackend,
    C: EmulationCore,
    I: InputSink,
{
    /// Creates the context on the calling thread, which becomes the controller thread.
    pub fn new<F>(
        registry: Arc<InputRegistry>,
        window: W,
        factory: &F,
        settings: &Settings,
        core: C,
        input: I,
    ) -> Result<Self>
    where
        F: ContextFactory<Backend = B>,
    {
        let surface = RenderSurface::create_context(factory, &settings.context)?;
        let execution = ExecutionThread::new(core, settings.stop.policy());
        let router = KeyInputRouter::new(registry);
        router.reload(&settings.key_bindings);
        let geometry = GeometrySnapshot::from(window.geometry());
        Ok(Self {
            execution,
            surface,
            router,
            input,
            window,
            geometry,
        })
    }

    pub fn start_emulation(&mut self) -> Result<()> {
        self.execution.start(&mut self.surface)
    }

    pub fn stop_emulation(&mut self) -> StopReport {
        self.execution.stop(&mut self.surface)
    }

    pub fn step(&self) -> bool {
        self.execution.step()
    }

    pub fn set_cpu_running(&self, running: bool) {
        self.execution.set_cpu_running(running);
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.execution.state()
    }

    pub fn is_emulation_active(&self) -> bool {
        self.execution.is_running()
    }

    pub fn poll_event(&self) -> Option<ExecutionEvent> {
        self.execution.poll_event()
    }

    pub fn key_pressed(&mut self, key: KeyCode) -> Option<LogicalButton> {
        let button = self.router.resolve(key);
        if let Some(button) = button {
            self.input.notify_key_down(button);
        }
        self.input.notify_input_update_complete();
        button
    }

    pub fn key_released(&mut self, key: KeyCode) -> Option<LogicalButton> {
        let button = self.router.resolve(key);
        if let Some(button) = button {
            self.input.notify_key_up(button);
        }
        self.input.notify_input_update_complete();
        button
    }

    pub fn reload_keymaps(&self, bindings: &KeyBindings) {
        self.router.reload(bindings);
    }

    pub fn set_client_area(&self, width: u32, height: u32) {
        self.surface.set_client_area(width, height);
    }

    /// Returns the current placement for top-level windows. Embedded windows report
    /// the last placement recorded while they were top-level or restored.
    pub fn capture_geometry(&mut self) -> GeometrySnapshot {
        if self.window.is_top_level() {
            self.geometry = GeometrySnapshot::from(self.window.geometry());
        }
        self.geometry.clone()
    }

    pub fn restore_geometry(&mut self, snapshot: &GeometrySnapshot) {
        self.window.set_geometry(&snapshot.geometry);
        if !self.window.is_top_level() {
            self.geometry = snapshot.clone();
        }
        self.capture_geometry();
    }

    /// Re-applies the stored snapshot without capturing a new one.
    pub fn restore_backup_geometry(&mut self) {
        let geometry = self.geometry.geometry;
        self.window.set_geometry(&geometry);
    }

    /// Stops emulation if it is running. Blocks for the whole stop protocol.
    pub fn close(&mut self) -> Option<StopReport> {
        if !self.execution.is_running() {
            return None;
        }
        let report = self.execution.stop(&mut self.surface);
        if report.forced() {
            warn!(target: "window", "Window closed after forced termination: {:?}", report);
        }
        Some(report)
    }

    pub fn surface(&self) -> &RenderSurface<B> {
        &self.surface
    }

    pub fn execution(&self) -> &ExecutionThread<C, B> {
        &self.execution
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut W {
        &mut self.window
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    pub fn device_id(&self) -> DeviceId {
        self.router.device_id()
    }
}

impl<W, B, C, I> Drop for ControllerWindow<W, B, C, I>
where
    W: NativeWindow,
    B: GlBackend,
    C: EmulationCore,
    I: InputSink,
{
    fn drop(&mut self) {
        if self.close().is_some() {
            debug!(target: "window", "Stopped emulation on window teardown");
        }
    }
}
