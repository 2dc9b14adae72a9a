//! Host window for an emulator: one OpenGL context shared between the UI thread and an
//! emulation thread, the run/step/stop lifecycle of that thread, window geometry
//! persistence and keyboard routing.

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod execution;
pub mod gl;
pub mod headless;
pub mod keymap;
pub mod surface;
pub mod window;

pub use config::{KeyBindings, Settings};
pub use error::{Error, Result};
pub use execution::{
    EmulationCore, ExecutionEvent, ExecutionState, ExecutionThread, Interrupt, StopDiagnostic,
    StopPolicy, StopReport,
};
pub use keymap::{DeviceId, InputRegistry, InputSink, KeyInputRouter, LogicalButton, SharedPadState};
pub use surface::{
    Affinity, AffinityToken, ContextFactory, ContextProfile, GlBackend, Handoff, Lease,
    RenderSurface, RenderTarget,
};
pub use window::{ControllerWindow, Geometry, GeometrySnapshot, NativeWindow};
