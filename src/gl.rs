//! glutin + winit implementation of the driver layer.

use std::ffi::{CStr, c_void};
use std::num::NonZeroU32;
use std::sync::Arc;

use glutin::config::Config;
use glutin::context::{
    ContextApi, ContextAttributesBuilder, GlProfile, NotCurrentContext, PossiblyCurrentContext,
    Version,
};
use glutin::display::{Display, GetGlDisplay};
use glutin::prelude::*;
use glutin::surface::{Surface, SurfaceAttributesBuilder, WindowSurface};
use raw_window_handle::HasWindowHandle;
use winit::dpi::{LogicalPosition, LogicalSize};
use winit::window::{Fullscreen, Window};

use crate::error::{Error, Result};
use crate::surface::{ContextFactory, ContextProfile, GlBackend};
use crate::window::{Geometry, NativeWindow};

fn driver(e: impl std::fmt::Display) -> Error {
    Error::Driver(e.to_string())
}

enum ContextState {
    NotCurrent(NotCurrentContext),
    Current(PossiblyCurrentContext),
}

pub struct GlutinBackend {
    // None only if the driver failed a make_current/make_not_current and consumed it.
    context: Option<ContextState>,
    surface: Surface<WindowSurface>,
    display: Display,
    window: Arc<Window>,
}

// SAFETY: the context and its surface are only touched by the affinity token holder, and
// the token releases the context before the backend crosses threads.
unsafe impl Send for GlutinBackend {}

impl GlBackend for GlutinBackend {
    fn make_current(&mut self) -> Result<()> {
        match self.context.take() {
            Some(ContextState::NotCurrent(context)) => {
                let context = context.make_current(&self.surface).map_err(driver)?;
                self.context = Some(ContextState::Current(context));
                Ok(())
            }
            Some(ContextState::Current(context)) => {
                let result = context.make_current(&self.surface).map_err(driver);
                self.context = Some(ContextState::Current(context));
                result
            }
            None => Err(Error::Driver("context lost".to_string())),
        }
    }

    fn make_not_current(&mut self) -> Result<()> {
        match self.context.take() {
            Some(ContextState::Current(context)) => {
                let context = context.make_not_current().map_err(driver)?;
                self.context = Some(ContextState::NotCurrent(context));
                Ok(())
            }
            other => {
                self.context = other;
                Ok(())
            }
        }
    }

    fn swap_buffers(&mut self) -> Result<()> {
        match &self.context {
            Some(ContextState::Current(context)) => {
                self.surface.swap_buffers(context).map_err(driver)
            }
            _ => Err(Error::Driver("swap without a current context".to_string())),
        }
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if let (Some(ContextState::Current(context)), Some(width), Some(height)) = (
            &self.context,
            NonZeroU32::new(width),
            NonZeroU32::new(height),
        ) {
            self.surface.resize(context, width, height);
        }
        Ok(())
    }

    fn logical_size(&self) -> (u32, u32) {
        let size: LogicalSize<u32> = self.window.inner_size().to_logical(self.window.scale_factor());
        (size.width, size.height)
    }

    fn scale_factor(&self) -> Option<f64> {
        Some(self.window.scale_factor())
    }

    fn get_proc_address(&self, name: &CStr) -> *const c_void {
        self.display.get_proc_address(name)
    }
}

/// Creates contexts for one window and config, as picked by `glutin_winit::DisplayBuilder`.
pub struct GlutinFactory {
    window: Arc<Window>,
    config: Config,
}

impl GlutinFactory {
    pub fn new(window: Arc<Window>, config: Config) -> Self {
        Self { window, config }
    }
}

impl ContextFactory for GlutinFactory {
    type Backend = GlutinBackend;

    fn create(&self, profile: &ContextProfile) -> Result<GlutinBackend> {
        let raw = self.window.window_handle().map_err(driver)?.as_raw();
        let display = self.config.display();
        let attributes = ContextAttributesBuilder::new()
            .with_profile(GlProfile::Core)
            .with_context_api(ContextApi::OpenGl(Some(Version::new(
                profile.major,
                profile.minor,
            ))))
            .build(Some(raw));
        let context = unsafe { display.create_context(&self.config, &attributes) }
            .map_err(|e| Error::ContextCreation(e.to_string()))?;

        let size = self.window.inner_size();
        let (width, height) = match (NonZeroU32::new(size.width), NonZeroU32::new(size.height)) {
            (Some(width), Some(height)) => (width, height),
            _ => return Err(Error::ContextCreation("window has no drawable area".to_string())),
        };
        let attrs = SurfaceAttributesBuilder::<WindowSurface>::new().build(raw, width, height);
        let surface = unsafe { display.create_window_surface(&self.config, &attrs) }
            .map_err(|e| Error::ContextCreation(e.to_string()))?;

        Ok(GlutinBackend {
            context: Some(ContextState::NotCurrent(context)),
            surface,
            display,
            window: self.window.clone(),
        })
    }
}

/// A winit window. `embedded` marks windows whose placement a parent container owns.
pub struct WinitWindow {
    window: Arc<Window>,
    embedded: bool,
}

impl WinitWindow {
    pub fn new(window: Arc<Window>) -> Self {
        Self {
            window,
            embedded: false,
        }
    }

    pub fn set_embedded(&mut self, embedded: bool) {
        self.embedded = embedded;
    }

    pub fn inner(&self) -> &Arc<Window> {
        &self.window
    }
}

impl NativeWindow for WinitWindow {
    fn is_top_level(&self) -> bool {
        !self.embedded
    }

    fn geometry(&self) -> Geometry {
        let scale = self.window.scale_factor();
        let position: LogicalPosition<i32> = self
            .window
            .outer_position()
            .unwrap_or_default()
            .to_logical(scale);
        let size: LogicalSize<u32> = self.window.inner_size().to_logical(scale);
        Geometry {
            x: position.x,
            y: position.y,
            width: size.width,
            height: size.height,
            maximized: self.window.is_maximized(),
            fullscreen: self.window.fullscreen().is_some(),
        }
    }

    fn set_geometry(&mut self, geometry: &Geometry) {
        if geometry.fullscreen {
            self.window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            return;
        }
        self.window.set_fullscreen(None);
        self.window
            .set_outer_position(LogicalPosition::new(geometry.x, geometry.y));
        let _ = self
            .window
            .request_inner_size(LogicalSize::new(geometry.width, geometry.height));
        self.window.set_maximized(geometry.maximized);
    }
}
