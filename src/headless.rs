//! Display-less backend and window, used by `--headless` runs.
//!
//! The backend keeps the bookkeeping a real driver does: a context is current on at most
//! one thread, and making it current elsewhere fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::{Error, Result};
use crate::surface::{ContextFactory, ContextProfile, GlBackend};
use crate::window::{Geometry, NativeWindow};

#[derive(Debug, Default)]
pub struct HeadlessStats {
    make_current: AtomicU64,
    releases: AtomicU64,
    swaps: AtomicU64,
    resizes: AtomicU64,
    conflicts: AtomicU64,
}

impl HeadlessStats {
    pub fn make_current_calls(&self) -> u64 {
        self.make_current.load(Ordering::Acquire)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Acquire)
    }

    pub fn swaps(&self) -> u64 {
        self.swaps.load(Ordering::Acquire)
    }

    pub fn resizes(&self) -> u64 {
        self.resizes.load(Ordering::Acquire)
    }

    /// Attempts to make the context current while another thread had it.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Acquire)
    }
}

pub struct HeadlessBackend {
    size: (u32, u32),
    scale: Option<f64>,
    current_on: Option<ThreadId>,
    stats: Arc<HeadlessStats>,
}

impl GlBackend for HeadlessBackend {
    fn make_current(&mut self) -> Result<()> {
        let me = thread::current().id();
        match self.current_on {
            Some(owner) if owner != me => {
                self.stats.conflicts.fetch_add(1, Ordering::AcqRel);
                Err(Error::Driver(format!(
                    "context is current on {:?}, cannot bind on {:?}",
                    owner, me
                )))
            }
            _ => {
                self.current_on = Some(me);
                self.stats.make_current.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    fn make_not_current(&mut self) -> Result<()> {
        self.current_on = None;
        self.stats.releases.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn swap_buffers(&mut self) -> Result<()> {
        if self.current_on != Some(thread::current().id()) {
            return Err(Error::Driver("swap without a current context".to_string()));
        }
        self.stats.swaps.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn resize(&mut self, _width: u32, _height: u32) -> Result<()> {
        self.stats.resizes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn logical_size(&self) -> (u32, u32) {
        self.size
    }

    fn scale_factor(&self) -> Option<f64> {
        self.scale
    }
}

pub struct HeadlessFactory {
    size: (u32, u32),
    scale: Option<f64>,
    max_version: (u8, u8),
    stats: Arc<HeadlessStats>,
}

impl HeadlessFactory {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            scale: None,
            max_version: (4, 6),
            stats: Arc::new(HeadlessStats::default()),
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Highest OpenGL version the fake driver claims to support.
    pub fn with_max_version(mut self, major: u8, minor: u8) -> Self {
        self.max_version = (major, minor);
        self
    }

    pub fn stats(&self) -> Arc<HeadlessStats> {
        self.stats.clone()
    }
}

impl ContextFactory for HeadlessFactory {
    type Backend = HeadlessBackend;

    fn create(&self, profile: &ContextProfile) -> Result<HeadlessBackend> {
        if (profile.major, profile.minor) > self.max_version {
            return Err(Error::ContextCreation(format!(
                "OpenGL {}.{} is not supported by the headless driver",
                profile.major, profile.minor
            )));
        }
        Ok(HeadlessBackend {
            size: self.size,
            scale: self.scale,
            current_on: None,
            stats: self.stats.clone(),
        })
    }
}

/// In-memory window; `set_top_level(false)` simulates embedding it in a container.
#[derive(Debug, Clone)]
pub struct HeadlessWindow {
    geometry: Geometry,
    top_level: bool,
    applied: usize,
}

impl HeadlessWindow {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            top_level: true,
            applied: 0,
        }
    }

    pub fn set_top_level(&mut self, top_level: bool) {
        self.top_level = top_level;
    }

    /// Simulates the user or a parent layout moving the window.
    pub fn move_to(&mut self, geometry: Geometry) {
        self.geometry = geometry;
    }

    /// Number of `set_geometry` calls received.
    pub fn applied(&self) -> usize {
        self.applied
    }
}

impl NativeWindow for HeadlessWindow {
    fn is_top_level(&self) -> bool {
        self.top_level
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn set_geometry(&mut self, geometry: &Geometry) {
        self.geometry = *geometry;
        self.applied += 1;
    }
}
