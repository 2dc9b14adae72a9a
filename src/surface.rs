//! The single rendering context and the protocol that moves it between threads.
//!
//! A [`RenderSurface`] lives on the controller thread. Whoever may issue context calls
//! holds the one [`AffinityToken`] for it; the token is not `Send`, so it can only change
//! threads by being turned into a [`Handoff`] (which releases the context first) and
//! accepted on the receiving side.

use std::cell::{Ref, RefCell};
use std::ffi::{CStr, c_void};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Logical owner of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Controller,
    Execution,
}

/// Requested OpenGL capability profile.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextProfile {
    #[serde(default = "default_major")]
    pub major: u8,
    #[serde(default = "default_minor")]
    pub minor: u8,
    #[serde(default = "default_true")]
    pub core: bool,
    /// No deprecated functionality. Required for 3.2+ on macOS.
    #[serde(default = "default_true")]
    pub forward_compatible: bool,
}

fn default_major() -> u8 { 3 }
fn default_minor() -> u8 { 2 }
fn default_true() -> bool { true }

impl Default for ContextProfile {
    fn default() -> Self {
        Self {
            major: default_major(),
            minor: default_minor(),
            core: default_true(),
            forward_compatible: default_true(),
        }
    }
}

impl ContextProfile {
    pub const MINIMUM_VERSION: (u8, u8) = (3, 2);

    pub fn validate(&self) -> Result<()> {
        if (self.major, self.minor) < Self::MINIMUM_VERSION {
            return Err(Error::ContextCreation(format!(
                "OpenGL {}.{} requested, at least {}.{} is required",
                self.major,
                self.minor,
                Self::MINIMUM_VERSION.0,
                Self::MINIMUM_VERSION.1
            )));
        }
        if !self.core {
            return Err(Error::ContextCreation(
                "compatibility profile requested, core profile is required".to_string(),
            ));
        }
        if !self.forward_compatible {
            return Err(Error::ContextCreation(
                "deprecated functionality requested".to_string(),
            ));
        }
        Ok(())
    }
}

/// Native context plus drawable, as provided by the graphics driver layer.
///
/// Implementations are moved between threads only while released, and are only ever
/// called by the current token holder.
pub trait GlBackend: Send + 'static {
    fn make_current(&mut self) -> Result<()>;

    fn make_not_current(&mut self) -> Result<()>;

    fn swap_buffers(&mut self) -> Result<()>;

    /// Resizes the drawable to `width` x `height` pixels. Called with the context current.
    fn resize(&mut self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    /// Drawable size in density independent pixels.
    fn logical_size(&self) -> (u32, u32);

    /// Display scale factor, when the platform layer reports one.
    fn scale_factor(&self) -> Option<f64> {
        None
    }

    fn get_proc_address(&self, _name: &CStr) -> *const c_void {
        ptr::null()
    }
}

/// Creates backends for a validated profile.
pub trait ContextFactory {
    type Backend: GlBackend;

    fn create(&self, profile: &ContextProfile) -> Result<Self::Backend>;
}

/// What a renderer needs from the context while it holds it.
pub trait RenderTarget {
    fn make_current(&mut self) -> Result<()>;

    fn release_current(&mut self) -> Result<()>;

    fn swap_buffers(&mut self) -> Result<()>;

    fn frame_buffer_size(&self) -> (u32, u32);

    fn get_proc_address(&self, name: &CStr) -> *const c_void;
}

struct Metrics {
    client_area: (u32, u32),
    scale: Option<f64>,
}

impl Metrics {
    fn frame_buffer_size(&self) -> (u32, u32) {
        let (width, height) = self.client_area;
        match self.scale {
            Some(scale) => (
                (width as f64 * scale).round() as u32,
                (height as f64 * scale).round() as u32,
            ),
            // Logical size only: the viewport ends up smaller than the window on hidpi
            // displays.
            None => (width, height),
        }
    }
}

struct Device<B> {
    backend: B,
    applied_size: Option<(u32, u32)>,
}

const CONTROLLER: u8 = 0;
const EXECUTION: u8 = 1;

/// Ownership bookkeeping lives in atomics so that it can be read and revoked while a
/// driver call is stuck holding the device lock.
struct Shared<B> {
    generation: AtomicU64,
    affinity: AtomicU8,
    current: AtomicBool,
    /// A released context is waiting for the controller to adopt it.
    returned: AtomicBool,
    metrics: Mutex<Metrics>,
    device: Mutex<Device<B>>,
}

impl<B> Shared<B> {
    fn affinity(&self) -> Affinity {
        match self.affinity.load(Ordering::Acquire) {
            EXECUTION => Affinity::Execution,
            _ => Affinity::Controller,
        }
    }

    fn set_affinity(&self, affinity: Affinity) {
        let value = match affinity {
            Affinity::Controller => CONTROLLER,
            Affinity::Execution => EXECUTION,
        };
        self.affinity.store(value, Ordering::Release);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn metrics(&self) -> MutexGuard<'_, Metrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Invalidates every outstanding token and hands ownership to the controller.
    fn revoke(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.set_affinity(Affinity::Controller);
        self.current.store(false, Ordering::Release);
        self.returned.store(false, Ordering::Release);
        generation
    }
}

fn affinity_violation(operation: &'static str, holder: Affinity) -> Error {
    error!(
        target: "surface",
        "{} called without context affinity, context held by {:?}", operation, holder
    );
    if cfg!(all(debug_assertions, not(test))) {
        panic!("{operation} called without context affinity");
    }
    Error::AffinityViolation { operation, holder }
}

/// Proof that the current thread owns the context.
pub struct AffinityToken<B: GlBackend> {
    shared: Arc<Shared<B>>,
    generation: u64,
    affinity: Affinity,
    _thread_confined: PhantomData<*const ()>,
}

impl<B: GlBackend> AffinityToken<B> {
    fn new(shared: Arc<Shared<B>>, generation: u64, affinity: Affinity) -> Self {
        Self {
            shared,
            generation,
            affinity,
            _thread_confined: PhantomData,
        }
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.shared.generation() != self.generation {
            return Err(affinity_violation(operation, self.shared.affinity()));
        }
        Ok(())
    }

    /// Runs one driver call. Never waits: the device lock can only be taken while a
    /// revoked holder is stuck inside the driver.
    fn with_device<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Device<B>) -> Result<R>,
    ) -> Result<R> {
        self.check(operation)?;
        let mut device = match self.shared.device.try_lock() {
            Ok(device) => device,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(Error::Driver(format!(
                    "{operation}: context is still in use by an abandoned thread"
                )));
            }
        };
        f(&mut device)
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// The token was revoked by a forced reclaim and no longer grants access.
    pub fn is_revoked(&self) -> bool {
        self.shared.generation() != self.generation
    }

    pub fn make_current(&self) -> Result<()> {
        self.with_device("make_current", |device| {
            device.backend.make_current()?;
            self.shared.current.store(true, Ordering::Release);
            let scale = device.backend.scale_factor();
            let size = {
                let mut metrics = self.shared.metrics();
                metrics.scale = scale;
                metrics.frame_buffer_size()
            };
            if device.applied_size != Some(size) {
                device.backend.resize(size.0, size.1)?;
                device.applied_size = Some(size);
            }
            Ok(())
        })
    }

    pub fn release_current(&self) -> Result<()> {
        self.with_device("release_current", |device| {
            if self.shared.current.load(Ordering::Acquire) {
                device.backend.make_not_current()?;
                self.shared.current.store(false, Ordering::Release);
            }
            Ok(())
        })
    }

    pub fn swap_buffers(&self) -> Result<()> {
        self.check("swap_buffers")?;
        if !self.shared.current.load(Ordering::Acquire) {
            return Err(affinity_violation("swap_buffers", self.shared.affinity()));
        }
        self.with_device("swap_buffers", |device| device.backend.swap_buffers())
    }

    pub fn frame_buffer_size(&self) -> (u32, u32) {
        self.shared.metrics().frame_buffer_size()
    }

    pub fn get_proc_address(&self, name: &CStr) -> *const c_void {
        self.with_device("get_proc_address", |device| {
            Ok(device.backend.get_proc_address(name))
        })
        .unwrap_or(ptr::null())
    }

    /// Releases the context on this thread and reassigns it to `target`.
    ///
    /// Only call this at a loop boundary: no rendering may be in flight.
    pub fn transfer(self, target: Affinity) -> Result<Handoff<B>> {
        self.check("transfer_affinity")?;
        if self.shared.current.load(Ordering::Acquire) {
            if let Err(e) = self.release_current() {
                warn!(target: "surface", "Failed to release context before transfer: {}", e);
            }
            self.shared.current.store(false, Ordering::Release);
        }
        debug!(
            target: "surface",
            "Context affinity {:?} -> {:?}", self.shared.affinity(), target
        );
        self.shared.set_affinity(target);
        Ok(Handoff {
            shared: self.shared.clone(),
            generation: self.generation,
            target,
            accepted: false,
        })
    }
}

impl<B: GlBackend> RenderTarget for AffinityToken<B> {
    fn make_current(&mut self) -> Result<()> {
        AffinityToken::make_current(self)
    }

    fn release_current(&mut self) -> Result<()> {
        AffinityToken::release_current(self)
    }

    fn swap_buffers(&mut self) -> Result<()> {
        AffinityToken::swap_buffers(self)
    }

    fn frame_buffer_size(&self) -> (u32, u32) {
        AffinityToken::frame_buffer_size(self)
    }

    fn get_proc_address(&self, name: &CStr) -> *const c_void {
        AffinityToken::get_proc_address(self, name)
    }
}

/// A released context in transit to the thread named by [`Handoff::target`].
///
/// Dropping it unaccepted returns the context to the controller, which adopts it on its
/// next call.
pub struct Handoff<B: GlBackend> {
    shared: Arc<Shared<B>>,
    generation: u64,
    target: Affinity,
    accepted: bool,
}

impl<B: GlBackend> Handoff<B> {
    pub fn target(&self) -> Affinity {
        self.target
    }

    /// A controller-side handle that can take the context back without the receiver.
    pub fn lease(&self) -> Lease<B> {
        Lease {
            shared: self.shared.clone(),
        }
    }

    /// Binds the context to the calling thread.
    pub fn accept(mut self) -> Result<AffinityToken<B>> {
        if self.shared.generation() != self.generation {
            return Err(affinity_violation("accept", self.shared.affinity()));
        }
        self.accepted = true;
        Ok(AffinityToken::new(
            self.shared.clone(),
            self.generation,
            self.target,
        ))
    }
}

impl<B: GlBackend> Drop for Handoff<B> {
    fn drop(&mut self) {
        if self.accepted || self.shared.generation() != self.generation {
            return;
        }
        debug!(
            target: "surface",
            "Hand-off to {:?} dropped, context returns to the controller", self.target
        );
        self.shared.set_affinity(Affinity::Controller);
        self.shared.returned.store(true, Ordering::Release);
    }
}

/// Kept by whoever lent the context out, so it can be revoked if the borrower never
/// gives it back.
pub struct Lease<B: GlBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: GlBackend> Lease<B> {
    /// Revokes the borrower's token and leaves the context for the controller to adopt.
    /// Does not wait for a driver call in progress.
    pub fn revoke(&self) {
        let generation = self.shared.revoke();
        self.shared.returned.store(true, Ordering::Release);
        warn!(target: "surface", "Context lease revoked, generation {}", generation);
    }
}

/// Controller side of the context. Holds the token whenever the controller owns it.
pub struct RenderSurface<B: GlBackend> {
    shared: Arc<Shared<B>>,
    token: RefCell<Option<AffinityToken<B>>>,
}

impl<B: GlBackend> RenderSurface<B> {
    /// Creates the context on the calling thread, which becomes its holder.
    pub fn create_context<F>(factory: &F, profile: &ContextProfile) -> Result<Self>
    where
        F: ContextFactory<Backend = B>,
    {
        profile.validate()?;
        let backend = factory.create(profile).map_err(|e| match e {
            Error::ContextCreation(_) => e,
            other => Error::ContextCreation(other.to_string()),
        })?;
        info!(
            target: "surface",
            "Created OpenGL {}.{} core context", profile.major, profile.minor
        );
        let metrics = Metrics {
            client_area: backend.logical_size(),
            scale: backend.scale_factor(),
        };
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            affinity: AtomicU8::new(CONTROLLER),
            current: AtomicBool::new(false),
            returned: AtomicBool::new(false),
            metrics: Mutex::new(metrics),
            device: Mutex::new(Device {
                backend,
                applied_size: None,
            }),
        });
        let token = AffinityToken::new(shared.clone(), 0, Affinity::Controller);
        Ok(Self {
            shared,
            token: RefCell::new(Some(token)),
        })
    }

    /// Picks up a context whose hand-off was dropped or whose lease was revoked.
    fn adopt_returned(&self) {
        let mut token = self.token.borrow_mut();
        if token.is_none()
            && self.shared.affinity() == Affinity::Controller
            && self.shared.returned.swap(false, Ordering::AcqRel)
        {
            debug!(target: "surface", "Controller adopted a returned context");
            *token = Some(AffinityToken::new(
                self.shared.clone(),
                self.shared.generation(),
                Affinity::Controller,
            ));
        }
    }

    fn token(&self, operation: &'static str) -> Result<Ref<'_, AffinityToken<B>>> {
        self.adopt_returned();
        Ref::filter_map(self.token.borrow(), Option::as_ref)
            .map_err(|_| affinity_violation(operation, self.affinity()))
    }

    pub fn affinity(&self) -> Affinity {
        self.shared.affinity()
    }

    pub fn holds_context(&self) -> bool {
        self.adopt_returned();
        self.token.borrow().is_some()
    }

    pub fn is_current(&self) -> bool {
        self.shared.current.load(Ordering::Acquire)
    }

    pub fn make_current(&self) -> Result<()> {
        self.token("make_current")?.make_current()
    }

    pub fn release_current(&self) -> Result<()> {
        self.token("release_current")?.release_current()
    }

    pub fn swap_buffers(&self) -> Result<()> {
        self.token("swap_buffers")?.swap_buffers()
    }

    pub fn frame_buffer_size(&self) -> (u32, u32) {
        self.shared.metrics().frame_buffer_size()
    }

    pub fn get_proc_address(&self, name: &CStr) -> *const c_void {
        self.adopt_returned();
        self.token
            .borrow()
            .as_ref()
            .map_or(ptr::null(), |token| token.get_proc_address(name))
    }

    /// Records a new client area size. Does not touch the context.
    pub fn set_client_area(&self, width: u32, height: u32) {
        self.shared.metrics().client_area = (width, height);
    }

    pub fn client_area(&self) -> (u32, u32) {
        self.shared.metrics().client_area
    }

    /// Gives up the controller's token in favour of `target`.
    pub fn transfer_affinity(&mut self, target: Affinity) -> Result<Handoff<B>> {
        self.adopt_returned();
        let token = match self.token.get_mut().take() {
            Some(token) => token,
            None => return Err(affinity_violation("transfer_affinity", self.affinity())),
        };
        token.transfer(target)
    }

    /// Takes back a context handed to the controller.
    pub fn accept(&mut self, handoff: Handoff<B>) -> Result<()> {
        if handoff.target() != Affinity::Controller || self.token.get_mut().is_some() {
            return Err(affinity_violation("accept", self.affinity()));
        }
        let token = handoff.accept()?;
        self.shared.returned.store(false, Ordering::Release);
        *self.token.get_mut() = Some(token);
        Ok(())
    }

    /// Revokes whatever token exists and makes the controller the holder again.
    ///
    /// Last resort after a worker was abandoned. Does not wait for the device: if the
    /// abandoned thread is stuck inside a driver call, context calls through the new
    /// token fail with [`Error::Driver`] until it returns. The driver may also still
    /// consider the context current on the abandoned thread. Every call through the
    /// revoked token fails with [`Error::AffinityViolation`].
    pub fn reclaim_forcibly(&mut self) {
        let generation = self.shared.revoke();
        warn!(target: "surface", "Context reclaimed forcibly, generation {}", generation);
        *self.token.get_mut() = Some(AffinityToken::new(
            self.shared.clone(),
            generation,
            Affinity::Controller,
        ));
    }
}

impl<B: GlBackend> RenderTarget for RenderSurface<B> {
    fn make_current(&mut self) -> Result<()> {
        RenderSurface::make_current(self)
    }

    fn release_current(&mut self) -> Result<()> {
        RenderSurface::release_current(self)
    }

    fn swap_buffers(&mut self) -> Result<()> {
        RenderSurface::swap_buffers(self)
    }

    fn frame_buffer_size(&self) -> (u32, u32) {
        RenderSurface::frame_buffer_size(self)
    }

    fn get_proc_address(&self, name: &CStr) -> *const c_void {
        RenderSurface::get_proc_address(self, name)
    }
}

impl<B: GlBackend> Drop for RenderSurface<B> {
    fn drop(&mut self) {
        self.adopt_returned();
        match self.token.get_mut() {
            Some(token) => {
                if let Err(e) = token.release_current() {
                    warn!(target: "surface", "Failed to release context on teardown: {}", e);
                }
            }
            None => error!(
                target: "surface",
                "Render surface dropped while context is held by {:?}", self.shared.affinity()
            ),
        }
    }
}
