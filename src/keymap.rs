use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use winit::keyboard::KeyCode;

use crate::config::KeyBindings;

/// Abstract pad input understood by the emulated input subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalButton {
    A,
    B,
    Select,
    Start,
    Right,
    Left,
    Up,
    Down,
    R,
    L,
    X,
    Y,
    CircleRight,
    CircleLeft,
    CircleUp,
    CircleDown,
}

impl LogicalButton {
    /// Bit of this button in the pad state word.
    pub fn mask(self) -> u32 {
        match self {
            Self::A => 1 << 0,
            Self::B => 1 << 1,
            Self::Select => 1 << 2,
            Self::Start => 1 << 3,
            Self::Right => 1 << 4,
            Self::Left => 1 << 5,
            Self::Up => 1 << 6,
            Self::Down => 1 << 7,
            Self::R => 1 << 8,
            Self::L => 1 << 9,
            Self::X => 1 << 10,
            Self::Y => 1 << 11,
            Self::CircleRight => 1 << 28,
            Self::CircleLeft => 1 << 29,
            Self::CircleUp => 1 << 30,
            Self::CircleDown => 1 << 31,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// A physical key as seen by one input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub key: KeyCode,
    pub device: DeviceId,
}

#[derive(Debug, Default)]
pub struct KeyBindingTable {
    map: HashMap<HostKey, LogicalButton>,
}

impl KeyBindingTable {
    pub fn set_mapping(&mut self, key: HostKey, button: LogicalButton) {
        self.map.insert(key, button);
    }

    pub fn resolve(&self, key: HostKey) -> Option<LogicalButton> {
        self.map.get(&key).copied()
    }

    pub fn clear_device(&mut self, device: DeviceId) {
        self.map.retain(|key, _| key.device != device);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Process-wide input state: the device id counter and the shared binding table.
///
/// Create one before the first window and hand it to every window by `Arc`. Dropping the
/// last reference tears the table down.
#[derive(Debug)]
pub struct InputRegistry {
    next_device: AtomicU32,
    table: RwLock<KeyBindingTable>,
}

impl InputRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_device: AtomicU32::new(1),
            table: RwLock::new(KeyBindingTable::default()),
        })
    }

    pub fn new_device_id(&self) -> DeviceId {
        DeviceId(self.next_device.fetch_add(1, Ordering::Relaxed))
    }

    pub fn set_key_mapping(&self, key: HostKey, button: LogicalButton) {
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set_mapping(key, button);
    }

    pub fn resolve(&self, key: HostKey) -> Option<LogicalButton> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(key)
    }

    pub fn clear_device(&self, device: DeviceId) {
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear_device(device);
    }

    pub fn binding_count(&self) -> usize {
        self.table.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Resolves physical keys of one device to logical buttons.
pub struct KeyInputRouter {
    registry: Arc<InputRegistry>,
    device: DeviceId,
}

impl KeyInputRouter {
    pub fn new(registry: Arc<InputRegistry>) -> Self {
        let device = registry.new_device_id();
        debug!(target: "keymap", "Assigned input device {:?}", device);
        Self { registry, device }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    /// Replaces every binding of this device with `bindings`.
    pub fn reload(&self, bindings: &KeyBindings) {
        self.registry.clear_device(self.device);
        for (key, button) in bindings.entries() {
            self.registry.set_key_mapping(
                HostKey {
                    key,
                    device: self.device,
                },
                button,
            );
        }
        info!(target: "keymap", "Loaded key bindings for device {}", self.device.0);
    }

    pub fn resolve(&self, key: KeyCode) -> Option<LogicalButton> {
        self.registry.resolve(HostKey {
            key,
            device: self.device,
        })
    }
}

impl Drop for KeyInputRouter {
    fn drop(&mut self) {
        self.registry.clear_device(self.device);
    }
}

/// The emulated input subsystem, fed from the controller thread.
pub trait InputSink {
    fn notify_key_down(&mut self, button: LogicalButton);

    fn notify_key_up(&mut self, button: LogicalButton);

    /// One full input update pass has been delivered.
    fn notify_input_update_complete(&mut self);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PadState {
    /// Buttons as of the last completed update pass.
    pub held: u32,
    /// Number of completed update passes.
    pub updates: u64,
    next: u32,
}

/// Pad state shared between the controller (writer) and the emulation core (reader).
#[derive(Debug, Default, Clone)]
pub struct SharedPadState {
    inner: Arc<Mutex<PadState>>,
}

impl SharedPadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PadState {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_held(&self, button: LogicalButton) -> bool {
        self.snapshot().held & button.mask() != 0
    }
}

impl InputSink for SharedPadState {
    fn notify_key_down(&mut self, button: LogicalButton) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).next |= button.mask();
    }

    fn notify_key_up(&mut self, button: LogicalButton) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).next &= !button.mask();
    }

    fn notify_input_update_complete(&mut self) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.held = state.next;
        state.updates += 1;
    }
}
