use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use winit::keyboard::KeyCode;

use crate::error::{Error, Result};
use crate::execution::StopPolicy;
use crate::keymap::LogicalButton;
use crate::surface::ContextProfile;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub window: WindowSettings,
    #[serde(default)]
    pub context: ContextProfile,
    #[serde(default)]
    pub stop: StopSettings,
    #[serde(default)]
    pub key_bindings: KeyBindings,
}

impl Settings {
    /// Reads settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(target: "config", "No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WindowSettings {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

// Top screen over bottom screen.
fn default_title() -> String { "emuhost".to_string() }
fn default_width() -> u32 { 400 }
fn default_height() -> u32 { 480 }

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            title: default_title(),
            width: default_width(),
            height: default_height(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct StopSettings {
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_quit_grace_ms")]
    pub quit_grace_ms: u64,
}

fn default_grace_ms() -> u64 { 500 }
fn default_quit_grace_ms() -> u64 { 1000 }

impl Default for StopSettings {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            quit_grace_ms: default_quit_grace_ms(),
        }
    }
}

impl StopSettings {
    pub fn policy(&self) -> StopPolicy {
        StopPolicy {
            grace: Duration::from_millis(self.grace_ms),
            quit_grace: Duration::from_millis(self.quit_grace_ms),
        }
    }
}

/// Physical key for every pad button. Missing entries fall back to the defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct KeyBindings {
    pub pad_a: KeyCode,
    pub pad_b: KeyCode,
    pub pad_x: KeyCode,
    pub pad_y: KeyCode,
    pub pad_l: KeyCode,
    pub pad_r: KeyCode,
    pub pad_start: KeyCode,
    pub pad_select: KeyCode,
    pub pad_dup: KeyCode,
    pub pad_ddown: KeyCode,
    pub pad_dleft: KeyCode,
    pub pad_dright: KeyCode,
    pub pad_sup: KeyCode,
    pub pad_sdown: KeyCode,
    pub pad_sleft: KeyCode,
    pub pad_sright: KeyCode,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            pad_a: KeyCode::KeyA,
            pad_b: KeyCode::KeyS,
            pad_x: KeyCode::KeyZ,
            pad_y: KeyCode::KeyX,
            pad_l: KeyCode::KeyQ,
            pad_r: KeyCode::KeyW,
            pad_start: KeyCode::KeyM,
            pad_select: KeyCode::KeyN,
            pad_dup: KeyCode::KeyT,
            pad_ddown: KeyCode::KeyG,
            pad_dleft: KeyCode::KeyF,
            pad_dright: KeyCode::KeyH,
            pad_sup: KeyCode::ArrowUp,
            pad_sdown: KeyCode::ArrowDown,
            pad_sleft: KeyCode::ArrowLeft,
            pad_sright: KeyCode::ArrowRight,
        }
    }
}

impl KeyBindings {
    pub fn entries(&self) -> [(KeyCode, LogicalButton); 16] {
        [
            (self.pad_a, LogicalButton::A),
            (self.pad_b, LogicalButton::B),
            (self.pad_select, LogicalButton::Select),
            (self.pad_start, LogicalButton::Start),
            (self.pad_dright, LogicalButton::Right),
            (self.pad_dleft, LogicalButton::Left),
            (self.pad_dup, LogicalButton::Up),
            (self.pad_ddown, LogicalButton::Down),
            (self.pad_r, LogicalButton::R),
            (self.pad_l, LogicalButton::L),
            (self.pad_x, LogicalButton::X),
            (self.pad_y, LogicalButton::Y),
            (self.pad_sright, LogicalButton::CircleRight),
            (self.pad_sleft, LogicalButton::CircleLeft),
            (self.pad_sup, LogicalButton::CircleUp),
            (self.pad_sdown, LogicalButton::CircleDown),
        ]
    }
}
