//! # parley-settings
//!
//! Layered gateway configuration:
//! 1. **Compiled defaults** ([`ParleySettings::default()`])
//! 2. **Settings file** (`~/.parley/settings.json` or `--config`), deep-merged over defaults
//! 3. **Environment variables** (`PARLEY_*`, highest priority)
//!
//! Settings are loaded once at startup and passed down explicitly.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
