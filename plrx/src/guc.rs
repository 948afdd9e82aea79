//! Bridge settings, read from the engine's configuration at startup.
use crate::context;
use crate::error::{ConfigError, Result};
use crate::sys::Backend;

/// Name of the engine setting that selects how a savepoint left open by an
/// exiting invocation is resolved.
pub const RELEASE_LINGERING_SAVEPOINTS: &str = "plrx.release_lingering_savepoints";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Release (rather than roll back) a savepoint still open when the
    /// invocation that set it returns normally.
    pub release_lingering_savepoints: bool,
}

impl Config {
    /// Reads every setting from the engine, falling back to the default for
    /// any that is not defined.
    pub fn from_backend(backend: &dyn Backend) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(value) = backend.config_option(RELEASE_LINGERING_SAVEPOINTS) {
            config.release_lingering_savepoints = parse_bool(RELEASE_LINGERING_SAVEPOINTS, &value)?;
        }
        Ok(config)
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError { name, value: value.to_owned() }),
    }
}

/// The settings currently in force.
pub fn config() -> Result<Config> {
    Ok(context::bridge()?.config.get())
}

pub fn set_release_lingering_savepoints(release: bool) -> Result<()> {
    let bridge = context::bridge()?;
    let mut config = bridge.config.get();
    config.release_lingering_savepoints = release;
    bridge.config.set(config);
    Ok(())
}
