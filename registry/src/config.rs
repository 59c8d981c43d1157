use super::*;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Name used to identify this registry in log output. A process may
    /// host several registries.
    pub name: String,

    /// How long an unregistration may block on outstanding service uses
    /// before a warning is logged. The wait itself is unbounded; zero
    /// disables the warning.
    pub unregister_grace: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            unregister_grace: std::time::Duration::from_secs(10),
        }
    }
}
