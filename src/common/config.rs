//! Configuration file handling

use serde::Deserialize;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Listener and upstream browser settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Module and symbol loading settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Names the sandbox uses for its internal frames
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Listener settings
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the front end connects to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Browser remote-debugging endpoint
    #[serde(default = "default_browser")]
    pub browser: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            browser: default_browser(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:9300".to_string()
}

fn default_browser() -> String {
    "http://127.0.0.1:9222".to_string()
}

/// Store settings
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Extension of side-car symbol files
    #[serde(default = "default_symbol_extension")]
    pub symbol_extension: String,

    /// Timeout for a single module or symbol fetch
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Use symbols embedded in the module image when no side-car file is listed
    #[serde(default = "default_true")]
    pub embedded_symbols: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            symbol_extension: default_symbol_extension(),
            fetch_timeout_secs: default_fetch_timeout(),
            embedded_symbols: true,
        }
    }
}

fn default_symbol_extension() -> String {
    "pdb".to_string()
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Sandbox settings
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Native function names marking a managed breakpoint on the stack
    #[serde(default = "default_trampolines")]
    pub trampolines: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            trampolines: default_trampolines(),
        }
    }
}

fn default_trampolines() -> Vec<String> {
    vec![
        "mono_wasm_fire_bp".to_string(),
        "_mono_wasm_fire_bp".to_string(),
    ]
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    super::Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    }
                })?;
                return Self::from_toml(&content);
            }
        }
        Ok(Self::default())
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Whether a function name is one of the breakpoint trampolines
    pub fn is_trampoline(&self, function_name: &str) -> bool {
        self.sandbox.trampolines.iter().any(|t| t == function_name)
    }
}
