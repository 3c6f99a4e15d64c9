//! Configuration management for the Horizon module host.
//!
//! This module handles loading, validation, and conversion of host
//! configuration from TOML files and command-line arguments.

use crate::cli::CliArgs;
use anyhow::Context;
use module_system::{RustcConfig, ServerHandle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration loaded from TOML file.
///
/// Encompasses server identity, module loading, compiler and logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server settings handed to modules
    pub server: ServerSettings,
    /// Module discovery and loading settings
    pub modules: ModuleSettings,
    /// How module sources are compiled
    #[serde(default)]
    pub compiler: CompilerSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

/// The server modules are attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Name reported to modules
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Network address the server binds to (e.g., "127.0.0.1:8080")
    pub bind_address: String,
}

fn default_server_name() -> String {
    "horizon".to_string()
}

/// Module system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSettings {
    /// Directory holding module source files
    pub directory: String,
    /// Whether to load all modules on startup
    pub auto_load: bool,
    /// Module whitelist - if non-empty, only these identities are loaded
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Scratch space for staged sources and loaded images
    #[serde(default = "default_build_directory")]
    pub build_directory: String,
}

fn default_build_directory() -> String {
    "target/horizon-modules".to_string()
}

/// Module compiler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerSettings {
    /// rustc executable
    pub rustc: String,
    /// `-C opt-level`
    pub opt_level: String,
    /// `-C debuginfo` (0, 1 or 2)
    pub debuginfo: u8,
    /// Lints promoted to errors
    #[serde(default)]
    pub deny_lints: Vec<String>,
    /// Extra arguments passed to rustc verbatim
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            rustc: "rustc".to_string(),
            opt_level: "1".to_string(),
            debuginfo: 2,
            deny_lints: vec![],
            extra_args: vec![],
        }
    }
}

/// Logging system configuration.
///
/// Controls log output format, levels, and destination settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
    /// Optional file path for log output, in addition to stdout
    pub file_path: Option<String>,
}

/// Where a loaded configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    File,
    /// The file was missing and the defaults were written to it.
    CreatedDefault,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                name: default_server_name(),
                bind_address: "127.0.0.1:8080".to_string(),
            },
            modules: ModuleSettings {
                directory: "modules".to_string(),
                auto_load: true,
                whitelist: vec![],
                build_directory: default_build_directory(),
            },
            compiler: CompilerSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
                file_path: None,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to `path`
    /// and returns it. Runs before logging is set up, so the caller reports
    /// the [`ConfigOrigin`].
    pub async fn load_from_file(path: &Path) -> anyhow::Result<(Self, ConfigOrigin)> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok((config, ConfigOrigin::File))
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok((default_config, ConfigOrigin::CreatedDefault))
        }
    }

    /// Applies command-line overrides.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(module_dir) = &args.module_dir {
            self.modules.directory = module_dir.to_string_lossy().to_string();
        }
        if let Some(bind_address) = &args.bind_address {
            self.server.bind_address = bind_address.clone();
        }
        if let Some(log_level) = &args.log_level {
            self.logging.level = log_level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Directory rustc stages and builds modules in.
    pub fn compile_directory(&self) -> PathBuf {
        PathBuf::from(&self.modules.build_directory).join("compile")
    }

    /// Directory loaded generations live in.
    pub fn domain_directory(&self) -> PathBuf {
        PathBuf::from(&self.modules.build_directory).join("loaded")
    }

    pub fn to_compiler_config(&self) -> RustcConfig {
        RustcConfig {
            rustc: PathBuf::from(&self.compiler.rustc),
            build_directory: self.compile_directory(),
            opt_level: self.compiler.opt_level.clone(),
            debuginfo: self.compiler.debuginfo,
            deny_lints: self.compiler.deny_lints.clone(),
            extra_args: self.compiler.extra_args.clone(),
        }
    }

    pub fn server_handle(&self) -> ServerHandle {
        ServerHandle {
            name: self.server.name.clone(),
            bind_address: self.server.bind_address.clone(),
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// Returns an error string describing the first issue found.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.server.bind_address
            ));
        }

        if self.modules.directory.is_empty() {
            return Err("Module directory cannot be empty".to_string());
        }
        if self.modules.build_directory.is_empty() {
            return Err("Module build directory cannot be empty".to_string());
        }

        if self.compiler.rustc.is_empty() {
            return Err("Compiler path cannot be empty".to_string());
        }
        let valid_opt_levels = ["0", "1", "2", "3", "s", "z"];
        if !valid_opt_levels.contains(&self.compiler.opt_level.as_str()) {
            return Err(format!(
                "Invalid opt_level: {}. Must be one of: {valid_opt_levels:?}",
                &self.compiler.opt_level
            ));
        }
        if self.compiler.debuginfo > 2 {
            return Err("debuginfo must be 0, 1 or 2".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
