//! Compiler configuration.
//!
//! A builder-style [`CompilerConfig`] drives compilation; the CLI can also
//! load a TOML project file (`aster.toml`) whose `[build]` table maps onto
//! the same options.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Annotate the output with `# file:line` source-position comments.
    pub debug_info: bool,
    /// Symbol name of the emitted entry point.
    pub entry: String,
    /// Runtime objects or archives passed to the linker by `build`.
    pub runtime_objects: Vec<PathBuf>,
    /// Additional library search paths for linking.
    pub library_paths: Vec<String>,
    /// Additional libraries to link.
    pub libraries: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            debug_info: false,
            entry: "main".to_string(),
            runtime_objects: Vec::new(),
            library_paths: Vec::new(),
            libraries: Vec::new(),
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    /// Enable source-position annotation (builder pattern).
    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.debug_info = enabled;
        self
    }

    /// Override the entry-point symbol.
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    /// Add a runtime object or archive for the link step.
    pub fn with_runtime_object(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime_objects.push(path.into());
        self
    }

    /// Add a library search path.
    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_paths.push(path.into());
        self
    }

    /// Add a library to link.
    pub fn with_library(mut self, lib: impl Into<String>) -> Self {
        self.libraries.push(lib.into());
        self
    }

    /// Parse the TOML project-file form and fold it over the defaults.
    pub fn from_toml(source: &str) -> Result<Self, String> {
        let file: ConfigFile =
            toml::from_str(source).map_err(|e| format!("Invalid config file: {}", e))?;
        let mut config = CompilerConfig::default();
        if let Some(build) = file.build {
            if let Some(debug) = build.debug_info {
                config.debug_info = debug;
            }
            if let Some(entry) = build.entry {
                config.entry = entry;
            }
            config.runtime_objects = build.runtime.unwrap_or_default();
            config.library_paths = build.library_paths.unwrap_or_default();
            config.libraries = build.libraries.unwrap_or_default();
        }
        Ok(config)
    }
}

/// On-disk form of the configuration.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    build: Option<BuildTable>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct BuildTable {
    debug_info: Option<bool>,
    entry: Option<String>,
    runtime: Option<Vec<PathBuf>>,
    library_paths: Option<Vec<String>>,
    libraries: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert!(!config.debug_info);
        assert_eq!(config.entry, "main");
    }

    #[test]
    fn test_builder() {
        let config = CompilerConfig::new()
            .with_debug_info(true)
            .with_entry("_start")
            .with_runtime_object("runtime/libaster.a")
            .with_library_path("/opt/aster/lib")
            .with_library("m");
        assert!(config.debug_info);
        assert_eq!(config.entry, "_start");
        assert_eq!(config.runtime_objects.len(), 1);
        assert_eq!(config.library_paths, vec!["/opt/aster/lib"]);
        assert_eq!(config.libraries, vec!["m"]);
    }

    #[test]
    fn test_from_toml() {
        let config = CompilerConfig::from_toml(
            r#"
            [build]
            debug-info = true
            runtime = ["rt/start.o", "rt/libaster.a"]
            libraries = ["c"]
            "#,
        )
        .unwrap();
        assert!(config.debug_info);
        assert_eq!(config.runtime_objects.len(), 2);
        assert_eq!(config.libraries, vec!["c"]);
        assert_eq!(config.entry, "main");
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(CompilerConfig::from_toml("build = 3").is_err());
    }
}
