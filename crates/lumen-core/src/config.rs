// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::{fs, io, path::Path};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid render config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePref {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub present_mode: PresentModePref,
    pub msaa_samples: u32,
    pub shadow_map_size: u32,
    pub cascade_count: u32,
    pub texture_capacity: u32,
    pub validation: bool,
    pub shader_root: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            vsync: true,
            present_mode: PresentModePref::Mailbox,
            msaa_samples: 8,
            shadow_map_size: 4096,
            cascade_count: 4,
            texture_capacity: 16384,
            validation: cfg!(debug_assertions),
            shader_root: "shaders".to_owned(),
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // the main pass always resolves, which needs a multisampled source
        if !self.msaa_samples.is_power_of_two() || !(2..=64).contains(&self.msaa_samples) {
            return Err(ConfigError::Invalid(format!(
                "msaa_samples must be a power of two in 2..=64, got {}",
                self.msaa_samples
            )));
        }
        if self.cascade_count == 0 {
            return Err(ConfigError::Invalid("cascade_count must be > 0".into()));
        }
        if self.shadow_map_size == 0 {
            return Err(ConfigError::Invalid("shadow_map_size must be > 0".into()));
        }
        // slot 0 is the fallback texture, so one real slot needs two entries
        if self.texture_capacity < 2 {
            return Err(ConfigError::Invalid(format!(
                "texture_capacity must be >= 2, got {}",
                self.texture_capacity
            )));
        }
        Ok(())
    }
}

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// `[log]`: levels for the fmt subscriber. `RUST_LOG` overrides both.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// The Vulkan backend traces every buffer and image it creates.
    pub backend_level: String,
    pub show_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_owned(),
            backend_level: "info".to_owned(),
            show_targets: false,
        }
    }
}

impl LogConfig {
    pub fn directives(&self) -> String {
        format!("{},lumen_render_vk={}", self.level, self.backend_level)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [("level", &self.level), ("backend_level", &self.backend_level)] {
            if !LEVELS.contains(&value.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "log.{key} must be one of {LEVELS:?}, got {value:?}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl EngineConfig {
    pub fn from_toml(src: &str, path: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = toml::from_str(src).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        cfg.render.validate()?;
        cfg.log.validate()?;
        Ok(cfg)
    }
}

/// Missing file means defaults. A file that exists but does not parse is an error.
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let shown = path.display().to_string();
    match fs::read_to_string(path) {
        Ok(s) => {
            let cfg = EngineConfig::from_toml(&s, &shown)?;
            info!("config loaded from {shown}");
            Ok(cfg)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("{shown} not found, using defaults");
            Ok(EngineConfig::default())
        }
        Err(source) => Err(ConfigError::Read { path: shown, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = EngineConfig::from_toml("", "mem").unwrap();
        assert_eq!(cfg.render.msaa_samples, 8);
        assert_eq!(cfg.render.cascade_count, 4);
        assert_eq!(cfg.render.shadow_map_size, 4096);
        assert_eq!(cfg.render.texture_capacity, 16384);
        assert_eq!(cfg.render.present_mode, PresentModePref::Mailbox);
    }

    #[test]
    fn partial_render_section_keeps_other_defaults() {
        let src = r#"
[render]
present_mode = "fifo"
msaa_samples = 4
shader_root = "assets/shaders"
"#;
        let cfg = EngineConfig::from_toml(src, "mem").unwrap();
        assert_eq!(cfg.render.present_mode, PresentModePref::Fifo);
        assert_eq!(cfg.render.msaa_samples, 4);
        assert_eq!(cfg.render.shader_root, "assets/shaders");
        assert_eq!(cfg.render.cascade_count, 4);
    }

    #[test]
    fn rejects_bad_sample_count() {
        let err = EngineConfig::from_toml("[render]\nmsaa_samples = 3\n", "mem").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn single_sample_is_rejected() {
        let err = EngineConfig::from_toml("[render]\nmsaa_samples = 1\n", "mem").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(EngineConfig::from_toml("[render]\nmsaa_samples = 2\n", "mem").is_ok());
    }

    #[test]
    fn rejects_tiny_texture_table() {
        let err = EngineConfig::from_toml("[render]\ntexture_capacity = 1\n", "mem").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn log_section_builds_filter_directives() {
        assert_eq!(EngineConfig::default().log.directives(), "info,lumen_render_vk=info");
        let src = "[log]\nlevel = \"warn\"\nbackend_level = \"trace\"\nshow_targets = true\n";
        let cfg = EngineConfig::from_toml(src, "mem").unwrap();
        assert_eq!(cfg.log.directives(), "warn,lumen_render_vk=trace");
        assert!(cfg.log.show_targets);
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let err = EngineConfig::from_toml("[log]\nlevel = \"loud\"\n", "mem").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(m) if m.contains("log.level")));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = EngineConfig::from_toml("[render\n", "mem").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_default() {
        let cfg = load_config("definitely/not/here/lumen.toml").unwrap();
        assert_eq!(cfg.render.msaa_samples, 8);
    }
}
