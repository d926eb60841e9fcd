//! Converter runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into the converter. The
//! engine never reads environment variables while converting; the binary is responsible for
//! turning `.env`, environment and command-line input into a [`ConverterConfig`].

use crate::constants::{MESSAGE_TEMPLATE_DIR, TEMPLATE_DIR};
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};

/// How ids are generated for resources whose template does not produce one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdStrategy {
    /// Random v4 UUIDs.
    #[default]
    Uuid,
    /// `<type>-<n>` counters, restarting for every message. Output is reproducible.
    Sequential,
}

impl std::str::FromStr for IdStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "uuid" => Ok(Self::Uuid),
            "sequential" | "seq" => Ok(Self::Sequential),
            other => Err(ConfigError::InvalidInput(format!(
                "unknown id strategy '{other}' (expected uuid or sequential)"
            ))),
        }
    }
}

/// Converter configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct ConverterConfig {
    template_dir: PathBuf,
    id_strategy: IdStrategy,
}

impl ConverterConfig {
    /// Create a new `ConverterConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidInput`] if `template_dir` is not a template directory.
    pub fn new(template_dir: PathBuf, id_strategy: IdStrategy) -> ConfigResult<Self> {
        if !looks_like_template_dir(&template_dir) {
            return Err(ConfigError::InvalidInput(format!(
                "{} is not a template directory (must contain {MESSAGE_TEMPLATE_DIR}/)",
                template_dir.display()
            )));
        }

        Ok(Self {
            template_dir,
            id_strategy,
        })
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    pub fn id_strategy(&self) -> IdStrategy {
        self.id_strategy
    }
}

fn looks_like_template_dir(path: &Path) -> bool {
    path.is_dir() && path.join(MESSAGE_TEMPLATE_DIR).is_dir()
}

/// Resolve the template directory without reading environment variables.
///
/// If `override_dir` is provided, it must be a directory containing `message/`. Otherwise this
/// searches for `templates/` relative to the current working directory and then walks up from
/// `CARGO_MANIFEST_DIR`.
pub fn resolve_template_dir(override_dir: Option<PathBuf>) -> ConfigResult<PathBuf> {
    if let Some(template_dir) = override_dir {
        if looks_like_template_dir(&template_dir) {
            return Ok(template_dir);
        }
        return Err(ConfigError::InvalidInput(format!(
            "template directory override {} is not valid (must contain {MESSAGE_TEMPLATE_DIR}/)",
            template_dir.display()
        )));
    }

    let cwd_relative = PathBuf::from(TEMPLATE_DIR);
    if looks_like_template_dir(&cwd_relative) {
        return Ok(cwd_relative);
    }

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    for ancestor in manifest_dir.ancestors() {
        let candidate = ancestor.join(TEMPLATE_DIR);
        if looks_like_template_dir(&candidate) {
            return Ok(candidate);
        }
    }

    Err(ConfigError::InvalidInput(format!(
        "could not locate {TEMPLATE_DIR}/ directory with {MESSAGE_TEMPLATE_DIR}/ subfolder"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_bundled_templates() {
        let dir = resolve_template_dir(None).expect("bundled templates should be found");
        assert!(dir.join(MESSAGE_TEMPLATE_DIR).is_dir());
    }

    #[test]
    fn rejects_override_without_message_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = resolve_template_dir(Some(temp.path().to_path_buf()))
            .expect_err("override should be rejected");
        assert!(matches!(err, ConfigError::InvalidInput(_)));
    }

    #[test]
    fn accepts_override_with_message_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(temp.path().join(MESSAGE_TEMPLATE_DIR)).expect("mkdir");
        let dir = resolve_template_dir(Some(temp.path().to_path_buf())).expect("valid override");
        let config = ConverterConfig::new(dir, IdStrategy::Sequential).expect("config");
        assert_eq!(config.id_strategy(), IdStrategy::Sequential);
    }

    #[test]
    fn parses_id_strategies() {
        assert_eq!("UUID".parse::<IdStrategy>().expect("uuid"), IdStrategy::Uuid);
        assert_eq!(
            "sequential".parse::<IdStrategy>().expect("sequential"),
            IdStrategy::Sequential
        );
        assert!("random".parse::<IdStrategy>().is_err());
    }
}
