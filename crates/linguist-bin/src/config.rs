//! Configuration loading and parsing.
//!
//! `linguist.toml` supplies defaults for the output-side switches; explicit
//! command-line flags always win. Discovery prefers a file in the working
//! directory, then falls back to the platform config directory. Unknown
//! fields are ignored and a malformed file degrades to defaults, so a stale
//! config never blocks a transformation.

use std::{fs, path::PathBuf};

use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, rename = "line-folding")]
    pub line_folding: Option<bool>,
    #[serde(default, rename = "text-prefixing")]
    pub text_prefixing: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct DiagnosticsConfig {
    #[serde(default)]
    pub quiet: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// Best-effort config path following platform conventions.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("linguist.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("linguist").join("linguist.toml");
    }
    PathBuf::from("linguist.toml")
}

pub fn load_from(path: Option<PathBuf>) -> ConfigFile {
    let path = path.unwrap_or_else(discover);
    let Ok(content) = fs::read_to_string(&path) else {
        return ConfigFile::default();
    };
    match toml::from_str::<ConfigFile>(&content) {
        Ok(file) => {
            info!(target: "config", path = %path.display(), "loaded configuration");
            file
        }
        Err(_e) => ConfigFile::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_from(Some(PathBuf::from("__no_such_linguist_config__.toml")));
        assert!(cfg.output.format.is_none());
        assert!(cfg.diagnostics.quiet.is_none());
    }

    #[test]
    fn parses_output_switches() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[output]\nformat = \"cif11\"\nline-folding = false\n[diagnostics]\nquiet = true\n",
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf()));
        assert_eq!(cfg.output.format.as_deref(), Some("cif11"));
        assert_eq!(cfg.output.line_folding, Some(false));
        assert_eq!(cfg.output.text_prefixing, None);
        assert_eq!(cfg.diagnostics.quiet, Some(true));
    }

    #[test]
    fn malformed_file_degrades_to_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[output\nnot toml").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf()));
        assert!(cfg.output.format.is_none());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[output]\nfuture-knob = 3\nformat = \"cif20\"\n").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf()));
        assert_eq!(cfg.output.format.as_deref(), Some("cif20"));
    }
}
