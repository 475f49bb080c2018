use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub(crate) const DEFAULT_WORKERS: usize = 16;
pub(crate) const DEFAULT_VARIANT: &str = "release";

/// Classes and entry points the rewritten code calls into.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct HookAbi {
    pub(crate) trace_class: String,
    pub(crate) begin: String,
    pub(crate) end: String,
    pub(crate) throw: String,
    pub(crate) lifecycle_class: String,
}

impl Default for HookAbi {
    fn default() -> Self {
        HookAbi {
            trace_class: "dev/methodtrace/runtime/TraceStub".to_string(),
            begin: "i".to_string(),
            end: "o".to_string(),
            throw: "t".to_string(),
            lifecycle_class: "dev/methodtrace/runtime/TraceApplication".to_string(),
        }
    }
}

impl HookAbi {
    pub(crate) const BEGIN_DESC: &str = "(I)J";
    pub(crate) const END_DESC: &str = "(IJ)V";
    pub(crate) const CAPTURE_DESC: &str = "(Ljava/lang/String;[Ljava/lang/Object;)V";
}

/// Contents of the optional `--config` JSON file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SettingsFile {
    pub(crate) hooks: HookAbi,
    pub(crate) workers: Option<usize>,
    pub(crate) application: Option<String>,
    pub(crate) variant: Option<String>,
}

impl SettingsFile {
    pub(crate) fn load(path: &Path) -> Result<SettingsFile> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Settings for one run, built once and shared by reference with every stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct WeaveConfig {
    pub(crate) hooks: HookAbi,
    /// Dotted original name of the application entry class.
    pub(crate) application: Option<String>,
    pub(crate) variant: String,
    pub(crate) workers: usize,
    pub(crate) artifacts_dir: PathBuf,
}

impl Default for WeaveConfig {
    fn default() -> Self {
        WeaveConfig {
            hooks: HookAbi::default(),
            application: None,
            variant: DEFAULT_VARIANT.to_string(),
            workers: DEFAULT_WORKERS,
            artifacts_dir: PathBuf::from("build/methodtrace"),
        }
    }
}

/// Values given on the command line; they win over the settings file.
#[derive(Debug, Default)]
pub(crate) struct Overrides {
    pub(crate) application: Option<String>,
    pub(crate) variant: Option<String>,
    pub(crate) workers: Option<usize>,
    pub(crate) artifacts_dir: Option<PathBuf>,
}

impl WeaveConfig {
    pub(crate) fn resolve(settings: SettingsFile, overrides: Overrides) -> Result<WeaveConfig> {
        let defaults = WeaveConfig::default();
        let workers = overrides
            .workers
            .or(settings.workers)
            .unwrap_or(defaults.workers);
        if workers == 0 {
            anyhow::bail!("worker count must be at least 1");
        }
        Ok(WeaveConfig {
            hooks: settings.hooks,
            application: overrides
                .application
                .or(settings.application)
                .map(|name| name.replace('/', ".")),
            variant: overrides
                .variant
                .or(settings.variant)
                .unwrap_or(defaults.variant),
            workers,
            artifacts_dir: overrides.artifacts_dir.unwrap_or(defaults.artifacts_dir),
        })
    }

    /// `<artifacts-dir>/<variant>`, where the catalog and reports go.
    pub(crate) fn variant_dir(&self) -> PathBuf {
        self.artifacts_dir.join(&self.variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_file_fills_gaps_and_flags_win() {
        let settings: SettingsFile = serde_json::from_str(
            r#"{
                "hooks": { "traceClass": "com/acme/Probe" },
                "workers": 4,
                "application": "com/acme/App",
                "variant": "debug"
            }"#,
        )
        .expect("parse settings");
        let config = WeaveConfig::resolve(
            settings,
            Overrides {
                variant: Some("staging".to_string()),
                ..Overrides::default()
            },
        )
        .expect("resolve");

        assert_eq!("com/acme/Probe", config.hooks.trace_class);
        assert_eq!("i", config.hooks.begin);
        assert_eq!(4, config.workers);
        assert_eq!(Some("com.acme.App".to_string()), config.application);
        assert_eq!("staging", config.variant);
        assert_eq!(Path::new("build/methodtrace/staging"), config.variant_dir());
    }

    #[test]
    fn unknown_keys_and_zero_workers_are_rejected() {
        assert!(serde_json::from_str::<SettingsFile>(r#"{"threads": 2}"#).is_err());
        let overrides = Overrides {
            workers: Some(0),
            ..Overrides::default()
        };
        assert!(WeaveConfig::resolve(SettingsFile::default(), overrides).is_err());
    }

    #[test]
    fn load_reports_the_path() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("settings.json");
        fs::write(&path, "{ not json").expect("write");

        let err = SettingsFile::load(&path).expect_err("invalid json");
        assert!(format!("{err:#}").contains("settings.json"));
    }
}
