use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::onnx::InferenceBackend;
use crate::tiling::TilingConfig;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "PATCHSCALE_DATA_DIR";
pub const DEFAULT_OUTPUT_SUFFIX: &str = "_2x";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub tiling: TilingConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// ONNX model; relative paths resolve against the data directory.
    /// Without a model the identity upscaler is used.
    pub path: Option<PathBuf>,
    pub backend: InferenceBackend,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    /// Where results are written; next to the input when unset.
    pub dir: Option<PathBuf>,
    /// Appended to the input's file stem.
    pub suffix: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            backend: InferenceBackend::default(),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: None,
            suffix: DEFAULT_OUTPUT_SUFFIX.to_string(),
        }
    }
}

impl OutputConfig {
    /// `<dir>/<stem><suffix>.png`, where `dir` is `dir_override`, then the
    /// configured directory, then the input's own directory.
    pub fn output_path(&self, input: &Path, dir_override: Option<&Path>) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let file_name = format!("{stem}{}.png", self.suffix);

        let dir = dir_override
            .map(Path::to_path_buf)
            .or_else(|| self.dir.clone())
            .or_else(|| input.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        dir.join(file_name)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .tiling
            .validate()
            .with_context(|| format!("invalid [tiling] section in {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. PATCHSCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.model.path, None);
        assert_eq!(cfg.model.backend, InferenceBackend::Cuda);
        assert_eq!(cfg.model.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.tiling, TilingConfig::default());
        assert_eq!(cfg.output.dir, None);
        assert_eq!(cfg.output.suffix, "_2x");
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.model.path = Some(PathBuf::from("models/restore.onnx"));
        original.model.backend = InferenceBackend::Tensorrt;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let decoded: AppConfig =
            toml::from_str("[tiling]\npatch_size = 16\n[model]\nbackend = \"tensorrt\"\n")
                .expect("deserialize config");
        assert_eq!(decoded.tiling.patch_size, 16);
        assert_eq!(decoded.tiling.size_factor, 64);
        assert_eq!(decoded.model.backend, InferenceBackend::Tensorrt);
        assert_eq!(decoded.output.suffix, "_2x");
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_empty_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "  \n").expect("write config");
        assert_eq!(
            AppConfig::load_from_path(&path).expect("load config"),
            AppConfig::default()
        );
    }

    #[test]
    fn load_rejects_invalid_tiling() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[tiling]\npatch_size = 32\nsize_factor = 48\n").expect("write config");

        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("size_factor"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_var_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }
        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let dir = temp.path().join("nested");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&dir)).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[output]\nsuffix = \"_hd\"\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_handles_both_kinds() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }

    #[test]
    fn output_path_prefers_override_then_config_then_input_dir() {
        let mut output = OutputConfig::default();
        let input = Path::new("/photos/cat.jpg");

        assert_eq!(
            output.output_path(input, None),
            PathBuf::from("/photos/cat_2x.png")
        );

        output.dir = Some(PathBuf::from("/out"));
        assert_eq!(output.output_path(input, None), PathBuf::from("/out/cat_2x.png"));
        assert_eq!(
            output.output_path(input, Some(Path::new("/cli"))),
            PathBuf::from("/cli/cat_2x.png")
        );
    }
}
