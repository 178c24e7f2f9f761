//! Config file loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use segfetch::DownloadOptions;

/// Download defaults read from a `key = value` config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Default output directory.
    pub dir: Option<PathBuf>,
    pub allow_overwrite: Option<bool>,
    pub auto_file_renaming: Option<bool>,
    pub single_host_multi_connection: Option<bool>,
    pub enable_pipelining: Option<bool>,
    pub persistent_connections: Option<bool>,
    pub max_redirects: Option<u32>,
    /// Piece length in bytes.
    pub piece_length: Option<u64>,
    /// Download cap in bytes per second.
    pub max_download_limit: Option<u64>,
    /// Abort threshold in bytes per second.
    pub lowest_speed_limit: Option<u64>,
    /// Grace period before the lowest speed limit applies.
    pub startup_idle_time_secs: Option<u64>,
}

impl FileConfig {
    /// Overlays the values present in the file onto `options`.
    pub fn apply(&self, options: &mut DownloadOptions) {
        if let Some(dir) = &self.dir {
            options.dir.clone_from(dir);
        }
        if let Some(value) = self.allow_overwrite {
            options.allow_overwrite = value;
        }
        if let Some(value) = self.auto_file_renaming {
            options.auto_file_renaming = value;
        }
        if let Some(value) = self.single_host_multi_connection {
            options.single_host_multi_connection = value;
        }
        if let Some(value) = self.enable_pipelining {
            options.enable_pipelining = value;
        }
        if let Some(value) = self.persistent_connections {
            options.persistent_connections = value;
        }
        if let Some(value) = self.max_redirects {
            options.max_redirects = value;
        }
        if let Some(value) = self.piece_length {
            options.piece_length = value;
        }
        if let Some(value) = self.max_download_limit {
            options.max_download_limit = value;
        }
        if let Some(value) = self.lowest_speed_limit {
            options.lowest_speed_limit = value;
        }
        if let Some(secs) = self.startup_idle_time_secs {
            options.startup_idle_time = Duration::from_secs(secs);
        }
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/segfetch/config.toml`
/// 2. `$HOME/.config/segfetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("segfetch")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("segfetch")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file.
///
/// An explicit path must exist; the default path is optional.
pub fn load(explicit: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = explicit {
        return load_file_config(path).map(Some);
    }
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path).map(Some),
        _ => Ok(None),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "dir" => cfg.dir = Some(PathBuf::from(parse_string_literal(value).with_context(context)?)),
            "allow_overwrite" => cfg.allow_overwrite = Some(parse_boolean(value).with_context(context)?),
            "auto_file_renaming" => {
                cfg.auto_file_renaming = Some(parse_boolean(value).with_context(context)?);
            }
            "single_host_multi_connection" => {
                cfg.single_host_multi_connection = Some(parse_boolean(value).with_context(context)?);
            }
            "enable_pipelining" => {
                cfg.enable_pipelining = Some(parse_boolean(value).with_context(context)?);
            }
            "persistent_connections" => {
                cfg.persistent_connections = Some(parse_boolean(value).with_context(context)?);
            }
            "max_redirects" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("max_redirects out of range for u32"))?;
                cfg.max_redirects = Some(n);
            }
            "piece_length" => cfg.piece_length = Some(parse_integer_u64(value).with_context(context)?),
            "max_download_limit" => {
                cfg.max_download_limit = Some(parse_integer_u64(value).with_context(context)?);
            }
            "lowest_speed_limit" => {
                cfg.lowest_speed_limit = Some(parse_integer_u64(value).with_context(context)?);
            }
            "startup_idle_time_secs" => {
                cfg.startup_idle_time_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_no}"),
        }
    }
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            "dir = \"/tmp/out\" # where files go\nenable_pipelining = true\n\nmax_redirects = 5\n",
        )
        .unwrap();
        assert_eq!(cfg.dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(cfg.enable_pipelining, Some(true));
        assert_eq!(cfg.max_redirects, Some(5));
        assert_eq!(cfg.piece_length, None);
    }

    #[test]
    fn test_parse_config_rejects_unknown_key() {
        let err = parse_config_str("colour = true").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_parse_config_rejects_missing_equals() {
        let err = parse_config_str("allow_overwrite").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_config_rejects_bad_boolean() {
        let err = parse_config_str("\n\nallow_overwrite = yes").unwrap_err();
        assert!(format!("{err:#}").contains("line 3"));
    }

    #[test]
    fn test_hash_inside_string_is_kept() {
        let cfg = parse_config_str("dir = \"/tmp/#1\"").unwrap();
        assert_eq!(cfg.dir, Some(PathBuf::from("/tmp/#1")));
    }

    #[test]
    fn test_apply_overlays_present_values() {
        let cfg = FileConfig {
            piece_length: Some(4096),
            allow_overwrite: Some(true),
            startup_idle_time_secs: Some(3),
            ..FileConfig::default()
        };
        let mut options = DownloadOptions::default();
        cfg.apply(&mut options);
        assert_eq!(options.piece_length, 4096);
        assert!(options.allow_overwrite);
        assert_eq!(options.startup_idle_time, Duration::from_secs(3));
        assert!(options.auto_file_renaming);
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_explicit_path_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "piece_length = 2048\n").unwrap();
        let cfg = load(Some(&path)).unwrap().unwrap();
        assert_eq!(cfg.piece_length, Some(2048));
    }
}
