#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::Deserialize;
use slate_ast::AccountAddress;
use slate_interpret::VmConfig;
use thiserror::Error;

pub const CONFIG_FILE: &str = "slate.toml";

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read {}", path.display())]
    #[diagnostic(code(slate::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}", path.display())]
    #[diagnostic(code(slate::config::parse), help("known sections are `[check]`, `[runtime]` and `[log]`"))]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SlateConfig {
    /// Where the settings came from; `None` when defaults are in effect.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
    pub check: CheckConfig,
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Check function bodies on the rayon pool.
    pub parallel: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self { parallel: true }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_call_depth: usize,
    /// Interpreter thread stack in bytes; derived from `max_call_depth`
    /// when unset.
    pub stack_size: Option<usize>,
    /// Signer handed to `&signer` parameters by `run` and `test`.
    pub sender: AccountAddress,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
            stack_size: None,
            sender: AccountAddress::from_u64(1),
        }
    }
}

impl RuntimeConfig {
    pub fn vm_config(&self) -> VmConfig {
        VmConfig {
            max_call_depth: self.max_call_depth,
            stack_size: self.stack_size,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `SLATE_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Nearest `slate.toml` at or above `start`.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut cur = if start.is_file() {
        start.parent()?.to_path_buf()
    } else {
        start.to_path_buf()
    };
    loop {
        let candidate = cur.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !cur.pop() {
            return None;
        }
    }
}

/// Load `explicit` if given, otherwise search upward from `start`. No file
/// means defaults.
pub fn load_config(explicit: Option<&Path>, start: &Path) -> Result<SlateConfig, ConfigError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match find_config(start) {
            Some(p) => p,
            None => return Ok(SlateConfig::default()),
        },
    };
    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let mut config: SlateConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    config.config_path = Some(path);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(None, dir.path()).expect("load");
        assert!(config.config_path.is_none());
        assert!(config.check.parallel);
        assert_eq!(config.runtime.max_call_depth, 1024);
        assert_eq!(config.runtime.sender, AccountAddress::from_u64(1));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_found_in_parent_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[runtime]\nsender = \"0xcafe\"\n\n[check]\nparallel = false\n",
        )
        .expect("write config");
        let nested = dir.path().join("modules");
        fs::create_dir(&nested).expect("mkdir");
        let module = nested.join("bank.json");
        fs::write(&module, "{}").expect("write module");

        let config = load_config(None, &module).expect("load");
        assert_eq!(config.config_path, Some(dir.path().join(CONFIG_FILE)));
        assert!(!config.check.parallel);
        assert_eq!(config.runtime.sender, AccountAddress::from_u64(0xcafe));
        assert_eq!(config.runtime.max_call_depth, 1024);
    }

    #[test]
    fn test_runtime_section_configures_the_vm() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[runtime]\nmax_call_depth = 16\nstack_size = 8388608\n").expect("write config");
        let vm = load_config(Some(&path), dir.path()).expect("load").runtime.vm_config();
        assert_eq!(vm.max_call_depth, 16);
        assert_eq!(vm.stack_size(), 8 * 1024 * 1024);

        let derived = RuntimeConfig::default().vm_config();
        assert_eq!(derived.stack_size, None);
        assert!(derived.stack_size() > 1024 * 64 * 1024);
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[runtime]\nmax_call_depth = \"deep\"\n").expect("write config");
        let err = load_config(Some(&path), dir.path()).expect_err("malformed");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_explicit_missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_config(Some(&dir.path().join("nope.toml")), dir.path()).expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
