//! Runtime configuration types.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::language::Language;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    #[default]
    Off,
    /// Always try the JIT on eligible programs
    On,
    /// JIT enabled if native execution is supported on this platform
    Auto,
}

impl JitMode {
    /// Whether `execute()` should attempt a native compile at all.
    pub fn should_attempt(self) -> bool {
        match self {
            JitMode::Off => false,
            JitMode::On => true,
            JitMode::Auto => cfg!(all(target_arch = "x86_64", unix)),
        }
    }
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    pub trace_jit: bool,
    pub gc_stats: bool,
    /// Whether `GC_gc` actually collects (default: true)
    pub gc_enabled: bool,
    /// Hard limit on VM-owned heap bytes (None = unlimited)
    pub heap_limit: Option<usize>,
    pub pool_blocks_per_class: usize,
    /// Message language; `None` means detect from `language.txt`
    pub language: Option<Language>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Off,
            trace_jit: false,
            gc_stats: false,
            gc_enabled: true,
            heap_limit: None,
            pool_blocks_per_class: 100,
            language: None,
        }
    }
}

/// On-disk layout: everything lives under a `[vm]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    vm: VmSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct VmSection {
    jit: Option<JitMode>,
    trace_jit: Option<bool>,
    gc_stats: Option<bool>,
    gc_enabled: Option<bool>,
    heap_limit: Option<usize>,
    pool_blocks_per_class: Option<usize>,
    language: Option<Language>,
}

impl RuntimeConfig {
    /// Parse a TOML config. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))?;
        let vm = file.vm;
        let defaults = Self::default();

        Ok(Self {
            jit_mode: vm.jit.unwrap_or(defaults.jit_mode),
            trace_jit: vm.trace_jit.unwrap_or(defaults.trace_jit),
            gc_stats: vm.gc_stats.unwrap_or(defaults.gc_stats),
            gc_enabled: vm.gc_enabled.unwrap_or(defaults.gc_enabled),
            heap_limit: vm.heap_limit.or(defaults.heap_limit),
            pool_blocks_per_class: vm
                .pool_blocks_per_class
                .unwrap_or(defaults.pool_blocks_per_class),
            language: vm.language.or(defaults.language),
        })
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.jit_mode, JitMode::Off);
        assert!(config.gc_enabled);
        assert_eq!(config.pool_blocks_per_class, 100);
        assert!(config.language.is_none());
    }

    #[test]
    fn test_empty_file_keeps_defaults() {
        assert_eq!(RuntimeConfig::from_toml_str("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_parse_vm_table() {
        let config = RuntimeConfig::from_toml_str(
            r#"
[vm]
jit = "on"
trace_jit = true
heap_limit = 4096
language = "chinese"
"#,
        )
        .unwrap();
        assert_eq!(config.jit_mode, JitMode::On);
        assert!(config.trace_jit);
        assert!(!config.gc_stats);
        assert_eq!(config.heap_limit, Some(4096));
        assert_eq!(config.language, Some(Language::Chinese));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(RuntimeConfig::from_toml_str("[vm]\njit = \"sometimes\"").is_err());
        assert!(RuntimeConfig::from_toml_str("[vm]\nbogus = 1").is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steve.toml");
        std::fs::write(&path, "[vm]\ngc_stats = true\n").unwrap();
        assert!(RuntimeConfig::load(&path).unwrap().gc_stats);
        assert!(RuntimeConfig::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_jit_mode_attempt() {
        assert!(!JitMode::Off.should_attempt());
        assert!(JitMode::On.should_attempt());
    }
}
