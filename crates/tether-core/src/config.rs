//! Engine configuration
//!
//! Options are plain serde structs; every field has a default so a partial
//! TOML document is enough:
//!
//! ```toml
//! [coordinator]
//! idle_interval_ms = 5
//!
//! [binder]
//! recursive = true
//! default_security = "READ"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::binder::SecurityFlags;
use crate::error::{BridgeError, BridgeResult};

/// Top-level engine options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Lifetime coordinator tuning
    pub coordinator: CoordinatorOptions,
    /// Binder defaults applied by `register_type`
    pub binder: BinderOptions,
    /// In-process native engine tuning
    pub heap: HeapOptions,
}

impl EngineOptions {
    /// Parse options from a TOML document
    pub fn from_toml_str(source: &str) -> BridgeResult<Self> {
        let options: EngineOptions = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> BridgeResult<()> {
        if self.coordinator.queue_capacity == 0 {
            return Err(BridgeError::Config(
                "coordinator.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.heap.gc_threshold == 0 {
            return Err(BridgeError::Config(
                "heap.gc_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifetime coordinator options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorOptions {
    /// How long the worker waits for work before running an idle step
    pub idle_interval_ms: u64,
    /// Pause between processed items
    pub yield_interval_us: u64,
    /// Grace period for `terminate` before the worker is abandoned
    pub terminate_timeout_ms: u64,
    /// Bounded capacity of each work queue before spilling to overflow
    pub queue_capacity: usize,
    /// Nudge the native collector while idle
    pub idle_gc_enabled: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            idle_interval_ms: 10,
            yield_interval_us: 50,
            terminate_timeout_ms: 3000,
            queue_capacity: 4096,
            idle_gc_enabled: true,
        }
    }
}

impl CoordinatorOptions {
    /// Idle wait as a duration
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    /// Yield pause as a duration
    pub fn yield_interval(&self) -> Duration {
        Duration::from_micros(self.yield_interval_us)
    }

    /// Terminate grace period as a duration
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

/// Options that shape a type binder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BinderOptions {
    /// Expose object-typed fields and properties
    pub recursive: bool,
    /// Security for members that declare none
    pub default_security: SecurityFlags,
}

impl Default for BinderOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            default_security: SecurityFlags::READ_WRITE,
        }
    }
}

impl BinderOptions {
    /// Options with recursive exposure enabled
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Self::default()
        }
    }
}

/// In-process native engine options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeapOptions {
    /// Slot table capacity reserved up front
    pub initial_slots: usize,
    /// Allocations between idle collections
    pub gc_threshold: usize,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            initial_slots: 256,
            gc_threshold: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.coordinator.idle_interval(), Duration::from_millis(10));
        assert_eq!(options.coordinator.terminate_timeout(), Duration::from_secs(3));
        assert!(!options.binder.recursive);
        assert_eq!(options.binder.default_security, SecurityFlags::READ_WRITE);
        assert_eq!(options.heap.gc_threshold, 1024);
    }

    #[test]
    fn test_partial_toml() {
        let options = EngineOptions::from_toml_str(
            r#"
            [coordinator]
            idle_interval_ms = 2

            [binder]
            recursive = true
            default_security = "READ"
            "#,
        )
        .unwrap();
        assert_eq!(options.coordinator.idle_interval_ms, 2);
        assert_eq!(options.coordinator.queue_capacity, 4096);
        assert!(options.binder.recursive);
        assert_eq!(options.binder.default_security, SecurityFlags::READ);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = EngineOptions::from_toml_str("[coordinator]\nspeed = 3\n").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = EngineOptions::from_toml_str("[coordinator]\nqueue_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[heap]\ngc_threshold = 8").unwrap();
        let options = EngineOptions::from_file(file.path()).unwrap();
        assert_eq!(options.heap.gc_threshold, 8);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineOptions::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
