//! Runtime configuration.
//!
//! [`RuntimeConfig`] carries everything a [`Runtime`](crate::Runtime) needs to
//! decide at construction time: the supported priority range, whether the
//! legacy control operations are reachable, and how native threads are built.
//!
//! # Example
//!
//! ```rust
//! use threadctl::{PriorityRange, RuntimeConfig};
//!
//! // Use a preset
//! let config = RuntimeConfig::legacy();
//!
//! // Or customize
//! let config = RuntimeConfig::default()
//!     .with_priority_range(PriorityRange::new(0, 31, 16))
//!     .with_max_threads(64)
//!     .with_stack_size(512 * 1024);
//! ```

use crate::thread::Priority;
use crate::DEFAULT_STACK_SIZE;

/// Inclusive range of priorities the platform supports, plus the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriorityRange {
    pub min: i32,
    pub max: i32,
    pub norm: i32,
}

impl PriorityRange {
    /// Creates a range. `norm` is pulled inside `min..=max` and a reversed
    /// range is flipped.
    pub fn new(min: i32, max: i32, norm: i32) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        PriorityRange {
            min,
            max,
            norm: norm.clamp(min, max),
        }
    }

    pub fn contains(&self, value: i32) -> bool {
        (self.min..=self.max).contains(&value)
    }

    pub fn clamp(&self, value: i32) -> Priority {
        Priority(value.clamp(self.min, self.max))
    }

    pub fn norm(&self) -> Priority {
        Priority(self.norm)
    }
}

impl Default for PriorityRange {
    fn default() -> Self {
        PriorityRange {
            min: 1,
            max: 10,
            norm: 5,
        }
    }
}

/// Configuration for a [`Runtime`](crate::Runtime).
///
/// The default configuration:
/// - priorities `1..=10`, default `5`
/// - legacy control (stop, suspend, resume) disabled
/// - native stack size of [`DEFAULT_STACK_SIZE`]
/// - no limit on concurrently started threads
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Priority range used for clamping and as the default for new threads.
    pub priority: PriorityRange,

    /// Gate for [`Runtime::legacy`](crate::Runtime::legacy).
    ///
    /// Stop, suspend and resume are unsafe by contract: a stopped thread does
    /// not exit at a point of its choosing, and a suspended thread keeps every
    /// lock it holds. They are only reachable when this is set.
    pub allow_legacy_control: bool,

    /// Stack size requested for every native thread. `None` uses the platform default.
    pub stack_size: Option<usize>,

    /// Maximum number of started, not yet terminated threads.
    ///
    /// Exceeding it makes `start` fail with
    /// [`Error::ResourceExhausted`](crate::Error::ResourceExhausted), the same
    /// way the platform refusing a thread does.
    pub max_threads: Option<usize>,

    /// Prefix for generated thread names, followed by the thread identity.
    pub name_prefix: String,

    /// Name of the initial thread attached when the runtime is built.
    pub main_thread_name: String,
}

impl RuntimeConfig {
    /// Preset with the legacy control operations enabled.
    pub fn legacy() -> Self {
        RuntimeConfig {
            allow_legacy_control: true,
            ..Default::default()
        }
    }

    pub fn with_priority_range(mut self, range: PriorityRange) -> Self {
        self.priority = range;
        self
    }

    pub fn with_legacy_control(mut self, allow: bool) -> Self {
        self.allow_legacy_control = allow;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = Some(max);
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_main_thread_name(mut self, name: impl Into<String>) -> Self {
        self.main_thread_name = name.into();
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            priority: PriorityRange::default(),
            allow_legacy_control: false,
            stack_size: Some(DEFAULT_STACK_SIZE),
            max_threads: None,
            name_prefix: "Thread-".to_string(),
            main_thread_name: "main".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(!config.allow_legacy_control);
        assert_eq!(config.priority.norm(), Priority(5));
        assert_eq!(config.max_threads, None);
        assert_eq!(config.main_thread_name, "main");
    }

    #[test]
    fn test_legacy_preset() {
        assert!(RuntimeConfig::legacy().allow_legacy_control);
    }

    #[test]
    fn test_priority_range_normalizes() {
        let range = PriorityRange::new(10, 1, 99);
        assert_eq!(range.min, 1);
        assert_eq!(range.max, 10);
        assert_eq!(range.norm, 10);
        assert_eq!(range.clamp(-4), Priority(1));
        assert!(range.contains(7));
        assert!(!range.contains(11));
    }

    #[test]
    fn test_builder_methods() {
        let config = RuntimeConfig::default()
            .with_max_threads(2)
            .with_name_prefix("worker-")
            .with_stack_size(4096)
            .with_legacy_control(true);
        assert_eq!(config.max_threads, Some(2));
        assert_eq!(config.name_prefix, "worker-");
        assert_eq!(config.stack_size, Some(4096));
        assert!(config.allow_legacy_control);
    }
}
