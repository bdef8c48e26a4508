//! Processor configuration.
//!
//! Recognised options, all optional in a TOML document:
//!
//! ```toml
//! name = "orders"
//! backlog = 4096
//! shared = true
//! wait_strategy = "yielding"   # blocking | busy-spin | yielding | sleeping | phased
//! auto_startup = true
//! error_policy = "continue"    # continue | halt
//! ```

use serde::Deserialize;

use crate::constants::{DEFAULT_BACKLOG, MAX_CAPACITY};
use crate::disruptor::{capacity_for, ProducerMode, WaitStrategyKind};
use crate::error::{Result, TopicError};

/// What a consumer does after its subscriber fails on an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Report the failure and move on to the next slot
    #[default]
    Continue,
    /// Report the failure and stop this consumer
    Halt,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Logical identity; prefixes worker thread names
    pub name: String,
    /// Requested ring capacity, rounded up to a power of two
    pub backlog: usize,
    /// Multi-producer when true
    pub shared: bool,
    pub wait_strategy: WaitStrategyKind,
    pub auto_startup: bool,
    pub error_policy: ErrorPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "topic".to_string(),
            backlog: DEFAULT_BACKLOG,
            shared: false,
            wait_strategy: WaitStrategyKind::default(),
            auto_startup: true,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn new(name: impl Into<String>, backlog: usize) -> Self {
        Self {
            name: name.into(),
            backlog,
            ..Default::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| TopicError::config(format!("unreadable processor config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_wait_strategy(mut self, wait_strategy: WaitStrategyKind) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    pub fn with_auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = auto_startup;
        self
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TopicError::config("name must not be empty"));
        }
        if self.backlog == 0 {
            return Err(TopicError::config("backlog must be greater than 0"));
        }
        if self.backlog > MAX_CAPACITY {
            return Err(TopicError::config(format!(
                "backlog {} exceeds the maximum of {MAX_CAPACITY}",
                self.backlog
            )));
        }
        Ok(())
    }

    /// Ring capacity this configuration allocates.
    pub fn capacity(&self) -> Result<usize> {
        self.validate()?;
        Ok(capacity_for(self.backlog))
    }

    pub fn producer_mode(&self) -> ProducerMode {
        if self.shared {
            ProducerMode::Multi
        } else {
            ProducerMode::Single
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.backlog, 1024);
        assert!(!config.shared);
        assert_eq!(config.wait_strategy, WaitStrategyKind::Blocking);
        assert!(config.auto_startup);
        assert_eq!(config.error_policy, ErrorPolicy::Continue);
        assert_eq!(config.producer_mode(), ProducerMode::Single);
    }

    #[test]
    fn test_capacity_rounding() {
        assert_eq!(ProcessorConfig::new("t", 1000).capacity().unwrap(), 1024);
        assert_eq!(ProcessorConfig::new("t", 1).capacity().unwrap(), 2);
        assert!(ProcessorConfig::new("t", 0).capacity().is_err());
        assert!(ProcessorConfig::new("t", MAX_CAPACITY + 1).capacity().is_err());
        assert!(ProcessorConfig::new(" ", 16).validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = ProcessorConfig::from_toml_str(
            r#"
            name = "orders"
            backlog = 300
            shared = true
            wait_strategy = "busy-spin"
            error_policy = "halt"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "orders");
        assert_eq!(config.capacity().unwrap(), 512);
        assert_eq!(config.producer_mode(), ProducerMode::Multi);
        assert_eq!(config.wait_strategy, WaitStrategyKind::BusySpin);
        assert_eq!(config.error_policy, ErrorPolicy::Halt);
        assert!(config.auto_startup);
    }

    #[test]
    fn test_from_toml_rejects_bad_input() {
        assert!(ProcessorConfig::from_toml_str("backlog = 0").is_err());
        assert!(ProcessorConfig::from_toml_str("wait_strategy = \"lazy\"").is_err());
        assert!(ProcessorConfig::from_toml_str("threads = 4").is_err());
    }
}
