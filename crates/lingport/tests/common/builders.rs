//! Builder for creating test configurations programmatically.

#![allow(dead_code)]

use std::path::Path;

use lingport::config::{Config, DerivedConfig, ToolConfig};

/// Builder for creating `Config` instances.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new(projects_root: &Path, converter: ToolConfig) -> Self {
        Self {
            config: Config::new(projects_root.to_string_lossy(), converter),
        }
    }

    pub fn database_path(mut self, path: &Path) -> Self {
        self.config.database_path = Some(path.to_string_lossy().into_owned());
        self
    }

    pub fn converter(mut self, converter: ToolConfig) -> Self {
        self.config.converter = converter;
        self
    }

    pub fn validator(mut self, validator: ToolConfig) -> Self {
        self.config.validator = Some(validator);
        self
    }

    pub fn derived(mut self, derived: DerivedConfig) -> Self {
        self.config.derived = Some(derived);
        self
    }

    pub fn stale_after_secs(mut self, secs: u64) -> Self {
        self.config.conversion.stale_after_secs = secs;
        self
    }

    pub fn failure_patterns(mut self, patterns: &[&str]) -> Self {
        self.config.conversion.failure_patterns = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
