//! Node configuration loading.

use anyhow::Context;
use firma_types::NodeConfig;
use std::path::Path;

/// Loads the TOML config at `path`; a missing path yields the defaults.
pub fn load(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let Some(path) = path else {
        return Ok(NodeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {:?}", path))?;
    toml::from_str(&text).with_context(|| format!("parse config file {:?}", path))
}
