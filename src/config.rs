use serde::{Deserialize, Serialize};

/// Geometry of a distributed index: number of dimensions and bit width of
/// every coordinate
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IndexConfig {
    pub dim: usize,
    pub depth: u32,
}

impl IndexConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.dim == 0 {
            return Err("dim must be at least 1".to_string());
        }
        if self.depth == 0 || self.depth > 64 {
            return Err(format!("depth must be in [1, 64], got {}", self.depth));
        }
        Ok(())
    }
}

/// Client-side tunables of the routing proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Page size used by batch iteration
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::{ClientConfig, IndexConfig};

    #[test]
    fn validate_rejects_bad_geometry() {
        assert!(IndexConfig { dim: 0, depth: 8 }.validate().is_err());
        assert!(IndexConfig { dim: 2, depth: 0 }.validate().is_err());
        assert!(IndexConfig { dim: 2, depth: 65 }.validate().is_err());
        assert!(IndexConfig { dim: 2, depth: 64 }.validate().is_ok());
    }

    #[test]
    fn client_config_defaults_batch_size() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.batch_size, ClientConfig::default().batch_size);
    }
}
