use crate::consensus::SenderId;
use crate::logger::LogFormat;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub field: String,
    pub reason: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Configuration error in {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Settings of one agreement node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub cluster_size: usize,
    /// Distinct-sender votes needed per phase. `None` derives `2f+1` from
    /// `cluster_size`.
    pub quorum_threshold: Option<usize>,
    /// How long finished rounds linger to absorb late duplicates.
    pub gc_grace: Duration,
    /// Unfinished rounds older than this are discarded by the GC task.
    pub round_timeout: Duration,
    /// SQLite journal file; in-memory journal when unset.
    pub journal_path: Option<String>,
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("node-0")
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        NodeConfig {
            node_id: node_id.into(),
            cluster_size: 4,
            quorum_threshold: None,
            gc_grace: Duration::from_secs(30),
            round_timeout: Duration::from_secs(60),
            journal_path: None,
            log_format: LogFormat::Compact,
        }
    }

    /// Reads `LEDGER_*` variables, loading `.env` first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = NodeConfig::new(env::var("LEDGER_NODE_ID").unwrap_or_else(|_| "node-0".to_string()));
        if let Some(size) = parse_var::<usize>("LEDGER_CLUSTER_SIZE")? {
            config.cluster_size = size;
        }
        config.quorum_threshold = parse_var::<usize>("LEDGER_QUORUM")?;
        if let Some(ms) = parse_var::<u64>("LEDGER_GC_GRACE_MS")? {
            config.gc_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("LEDGER_ROUND_TIMEOUT_MS")? {
            config.round_timeout = Duration::from_millis(ms);
        }
        config.journal_path = env::var("LEDGER_JOURNAL_PATH").ok().filter(|p| !p.is_empty());
        if let Ok(format) = env::var("LEDGER_LOG_FORMAT") {
            config.log_format = format.parse().map_err(|reason| ConfigError {
                field: "LEDGER_LOG_FORMAT".to_string(),
                reason,
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_cluster_size(mut self, size: usize) -> Self {
        self.cluster_size = size;
        self
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum_threshold = Some(quorum);
        self
    }

    pub fn with_gc_grace(mut self, grace: Duration) -> Self {
        self.gc_grace = grace;
        self
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self
    }

    pub fn with_journal_path(mut self, path: impl Into<String>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    /// `2f + 1` where `f = (n - 1) / 3` Byzantine peers are tolerated.
    pub fn bft_quorum(cluster_size: usize) -> usize {
        let f = cluster_size.saturating_sub(1) / 3;
        (2 * f) + 1
    }

    pub fn quorum(&self) -> usize {
        self.quorum_threshold
            .unwrap_or_else(|| Self::bft_quorum(self.cluster_size))
    }

    pub fn sender_id(&self) -> SenderId {
        SenderId::new(self.node_id.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError {
                field: "node_id".to_string(),
                reason: "Node id cannot be empty".to_string(),
            });
        }

        if self.cluster_size == 0 {
            return Err(ConfigError {
                field: "cluster_size".to_string(),
                reason: "Cluster needs at least one node".to_string(),
            });
        }

        if self.round_timeout.is_zero() {
            return Err(ConfigError {
                field: "round_timeout".to_string(),
                reason: "Round timeout must be positive".to_string(),
            });
        }

        if self.quorum() == 0 {
            return Err(ConfigError {
                field: "quorum_threshold".to_string(),
                reason: "Quorum must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError {
            field: name.to_string(),
            reason: format!("'{}' is not a valid number", raw),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bft_quorum_calculation() {
        assert_eq!(NodeConfig::bft_quorum(4), 3);
        assert_eq!(NodeConfig::bft_quorum(7), 5);
        assert_eq!(NodeConfig::bft_quorum(10), 7);
        assert_eq!(NodeConfig::bft_quorum(1), 1);
    }

    #[test]
    fn test_explicit_quorum_wins() {
        let config = NodeConfig::new("n1").with_cluster_size(7).with_quorum(2);
        assert_eq!(config.quorum(), 2);

        let config = NodeConfig::new("n1").with_cluster_size(7);
        assert_eq!(config.quorum(), 5);
    }

    #[test]
    fn test_validate_rejects_zero_quorum() {
        let config = NodeConfig::new("n1").with_quorum(0);
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "quorum_threshold");
    }

    #[test]
    fn test_validate_rejects_empty_node_id() {
        assert!(NodeConfig::new("").validate().is_err());
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_round_timeout() {
        let config = NodeConfig::new("n1").with_round_timeout(Duration::ZERO);
        assert_eq!(config.validate().unwrap_err().field, "round_timeout");

        let config = NodeConfig::new("n1").with_round_timeout(Duration::from_secs(5));
        assert_eq!(config.round_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_settings() {
        let config = NodeConfig::new("n2")
            .with_gc_grace(Duration::from_millis(250))
            .with_journal_path("journal.db");

        assert_eq!(config.gc_grace, Duration::from_millis(250));
        assert_eq!(config.journal_path.as_deref(), Some("journal.db"));
        assert_eq!(config.sender_id().as_str(), "n2");
    }
}
