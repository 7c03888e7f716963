use anyhow::Result;
use clip_proto::MAX_WIRE_LEN;
use tracing::warn;

use crate::RetrievalConfig;

pub fn check_config(cfg: &RetrievalConfig) -> Result<()> {
    anyhow::ensure!(!cfg.endpoint.host.trim().is_empty(), "retrieval.endpoint.host is empty");
    anyhow::ensure!(cfg.endpoint.port != 0, "retrieval.endpoint.port must be non-zero");
    anyhow::ensure!(cfg.connect_timeout_ms > 0, "retrieval.connect_timeout_ms must be > 0");
    anyhow::ensure!(cfg.max_message_bytes >= 1024, "retrieval.max_message_bytes too small; set >= 1024");
    anyhow::ensure!(
        cfg.max_message_bytes <= MAX_WIRE_LEN,
        "retrieval.max_message_bytes above what an int32 prefix can carry"
    );
    anyhow::ensure!(cfg.max_in_flight >= 1, "retrieval.max_in_flight must be >= 1");
    if cfg.read_timeout_ms == 0 {
        warn!("retrieval: read_timeout_ms=0 - a stalled server blocks its request forever");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_config(&RetrievalConfig::default()).unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = RetrievalConfig::default();
        cfg.endpoint.host = "  ".into();
        assert!(check_config(&cfg).is_err());

        let mut cfg = RetrievalConfig::default();
        cfg.connect_timeout_ms = 0;
        assert!(check_config(&cfg).is_err());

        let mut cfg = RetrievalConfig::default();
        cfg.max_message_bytes = 10;
        assert!(check_config(&cfg).is_err());

        let mut cfg = RetrievalConfig::default();
        cfg.max_in_flight = 0;
        assert!(check_config(&cfg).is_err());
    }

    #[test]
    fn unbounded_reads_are_allowed() {
        let cfg = RetrievalConfig { read_timeout_ms: 0, ..Default::default() };
        check_config(&cfg).unwrap();
    }
}
