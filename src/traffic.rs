//! Transactional accumulation of traffic counters reported by the proxy

use crate::db::Database;
use crate::error::{Error, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bytes counted by the proxy for one tag since the previous report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Traffic {
    pub tag: String,
    /// Outbound counters are reported too but are not accounted here
    #[serde(default)]
    pub is_inbound: bool,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
}

impl Traffic {
    pub fn inbound(tag: &str, up: i64, down: i64) -> Self {
        Self {
            tag: tag.to_string(),
            is_inbound: true,
            up,
            down,
        }
    }
}

/// Adds traffic deltas to the inbound counters
#[derive(Clone)]
pub struct TrafficAccumulator {
    db: Database,
}

impl TrafficAccumulator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply a batch of deltas in one transaction
    ///
    /// Deltas for tags without a matching inbound are ignored. If any
    /// increment fails, none of the batch is kept. A negative delta rejects
    /// the whole batch.
    pub fn apply_deltas(&self, traffics: &[Traffic]) -> Result<()> {
        if traffics.is_empty() {
            return Ok(());
        }

        if let Some(bad) = traffics.iter().find(|t| t.up < 0 || t.down < 0) {
            return Err(Error::Validation(format!(
                "negative traffic delta for {}",
                bad.tag
            )));
        }

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let mut matched = 0usize;
        {
            let mut stmt =
                tx.prepare("UPDATE inbounds SET up = up + ?1, down = down + ?2 WHERE tag = ?3")?;
            for traffic in traffics.iter().filter(|t| t.is_inbound) {
                matched += stmt.execute(params![traffic.up, traffic.down, traffic.tag])?;
            }
        }
        tx.commit()?;

        debug!(reported = traffics.len(), matched, "Traffic applied");
        Ok(())
    }
}
