//! Disables inbounds that ran out of quota or expired

use crate::db::Database;
use crate::error::Result;
use rusqlite::params;

/// Current time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct QuotaSweeper {
    db: Database,
}

impl QuotaSweeper {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Disable every enabled inbound whose usage reached its quota or whose
    /// expiry time has passed. Returns the number of inbounds disabled.
    pub fn disable_expired_or_over_quota(&self) -> Result<usize> {
        self.sweep_at(now_millis())
    }

    /// Same as [`disable_expired_or_over_quota`](Self::disable_expired_or_over_quota)
    /// with an explicit clock
    pub fn sweep_at(&self, now_ms: i64) -> Result<usize> {
        let conn = self.db.conn();
        let affected = conn.execute(
            "UPDATE inbounds SET enable = 0
             WHERE enable = 1
               AND ((total > 0 AND up + down >= total)
                    OR (expiry_time > 0 AND expiry_time <= ?1))",
            params![now_ms],
        )?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::{Inbound, InboundRepository};
    use crate::traffic::{Traffic, TrafficAccumulator};

    fn setup() -> (InboundRepository, TrafficAccumulator, QuotaSweeper) {
        let db = Database::open_in_memory().unwrap();
        (
            InboundRepository::new(db.clone()),
            TrafficAccumulator::new(db.clone()),
            QuotaSweeper::new(db),
        )
    }

    #[test]
    fn test_nothing_to_disable() {
        let (repo, _traffic, sweeper) = setup();
        repo.add(&Inbound::new(443, "vmess")).unwrap();
        repo.add(&Inbound::new(444, "vmess").with_total(10)).unwrap();

        assert_eq!(sweeper.sweep_at(1_000).unwrap(), 0);
    }

    #[test]
    fn test_over_quota_is_disabled_once() {
        let (repo, traffic, sweeper) = setup();
        repo.add(&Inbound::new(443, "vmess").with_total(1000)).unwrap();
        repo.add(&Inbound::new(444, "vmess").with_total(1000)).unwrap();

        traffic
            .apply_deltas(&[
                Traffic::inbound("inbound-443", 600, 400),
                Traffic::inbound("inbound-444", 600, 399),
            ])
            .unwrap();

        assert_eq!(sweeper.sweep_at(0).unwrap(), 1);
        assert!(!repo.get_by_port(443).unwrap().enable);
        assert!(repo.get_by_port(444).unwrap().enable);

        assert_eq!(sweeper.sweep_at(0).unwrap(), 0);
    }

    #[test]
    fn test_expired_is_disabled() {
        let (repo, _traffic, sweeper) = setup();
        repo.add(&Inbound::new(443, "vmess").with_expiry_time(5_000)).unwrap();
        repo.add(&Inbound::new(444, "vmess").with_expiry_time(9_000)).unwrap();

        assert_eq!(sweeper.sweep_at(4_999).unwrap(), 0);
        assert_eq!(sweeper.sweep_at(5_000).unwrap(), 1);
        assert_eq!(sweeper.sweep_at(10_000).unwrap(), 1);
        assert_eq!(sweeper.sweep_at(10_000).unwrap(), 0);
    }

    #[test]
    fn test_sweep_never_reenables() {
        let (repo, _traffic, sweeper) = setup();
        let created = repo.add(&Inbound::new(443, "vmess")).unwrap();

        let mut disabled = Inbound::new(443, "vmess");
        disabled.enable = false;
        repo.update(created.id, &disabled).unwrap();

        assert_eq!(sweeper.sweep_at(0).unwrap(), 0);
        assert!(!repo.get_by_id(created.id).unwrap().enable);
    }

    #[test]
    fn test_real_clock_disables_past_expiry() {
        let (repo, _traffic, sweeper) = setup();
        repo.add(&Inbound::new(443, "vmess").with_expiry_time(1)).unwrap();

        assert_eq!(sweeper.disable_expired_or_over_quota().unwrap(), 1);
    }
}
