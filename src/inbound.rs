//! Inbound records and the repository enforcing their invariants
//!
//! An inbound is one listening endpoint of the supervised proxy process.
//! Ports are unique across all owners and the tag is always derived from the
//! port, so traffic reports can be matched back to a record.

use crate::db::Database;
use crate::error::{Error, Lookup, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const INBOUND_COLUMNS: &str = "id, user_id, up, down, total, remark, enable, expiry_time, \
     listen, port, protocol, settings, stream_settings, sniffing, tag";

/// Tag the proxy process uses for the inbound listening on `port`
pub fn inbound_tag(port: u16) -> String {
    format!("inbound-{}", port)
}

/// One configured listening endpoint
///
/// Also used as the request payload for add and update; `id`, `userId` and
/// `tag` are ignored on input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Inbound {
    pub id: i64,
    pub user_id: i64,
    pub up: i64,
    pub down: i64,
    /// Quota in bytes, 0 means unlimited
    pub total: i64,
    pub remark: String,
    pub enable: bool,
    /// Epoch milliseconds, 0 means no expiry
    pub expiry_time: i64,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: String,
    pub stream_settings: String,
    pub sniffing: String,
    pub tag: String,
}

impl Inbound {
    /// Create an inbound payload for the given port and protocol
    pub fn new(port: u16, protocol: &str) -> Self {
        Self {
            port,
            protocol: protocol.to_string(),
            enable: true,
            ..Default::default()
        }
    }

    /// Set the quota in bytes (builder pattern)
    pub fn with_total(mut self, total: i64) -> Self {
        self.total = total;
        self
    }

    /// Set the remark (builder pattern)
    pub fn with_remark(mut self, remark: &str) -> Self {
        self.remark = remark.to_string();
        self
    }

    /// Set the expiry time in epoch milliseconds (builder pattern)
    pub fn with_expiry_time(mut self, expiry_time: i64) -> Self {
        self.expiry_time = expiry_time;
        self
    }

    /// Set the opaque settings blobs (builder pattern)
    pub fn with_settings(mut self, settings: &str, stream_settings: &str, sniffing: &str) -> Self {
        self.settings = settings.to_string();
        self.stream_settings = stream_settings.to_string();
        self.sniffing = sniffing.to_string();
        self
    }

    /// Reject negative counters, quota or expiry time
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("up", self.up),
            ("down", self.down),
            ("total", self.total),
            ("expiryTime", self.expiry_time),
        ] {
            if value < 0 {
                return Err(Error::Validation(format!(
                    "{} must not be negative (port {})",
                    field, self.port
                )));
            }
        }
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            up: row.get(2)?,
            down: row.get(3)?,
            total: row.get(4)?,
            remark: row.get(5)?,
            enable: row.get(6)?,
            expiry_time: row.get(7)?,
            listen: row.get(8)?,
            port: row.get(9)?,
            protocol: row.get(10)?,
            settings: row.get(11)?,
            stream_settings: row.get(12)?,
            sniffing: row.get(13)?,
            tag: row.get(14)?,
        })
    }
}

/// One page of an owner's inbounds plus aggregates over the filtered set
#[derive(Debug, Clone, Default, Serialize)]
pub struct PagedInbounds {
    pub items: Vec<Inbound>,
    pub total_count: i64,
    pub total_up: i64,
    pub total_down: i64,
}

/// Create/update/delete/list operations over inbound records
#[derive(Clone)]
pub struct InboundRepository {
    db: Database,
}

impl InboundRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// All inbounds of an owner
    pub fn list(&self, user_id: i64) -> Result<Vec<Inbound>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM inbounds WHERE user_id = ?1 ORDER BY id",
            INBOUND_COLUMNS
        ))?;
        let inbounds = stmt
            .query_map(params![user_id], Inbound::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(inbounds)
    }

    /// Every inbound regardless of owner
    pub fn list_all(&self) -> Result<Vec<Inbound>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM inbounds ORDER BY id",
            INBOUND_COLUMNS
        ))?;
        let inbounds = stmt
            .query_map([], Inbound::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(inbounds)
    }

    /// One page of an owner's inbounds, newest first
    ///
    /// `query` matches remark or port as a substring. Counts and sums cover
    /// the whole filtered set, not just the returned page. `page` and
    /// `per_page` must already be at least 1.
    pub fn list_paged(
        &self,
        user_id: i64,
        page: u32,
        per_page: u32,
        query: &str,
    ) -> Result<PagedInbounds> {
        let conn = self.db.conn();

        let mut filter = String::from("WHERE user_id = ?1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id)];

        if !query.is_empty() {
            filter.push_str(" AND (remark LIKE ?2 OR CAST(port AS TEXT) LIKE ?2)");
            params_vec.push(Box::new(format!("%{}%", query)));
        }

        let params: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();

        let (total_count, total_up, total_down): (i64, i64, i64) = conn.query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(up), 0), COALESCE(SUM(down), 0) FROM inbounds {}",
                filter
            ),
            params.as_slice(),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let limit_idx = params.len() + 1;
        let offset = i64::from(page.saturating_sub(1)).saturating_mul(i64::from(per_page));
        let sql = format!(
            "SELECT {} FROM inbounds {} ORDER BY id DESC LIMIT ?{} OFFSET ?{}",
            INBOUND_COLUMNS,
            filter,
            limit_idx,
            limit_idx + 1
        );

        let per_page = i64::from(per_page);
        let mut page_params = params.clone();
        page_params.push(&per_page);
        page_params.push(&offset);

        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(page_params.as_slice(), Inbound::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(PagedInbounds {
            items,
            total_count,
            total_up,
            total_down,
        })
    }

    /// Get an inbound by id
    pub fn get_by_id(&self, id: i64) -> Result<Inbound> {
        fetch_by_id(&self.db.conn(), id)
    }

    /// Get an inbound by listening port
    pub fn get_by_port(&self, port: u16) -> Result<Inbound> {
        fetch_by_port(&self.db.conn(), port)
    }

    /// Create an inbound; it starts enabled with its tag derived from the port
    pub fn add(&self, inbound: &Inbound) -> Result<Inbound> {
        inbound.validate()?;
        let conn = self.db.conn();

        if port_taken(&conn, inbound.port, None)? {
            return Err(Error::PortConflict(inbound.port));
        }

        insert(&conn, inbound)?;
        fetch_by_port(&conn, inbound.port)
    }

    /// Create several inbounds; either all of them are stored or none
    pub fn add_batch(&self, inbounds: &[Inbound]) -> Result<()> {
        for inbound in inbounds {
            inbound.validate()?;
        }
        let mut conn = self.db.conn();

        let mut seen = HashSet::new();
        for inbound in inbounds {
            if !seen.insert(inbound.port) || port_taken(&conn, inbound.port, None)? {
                return Err(Error::PortConflict(inbound.port));
            }
        }

        let tx = conn.transaction()?;
        for inbound in inbounds {
            insert(&tx, inbound)?;
        }
        tx.commit()?;

        Ok(())
    }

    /// Overwrite all mutable fields of inbound `id` with `payload`
    ///
    /// Counters are taken from the payload as well, so an update can reset
    /// usage. The owner and id are kept.
    pub fn update(&self, id: i64, payload: &Inbound) -> Result<Inbound> {
        payload.validate()?;
        let conn = self.db.conn();

        if port_taken(&conn, payload.port, Some(id))? {
            return Err(Error::PortConflict(payload.port));
        }

        let mut inbound = fetch_by_id(&conn, id)?;
        inbound.up = payload.up;
        inbound.down = payload.down;
        inbound.total = payload.total;
        inbound.remark = payload.remark.clone();
        inbound.enable = payload.enable;
        inbound.expiry_time = payload.expiry_time;
        inbound.listen = payload.listen.clone();
        inbound.port = payload.port;
        inbound.protocol = payload.protocol.clone();
        inbound.settings = payload.settings.clone();
        inbound.stream_settings = payload.stream_settings.clone();
        inbound.sniffing = payload.sniffing.clone();
        inbound.tag = inbound_tag(payload.port);

        conn.execute(
            "UPDATE inbounds SET up = ?1, down = ?2, total = ?3, remark = ?4, enable = ?5,
                    expiry_time = ?6, listen = ?7, port = ?8, protocol = ?9, settings = ?10,
                    stream_settings = ?11, sniffing = ?12, tag = ?13
             WHERE id = ?14",
            params![
                inbound.up,
                inbound.down,
                inbound.total,
                inbound.remark,
                inbound.enable,
                inbound.expiry_time,
                inbound.listen,
                inbound.port,
                inbound.protocol,
                inbound.settings,
                inbound.stream_settings,
                inbound.sniffing,
                inbound.tag,
                id,
            ],
        )
        .map_err(|e| Error::from_write(e, payload.port))?;

        fetch_by_id(&conn, id)
    }

    /// Delete an inbound; deleting a missing id is not an error
    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM inbounds WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn port_taken(conn: &Connection, port: u16, ignore_id: Option<i64>) -> Result<bool> {
    let count: i64 = match ignore_id {
        Some(id) => conn.query_row(
            "SELECT COUNT(*) FROM inbounds WHERE port = ?1 AND id != ?2",
            params![port, id],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM inbounds WHERE port = ?1",
            params![port],
            |row| row.get(0),
        )?,
    };
    Ok(count > 0)
}

fn insert(conn: &Connection, inbound: &Inbound) -> Result<()> {
    conn.execute(
        "INSERT INTO inbounds (user_id, up, down, total, remark, enable, expiry_time, listen,
                               port, protocol, settings, stream_settings, sniffing, tag)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            inbound.user_id,
            inbound.up,
            inbound.down,
            inbound.total,
            inbound.remark,
            inbound.expiry_time,
            inbound.listen,
            inbound.port,
            inbound.protocol,
            inbound.settings,
            inbound.stream_settings,
            inbound.sniffing,
            inbound_tag(inbound.port),
        ],
    )
    .map_err(|e| Error::from_write(e, inbound.port))?;
    Ok(())
}

fn fetch_by_id(conn: &Connection, id: i64) -> Result<Inbound> {
    conn.query_row(
        &format!("SELECT {} FROM inbounds WHERE id = ?1", INBOUND_COLUMNS),
        params![id],
        Inbound::from_row,
    )
    .optional()?
    .ok_or(Error::NotFound(Lookup::Id(id)))
}

fn fetch_by_port(conn: &Connection, port: u16) -> Result<Inbound> {
    conn.query_row(
        &format!("SELECT {} FROM inbounds WHERE port = ?1", INBOUND_COLUMNS),
        params![port],
        Inbound::from_row,
    )
    .optional()?
    .ok_or(Error::NotFound(Lookup::Port(port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_repo() -> InboundRepository {
        InboundRepository::new(Database::open_in_memory().unwrap())
    }

    fn owned(user_id: i64, port: u16) -> Inbound {
        Inbound {
            user_id,
            ..Inbound::new(port, "vmess")
        }
    }

    #[test]
    fn test_add_derives_tag_and_enables() {
        let repo = create_test_repo();

        let mut payload = owned(1, 443).with_total(1000);
        payload.enable = false;
        payload.tag = "custom".to_string();

        let inbound = repo.add(&payload).unwrap();
        assert!(inbound.id > 0);
        assert_eq!(inbound.tag, "inbound-443");
        assert!(inbound.enable);
        assert_eq!(inbound.total, 1000);
        assert_eq!(inbound.user_id, 1);
    }

    #[test]
    fn test_add_duplicate_port_conflicts() {
        let repo = create_test_repo();

        repo.add(&owned(1, 80)).unwrap();
        let err = repo.add(&owned(2, 80)).unwrap_err();
        assert!(matches!(err, Error::PortConflict(80)));

        assert_eq!(repo.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let repo = create_test_repo();

        assert!(matches!(
            repo.get_by_id(42).unwrap_err(),
            Error::NotFound(Lookup::Id(42))
        ));
        assert!(matches!(
            repo.get_by_port(8080).unwrap_err(),
            Error::NotFound(Lookup::Port(8080))
        ));
    }

    #[test]
    fn test_list_is_scoped_to_owner() {
        let repo = create_test_repo();

        repo.add(&owned(1, 1001)).unwrap();
        repo.add(&owned(1, 1002)).unwrap();
        repo.add(&owned(2, 1003)).unwrap();

        assert_eq!(repo.list(1).unwrap().len(), 2);
        assert_eq!(repo.list(2).unwrap().len(), 1);
        assert!(repo.list(3).unwrap().is_empty());
    }

    #[test]
    fn test_update_overwrites_fields_and_retags() {
        let repo = create_test_repo();
        let created = repo.add(&owned(7, 1000).with_remark("old")).unwrap();

        let mut payload = Inbound::new(2000, "trojan").with_remark("new").with_total(50);
        payload.user_id = 99;
        payload.up = 5;
        payload.down = 6;
        payload.enable = false;

        let updated = repo.update(created.id, &payload).unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.user_id, 7);
        assert_eq!(updated.port, 2000);
        assert_eq!(updated.tag, "inbound-2000");
        assert_eq!(updated.protocol, "trojan");
        assert_eq!(updated.remark, "new");
        assert_eq!((updated.up, updated.down, updated.total), (5, 6, 50));
        assert!(!updated.enable);
    }

    #[test]
    fn test_update_keeping_own_port_is_allowed() {
        let repo = create_test_repo();
        let created = repo.add(&owned(1, 3000)).unwrap();

        let updated = repo
            .update(created.id, &Inbound::new(3000, "vless").with_remark("same port"))
            .unwrap();
        assert_eq!(updated.port, 3000);
        assert_eq!(updated.remark, "same port");
    }

    #[test]
    fn test_update_to_taken_port_conflicts_and_leaves_store_unchanged() {
        let repo = create_test_repo();
        repo.add(&owned(1, 4000)).unwrap();
        let second = repo.add(&owned(1, 4001)).unwrap();

        let err = repo.update(second.id, &Inbound::new(4000, "vmess")).unwrap_err();
        assert!(matches!(err, Error::PortConflict(4000)));

        let unchanged = repo.get_by_id(second.id).unwrap();
        assert_eq!(unchanged.port, 4001);
        assert_eq!(unchanged.tag, "inbound-4001");
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let repo = create_test_repo();
        let err = repo.update(5, &Inbound::new(5000, "vmess")).unwrap_err();
        assert!(matches!(err, Error::NotFound(Lookup::Id(5))));
    }

    #[test]
    fn test_delete_missing_succeeds() {
        let repo = create_test_repo();
        let created = repo.add(&owned(1, 6000)).unwrap();

        repo.delete(created.id).unwrap();
        repo.delete(created.id).unwrap();
        assert!(repo.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_add_batch_is_all_or_nothing() {
        let repo = create_test_repo();
        repo.add(&owned(1, 7002)).unwrap();

        let batch = vec![owned(1, 7000), owned(1, 7001), owned(1, 7002)];
        let err = repo.add_batch(&batch).unwrap_err();
        assert!(matches!(err, Error::PortConflict(7002)));
        assert_eq!(repo.list_all().unwrap().len(), 1);

        let batch = vec![owned(1, 7010), owned(1, 7010)];
        assert!(matches!(
            repo.add_batch(&batch).unwrap_err(),
            Error::PortConflict(7010)
        ));
        assert_eq!(repo.list_all().unwrap().len(), 1);

        let batch = vec![owned(1, 7020), owned(1, 7021)];
        repo.add_batch(&batch).unwrap();
        let all = repo.list_all().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|i| i.enable && i.tag == inbound_tag(i.port)));
    }

    #[test]
    fn test_list_paged_orders_newest_first_and_sums_filtered_set() {
        let repo = create_test_repo();
        for port in 8001..=8005u16 {
            let mut inbound = owned(1, port).with_remark(if port % 2 == 0 { "even" } else { "odd" });
            inbound.up = i64::from(port - 8000);
            inbound.down = 10;
            repo.add(&inbound).unwrap();
        }
        repo.add(&owned(2, 9000)).unwrap();

        let page = repo.list_paged(1, 1, 2, "").unwrap();
        assert_eq!(page.total_count, 5);
        assert_eq!(page.total_up, 1 + 2 + 3 + 4 + 5);
        assert_eq!(page.total_down, 50);
        let ports: Vec<u16> = page.items.iter().map(|i| i.port).collect();
        assert_eq!(ports, vec![8005, 8004]);

        let page = repo.list_paged(1, 3, 2, "").unwrap();
        let ports: Vec<u16> = page.items.iter().map(|i| i.port).collect();
        assert_eq!(ports, vec![8001]);

        let page = repo.list_paged(1, 1, 10, "even").unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.total_up, 2 + 4);

        let page = repo.list_paged(1, 1, 10, "8003").unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.items[0].port, 8003);
    }

    #[test]
    fn test_list_paged_empty_owner() {
        let repo = create_test_repo();
        let page = repo.list_paged(1, 1, 10, "").unwrap();
        assert_eq!(page.total_count, 0);
        assert_eq!(page.total_up, 0);
        assert_eq!(page.total_down, 0);
        assert!(page.items.is_empty());
    }

    #[test]
    fn test_negative_counters_are_rejected() {
        let repo = create_test_repo();

        let err = repo.add(&owned(1, 443).with_total(-1)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(repo.list_all().unwrap().is_empty());

        let mut negative_up = owned(1, 444);
        negative_up.up = -5;
        let err = repo.add_batch(&[owned(1, 443), negative_up]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(repo.list_all().unwrap().is_empty());

        let created = repo.add(&owned(1, 443).with_total(1000)).unwrap();
        let mut payload = created.clone();
        payload.down = -100;
        let err = repo.update(created.id, &payload).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = repo
            .update(created.id, &owned(1, 443).with_expiry_time(-1))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(repo.get_by_id(created.id).unwrap(), created);
    }

    #[test]
    fn test_payload_json_uses_camel_case() {
        let json = r#"{"port": 443, "protocol": "vless", "expiryTime": 5, "streamSettings": "{}", "tag": "x"}"#;
        let payload: Inbound = serde_json::from_str(json).unwrap();
        assert_eq!(payload.port, 443);
        assert_eq!(payload.expiry_time, 5);
        assert_eq!(payload.stream_settings, "{}");
        assert!(!payload.enable);

        let out = serde_json::to_value(&payload).unwrap();
        assert_eq!(out["expiryTime"], 5);
        assert_eq!(out["userId"], 0);
    }
}
