//! Inbound operations as seen by the admin API
//!
//! Wraps the repository and marks the restart coordinator dirty after every
//! successful configuration change.

use crate::error::Result;
use crate::inbound::{Inbound, InboundRepository};
use crate::restart::RestartCoordinator;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PER_PAGE: u32 = 10;

fn clamp_paging(value: i64, default: u32) -> u32 {
    if value < 1 {
        default
    } else {
        u32::try_from(value).unwrap_or(u32::MAX)
    }
}

/// Paged listing with the metadata the panel front end expects
#[derive(Debug, Clone, Serialize)]
pub struct InboundPage {
    pub inbounds: Vec<Inbound>,
    pub total_count: i64,
    pub total_pages: i64,
    pub total_down: i64,
    pub total_up: i64,
    pub current_page: i64,
    pub per_page: i64,
}

#[derive(Clone)]
pub struct InboundService {
    repo: InboundRepository,
    coordinator: Arc<RestartCoordinator>,
}

impl InboundService {
    pub fn new(repo: InboundRepository, coordinator: Arc<RestartCoordinator>) -> Self {
        Self { repo, coordinator }
    }

    pub fn repository(&self) -> &InboundRepository {
        &self.repo
    }

    pub fn list(&self, user_id: i64) -> Result<Vec<Inbound>> {
        self.repo.list(user_id)
    }

    /// List one page
    ///
    /// `page` and `per_page` below 1 fall back to 1 and 10; values above
    /// `u32::MAX` are capped there. The response echoes the values used.
    pub fn list_paged(&self, user_id: i64, page: i64, per_page: i64, query: &str) -> Result<InboundPage> {
        let page = clamp_paging(page, DEFAULT_PAGE);
        let per_page = clamp_paging(per_page, DEFAULT_PER_PAGE);

        let result = self.repo.list_paged(user_id, page, per_page, query)?;

        let per_page = i64::from(per_page);
        Ok(InboundPage {
            inbounds: result.items,
            total_count: result.total_count,
            total_pages: (result.total_count + per_page - 1) / per_page,
            total_down: result.total_down,
            total_up: result.total_up,
            current_page: i64::from(page),
            per_page,
        })
    }

    /// Create an inbound owned by `user_id`
    pub fn add(&self, user_id: i64, mut payload: Inbound) -> Result<Inbound> {
        payload.user_id = user_id;
        let inbound = self.repo.add(&payload)?;
        self.coordinator.mark_dirty();
        info!(id = inbound.id, port = inbound.port, tag = %inbound.tag, "Inbound added");
        Ok(inbound)
    }

    /// Create several inbounds owned by `user_id` in one transaction
    pub fn add_batch(&self, user_id: i64, mut payloads: Vec<Inbound>) -> Result<usize> {
        for payload in &mut payloads {
            payload.user_id = user_id;
        }
        self.repo.add_batch(&payloads)?;
        self.coordinator.mark_dirty();
        info!(count = payloads.len(), "Inbounds imported");
        Ok(payloads.len())
    }

    pub fn update(&self, id: i64, payload: Inbound) -> Result<Inbound> {
        let inbound = self.repo.update(id, &payload)?;
        self.coordinator.mark_dirty();
        info!(id, port = inbound.port, enable = inbound.enable, "Inbound updated");
        Ok(inbound)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.repo.delete(id)?;
        self.coordinator.mark_dirty();
        info!(id, "Inbound deleted");
        Ok(())
    }
}
