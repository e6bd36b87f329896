//! Delivery Server Pool & Selector
//!
//! Registry of outbound sending endpoints. Selection filters by capability
//! tag, exclusion list and daily quota; usage is tracked per (server, day)
//! in the shared cache. The optimistic usage log runs under a short named
//! lock that is released before the transport I/O, with an undo for failed
//! sends that were not meant to count.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;

use crate::{
    model::{DeliveryServer, ServerId, UseFor},
    sync::{EphemeralCache, LockRegistry},
    util::day_stamp,
};

pub struct ServerPool {
    servers: Vec<Arc<DeliveryServer>>,
    cache: EphemeralCache,
    locks: LockRegistry,
    step_ttl: Duration,
    step_wait: Duration,
}

impl ServerPool {
    pub fn new(
        servers: Vec<DeliveryServer>,
        cache: EphemeralCache,
        locks: LockRegistry,
        step_ttl: Duration,
        step_wait: Duration,
    ) -> Self {
        Self {
            servers: servers.into_iter().map(Arc::new).collect(),
            cache,
            locks,
            step_ttl,
            step_wait,
        }
    }

    pub fn active_count(&self) -> usize {
        self.servers.len()
    }

    pub fn all(&self) -> &[Arc<DeliveryServer>] {
        &self.servers
    }

    /// Select a usable server: capability tag must cover `use_for`, the id
    /// must not be excluded and, when `check_quota` is on, the server must
    /// have quota headroom today. `None` means every candidate is ruled out.
    pub fn pick(
        &self,
        use_for: UseFor,
        exclude: &HashSet<ServerId>,
        check_quota: bool,
    ) -> Option<Arc<DeliveryServer>> {
        self.servers
            .iter()
            .filter(|server| server.use_for.covers(use_for))
            .filter(|server| !exclude.contains(&server.id))
            .find(|server| !check_quota || !self.is_over_quota(server))
            .cloned()
    }

    fn usage_key(&self, id: ServerId) -> String {
        format!("server-usage:{}:{}", id, day_stamp(Utc::now()))
    }

    pub fn usage_today(&self, id: ServerId) -> u64 {
        self.cache
            .get(&self.usage_key(id))
            .and_then(|value| value.as_u64())
            .unwrap_or(0)
    }

    pub fn is_over_quota(&self, server: &DeliveryServer) -> bool {
        match server.daily_quota {
            Some(quota) => self.usage_today(server.id) >= quota,
            None => false,
        }
    }

    /// Optimistically count a send against the server's daily usage.
    ///
    /// Quota-enforcing servers take the short `server:{id}:{date}` lock for
    /// the read-modify-write and drop it before any I/O happens. `Err(())`
    /// means the lock could not be taken in time, which is batch-fatal for
    /// the caller.
    pub async fn log_usage(&self, server: &DeliveryServer) -> Result<(), ()> {
        let key = self.usage_key(server.id);
        if server.daily_quota.is_none() {
            self.cache.increment(&key, 1);
            return Ok(());
        }

        let lock_name = format!("server:{}:{}", server.id, day_stamp(Utc::now()));
        let _lock = self
            .locks
            .acquire_wait(&lock_name, self.step_ttl, self.step_wait)
            .await
            .ok_or(())?;
        self.cache.increment(&key, 1);
        Ok(())
    }

    /// Take back one optimistic usage count after a send that ended as a
    /// giveup or hard failure.
    pub fn undo_usage(&self, server: &DeliveryServer) {
        self.cache.increment(&self.usage_key(server.id), -1);
    }
}
