/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Ban checks run before any identity work.
//!
//! Results are memoized per address for the life of the process and never
//! evicted: ban lists change slowly compared to how long a worker lives, so a
//! newly banned address may keep passing until restart.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use tracing::debug;

use crate::admission::ConnectionLease;
use crate::db::Value;
use crate::error::ForumResult;

const NUKED_IP_SQL: &str = "select count(*) as c from nukes where nuke_ip = $1";

const COUNTRY_SQL: &str = "select country_evil from countries \
     where country_start = (select max(country_start) from countries where country_start <= $1) \
     and country_end = (select min(country_end) from countries where country_end >= $1)";

/// Append-only address -> bool memo. Inserting the same key twice is harmless.
pub struct CachedPredicate {
    name: &'static str,
    cache: RwLock<HashMap<String, bool>>,
}

impl CachedPredicate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached(&self, address: &str) -> Option<bool> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .copied()
    }

    pub fn remember(&self, address: &str, verdict: bool) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(address.to_string())
            .or_insert(verdict);
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub struct AbuseFilters {
    nuked: CachedPredicate,
    countries: CachedPredicate,
}

impl Default for AbuseFilters {
    fn default() -> Self {
        Self::new()
    }
}

impl AbuseFilters {
    pub fn new() -> Self {
        Self {
            nuked: CachedPredicate::new("nuked_ip"),
            countries: CachedPredicate::new("country"),
        }
    }

    /// Was this address nuked in the past?
    pub async fn ip_banned(&self, lease: &mut ConnectionLease, address: &str) -> ForumResult<bool> {
        if let Some(hit) = self.nuked.cached(address) {
            return Ok(hit);
        }
        let banned = lease
            .scalar(NUKED_IP_SQL, &[Value::from(address)])
            .await?
            .map(|v| v.truthy())
            .unwrap_or(false);
        self.nuked.remember(address, banned);
        debug!(ip = %address, banned, "ip ban lookup");
        Ok(banned)
    }

    /// Does this address fall in the range of a country that is blocked outright?
    pub async fn country_blocked(&self, lease: &mut ConnectionLease, address: &str) -> ForumResult<bool> {
        if let Some(hit) = self.countries.cached(address) {
            return Ok(hit);
        }
        let blocked = match ipv4_number(address) {
            Some(n) => lease
                .scalar(COUNTRY_SQL, &[Value::Int(n)])
                .await?
                .map(|v| v.truthy())
                .unwrap_or(false),
            // Nothing to bracket: no range can contain it.
            None => false,
        };
        self.countries.remember(address, blocked);
        debug!(ip = %address, blocked, "country lookup");
        Ok(blocked)
    }

    pub fn memoized(&self) -> (usize, usize) {
        (self.nuked.len(), self.countries.len())
    }
}

/// Dotted-quad to its 32-bit number, like MySQL's `inet_aton`.
pub fn ipv4_number(address: &str) -> Option<i64> {
    address
        .trim()
        .parse::<Ipv4Addr>()
        .ok()
        .map(|ip| i64::from(u32::from(ip)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use crate::db::fake::FakePool;
    use crate::db::Row;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn ipv4_numbers() {
        assert_eq!(ipv4_number("1.2.3.4"), Some(16_909_060));
        assert_eq!(ipv4_number("255.255.255.255"), Some(4_294_967_295));
        assert_eq!(ipv4_number("::1"), None);
        assert_eq!(ipv4_number("garbage"), None);
    }

    #[test]
    fn first_verdict_sticks() {
        let p = CachedPredicate::new("t");
        assert_eq!(p.cached("a"), None);
        p.remember("a", true);
        p.remember("a", false);
        assert_eq!(p.cached("a"), Some(true));
        assert_eq!(p.len(), 1);
        assert_eq!(p.name(), "t");
    }

    #[tokio::test]
    async fn country_lookup_is_memoized() {
        let pool = FakePool::new();
        pool.on("from countries", vec![Row::new().with("country_evil", 1)]);
        let gate = AdmissionGate::new(Arc::new(pool.clone()), Duration::from_secs(2));
        let filters = AbuseFilters::new();

        let mut lease = gate.acquire("1.2.3.4").await.unwrap();
        assert!(filters.country_blocked(&mut lease, "1.2.3.4").await.unwrap());
        assert!(filters.country_blocked(&mut lease, "1.2.3.4").await.unwrap());
        assert_eq!(pool.hits("from countries"), 1);
        assert_eq!(pool.params_of("from countries")[0], vec![Value::Int(16_909_060)]);
    }

    #[tokio::test]
    async fn ip_ban_counts_nukes() {
        let pool = FakePool::new();
        pool.on_with("from nukes", |params| {
            let hit = params.first() == Some(&Value::from("6.6.6.6"));
            Ok(vec![Row::new().with("c", i64::from(hit))])
        });
        let gate = AdmissionGate::new(Arc::new(pool.clone()), Duration::from_secs(2));
        let filters = AbuseFilters::new();
        let mut lease = gate.acquire("6.6.6.6").await.unwrap();

        assert!(filters.ip_banned(&mut lease, "6.6.6.6").await.unwrap());
        assert!(!filters.ip_banned(&mut lease, "7.7.7.7").await.unwrap());
        assert!(!filters.ip_banned(&mut lease, "7.7.7.7").await.unwrap());
        assert_eq!(pool.hits("from nukes"), 2);
        assert_eq!(filters.memoized(), (2, 0));
    }

    #[tokio::test]
    async fn non_ipv4_addresses_skip_the_range_query() {
        let pool = FakePool::new();
        let gate = AdmissionGate::new(Arc::new(pool.clone()), Duration::from_secs(2));
        let filters = AbuseFilters::new();
        let mut lease = gate.acquire("::1").await.unwrap();

        assert!(!filters.country_blocked(&mut lease, "::1").await.unwrap());
        assert_eq!(pool.executed(), 0);
    }

    #[tokio::test]
    async fn query_faults_are_not_memoized() {
        let pool = FakePool::new();
        pool.fail("from nukes", "lost connection");
        let gate = AdmissionGate::new(Arc::new(pool.clone()), Duration::from_secs(2));
        let filters = AbuseFilters::new();
        let mut lease = gate.acquire("1.1.1.1").await.unwrap();

        assert!(filters.ip_banned(&mut lease, "1.1.1.1").await.is_err());
        assert_eq!(filters.memoized(), (0, 0));
    }
}
