//! Per-user access-pattern baselining.
//!
//! Recomputation scans the full audit window and is the most expensive
//! operation in the core, so results are cached with a TTL and guarded by a
//! single-flight set. The TTL bound is strict: an entry past its TTL is
//! never served, even under load.

use crate::storage::cache::Cache;
use crate::storage::{with_read_retry, Pool};
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use rusqlite::params;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

const CACHE_NS: &str = "baseline";

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("corrupt cached baseline for {tenant}/{user}")]
    CorruptCache { tenant: String, user: String },
}

/// The statistically "normal" access profile for one `(user, tenant)` pair.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AccessPattern {
    /// Min/max of the 8 most-active hours (0-23).
    pub normal_hours: (u8, u8),
    /// Days (0 = Sunday) whose request count exceeds the per-day average.
    pub normal_days: Vec<u8>,
    pub typical_locations: Vec<String>,
    pub typical_devices: Vec<String>,
    pub average_requests_per_hour: f64,
    /// Top resource categories by access count.
    pub common_resources: Vec<String>,
    /// Audit records the profile was computed from. Baseline-driven checks
    /// stay off until this reaches the configured minimum.
    pub samples: i64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AccessPatternBaseliner {
    pool: Pool,
    cache: Cache,
    window_days: i64,
    ttl_secs: i64,
    top_n: usize,
    /// Single-flight guard: (tenant, user) pairs currently recomputing.
    inflight: Arc<Mutex<HashSet<(String, String)>>>,
}

impl AccessPatternBaseliner {
    pub fn new(pool: Pool, cache: Cache, window_days: i64, ttl_secs: i64, top_n: usize) -> Self {
        Self {
            pool,
            cache,
            window_days,
            ttl_secs,
            top_n,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Fetch the user's access pattern: cache first, recompute on miss.
    ///
    /// Never blocks the request path on someone else's recomputation; a
    /// concurrent caller that misses the cache recomputes redundantly
    /// rather than waiting.
    pub fn get(&self, user_id: &str, tenant_id: &str) -> Result<AccessPattern> {
        if let Some(raw) = self.cache.get(CACHE_NS, tenant_id, user_id)? {
            let pattern: AccessPattern =
                serde_json::from_value(raw).map_err(|_| BaselineError::CorruptCache {
                    tenant: tenant_id.into(),
                    user: user_id.into(),
                })?;
            return Ok(pattern);
        }

        let key = (tenant_id.to_string(), user_id.to_string());
        let first_flight = self.inflight.lock().map(|mut s| s.insert(key.clone())).unwrap_or(false);

        let result = with_read_retry(|| self.compute(user_id, tenant_id));

        if first_flight {
            if let Ok(mut s) = self.inflight.lock() {
                s.remove(&key);
            }
            if let Ok(pattern) = &result {
                self.cache.set(
                    CACHE_NS,
                    tenant_id,
                    user_id,
                    &serde_json::to_value(pattern)?,
                    Duration::seconds(self.ttl_secs),
                )?;
            }
        }

        result
    }

    /// Drop the cached profile so the next lookup reflects newly confirmed
    /// normal behavior (the detector's feedback loop) or an explicit reset.
    pub fn invalidate(&self, user_id: &str, tenant_id: &str) -> Result<()> {
        self.cache.delete(CACHE_NS, tenant_id, user_id)
    }

    /// Full recomputation: O(audit records in the window).
    fn compute(&self, user_id: &str, tenant_id: &str) -> Result<AccessPattern> {
        let conn = self.pool.get()?;
        // RFC3339 cutoff, same format as the stored timestamps.
        let cutoff = (Utc::now() - Duration::days(self.window_days)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT ip_address, user_agent, resource, created_at FROM access_log
             WHERE tenant_id = ?1 AND user_id = ?2
               AND created_at > ?3",
        )?;
        let rows = stmt.query_map(params![tenant_id, user_id, cutoff], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut hour_counts = [0i64; 24];
        let mut day_counts = [0i64; 7];
        let mut ip_counts: HashMap<String, i64> = HashMap::new();
        let mut ua_counts: HashMap<String, i64> = HashMap::new();
        let mut resource_counts: HashMap<String, i64> = HashMap::new();
        let mut active_hour_buckets: HashSet<String> = HashSet::new();
        let mut samples = 0i64;

        for r in rows {
            let (ip, ua, resource, created_at) = r?;
            let ts = DateTime::parse_from_rfc3339(&created_at)
                .with_context(|| format!("bad timestamp in access_log: {created_at}"))?
                .with_timezone(&Utc);

            samples += 1;
            hour_counts[ts.hour() as usize] += 1;
            day_counts[ts.weekday().num_days_from_sunday() as usize] += 1;
            active_hour_buckets.insert(ts.format("%Y-%m-%dT%H").to_string());

            if let Some(ip) = ip {
                *ip_counts.entry(ip).or_default() += 1;
            }
            if let Some(ua) = ua {
                *ua_counts.entry(ua).or_default() += 1;
            }
            if let Some(resource) = resource {
                *resource_counts.entry(resource).or_default() += 1;
            }
        }

        // 8 most-active hours; normal_hours is the min/max of that set.
        let mut ranked_hours: Vec<(usize, i64)> = hour_counts
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, c)| *c > 0)
            .collect();
        ranked_hours.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let active: Vec<usize> = ranked_hours.iter().take(8).map(|(h, _)| *h).collect();
        let normal_hours = match (active.iter().min(), active.iter().max()) {
            (Some(&lo), Some(&hi)) => (lo as u8, hi as u8),
            _ => (9, 17), // no history yet; placeholder until samples accrue
        };

        // Days with more traffic than the per-day average.
        let day_avg = samples as f64 / 7.0;
        let normal_days: Vec<u8> = (0..7u8)
            .filter(|&d| day_counts[d as usize] as f64 > day_avg)
            .collect();

        let average_requests_per_hour = if active_hour_buckets.is_empty() {
            0.0
        } else {
            samples as f64 / active_hour_buckets.len() as f64
        };

        let pattern = AccessPattern {
            normal_hours,
            normal_days,
            typical_locations: top_n_keys(ip_counts, self.top_n),
            typical_devices: top_n_keys(ua_counts, self.top_n),
            average_requests_per_hour,
            common_resources: top_n_keys(resource_counts, 5),
            samples,
            last_updated: Utc::now(),
        };

        debug!(user = %user_id, tenant = %tenant_id, samples, "baseline recomputed");
        Ok(pattern)
    }
}

fn top_n_keys(counts: HashMap<String, i64>, n: usize) -> Vec<String> {
    let mut ranked: Vec<(String, i64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(k, _)| k).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_pool_in_dir, save_access, AccessRecord};

    fn access(ts: DateTime<Utc>, ip: &str, ua: &str, resource: &str) -> AccessRecord {
        AccessRecord {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            ip_address: Some(ip.into()),
            user_agent: Some(ua.into()),
            resource: Some(resource.into()),
            path: Some(format!("/api/{resource}")),
            status_code: 200,
            timestamp: ts,
        }
    }

    fn baseliner(pool: &Pool) -> AccessPatternBaseliner {
        AccessPatternBaseliner::new(pool.clone(), Cache::new(pool.clone()), 30, 3600, 10)
    }

    /// Weekday 9-17 office traffic for the last two weeks.
    fn seed_office_hours(pool: &Pool) {
        let now = Utc::now();
        for day in 1..15 {
            let base = now - Duration::days(day);
            if matches!(base.weekday().num_days_from_sunday(), 0 | 6) {
                continue;
            }
            for hour in [9u32, 11, 14, 17] {
                let ts = base
                    .with_hour(hour)
                    .and_then(|t| t.with_minute(15))
                    .unwrap_or(base);
                save_access(pool, &access(ts, "203.0.113.7", "firefox", "projects")).unwrap();
            }
        }
    }

    #[test]
    fn test_profile_reflects_office_hours() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        seed_office_hours(&pool);

        let pattern = baseliner(&pool).get("u1", "t1").unwrap();
        assert_eq!(pattern.normal_hours, (9, 17));
        assert!(pattern.samples >= 20);
        // Weekend days carry no traffic, so they are below the daily average
        assert!(!pattern.normal_days.contains(&0));
        assert!(!pattern.normal_days.contains(&6));
        assert_eq!(pattern.typical_locations, vec!["203.0.113.7".to_string()]);
        assert_eq!(pattern.typical_devices, vec!["firefox".to_string()]);
        assert_eq!(pattern.common_resources, vec!["projects".to_string()]);
        assert!(pattern.average_requests_per_hour > 0.0);
    }

    #[test]
    fn test_cache_hit_and_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        seed_office_hours(&pool);

        let b = baseliner(&pool);
        let first = b.get("u1", "t1").unwrap();

        // New traffic lands; the cached profile is still served inside the TTL
        save_access(&pool, &access(Utc::now(), "198.51.100.9", "curl/8", "billing")).unwrap();
        let cached = b.get("u1", "t1").unwrap();
        assert_eq!(cached.last_updated, first.last_updated);

        // After invalidation, the profile reflects the new record
        b.invalidate("u1", "t1").unwrap();
        let fresh = b.get("u1", "t1").unwrap();
        assert_eq!(fresh.samples, first.samples + 1);
    }

    #[test]
    fn test_expired_cache_is_recomputed_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        seed_office_hours(&pool);

        // TTL of zero: every read is past the TTL bound
        let b = AccessPatternBaseliner::new(pool.clone(), Cache::new(pool.clone()), 30, 0, 10);
        let first = b.get("u1", "t1").unwrap();
        save_access(&pool, &access(Utc::now(), "198.51.100.9", "curl/8", "billing")).unwrap();
        let second = b.get("u1", "t1").unwrap();
        assert_eq!(second.samples, first.samples + 1);
    }

    #[test]
    fn test_empty_history_yields_zero_samples() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let pattern = baseliner(&pool).get("nobody", "t1").unwrap();
        assert_eq!(pattern.samples, 0);
        assert_eq!(pattern.average_requests_per_hour, 0.0);
    }

    #[test]
    fn test_top_n_bounds_locations() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        for i in 0..20 {
            save_access(
                &pool,
                &access(Utc::now() - Duration::hours(i), &format!("10.0.0.{i}"), "firefox", "projects"),
            )
            .unwrap();
        }
        let b = AccessPatternBaseliner::new(pool.clone(), Cache::new(pool.clone()), 30, 3600, 5);
        let pattern = b.get("u1", "t1").unwrap();
        assert_eq!(pattern.typical_locations.len(), 5);
    }
}
