//! Two-tier snapshot persistence for per-venue market lists.
//!
//! The fast tier is a per-venue JSON file (cheap to rewrite every cycle,
//! expires by age at read time); the durable tier is a SQLite row per venue.
//! Writes validate before touching storage and go to both tiers; a failure
//! in one tier is logged and never blocks the other.  Reads classify each
//! tier's outcome so callers can decide whether to fall back to a live
//! fetch — and a stale snapshot is still returned, clearly flagged, rather
//! than an empty result.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::model::{Market, Snapshot, SnapshotMeta, Venue, SNAPSHOT_SCHEMA_VERSION};

/// Per-tier read outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TierState {
    #[error("snapshot usable")]
    Ok,
    #[error("no snapshot present")]
    Missing,
    #[error("snapshot invalid: {0}")]
    Invalid(String),
    #[error("snapshot stale ({age_secs}s old)")]
    Stale { age_secs: i64 },
    #[error("tier error: {0}")]
    Error(String),
    #[error("tier disabled")]
    Disabled,
    /// The other tier satisfied the read, so this one was never consulted
    #[error("tier not consulted")]
    Unchecked,
}

impl TierState {
    fn usable(&self) -> bool {
        matches!(self, TierState::Ok | TierState::Stale { .. })
    }
}

/// Result of a snapshot read: the best usable snapshot (possibly stale) plus
/// per-tier diagnostics.
#[derive(Debug)]
pub struct SnapshotRead {
    pub snapshot: Option<Snapshot>,
    /// True when the returned snapshot exceeded `max_age`
    pub stale: bool,
    pub fast: TierState,
    pub durable: TierState,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    platform       TEXT    PRIMARY KEY,
    schema_version INTEGER NOT NULL,
    fetched_at     TEXT    NOT NULL,
    payload        TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS service_state (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Two-tier snapshot store.  Either tier may be disabled by construction.
#[derive(Clone)]
pub struct SnapshotStore {
    fast_dir: Option<PathBuf>,
    conn: Option<Arc<Mutex<Connection>>>,
}

impl SnapshotStore {
    pub fn open(fast_dir: Option<&str>, db_path: Option<&str>) -> Result<Self> {
        let fast_dir = match fast_dir {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create snapshot dir {}", dir))?;
                Some(PathBuf::from(dir))
            }
            None => None,
        };
        let conn = match db_path {
            Some(path) => {
                let conn = Connection::open(path)
                    .with_context(|| format!("Failed to open snapshot db {}", path))?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                conn.execute_batch(SCHEMA_SQL)?;
                Some(Arc::new(Mutex::new(conn)))
            }
            None => None,
        };
        Ok(SnapshotStore { fast_dir, conn })
    }

    /// Persist one venue's market list to both tiers.
    ///
    /// Validation happens before any storage is touched; an invalid list is
    /// an error and nothing is persisted.  After validation each tier is
    /// written independently — one tier failing is logged, not fatal.
    pub fn write(
        &self,
        venue: Venue,
        markets: Vec<Market>,
        filters: Option<serde_json::Value>,
        meta: Option<SnapshotMeta>,
    ) -> Result<Snapshot> {
        for m in &markets {
            if m.venue != venue {
                anyhow::bail!(
                    "snapshot for {} contains market {} from {}",
                    venue,
                    m.ticker,
                    m.venue
                );
            }
            if !m.has_both_sides() {
                anyhow::bail!(
                    "snapshot for {} contains one-sided market {}",
                    venue,
                    m.ticker
                );
            }
        }

        let snapshot = Snapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            platform: venue.as_str().to_string(),
            fetched_at: Utc::now(),
            filters,
            total_markets: markets.len(),
            markets,
            meta,
        };
        let payload =
            serde_json::to_string(&snapshot).context("Failed to serialize snapshot")?;

        if let Some(dir) = &self.fast_dir {
            let path = dir.join(format!("{}.json", venue));
            if let Err(e) = fs::write(&path, &payload) {
                warn!(venue = %venue, error = %e, "fast snapshot tier write failed");
            }
        }

        if let Some(conn) = &self.conn {
            let result = conn.lock().unwrap().execute(
                "INSERT INTO snapshots (platform, schema_version, fetched_at, payload)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(platform) DO UPDATE SET
                    schema_version=excluded.schema_version,
                    fetched_at=excluded.fetched_at,
                    payload=excluded.payload",
                params![
                    venue.as_str(),
                    snapshot.schema_version,
                    snapshot.fetched_at,
                    payload
                ],
            );
            if let Err(e) = result {
                warn!(venue = %venue, error = %e, "durable snapshot tier write failed");
            }
        }

        debug!(venue = %venue, markets = snapshot.total_markets, "snapshot written");
        Ok(snapshot)
    }

    /// Read the freshest usable snapshot for a venue: fast tier first, then
    /// durable.  A snapshot older than `max_age` is classified `Stale` but
    /// still returned so the caller can use it as a last resort.
    pub fn read(&self, venue: Venue, max_age: Duration) -> SnapshotRead {
        let now = Utc::now();
        let (fast_state, fast_snap) = self.read_fast(venue, max_age, now);
        if fast_state == TierState::Ok {
            return SnapshotRead {
                snapshot: fast_snap,
                stale: false,
                fast: fast_state,
                durable: self
                    .conn
                    .as_ref()
                    .map_or(TierState::Disabled, |_| TierState::Unchecked),
            };
        }

        let (durable_state, durable_snap) = self.read_durable(venue, max_age, now);
        if durable_state == TierState::Ok {
            return SnapshotRead {
                snapshot: durable_snap,
                stale: false,
                fast: fast_state,
                durable: durable_state,
            };
        }

        // Neither tier is fresh: fall back to the newest stale snapshot.
        let best_stale = match (fast_state.usable(), durable_state.usable()) {
            (true, true) => {
                let fast = fast_snap.unwrap();
                let durable = durable_snap.unwrap();
                Some(if fast.fetched_at >= durable.fetched_at {
                    fast
                } else {
                    durable
                })
            }
            (true, false) => fast_snap,
            (false, true) => durable_snap,
            (false, false) => None,
        };
        SnapshotRead {
            stale: best_stale.is_some(),
            snapshot: best_stale,
            fast: fast_state,
            durable: durable_state,
        }
    }

    fn read_fast(
        &self,
        venue: Venue,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> (TierState, Option<Snapshot>) {
        let Some(dir) = &self.fast_dir else {
            return (TierState::Disabled, None);
        };
        let path = dir.join(format!("{}.json", venue));
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return (TierState::Missing, None)
            }
            Err(e) => return (TierState::Error(e.to_string()), None),
        };
        classify_payload(&text, venue, max_age, now)
    }

    fn read_durable(
        &self,
        venue: Venue,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> (TierState, Option<Snapshot>) {
        let Some(conn) = &self.conn else {
            return (TierState::Disabled, None);
        };
        let conn = conn.lock().unwrap();
        let row: rusqlite::Result<String> = conn.query_row(
            "SELECT payload FROM snapshots WHERE platform = ?1",
            params![venue.as_str()],
            |r| r.get(0),
        );
        match row {
            Ok(payload) => classify_payload(&payload, venue, max_age, now),
            Err(rusqlite::Error::QueryReturnedNoRows) => (TierState::Missing, None),
            Err(e) => (TierState::Error(e.to_string()), None),
        }
    }

    /// Record a service-lifecycle marker ("running", "stopped") in the
    /// durable tier, used by the orchestrator's graceful-shutdown path.
    pub fn set_state_marker(&self, value: &str) -> Result<()> {
        if let Some(conn) = &self.conn {
            conn.lock().unwrap().execute(
                "INSERT INTO service_state (key, value, updated_at) VALUES ('scanner', ?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
                params![value, Utc::now()],
            )?;
        }
        Ok(())
    }

    pub fn state_marker(&self) -> Result<Option<String>> {
        let Some(conn) = &self.conn else {
            return Ok(None);
        };
        let conn = conn.lock().unwrap();
        let row: rusqlite::Result<String> = conn.query_row(
            "SELECT value FROM service_state WHERE key = 'scanner'",
            [],
            |r| r.get(0),
        );
        match row {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Validate and age-classify one tier's raw payload.  Schema-version or
/// venue mismatches are `Invalid`, which readers treat like `Missing`.
fn classify_payload(
    text: &str,
    venue: Venue,
    max_age: Duration,
    now: DateTime<Utc>,
) -> (TierState, Option<Snapshot>) {
    let snapshot: Snapshot = match serde_json::from_str(text) {
        Ok(s) => s,
        Err(e) => return (TierState::Invalid(format!("unparseable payload: {}", e)), None),
    };
    if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
        return (
            TierState::Invalid(format!(
                "schema version {} (expected {})",
                snapshot.schema_version, SNAPSHOT_SCHEMA_VERSION
            )),
            None,
        );
    }
    if snapshot.platform != venue.as_str() {
        return (
            TierState::Invalid(format!("platform {} under {} key", snapshot.platform, venue)),
            None,
        );
    }
    let age = now - snapshot.fetched_at;
    if age > max_age {
        return (
            TierState::Stale {
                age_secs: age.num_seconds(),
            },
            Some(snapshot),
        );
    }
    (TierState::Ok, Some(snapshot))
}
