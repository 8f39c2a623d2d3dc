use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

pub mod models;
pub mod stats;

use models::{ChannelUserStat, TrustedBadge};

/// Read/write contract the decision pipeline and the tracker rely on.
/// Split out as a trait so tests can substitute an in-memory fake.
pub trait AnalyticsStore: Send + Sync {
    /// Per-badge aggregates over the qualifying bettors with an open bet on
    /// this channel, best SQN first (stable ordering: ties break on badge).
    fn top_candidates(
        &self,
        channel_id: &str,
        min_bets: u32,
        min_sqn: f64,
    ) -> Result<Vec<TrustedBadge>>;

    /// Record a newly created prediction event.
    fn record_prediction(
        &self,
        channel_id: &str,
        event_id: &str,
        title: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record (or supersede) an observed open bet for `(channel, user)`.
    fn record_user_bet(
        &self,
        channel_id: &str,
        user_id: &str,
        badge: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Close a canceled prediction and drop its open bets. No stat mutation.
    fn cancel_prediction(
        &self,
        channel_id: &str,
        event_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Apply one resolution: close the prediction row, fold every listed
    /// `(user_id, badge)` bet into that user's aggregate, and clear the
    /// channel's open bets, all as a single transaction. Returns `false`
    /// (and changes nothing) when the event was already resolved.
    fn record_resolution(
        &self,
        channel_id: &str,
        event_id: &str,
        winning_badge: &str,
        payout_ratio: f64,
        bets: &[(String, String)],
    ) -> Result<bool>;
}

/// Thread-safe SQLite handle (single connection with mutex).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path.
    /// `":memory:"` works for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let conn = Connection::open(path)?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
            conn
        };
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Channels ─────────────────────────────────────────────────────────────

    /// Register a channel row if it does not exist yet.
    pub fn create_channel(&self, channel_id: &str, username: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO channels (id, username, last_status_change)
             VALUES (?1, ?2, ?3)",
            params![channel_id, username, Utc::now()],
        )?;
        Ok(())
    }

    /// Record a stream-up / stream-down transition.
    pub fn update_channel_status(&self, channel_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE channels SET last_status_change=?1 WHERE id=?2",
            params![at, channel_id],
        )?;
        Ok(())
    }

    // ── Balance ──────────────────────────────────────────────────────────────

    /// Append a points-balance snapshot for a channel.
    pub fn record_balance(&self, channel_id: &str, balance: i64, reason: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO balance_log (channel_id, balance, reason, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![channel_id, balance, reason, Utc::now()],
        )?;
        Ok(())
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Drop every open bet observation. Run at startup: bets left over from a
    /// previous run belong to events whose resolution we missed.
    pub fn purge_unresolved_bets(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM user_bets", [])?;
        Ok(n)
    }
}

impl AnalyticsStore for Database {
    fn top_candidates(
        &self,
        channel_id: &str,
        min_bets: u32,
        min_sqn: f64,
    ) -> Result<Vec<TrustedBadge>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT b.badge,
                    COUNT(*) AS user_count,
                    AVG(s.win_rate) AS mean_win_rate,
                    AVG(s.roi_sum / s.bet_count) AS mean_roi,
                    SUM(s.roi_sum) / SUM(s.bet_count) AS weighted_mean_roi,
                    MAX(s.sqn) AS best_sqn
             FROM user_bets b
             JOIN channel_user_stats s
               ON s.channel_id = b.channel_id AND s.user_id = b.user_id
             WHERE b.channel_id = ?1
               AND s.bet_count >= ?2
               AND s.sqn >= ?3
               AND s.stddev > 0
             GROUP BY b.badge
             ORDER BY best_sqn DESC, b.badge ASC",
        )?;
        let rows = stmt
            .query_map(params![channel_id, min_bets, min_sqn], |row| {
                Ok(TrustedBadge {
                    badge: row.get(0)?,
                    user_count: row.get(1)?,
                    mean_win_rate: row.get(2)?,
                    mean_roi: row.get(3)?,
                    weighted_mean_roi: row.get(4)?,
                    best_sqn: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn record_prediction(
        &self,
        channel_id: &str,
        event_id: &str,
        title: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO predictions (event_id, channel_id, title, created_at, status)
             VALUES (?1, ?2, ?3, ?4, 'open')",
            params![event_id, channel_id, title, created_at],
        )?;
        Ok(())
    }

    fn record_user_bet(
        &self,
        channel_id: &str,
        user_id: &str,
        badge: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // Last observation before lock wins.
        conn.execute(
            "INSERT OR REPLACE INTO user_bets (channel_id, user_id, badge, observed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![channel_id, user_id, badge, observed_at],
        )?;
        Ok(())
    }

    fn cancel_prediction(
        &self,
        channel_id: &str,
        event_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE predictions SET status='canceled', ended_at=?1
             WHERE event_id=?2 AND status='open'",
            params![ended_at, event_id],
        )?;
        tx.execute(
            "DELETE FROM user_bets WHERE channel_id=?1",
            params![channel_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn record_resolution(
        &self,
        channel_id: &str,
        event_id: &str,
        winning_badge: &str,
        payout_ratio: f64,
        bets: &[(String, String)],
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // The status transition is the idempotency gate: a duplicate
        // resolution for the same event updates nothing.
        let closed = tx.execute(
            "UPDATE predictions
             SET status='resolved', winning_badge=?1, ended_at=?2
             WHERE event_id=?3 AND status='open'",
            params![winning_badge, Utc::now(), event_id],
        )?;
        if closed == 0 {
            return Ok(false);
        }

        for (user_id, badge) in bets {
            let mut stat = tx
                .query_row(
                    "SELECT bet_count, win_count, win_rate, roi_sum, roi_squared_sum, stddev, sqn
                     FROM channel_user_stats WHERE channel_id=?1 AND user_id=?2",
                    params![channel_id, user_id],
                    |row| {
                        Ok(ChannelUserStat {
                            channel_id: channel_id.to_string(),
                            user_id: user_id.to_string(),
                            bet_count: row.get(0)?,
                            win_count: row.get(1)?,
                            win_rate: row.get(2)?,
                            roi_sum: row.get(3)?,
                            roi_squared_sum: row.get(4)?,
                            stddev: row.get(5)?,
                            sqn: row.get(6)?,
                        })
                    },
                )
                .optional()?
                .unwrap_or_else(|| ChannelUserStat::new(channel_id, user_id));

            let won = badge.eq_ignore_ascii_case(winning_badge);
            stat.apply_resolution(won, payout_ratio);

            tx.execute(
                "INSERT OR REPLACE INTO channel_user_stats
                 (channel_id, user_id, bet_count, win_count, win_rate,
                  roi_sum, roi_squared_sum, stddev, sqn)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    stat.channel_id,
                    stat.user_id,
                    stat.bet_count,
                    stat.win_count,
                    stat.win_rate,
                    stat.roi_sum,
                    stat.roi_squared_sum,
                    stat.stddev,
                    stat.sqn,
                ],
            )?;
        }

        tx.execute(
            "DELETE FROM user_bets WHERE channel_id=?1",
            params![channel_id],
        )?;

        tx.commit()?;
        Ok(true)
    }
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS channels (
    id                 TEXT PRIMARY KEY,
    username           TEXT NOT NULL,
    last_status_change TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS balance_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id  TEXT    NOT NULL,
    balance     INTEGER NOT NULL,
    reason      TEXT,
    recorded_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS predictions (
    event_id      TEXT PRIMARY KEY,
    channel_id    TEXT NOT NULL,
    title         TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    ended_at      TEXT,
    status        TEXT NOT NULL DEFAULT 'open',
    winning_badge TEXT
);

CREATE TABLE IF NOT EXISTS user_bets (
    channel_id  TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    badge       TEXT NOT NULL,
    observed_at TEXT NOT NULL,
    PRIMARY KEY (channel_id, user_id)
);

CREATE TABLE IF NOT EXISTS channel_user_stats (
    channel_id      TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    bet_count       INTEGER NOT NULL DEFAULT 0,
    win_count       INTEGER NOT NULL DEFAULT 0,
    win_rate        REAL    NOT NULL DEFAULT 0,
    roi_sum         REAL    NOT NULL DEFAULT 0,
    roi_squared_sum REAL    NOT NULL DEFAULT 0,
    stddev          REAL    NOT NULL DEFAULT 0,
    sqn             REAL    NOT NULL DEFAULT 0,
    PRIMARY KEY (channel_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_predictions_channel ON predictions(channel_id);
CREATE INDEX IF NOT EXISTS idx_balance_log_channel ON balance_log(channel_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mem_db() -> Database {
        Database::open(":memory:").unwrap()
    }

    fn seed_stat(db: &Database, user: &str, wins: u32, losses: u32, ratio: f64) {
        // Build a user's history through the public resolution path.
        for i in 0..(wins + losses) {
            let event = format!("seed-{}-{}", user, i);
            db.record_prediction("chan", &event, "seed", Utc::now()).unwrap();
            let badge = if i < wins { "BLUE" } else { "PINK" };
            let bets = vec![(user.to_string(), badge.to_string())];
            db.record_resolution("chan", &event, "BLUE", ratio, &bets)
                .unwrap();
        }
    }

    #[test]
    fn test_resolution_is_idempotent_per_event() {
        let db = mem_db();
        db.record_prediction("chan", "ev1", "t", Utc::now()).unwrap();
        let bets = vec![("u1".to_string(), "BLUE".to_string())];
        assert!(db.record_resolution("chan", "ev1", "BLUE", 2.0, &bets).unwrap());
        // Second delivery of the same resolution must change nothing.
        assert!(!db.record_resolution("chan", "ev1", "BLUE", 2.0, &bets).unwrap());

        let rows = db.top_candidates("chan", 0, f64::MIN).unwrap();
        assert!(rows.is_empty()); // open bets were cleared by the resolution

        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT bet_count FROM channel_user_stats WHERE channel_id='chan' AND user_id='u1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_resolution_updates_sums_consistently() {
        let db = mem_db();
        seed_stat(&db, "u1", 1, 1, 3.0); // roi +2 then -1

        let conn = db.conn.lock().unwrap();
        let (bets, wins, roi_sum, stddev): (i64, i64, f64, f64) = conn
            .query_row(
                "SELECT bet_count, win_count, roi_sum, stddev
                 FROM channel_user_stats WHERE user_id='u1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!((bets, wins), (2, 1));
        assert_relative_eq!(roi_sum, 1.0, epsilon = 1e-9);
        assert_relative_eq!(stddev, 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_top_candidates_filters_and_orders() {
        let db = mem_db();
        // u1: strong record; u2: identical-outcome record → stddev 0, filtered
        seed_stat(&db, "u1", 3, 1, 4.0);
        seed_stat(&db, "u2", 4, 0, 4.0);
        // u3: mixed record, worse SQN than u1
        seed_stat(&db, "u3", 1, 3, 4.0);

        let now = Utc::now();
        db.record_user_bet("chan", "u1", "BLUE", now).unwrap();
        db.record_user_bet("chan", "u2", "PINK", now).unwrap();
        db.record_user_bet("chan", "u3", "PINK", now).unwrap();

        let rows = db.top_candidates("chan", 4, f64::MIN).unwrap();
        // u2 is filtered on stddev=0; u1 (BLUE) outranks u3 (PINK)
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].badge, "BLUE");
        assert_eq!(rows[0].user_count, 1);
        assert!(rows[0].best_sqn > rows[1].best_sqn);

        // Raising min_bets excludes everyone
        assert!(db.top_candidates("chan", 10, f64::MIN).unwrap().is_empty());
    }

    #[test]
    fn test_user_bet_last_observation_wins() {
        let db = mem_db();
        seed_stat(&db, "u1", 2, 2, 3.0);
        db.record_user_bet("chan", "u1", "BLUE", Utc::now()).unwrap();
        db.record_user_bet("chan", "u1", "PINK", Utc::now()).unwrap();
        let rows = db.top_candidates("chan", 0, f64::MIN).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].badge, "PINK");
    }

    #[test]
    fn test_cancel_drops_bets_without_stat_mutation() {
        let db = mem_db();
        db.record_prediction("chan", "ev1", "t", Utc::now()).unwrap();
        db.record_user_bet("chan", "u1", "BLUE", Utc::now()).unwrap();
        db.cancel_prediction("chan", "ev1", Utc::now()).unwrap();

        let conn = db.conn.lock().unwrap();
        let open_bets: i64 = conn
            .query_row("SELECT COUNT(*) FROM user_bets", [], |r| r.get(0))
            .unwrap();
        let stats: i64 = conn
            .query_row("SELECT COUNT(*) FROM channel_user_stats", [], |r| r.get(0))
            .unwrap();
        let status: String = conn
            .query_row("SELECT status FROM predictions WHERE event_id='ev1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(open_bets, 0);
        assert_eq!(stats, 0);
        assert_eq!(status, "canceled");
    }

    #[test]
    fn test_purge_unresolved_bets() {
        let db = mem_db();
        db.record_user_bet("chan", "u1", "BLUE", Utc::now()).unwrap();
        db.record_user_bet("chan", "u2", "PINK", Utc::now()).unwrap();
        assert_eq!(db.purge_unresolved_bets().unwrap(), 2);
    }
}
