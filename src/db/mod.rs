use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;

use crate::models::{Event, Opportunity, Sport};

/// Bump when the schema changes; `init_database` upgrades older stores in place.
pub const SCHEMA_VERSION: i64 = 2;

/// Hard cap on rows returned by `list_opportunities`.
pub const MAX_OPPORTUNITY_ROWS: i64 = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("corrupt stored payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("store schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

pub async fn create_pool(database_url: &str) -> Result<SqlitePool, StoreError> {
    // Strip the "sqlite:" prefix to get the file path, create parent dir if needed
    let file_path = database_url
        .strip_prefix("sqlite:///")
        .or_else(|| database_url.strip_prefix("sqlite://"))
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);

    if file_path != ":memory:" {
        if let Some(parent) = std::path::Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Create or upgrade the schema. Safe to call on every startup.
pub async fn init_database(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS meta (schema_version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    let version: Option<i64> = sqlx::query_scalar("SELECT schema_version FROM meta")
        .fetch_optional(pool)
        .await?;

    match version {
        None => {
            create_schema(pool).await?;
            sqlx::query("INSERT INTO meta (schema_version) VALUES (?)")
                .bind(SCHEMA_VERSION)
                .execute(pool)
                .await?;
            tracing::info!("Database initialized at schema version {}", SCHEMA_VERSION);
        }
        Some(v) if v == SCHEMA_VERSION => {
            // Re-run idempotent DDL so a wiped table never strands a versioned store
            create_schema(pool).await?;
        }
        Some(1) => {
            create_schema(pool).await?;
            upgrade_v1_to_v2(pool).await?;
            sqlx::query("UPDATE meta SET schema_version = ?")
                .bind(SCHEMA_VERSION)
                .execute(pool)
                .await?;
            tracing::info!("Database upgraded from schema version 1 to {}", SCHEMA_VERSION);
        }
        Some(v) => {
            return Err(StoreError::SchemaTooNew {
                found: v,
                supported: SCHEMA_VERSION,
            });
        }
    }

    Ok(())
}

async fn create_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    // sports: catalogue snapshot, replaced wholesale on sync
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sports (
            key          TEXT PRIMARY KEY,
            grp          TEXT NOT NULL,
            title        TEXT NOT NULL,
            active       INTEGER NOT NULL,
            has_outcomes INTEGER NOT NULL,
            synced_at    TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // latest_events: one row per event fingerprint, replaced per refresh cycle
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS latest_events (
            fingerprint   TEXT PRIMARY KEY,
            sport_key     TEXT NOT NULL,
            commence_time TEXT NOT NULL,
            payload       TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_latest_events_sport ON latest_events(sport_key)")
        .execute(pool)
        .await?;

    // opportunities: append-only log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS opportunities (
            id                  TEXT PRIMARY KEY,
            sport_key           TEXT NOT NULL,
            sport_title         TEXT NOT NULL,
            commence_time       TEXT NOT NULL,
            home_team           TEXT NOT NULL,
            away_team           TEXT NOT NULL,
            market              TEXT NOT NULL,
            total_implied_prob  REAL NOT NULL,
            profit_pct          REAL NOT NULL,
            detected_at         TEXT NOT NULL,
            minute_bucket       TEXT NOT NULL,
            legs                TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_opportunities_listing \
         ON opportunities(detected_at DESC, sport_key, profit_pct DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_opportunities_dedup \
         ON opportunities(sport_key, commence_time, home_team, away_team, market, minute_bucket)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Version 1 stores predate the minute-bucket dedup index. Collapse any
/// duplicate rows before the unique index can be created.
async fn upgrade_v1_to_v2(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        DELETE FROM opportunities WHERE rowid NOT IN (
            SELECT MIN(rowid) FROM opportunities
            GROUP BY sport_key, commence_time, home_team, away_team, market, minute_bucket
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_opportunities_dedup \
         ON opportunities(sport_key, commence_time, home_team, away_team, market, minute_bucket)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ── Sports catalogue ──────────────────────────────────────────────────────────

pub async fn replace_sports(pool: &SqlitePool, sports: &[Sport]) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM sports").execute(&mut *tx).await?;
    for sport in sports {
        sqlx::query(
            "INSERT INTO sports (key, grp, title, active, has_outcomes, synced_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&sport.key)
        .bind(&sport.group)
        .bind(&sport.title)
        .bind(sport.active)
        .bind(sport.has_outcomes)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_sports(pool: &SqlitePool) -> Result<Vec<Sport>, StoreError> {
    let rows = sqlx::query("SELECT key, grp, title, active, has_outcomes FROM sports ORDER BY grp, title")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| Sport {
            key: row.get("key"),
            group: row.get("grp"),
            title: row.get("title"),
            active: row.get("active"),
            has_outcomes: row.get("has_outcomes"),
        })
        .collect())
}

// ── Latest odds snapshot ──────────────────────────────────────────────────────

/// Atomic swap: readers see either the previous sweep or the new one, never a mix.
pub async fn replace_latest(pool: &SqlitePool, events: &[Event]) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM latest_events").execute(&mut *tx).await?;
    for event in events {
        let payload = serde_json::to_string(event)?;
        sqlx::query(
            "INSERT OR REPLACE INTO latest_events (fingerprint, sport_key, commence_time, payload) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(event.fingerprint())
        .bind(&event.sport_key)
        .bind(event.commence_time.to_rfc3339())
        .bind(payload)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_latest(pool: &SqlitePool, sport: Option<&str>) -> Result<Vec<Event>, StoreError> {
    let rows = if let Some(sport) = sport {
        sqlx::query("SELECT payload FROM latest_events WHERE sport_key = ? ORDER BY commence_time")
            .bind(sport)
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query("SELECT payload FROM latest_events ORDER BY commence_time")
            .fetch_all(pool)
            .await?
    };

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let payload: String = row.get("payload");
        events.push(serde_json::from_str(&payload)?);
    }
    Ok(events)
}

// ── Opportunity log ───────────────────────────────────────────────────────────

/// Minute-resolution bucket used to make re-appends within the same minute no-ops.
pub fn minute_bucket(detected_at: DateTime<Utc>) -> String {
    detected_at.format("%Y-%m-%dT%H:%M").to_string()
}

/// Append in a single transaction. Rows whose (event, market, minute) already
/// exist are skipped. Returns the number of rows actually inserted.
pub async fn append_opportunities(
    pool: &SqlitePool,
    opportunities: &[Opportunity],
) -> Result<usize, StoreError> {
    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;

    for op in opportunities {
        let legs = serde_json::to_string(&op.legs)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO opportunities
                (id, sport_key, sport_title, commence_time, home_team, away_team,
                 market, total_implied_prob, profit_pct, detected_at, minute_bucket, legs)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&op.id)
        .bind(&op.sport_key)
        .bind(&op.sport_title)
        .bind(op.commence_time.to_rfc3339())
        .bind(&op.home_team)
        .bind(&op.away_team)
        .bind(&op.market)
        .bind(op.total_implied_prob)
        .bind(op.profit_pct)
        .bind(op.detected_at.to_rfc3339())
        .bind(minute_bucket(op.detected_at))
        .bind(legs)
        .execute(&mut *tx)
        .await?;

        inserted += result.rows_affected() as usize;
    }

    tx.commit().await?;
    Ok(inserted)
}

#[derive(Debug, Clone, Default)]
pub struct OpportunityFilter {
    pub sport: Option<String>,
    pub min_profit_pct: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_opportunities(
    pool: &SqlitePool,
    filter: &OpportunityFilter,
) -> Result<Vec<Opportunity>, StoreError> {
    let mut sql = String::from(
        "SELECT id, sport_key, sport_title, commence_time, home_team, away_team, \
                market, total_implied_prob, profit_pct, detected_at, legs \
         FROM opportunities WHERE 1=1",
    );
    if filter.sport.is_some() {
        sql.push_str(" AND sport_key = ?");
    }
    if filter.min_profit_pct.is_some() {
        sql.push_str(" AND profit_pct >= ?");
    }
    if filter.since.is_some() {
        sql.push_str(" AND detected_at >= ?");
    }
    sql.push_str(" ORDER BY detected_at DESC, profit_pct DESC LIMIT ?");

    let limit = filter
        .limit
        .unwrap_or(100)
        .clamp(1, MAX_OPPORTUNITY_ROWS);

    let mut query = sqlx::query(&sql);
    if let Some(sport) = &filter.sport {
        query = query.bind(sport);
    }
    if let Some(min_profit) = filter.min_profit_pct {
        query = query.bind(min_profit);
    }
    if let Some(since) = filter.since {
        query = query.bind(since.to_rfc3339());
    }
    query = query.bind(limit);

    let rows = query.fetch_all(pool).await?;

    let mut opportunities = Vec::with_capacity(rows.len());
    for row in rows {
        opportunities.push(row_to_opportunity(&row)?);
    }
    Ok(opportunities)
}

pub async fn purge_opportunities(
    pool: &SqlitePool,
    older_than: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM opportunities WHERE detected_at < ?")
        .bind(older_than.to_rfc3339())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

fn row_to_opportunity(row: &sqlx::sqlite::SqliteRow) -> Result<Opportunity, StoreError> {
    let legs: String = row.get("legs");
    Ok(Opportunity {
        id: row.get("id"),
        sport_key: row.get("sport_key"),
        sport_title: row.get("sport_title"),
        commence_time: parse_instant(&row.get::<String, _>("commence_time"))?,
        home_team: row.get("home_team"),
        away_team: row.get("away_team"),
        market: row.get("market"),
        total_implied_prob: row.get("total_implied_prob"),
        profit_pct: row.get("profit_pct"),
        detected_at: parse_instant(&row.get::<String, _>("detected_at"))?,
        legs: serde_json::from_str(&legs)?,
    })
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Db(sqlx::Error::Decode(Box::new(e))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bookmaker, Leg, MarketQuote, Outcome};
    use chrono::TimeZone;

    // Every pool connection to :memory: would get its own database, so pin
    // the test pool to a single connection.
    async fn memory_pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        init_database(&pool).await.unwrap();
        pool
    }

    fn sample_event(sport: &str, home: &str, away: &str) -> Event {
        Event {
            sport_key: sport.to_string(),
            sport_title: "Test League".to_string(),
            commence_time: Utc.with_ymd_and_hms(2030, 6, 1, 18, 0, 0).unwrap(),
            home_team: home.to_string(),
            away_team: away.to_string(),
            bookmakers: vec![Bookmaker {
                key: "booka".to_string(),
                title: "Book A".to_string(),
                last_update: None,
                markets: vec![MarketQuote {
                    key: "h2h".to_string(),
                    last_update: None,
                    outcomes: vec![
                        Outcome { name: away.to_string(), price: 2.1, point: None },
                        Outcome { name: home.to_string(), price: 1.9, point: None },
                    ],
                }],
            }],
        }
    }

    fn sample_opportunity(sport: &str, home: &str, profit_pct: f64, detected_at: DateTime<Utc>) -> Opportunity {
        Opportunity {
            id: uuid::Uuid::new_v4().to_string(),
            sport_key: sport.to_string(),
            sport_title: "Test League".to_string(),
            commence_time: Utc.with_ymd_and_hms(2030, 6, 1, 18, 0, 0).unwrap(),
            home_team: home.to_string(),
            away_team: "Visitors".to_string(),
            market: "h2h".to_string(),
            legs: vec![
                Leg {
                    outcome: home.to_string(),
                    point: None,
                    bookmaker: "booka".to_string(),
                    price: "2.50".to_string(),
                    decimal_price: 2.5,
                    implied_prob: 0.4,
                    stake_share: 0.4565,
                },
                Leg {
                    outcome: "Visitors".to_string(),
                    point: None,
                    bookmaker: "bookb".to_string(),
                    price: "2.10".to_string(),
                    decimal_price: 2.1,
                    implied_prob: 0.47619,
                    stake_share: 0.5435,
                },
            ],
            total_implied_prob: 0.87619,
            profit_pct,
            detected_at,
        }
    }

    #[tokio::test]
    async fn replace_latest_swaps_whole_snapshot() {
        let pool = memory_pool().await;

        let first = vec![
            sample_event("basketball_nba", "Lakers", "Celtics"),
            sample_event("basketball_nba", "Bulls", "Heat"),
        ];
        replace_latest(&pool, &first).await.unwrap();
        assert_eq!(list_latest(&pool, None).await.unwrap().len(), 2);

        let second = vec![sample_event("soccer_epl", "Arsenal", "Spurs")];
        replace_latest(&pool, &second).await.unwrap();

        let latest = list_latest(&pool, None).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].home_team, "Arsenal");
    }

    #[tokio::test]
    async fn list_latest_filters_by_sport() {
        let pool = memory_pool().await;
        replace_latest(
            &pool,
            &[
                sample_event("basketball_nba", "Lakers", "Celtics"),
                sample_event("soccer_epl", "Arsenal", "Spurs"),
            ],
        )
        .await
        .unwrap();

        let nba = list_latest(&pool, Some("basketball_nba")).await.unwrap();
        assert_eq!(nba.len(), 1);
        assert_eq!(nba[0].sport_key, "basketball_nba");
        assert!(list_latest(&pool, Some("icehockey_nhl")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_is_idempotent_within_minute_bucket() {
        let pool = memory_pool().await;
        let detected = Utc.with_ymd_and_hms(2030, 5, 1, 12, 30, 15).unwrap();

        let op = sample_opportunity("basketball_nba", "Lakers", 4.2, detected);
        assert_eq!(append_opportunities(&pool, &[op.clone()]).await.unwrap(), 1);

        // Same event/market/minute, different id and second offset: skipped
        let mut dup = op.clone();
        dup.id = uuid::Uuid::new_v4().to_string();
        dup.detected_at = Utc.with_ymd_and_hms(2030, 5, 1, 12, 30, 45).unwrap();
        assert_eq!(append_opportunities(&pool, &[dup]).await.unwrap(), 0);

        // Next minute: appended
        let mut next = op.clone();
        next.id = uuid::Uuid::new_v4().to_string();
        next.detected_at = Utc.with_ymd_and_hms(2030, 5, 1, 12, 31, 0).unwrap();
        assert_eq!(append_opportunities(&pool, &[next]).await.unwrap(), 1);

        let all = list_opportunities(&pool, &OpportunityFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn list_opportunities_applies_filters_and_ordering() {
        let pool = memory_pool().await;
        let base = Utc.with_ymd_and_hms(2030, 5, 1, 12, 0, 0).unwrap();

        let ops = vec![
            sample_opportunity("basketball_nba", "Lakers", 1.5, base),
            sample_opportunity("basketball_nba", "Bulls", 6.0, base + chrono::Duration::minutes(1)),
            sample_opportunity("soccer_epl", "Arsenal", 3.0, base + chrono::Duration::minutes(2)),
        ];
        assert_eq!(append_opportunities(&pool, &ops).await.unwrap(), 3);

        let nba_only = list_opportunities(
            &pool,
            &OpportunityFilter { sport: Some("basketball_nba".to_string()), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(nba_only.len(), 2);

        let profitable = list_opportunities(
            &pool,
            &OpportunityFilter { min_profit_pct: Some(2.0), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(profitable.len(), 2);
        // Newest first
        assert_eq!(profitable[0].home_team, "Arsenal");

        let recent = list_opportunities(
            &pool,
            &OpportunityFilter {
                since: Some(base + chrono::Duration::minutes(2)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(recent.len(), 1);

        let capped = list_opportunities(
            &pool,
            &OpportunityFilter { limit: Some(100_000), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(capped.len(), 3);

        let one = list_opportunities(
            &pool,
            &OpportunityFilter { limit: Some(1), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_old_rows_only() {
        let pool = memory_pool().await;
        let old = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let fresh = Utc.with_ymd_and_hms(2030, 5, 1, 0, 0, 0).unwrap();

        append_opportunities(
            &pool,
            &[
                sample_opportunity("basketball_nba", "Lakers", 2.0, old),
                sample_opportunity("basketball_nba", "Bulls", 2.0, fresh),
            ],
        )
        .await
        .unwrap();

        let removed = purge_opportunities(&pool, Utc.with_ymd_and_hms(2030, 2, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = list_opportunities(&pool, &OpportunityFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].home_team, "Bulls");
    }

    #[tokio::test]
    async fn sports_catalogue_replaced_wholesale() {
        let pool = memory_pool().await;
        let nfl = Sport {
            key: "americanfootball_nfl".to_string(),
            group: "American Football".to_string(),
            title: "NFL".to_string(),
            active: true,
            has_outcomes: true,
        };
        let epl = Sport {
            key: "soccer_epl".to_string(),
            group: "Soccer".to_string(),
            title: "EPL".to_string(),
            active: true,
            has_outcomes: false,
        };

        replace_sports(&pool, &[nfl.clone(), epl]).await.unwrap();
        assert_eq!(list_sports(&pool).await.unwrap().len(), 2);

        replace_sports(&pool, &[nfl]).await.unwrap();
        let sports = list_sports(&pool).await.unwrap();
        assert_eq!(sports.len(), 1);
        assert_eq!(sports[0].key, "americanfootball_nfl");
        assert!(sports[0].has_outcomes);
    }

    #[tokio::test]
    async fn schema_version_upgrade_path() {
        let pool = memory_pool().await;
        let version: i64 = sqlx::query_scalar("SELECT schema_version FROM meta")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        // Re-init on a current store is a no-op
        init_database(&pool).await.unwrap();

        // A v1 store is upgraded in place
        sqlx::query("UPDATE meta SET schema_version = 1").execute(&pool).await.unwrap();
        init_database(&pool).await.unwrap();
        let version: i64 = sqlx::query_scalar("SELECT schema_version FROM meta")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        // A future store is refused
        sqlx::query("UPDATE meta SET schema_version = 99").execute(&pool).await.unwrap();
        assert!(matches!(
            init_database(&pool).await,
            Err(StoreError::SchemaTooNew { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn create_pool_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("arbscout.db");
        let url = format!("sqlite:{}", db_path.display());

        let pool = create_pool(&url).await.unwrap();
        init_database(&pool).await.unwrap();
        assert!(db_path.exists());
    }
}
