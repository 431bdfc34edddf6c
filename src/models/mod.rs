use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market keys the detector understands.
pub const MARKET_KEYS: [&str; 3] = ["h2h", "spreads", "totals"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sport {
    pub key: String, // "americanfootball_nfl", "soccer_epl", ...
    pub group: String,
    pub title: String,
    pub active: bool,
    pub has_outcomes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub name: String,
    /// Decimal odds. Upstream responses are normalised to decimal on ingest.
    pub price: f64,
    /// Spread handicap or totals line, absent for h2h.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub key: String, // "h2h", "spreads", "totals"
    pub last_update: Option<DateTime<Utc>>,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmaker {
    pub key: String,
    pub title: String,
    pub last_update: Option<DateTime<Utc>>,
    pub markets: Vec<MarketQuote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sport_key: String,
    pub sport_title: String,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    pub bookmakers: Vec<Bookmaker>,
}

impl Event {
    /// Identity used for dedup and joins across refresh cycles.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.sport_key,
            self.commence_time.to_rfc3339(),
            self.home_team,
            self.away_team
        )
    }
}

/// One wager of a proposed arbitrage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<f64>,
    pub bookmaker: String,
    /// Price rendered in the configured display format at detection time.
    pub price: String,
    pub decimal_price: f64,
    pub implied_prob: f64,
    /// Fraction of a unit bankroll. Shares across an opportunity sum to 1.
    pub stake_share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub sport_key: String,
    pub sport_title: String,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    pub market: String,
    pub legs: Vec<Leg>,
    /// Strictly below 1.0 for every emitted opportunity.
    pub total_implied_prob: f64,
    pub profit_pct: f64,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn event_fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.sport_key,
            self.commence_time.to_rfc3339(),
            self.home_team,
            self.away_team
        )
    }
}

/// Advisory request-quota reading taken from upstream response headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub requests_remaining: f64,
    pub requests_used: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every configured sport fetched and both store writes landed.
    Completed,
    /// Cycle finished but a sport was skipped or a write was dropped.
    Partial,
    Failed,
    Cancelled,
}

/// Outcome of one refresh cycle, published to manual-refresh waiters and
/// kept as `last_run` for /api/status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sports_polled: usize,
    pub events_fetched: usize,
    pub detected: usize,
    pub persisted: usize,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

impl RunReport {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

// API Response types
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now(),
        }
    }
}
