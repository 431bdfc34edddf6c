//! Thin façade over The Odds API v4.
//!
//! One request per sport per refresh cycle. Responses are normalised into
//! domain events here so the detector never sees upstream quirks: outcomes
//! are sorted, short markets dropped, naive timestamps rejected. Quota
//! headers (`x-requests-remaining` / `x-requests-used`) ride along with
//! every odds response.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::config::AppConfig;
use crate::models::{Bookmaker, Event, MarketQuote, Outcome, QuotaSnapshot, Sport};

pub const DEFAULT_BASE_URL: &str = "https://api.the-odds-api.com";

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum OddsApiError {
    #[error("odds API rejected the configured key (401)")]
    Auth,
    #[error("odds API rejected the request: {0}")]
    BadRequest(String),
    #[error("request quota exhausted")]
    QuotaExhausted { reset_after_secs: Option<u64> },
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Seam between the scheduler and the upstream feed. The scheduler only
/// sees this trait, so cycle tests can run against a scripted feed.
#[async_trait]
pub trait OddsSource: Send + Sync {
    async fn list_sports(&self) -> Result<Vec<Sport>, OddsApiError>;

    /// One upstream request. Returns the normalised events for the sport and
    /// the quota snapshot observed on the response, when headers are present.
    async fn get_odds(
        &self,
        sport_key: &str,
    ) -> Result<(Vec<Event>, Option<QuotaSnapshot>), OddsApiError>;
}

pub struct OddsClient {
    client: Client,
    base_url: String,
    api_key: String,
    regions: String,
    markets: String,
}

impl OddsClient {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        Self::with_base_url(config, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(config: &AppConfig, base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            regions: config.regions.join(","),
            markets: config.markets.join(","),
        })
    }
}

#[async_trait]
impl OddsSource for OddsClient {
    async fn list_sports(&self) -> Result<Vec<Sport>, OddsApiError> {
        let url = format!("{}/v4/sports", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("apiKey", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| OddsApiError::Transient(e.to_string()))?;

        let resp = check_status(resp).await?;
        let raw: Vec<RawSport> = resp
            .json()
            .await
            .map_err(|e| OddsApiError::InvalidPayload(e.to_string()))?;

        Ok(raw.into_iter().map(RawSport::into_sport).collect())
    }

    async fn get_odds(
        &self,
        sport_key: &str,
    ) -> Result<(Vec<Event>, Option<QuotaSnapshot>), OddsApiError> {
        let url = format!("{}/v4/sports/{}/odds", self.base_url, sport_key);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("regions", self.regions.as_str()),
                ("markets", self.markets.as_str()),
                // Detection runs on decimal odds; the configured display
                // format is applied when legs are rendered.
                ("oddsFormat", "decimal"),
                ("dateFormat", "iso"),
            ])
            .send()
            .await
            .map_err(|e| OddsApiError::Transient(e.to_string()))?;

        let resp = check_status(resp).await?;
        let quota = quota_from_headers(resp.headers());

        let raw: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| OddsApiError::InvalidPayload(e.to_string()))?;

        let mut events = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<RawEvent>(value) {
                Ok(raw_event) => {
                    if let Some(event) = normalize_event(raw_event, sport_key) {
                        events.push(event);
                    }
                }
                Err(e) => tracing::warn!("Odds: dropping undecodable {} event: {}", sport_key, e),
            }
        }

        Ok((events, quota))
    }
}

/// Map upstream status codes onto error kinds. 200 passes through.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, OddsApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(OddsApiError::Auth);
    }
    if status == StatusCode::UNPROCESSABLE_ENTITY {
        let body = resp.text().await.unwrap_or_default();
        return Err(OddsApiError::BadRequest(body));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(OddsApiError::QuotaExhausted {
            reset_after_secs: retry_after_secs(resp.headers()),
        });
    }
    if status.is_server_error() {
        return Err(OddsApiError::Transient(format!("upstream HTTP {}", status)));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(OddsApiError::BadRequest(format!("HTTP {}: {}", status, body)))
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

pub fn quota_from_headers(headers: &HeaderMap) -> Option<QuotaSnapshot> {
    let requests_remaining = header_f64(headers, "x-requests-remaining")?;
    let requests_used = header_f64(headers, "x-requests-used").unwrap_or(0.0);
    Some(QuotaSnapshot {
        requests_remaining,
        requests_used,
        observed_at: Utc::now(),
    })
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers.get("retry-after")?.to_str().ok()?.trim().parse().ok()
}

// ── Odds API response types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawSport {
    key: String,
    #[serde(default)]
    group: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    has_outcomes: bool,
}

impl RawSport {
    fn into_sport(self) -> Sport {
        Sport {
            key: self.key,
            group: self.group,
            title: self.title,
            active: self.active,
            has_outcomes: self.has_outcomes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    sport_key: Option<String>,
    #[serde(default)]
    sport_title: String,
    commence_time: Option<String>,
    home_team: Option<String>,
    away_team: Option<String>,
    #[serde(default)]
    bookmakers: Vec<RawBookmaker>,
}

#[derive(Debug, Deserialize)]
struct RawBookmaker {
    key: Option<String>,
    #[serde(default)]
    title: String,
    last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    markets: Vec<RawMarket>,
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    key: Option<String>,
    last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    outcomes: Vec<RawOutcome>,
}

#[derive(Debug, Deserialize)]
struct RawOutcome {
    name: Option<String>,
    price: Option<f64>,
    point: Option<f64>,
}

// ── Normalisation ─────────────────────────────────────────────────────────────

/// Turn a raw upstream event into a domain event. Returns None (with a
/// warning) when a required field is missing or the timestamp carries no
/// offset. Never panics on upstream garbage.
fn normalize_event(raw: RawEvent, requested_sport: &str) -> Option<Event> {
    let sport_key = raw.sport_key.unwrap_or_else(|| requested_sport.to_string());

    let (Some(commence_raw), Some(home_team), Some(away_team)) =
        (raw.commence_time, raw.home_team, raw.away_team)
    else {
        tracing::warn!("Odds: dropping {} event with missing identity fields", sport_key);
        return None;
    };

    // RFC 3339 only: a timestamp without an offset is rejected, not guessed at.
    let commence_time = match DateTime::parse_from_rfc3339(&commence_raw) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(e) => {
            tracing::warn!(
                "Odds: dropping {} vs {}, bad commence_time {:?}: {}",
                home_team, away_team, commence_raw, e
            );
            return None;
        }
    };

    let mut bookmakers: Vec<Bookmaker> = raw
        .bookmakers
        .into_iter()
        .filter_map(normalize_bookmaker)
        .collect();
    bookmakers.sort_by(|a, b| a.key.cmp(&b.key));

    Some(Event {
        sport_key,
        sport_title: raw.sport_title,
        commence_time,
        home_team,
        away_team,
        bookmakers,
    })
}

fn normalize_bookmaker(raw: RawBookmaker) -> Option<Bookmaker> {
    let key = raw.key?;
    let mut markets = Vec::with_capacity(raw.markets.len());

    for market in raw.markets {
        let Some(market_key) = market.key else { continue };

        // A bookmaker must not quote the same market twice; keep the first.
        if markets.iter().any(|m: &MarketQuote| m.key == market_key) {
            tracing::warn!("Odds: {} quotes market {} twice, keeping first", key, market_key);
            continue;
        }

        let mut outcomes: Vec<Outcome> = market
            .outcomes
            .into_iter()
            .filter_map(|o| {
                Some(Outcome {
                    name: o.name?,
                    price: o.price?,
                    point: o.point,
                })
            })
            .collect();

        // A market needs at least two priced outcomes to mean anything.
        if outcomes.len() < 2 {
            tracing::warn!("Odds: {} market {} has fewer than two outcomes, dropped", key, market_key);
            continue;
        }

        outcomes.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then(a.point.partial_cmp(&b.point).unwrap_or(std::cmp::Ordering::Equal))
        });

        markets.push(MarketQuote {
            key: market_key,
            last_update: market.last_update,
            outcomes,
        });
    }

    Some(Bookmaker {
        key,
        title: raw.title,
        last_update: raw.last_update,
        markets,
    })
}
