use std::env;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};

use crate::models::MARKET_KEYS;
use crate::utils::OddsFormat;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:data/arbscout.db";
pub const DEFAULT_REFRESH_INTERVAL_S: u64 = 300;

/// Runtime configuration, built once at startup and passed explicitly into
/// the client, scheduler and server constructors.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    /// Display format for leg prices; detection always runs on decimal odds.
    pub odds_format: OddsFormat,
    pub markets: Vec<String>,
    pub regions: Vec<String>,
    pub min_profit_pct: f64,
    /// Seconds between automatic refresh cycles; 0 disables the timer
    /// (manual refresh only).
    pub refresh_interval_s: u64,
    pub database_url: String,
    /// Allow-list of sport keys to poll; empty polls every active sport.
    pub sports: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source. `from_env` is the thin production
    /// wrapper; tests pass a map.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = get("ODDS_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("ODDS_API_KEY is required and must be non-empty"))?;

        let odds_format = match get("ODDS_FORMAT") {
            Some(raw) => OddsFormat::from_str(&raw)?,
            None => OddsFormat::Decimal,
        };

        let markets = parse_csv(get("ODDS_MARKETS").as_deref().unwrap_or("h2h"));
        if markets.is_empty() {
            bail!("ODDS_MARKETS must name at least one market");
        }
        for market in &markets {
            if !MARKET_KEYS.contains(&market.as_str()) {
                bail!(
                    "unknown market {:?} in ODDS_MARKETS (expected a subset of {})",
                    market,
                    MARKET_KEYS.join(", ")
                );
            }
        }

        let regions = parse_csv(get("ODDS_REGIONS").as_deref().unwrap_or("us"));
        if regions.is_empty() {
            bail!("ODDS_REGIONS must name at least one region");
        }

        let min_profit_pct = match get("MIN_PROFIT_PCT") {
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .map_err(|_| anyhow!("MIN_PROFIT_PCT must be a number, got {:?}", raw))?,
            None => 0.0,
        };

        let refresh_interval_s = match get("REFRESH_INTERVAL_S") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| anyhow!("REFRESH_INTERVAL_S must be a whole number of seconds, got {:?}", raw))?,
            None => DEFAULT_REFRESH_INTERVAL_S,
        };

        let database_url = get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let sports = parse_csv(get("ODDS_SPORTS").as_deref().unwrap_or(""));

        Ok(Self {
            api_key,
            odds_format,
            markets,
            regions,
            min_profit_pct,
            refresh_interval_s,
            database_url,
            sports,
        })
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}
