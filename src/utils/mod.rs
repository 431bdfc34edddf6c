use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PriceError {
    #[error("american odds must be >= +100 or <= -100, got {0}")]
    InvalidAmerican(f64),
    #[error("decimal odds must be greater than 1, got {0}")]
    InvalidDecimal(f64),
    #[error("unknown odds format: {0} (expected american, decimal or fractional)")]
    UnknownFormat(String),
}

/// Display format for prices. Detection always runs on decimal odds;
/// this only affects how leg prices are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OddsFormat {
    American,
    Decimal,
    Fractional,
}

impl OddsFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OddsFormat::American => "american",
            OddsFormat::Decimal => "decimal",
            OddsFormat::Fractional => "fractional",
        }
    }
}

impl FromStr for OddsFormat {
    type Err = PriceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "american" => Ok(OddsFormat::American),
            "decimal" => Ok(OddsFormat::Decimal),
            "fractional" => Ok(OddsFormat::Fractional),
            other => Err(PriceError::UnknownFormat(other.to_string())),
        }
    }
}

/// Convert American odds to decimal odds.
/// American prices between -100 and +100 (exclusive) do not exist.
pub fn american_to_decimal(price: f64) -> Result<f64, PriceError> {
    if price >= 100.0 {
        Ok(1.0 + price / 100.0)
    } else if price <= -100.0 {
        Ok(1.0 + 100.0 / price.abs())
    } else {
        Err(PriceError::InvalidAmerican(price))
    }
}

/// Implied probability of decimal odds (1/d). Odds at or below even money
/// for the bettor's full stake (d <= 1) are rejected.
pub fn decimal_to_implied_prob(decimal: f64) -> Result<f64, PriceError> {
    if decimal > 1.0 {
        Ok(1.0 / decimal)
    } else {
        Err(PriceError::InvalidDecimal(decimal))
    }
}

/// Implied probability of an American price.
pub fn american_to_implied_prob(price: f64) -> Result<f64, PriceError> {
    decimal_to_implied_prob(american_to_decimal(price)?)
}

/// Convert decimal odds back to American, rounded to the nearest integer
/// with ties away from zero.
pub fn decimal_to_american(decimal: f64) -> Result<f64, PriceError> {
    if decimal >= 2.0 {
        Ok(((decimal - 1.0) * 100.0).round())
    } else if decimal > 1.0 {
        Ok((-100.0 / (decimal - 1.0)).round())
    } else {
        Err(PriceError::InvalidDecimal(decimal))
    }
}

/// Best fractional representation of decimal odds: the rational closest to
/// d - 1 with denominator at most 100, reduced to lowest terms.
pub fn decimal_to_fractional(decimal: f64) -> Result<(i64, i64), PriceError> {
    if decimal <= 1.0 {
        return Err(PriceError::InvalidDecimal(decimal));
    }
    let target = decimal - 1.0;
    let mut best = (1i64, 100i64);
    let mut best_err = f64::MAX;

    for den in 1..=100i64 {
        let num = (target * den as f64).round() as i64;
        if num < 1 {
            continue;
        }
        let err = (target - num as f64 / den as f64).abs();
        if err + 1e-12 < best_err {
            best = (num, den);
            best_err = err;
        }
    }

    let g = gcd(best.0, best.1);
    Ok((best.0 / g, best.1 / g))
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Render decimal odds in the configured display format.
/// Falls back to plain decimal if the price cannot be expressed (never the
/// case for prices that survived normalisation).
pub fn format_price(decimal: f64, format: OddsFormat) -> String {
    match format {
        OddsFormat::Decimal => format!("{:.2}", decimal),
        OddsFormat::American => match decimal_to_american(decimal) {
            Ok(a) => format!("{:+}", a as i64),
            Err(_) => format!("{:.2}", decimal),
        },
        OddsFormat::Fractional => match decimal_to_fractional(decimal) {
            Ok((num, den)) => format!("{}/{}", num, den),
            Err(_) => format!("{:.2}", decimal),
        },
    }
}

/// Round half-to-even at `dp` decimal places. Used for monetary display
/// fields (2 dp) and probability display fields (6 dp).
pub fn round_half_even(x: f64, dp: u32) -> f64 {
    let scale = 10f64.powi(dp as i32);
    let scaled = x * scale;
    let floor = scaled.floor();
    let rounded = if ((scaled - floor) - 0.5).abs() < 1e-9 {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        scaled.round()
    };
    rounded / scale
}
