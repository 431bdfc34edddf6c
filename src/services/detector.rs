//! Arbitrage detection over normalised odds.
//!
//! Pure over its input: same events + same clock in, byte-identical
//! opportunities out. For every event and configured market the engine picks
//! the best decimal price per outcome across books, sums implied
//! probabilities, and emits an opportunity whenever the total lands strictly
//! below 1.0 and clears the configured profit threshold.
//!
//! Spreads and totals only pair outcomes on the same line: `A -2.5` with
//! `B +2.5`, `Over 45.5` with `Under 45.5`. Lines are matched on the
//! magnitude of the point, so cross-line "middles" are never reported as
//! arbitrage.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::{Event, Leg, MarketQuote, Opportunity};
use crate::utils::{format_price, OddsFormat};

/// Tolerance for treating two spread/total lines as the same line.
const LINE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub markets: Vec<String>,
    pub min_profit_pct: f64,
    /// Minimum distinct bookmakers quoting a market before it is considered.
    pub min_books: usize,
    pub odds_format: OddsFormat,
}

impl DetectorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            markets: config.markets.clone(),
            min_profit_pct: config.min_profit_pct,
            min_books: 2,
            odds_format: config.odds_format,
        }
    }
}

/// Scan events for arbitrage. `now` is both the past-event cutoff and the
/// detection instant stamped on every emitted opportunity.
pub fn detect(events: &[Event], config: &DetectorConfig, now: DateTime<Utc>) -> Vec<Opportunity> {
    let mut opportunities = Vec::new();

    for event in events {
        if event.commence_time <= now {
            tracing::debug!(
                "Detector: skipping started event {} vs {}",
                event.home_team,
                event.away_team
            );
            continue;
        }

        for market_key in &config.markets {
            let quotes = valid_quotes(event, market_key);
            if quotes.len() < config.min_books {
                continue;
            }

            if market_key == "h2h" {
                opportunities.extend(detect_h2h(event, market_key, &quotes, config, now));
            } else {
                opportunities.extend(detect_lined(event, market_key, &quotes, config, now));
            }
        }
    }

    opportunities.sort_by(|a, b| {
        b.profit_pct
            .partial_cmp(&a.profit_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.event_fingerprint().cmp(&b.event_fingerprint()))
            .then_with(|| a.market.cmp(&b.market))
            .then_with(|| a.id.cmp(&b.id))
    });

    opportunities
}

/// All quotes for a market, minus bookmakers offering NaN or sub-even
/// decimal prices. Each surviving bookmaker appears at most once.
fn valid_quotes<'a>(event: &'a Event, market_key: &str) -> Vec<(&'a str, &'a MarketQuote)> {
    let mut quotes = Vec::new();

    for book in &event.bookmakers {
        let Some(market) = book.markets.iter().find(|m| m.key == market_key) else {
            continue;
        };

        if market
            .outcomes
            .iter()
            .all(|o| o.price.is_finite() && o.price > 1.0)
        {
            quotes.push((book.key.as_str(), market));
        } else {
            tracing::warn!(
                "Detector: dropping {} market from {} for {} vs {} (unusable price)",
                market_key,
                book.key,
                event.home_team,
                event.away_team
            );
        }
    }

    quotes
}

/// Best price holder for one outcome key during selection.
struct BestLeg {
    name: String,
    point: Option<f64>,
    price: f64,
    book: String,
}

fn detect_h2h(
    event: &Event,
    market_key: &str,
    quotes: &[(&str, &MarketQuote)],
    config: &DetectorConfig,
    now: DateTime<Utc>,
) -> Option<Opportunity> {
    let mut best: Vec<BestLeg> = Vec::new();

    for (book, market) in quotes {
        for outcome in &market.outcomes {
            upsert_best(&mut best, &outcome.name, None, outcome.price, book);
        }
    }

    if best.len() < 2 {
        return None;
    }
    build_opportunity(event, market_key, best, None, config, now)
}

fn detect_lined(
    event: &Event,
    market_key: &str,
    quotes: &[(&str, &MarketQuote)],
    config: &DetectorConfig,
    now: DateTime<Utc>,
) -> Vec<Opportunity> {
    // (book, name, point, price); outcomes without a point cannot be paired
    let mut entries: Vec<(&str, &str, f64, f64)> = Vec::new();
    for (book, market) in quotes {
        for outcome in &market.outcomes {
            match outcome.point {
                Some(point) => entries.push((*book, outcome.name.as_str(), point, outcome.price)),
                None => tracing::debug!(
                    "Detector: {} outcome {:?} from {} has no line, skipped",
                    market_key,
                    outcome.name,
                    book
                ),
            }
        }
    }

    // Partition by line magnitude: -2.5 and +2.5 sit on the 2.5 line,
    // Over/Under 45.5 both carry 45.5.
    let mut lines: Vec<f64> = Vec::new();
    for (_, _, point, _) in &entries {
        if !lines.iter().any(|l| (l - point.abs()).abs() < LINE_EPSILON) {
            lines.push(point.abs());
        }
    }
    lines.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut opportunities = Vec::new();
    for line in lines {
        let mut best: Vec<BestLeg> = Vec::new();
        for (book, name, point, price) in &entries {
            if (point.abs() - line).abs() < LINE_EPSILON {
                upsert_best(&mut best, name, Some(*point), *price, book);
            }
        }

        // One-sided lines cannot cover the outcome space
        if best.len() < 2 {
            continue;
        }
        opportunities.extend(build_opportunity(event, market_key, best, Some(line), config, now));
    }

    opportunities
}

/// Keep the highest decimal price per outcome key; ties go to the
/// lexicographically smallest bookmaker so repeated runs pick the same book.
fn upsert_best(best: &mut Vec<BestLeg>, name: &str, point: Option<f64>, price: f64, book: &str) {
    let existing = best.iter_mut().find(|leg| {
        leg.name == name
            && match (leg.point, point) {
                (None, None) => true,
                (Some(a), Some(b)) => (a - b).abs() < LINE_EPSILON,
                _ => false,
            }
    });

    match existing {
        Some(leg) => {
            if price > leg.price || (price == leg.price && book < leg.book.as_str()) {
                leg.price = price;
                leg.book = book.to_string();
            }
        }
        None => best.push(BestLeg {
            name: name.to_string(),
            point,
            price,
            book: book.to_string(),
        }),
    }
}

fn build_opportunity(
    event: &Event,
    market_key: &str,
    mut best: Vec<BestLeg>,
    line: Option<f64>,
    config: &DetectorConfig,
    now: DateTime<Utc>,
) -> Option<Opportunity> {
    let total_implied_prob: f64 = best.iter().map(|leg| 1.0 / leg.price).sum();
    if total_implied_prob >= 1.0 {
        return None;
    }

    let profit_pct = (1.0 / total_implied_prob - 1.0) * 100.0;
    if profit_pct < config.min_profit_pct {
        return None;
    }

    best.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then(a.point.partial_cmp(&b.point).unwrap_or(std::cmp::Ordering::Equal))
    });

    let legs = best
        .into_iter()
        .map(|leg| {
            let implied_prob = 1.0 / leg.price;
            Leg {
                outcome: leg.name,
                point: leg.point,
                bookmaker: leg.book,
                price: format_price(leg.price, config.odds_format),
                decimal_price: leg.price,
                implied_prob,
                stake_share: implied_prob / total_implied_prob,
            }
        })
        .collect();

    // Deterministic id: identical inputs and clock reproduce identical rows
    let id_seed = format!(
        "{}|{}|{}|{}",
        event.fingerprint(),
        market_key,
        line.map(|l| l.to_string()).unwrap_or_default(),
        now.to_rfc3339()
    );

    Some(Opportunity {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, id_seed.as_bytes()).to_string(),
        sport_key: event.sport_key.clone(),
        sport_title: event.sport_title.clone(),
        commence_time: event.commence_time,
        home_team: event.home_team.clone(),
        away_team: event.away_team.clone(),
        market: market_key.to_string(),
        legs,
        total_implied_prob,
        profit_pct,
        detected_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bookmaker, Outcome};
    use crate::utils::american_to_decimal;
    use chrono::TimeZone;

    fn clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 10, 1, 12, 0, 0).unwrap()
    }

    fn h2h_book(key: &str, outcomes: &[(&str, f64)]) -> Bookmaker {
        Bookmaker {
            key: key.to_string(),
            title: key.to_string(),
            last_update: None,
            markets: vec![MarketQuote {
                key: "h2h".to_string(),
                last_update: None,
                outcomes: outcomes
                    .iter()
                    .map(|(name, price)| Outcome {
                        name: name.to_string(),
                        price: *price,
                        point: None,
                    })
                    .collect(),
            }],
        }
    }

    fn spreads_book(key: &str, outcomes: &[(&str, f64, f64)]) -> Bookmaker {
        Bookmaker {
            key: key.to_string(),
            title: key.to_string(),
            last_update: None,
            markets: vec![MarketQuote {
                key: "spreads".to_string(),
                last_update: None,
                outcomes: outcomes
                    .iter()
                    .map(|(name, point, price)| Outcome {
                        name: name.to_string(),
                        price: *price,
                        point: Some(*point),
                    })
                    .collect(),
            }],
        }
    }

    fn event(market_books: Vec<Bookmaker>) -> Event {
        Event {
            sport_key: "americanfootball_nfl".to_string(),
            sport_title: "NFL".to_string(),
            commence_time: clock() + chrono::Duration::hours(6),
            home_team: "Chiefs".to_string(),
            away_team: "Bills".to_string(),
            bookmakers: market_books,
        }
    }

    fn config(markets: &[&str], min_profit_pct: f64) -> DetectorConfig {
        DetectorConfig {
            markets: markets.iter().map(|m| m.to_string()).collect(),
            min_profit_pct,
            min_books: 2,
            odds_format: OddsFormat::Decimal,
        }
    }

    #[test]
    fn classic_two_way_h2h_arb() {
        let events = vec![event(vec![
            h2h_book(
                "booka",
                &[
                    ("Chiefs", american_to_decimal(150.0).unwrap()),
                    ("Bills", american_to_decimal(-180.0).unwrap()),
                ],
            ),
            h2h_book(
                "bookb",
                &[
                    ("Chiefs", american_to_decimal(120.0).unwrap()),
                    ("Bills", american_to_decimal(110.0).unwrap()),
                ],
            ),
        ])];

        let ops = detect(&events, &config(&["h2h"], 0.0), clock());
        assert_eq!(ops.len(), 1);

        let op = &ops[0];
        assert!((op.total_implied_prob - 0.876190476).abs() < 1e-6);
        assert!((op.profit_pct - 14.1304348).abs() < 1e-4);

        // Legs ordered by outcome name
        assert_eq!(op.legs[0].outcome, "Bills");
        assert_eq!(op.legs[0].bookmaker, "bookb");
        assert!((op.legs[0].decimal_price - 2.1).abs() < 1e-9);
        assert!((op.legs[0].stake_share - 0.543478).abs() < 1e-3);

        assert_eq!(op.legs[1].outcome, "Chiefs");
        assert_eq!(op.legs[1].bookmaker, "booka");
        assert!((op.legs[1].decimal_price - 2.5).abs() < 1e-9);
        assert!((op.legs[1].stake_share - 0.456522).abs() < 1e-3);

        // Invariants: probabilities sum below 1, stakes sum to 1
        let prob_sum: f64 = op.legs.iter().map(|l| l.implied_prob).sum();
        assert!(prob_sum < 1.0);
        assert!((op.profit_pct - (1.0 / prob_sum - 1.0) * 100.0).abs() < 1e-9);
        let stake_sum: f64 = op.legs.iter().map(|l| l.stake_share).sum();
        assert!((stake_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_arb_when_probabilities_exceed_one() {
        let d = american_to_decimal(-110.0).unwrap();
        let events = vec![event(vec![
            h2h_book("booka", &[("Chiefs", d), ("Bills", d)]),
            h2h_book("bookb", &[("Chiefs", d), ("Bills", d)]),
        ])];

        assert!(detect(&events, &config(&["h2h"], 0.0), clock()).is_empty());
    }

    #[test]
    fn exact_break_even_is_not_an_arb() {
        let events = vec![event(vec![
            h2h_book("booka", &[("Chiefs", 2.0), ("Bills", 2.0)]),
            h2h_book("bookb", &[("Chiefs", 1.9), ("Bills", 1.9)]),
        ])];

        assert!(detect(&events, &config(&["h2h"], 0.0), clock()).is_empty());
    }

    #[test]
    fn threshold_gates_marginal_arbs() {
        // sum = 1/2.0 + 1/2.02 = 0.995049..., profit ≈ 0.4975%
        let books = vec![
            h2h_book("booka", &[("Chiefs", 2.0), ("Bills", 2.02)]),
            h2h_book("bookb", &[("Chiefs", 1.9), ("Bills", 1.9)]),
        ];

        let below = detect(&[event(books.clone())], &config(&["h2h"], 0.5), clock());
        assert!(below.is_empty());

        let above = detect(&[event(books)], &config(&["h2h"], 0.4), clock());
        assert_eq!(above.len(), 1);
    }

    #[test]
    fn empty_input_and_started_events_produce_nothing() {
        assert!(detect(&[], &config(&["h2h"], 0.0), clock()).is_empty());

        let mut started = event(vec![
            h2h_book("booka", &[("Chiefs", 2.5), ("Bills", 2.5)]),
            h2h_book("bookb", &[("Chiefs", 2.4), ("Bills", 2.4)]),
        ]);
        started.commence_time = clock() - chrono::Duration::seconds(1);
        assert!(detect(&[started], &config(&["h2h"], 0.0), clock()).is_empty());
    }

    #[test]
    fn spreads_pair_only_matching_lines() {
        // Scenario: BookA quotes the ±2.5 line, BookB the ±3.0 line. Neither
        // line arbs on its own; the cross-line combination would, and must
        // not be emitted.
        let d110 = american_to_decimal(-110.0).unwrap();
        let events = vec![event(vec![
            spreads_book("booka", &[("Chiefs", -2.5, d110), ("Bills", 2.5, d110)]),
            spreads_book(
                "bookb",
                &[
                    ("Chiefs", -3.0, american_to_decimal(100.0).unwrap()),
                    ("Bills", 3.0, american_to_decimal(-120.0).unwrap()),
                ],
            ),
        ])];

        assert!(detect(&events, &config(&["spreads"], 0.0), clock()).is_empty());
    }

    #[test]
    fn same_line_spread_arb_is_emitted() {
        let events = vec![event(vec![
            spreads_book("booka", &[("Chiefs", -3.0, 2.2), ("Bills", 3.0, 1.7)]),
            spreads_book("bookb", &[("Chiefs", -3.0, 1.8), ("Bills", 3.0, 2.05)]),
        ])];

        let ops = detect(&events, &config(&["spreads"], 0.0), clock());
        assert_eq!(ops.len(), 1);

        let op = &ops[0];
        // 1/2.2 + 1/2.05 = 0.942350...
        assert!((op.total_implied_prob - 0.9423503).abs() < 1e-6);
        assert!(op.legs.iter().all(|l| l.point.unwrap().abs() == 3.0));
        assert_eq!(op.legs[0].bookmaker, "bookb"); // Bills 2.05
        assert_eq!(op.legs[1].bookmaker, "booka"); // Chiefs 2.2
    }

    #[test]
    fn totals_pair_over_and_under_on_the_same_point() {
        let over_under = |key: &str, over: f64, under: f64, point: f64| Bookmaker {
            key: key.to_string(),
            title: key.to_string(),
            last_update: None,
            markets: vec![MarketQuote {
                key: "totals".to_string(),
                last_update: None,
                outcomes: vec![
                    Outcome { name: "Over".to_string(), price: over, point: Some(point) },
                    Outcome { name: "Under".to_string(), price: under, point: Some(point) },
                ],
            }],
        };

        let events = vec![event(vec![
            over_under("booka", 2.15, 1.75, 45.5),
            over_under("bookb", 1.8, 2.1, 45.5),
            // Different line: never pairs with 45.5
            over_under("bookc", 3.0, 3.0, 47.5),
        ])];

        let ops = detect(&events, &config(&["totals"], 0.0), clock());
        // 45.5: 1/2.15 + 1/2.1 = 0.9413... arb; 47.5 single-book: 0.666 arb
        assert_eq!(ops.len(), 2);

        let line_455 = ops.iter().find(|o| o.legs[0].point == Some(45.5)).unwrap();
        assert_eq!(line_455.legs[0].bookmaker, "booka"); // Over 2.15
        assert_eq!(line_455.legs[1].bookmaker, "bookb"); // Under 2.1

        let line_475 = ops.iter().find(|o| o.legs[0].point == Some(47.5)).unwrap();
        assert!(line_475.legs.iter().all(|l| l.bookmaker == "bookc"));
    }

    #[test]
    fn single_book_mistake_is_still_an_arb() {
        let events = vec![event(vec![
            h2h_book("generous", &[("Chiefs", 2.2), ("Bills", 2.2)]),
            h2h_book("sharp", &[("Chiefs", 1.5), ("Bills", 1.5)]),
        ])];

        let ops = detect(&events, &config(&["h2h"], 0.0), clock());
        assert_eq!(ops.len(), 1);
        assert!(ops[0].legs.iter().all(|l| l.bookmaker == "generous"));
    }

    #[test]
    fn lone_bookmaker_market_is_skipped() {
        let events = vec![event(vec![h2h_book(
            "generous",
            &[("Chiefs", 2.2), ("Bills", 2.2)],
        )])];

        assert!(detect(&events, &config(&["h2h"], 0.0), clock()).is_empty());
    }

    #[test]
    fn invalid_prices_drop_only_the_offending_book() {
        let events = vec![event(vec![
            h2h_book("booka", &[("Chiefs", 2.5), ("Bills", 2.1)]),
            h2h_book("badbook", &[("Chiefs", f64::NAN), ("Bills", 1.8)]),
            h2h_book("bookb", &[("Chiefs", 2.3), ("Bills", 2.0)]),
        ])];

        let ops = detect(&events, &config(&["h2h"], 0.0), clock());
        assert_eq!(ops.len(), 1);
        assert!(ops[0].legs.iter().all(|l| l.bookmaker != "badbook"));
    }

    #[test]
    fn price_ties_break_to_lexicographic_bookmaker() {
        let events = vec![event(vec![
            h2h_book("zeta", &[("Chiefs", 2.5), ("Bills", 2.1)]),
            h2h_book("alpha", &[("Chiefs", 2.5), ("Bills", 1.9)]),
        ])];

        let ops = detect(&events, &config(&["h2h"], 0.0), clock());
        assert_eq!(ops.len(), 1);
        let chiefs = ops.iter().flat_map(|o| &o.legs).find(|l| l.outcome == "Chiefs").unwrap();
        assert_eq!(chiefs.bookmaker, "alpha");
    }

    #[test]
    fn detector_is_deterministic_under_book_reordering() {
        let forward = vec![event(vec![
            h2h_book("booka", &[("Chiefs", 2.5), ("Bills", 1.55)]),
            h2h_book("bookb", &[("Chiefs", 2.2), ("Bills", 2.1)]),
            h2h_book("bookc", &[("Chiefs", 2.5), ("Bills", 2.0)]),
        ])];
        let mut shuffled = forward.clone();
        shuffled[0].bookmakers.reverse();

        let cfg = config(&["h2h"], 0.0);
        let a = detect(&forward, &cfg, clock());
        let b = detect(&shuffled, &cfg, clock());
        let c = detect(&forward, &cfg, clock());

        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&c).unwrap());
    }

    #[test]
    fn output_sorted_by_profit_then_fingerprint() {
        let small = event(vec![
            h2h_book("booka", &[("Chiefs", 2.05), ("Bills", 2.05)]),
            h2h_book("bookb", &[("Chiefs", 1.9), ("Bills", 1.9)]),
        ]);
        let mut big = event(vec![
            h2h_book("booka", &[("Jets", 2.6), ("Dolphins", 2.6)]),
            h2h_book("bookb", &[("Jets", 1.9), ("Dolphins", 1.9)]),
        ]);
        big.home_team = "Jets".to_string();
        big.away_team = "Dolphins".to_string();

        let ops = detect(&[small, big], &config(&["h2h"], 0.0), clock());
        assert_eq!(ops.len(), 2);
        assert!(ops[0].profit_pct > ops[1].profit_pct);
        assert_eq!(ops[0].home_team, "Jets");
    }

    #[test]
    fn leg_prices_render_in_configured_format() {
        let events = vec![event(vec![
            h2h_book("booka", &[("Chiefs", 2.5), ("Bills", 1.55)]),
            h2h_book("bookb", &[("Chiefs", 2.2), ("Bills", 2.1)]),
        ])];

        let mut cfg = config(&["h2h"], 0.0);
        cfg.odds_format = OddsFormat::American;

        let ops = detect(&events, &cfg, clock());
        assert_eq!(ops.len(), 1);
        let chiefs = ops[0].legs.iter().find(|l| l.outcome == "Chiefs").unwrap();
        assert_eq!(chiefs.price, "+150");
        assert!((chiefs.decimal_price - 2.5).abs() < 1e-9);
    }

    #[test]
    fn multiple_markets_detected_independently() {
        let mut books = vec![
            h2h_book("booka", &[("Chiefs", 2.5), ("Bills", 2.1)]),
            h2h_book("bookb", &[("Chiefs", 2.2), ("Bills", 2.0)]),
        ];
        books[0].markets.push(MarketQuote {
            key: "totals".to_string(),
            last_update: None,
            outcomes: vec![
                Outcome { name: "Over".to_string(), price: 2.15, point: Some(45.5) },
                Outcome { name: "Under".to_string(), price: 1.75, point: Some(45.5) },
            ],
        });
        books[1].markets.push(MarketQuote {
            key: "totals".to_string(),
            last_update: None,
            outcomes: vec![
                Outcome { name: "Over".to_string(), price: 1.8, point: Some(45.5) },
                Outcome { name: "Under".to_string(), price: 2.1, point: Some(45.5) },
            ],
        });

        let ops = detect(&[event(books)], &config(&["h2h", "totals"], 0.0), clock());
        let markets: Vec<&str> = ops.iter().map(|o| o.market.as_str()).collect();
        assert!(markets.contains(&"h2h"));
        assert!(markets.contains(&"totals"));
    }
}
