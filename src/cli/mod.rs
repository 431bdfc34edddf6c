use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::db::{self, OpportunityFilter};
use crate::services::{scheduler, OddsClient, OddsSource};

/// Run a single refresh cycle from the command line and print its report.
pub async fn refresh_once(config: &AppConfig) -> Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    db::init_database(&pool).await?;

    let client = Arc::new(OddsClient::new(config)?);

    // Manual-only scheduler: trigger one cycle, then shut it down
    let mut manual_config = config.clone();
    manual_config.refresh_interval_s = 0;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, join) = scheduler::spawn(pool, client, manual_config, shutdown_rx);

    println!("🔄 Running refresh cycle...");
    let report = handle.trigger().await;

    println!("\n📋 Refresh report:");
    println!("   Status:      {:?}", report.status);
    println!("   Sports:      {}", report.sports_polled);
    println!("   Events:      {}", report.events_fetched);
    println!("   Detected:    {}", report.detected);
    println!("   Persisted:   {}", report.persisted);
    println!("   Duration:    {} ms", report.duration_ms());
    if let Some(quota) = &report.quota {
        println!(
            "   Quota:       {:.0} remaining / {:.0} used",
            quota.requests_remaining, quota.requests_used
        );
    }
    if !report.errors.is_empty() {
        println!("\n⚠️  Errors:");
        for error in &report.errors {
            println!("   • {}", error);
        }
    }

    shutdown_tx.send(true).ok();
    let _ = join.await;
    Ok(())
}

/// Print the upstream sports catalogue.
pub async fn show_sports(config: &AppConfig) -> Result<()> {
    let client = OddsClient::new(config)?;

    println!("🏟️  Fetching sports catalogue...\n");
    let mut sports = client.list_sports().await?;
    sports.sort_by(|a, b| a.group.cmp(&b.group).then(a.title.cmp(&b.title)));

    let mut current_group = String::new();
    for sport in &sports {
        if sport.group != current_group {
            if !current_group.is_empty() {
                println!();
            }
            println!("📊 {}:", sport.group);
            current_group = sport.group.clone();
        }
        let marker = if sport.active { "•" } else { "○" };
        println!("   {} {} ({})", marker, sport.title, sport.key);
    }

    println!("\n💡 Use ODDS_SPORTS=<key,key,...> to restrict polling");
    Ok(())
}

/// Print recent opportunities from the store.
pub async fn show_opportunities(
    config: &AppConfig,
    sport: Option<String>,
    min_profit: Option<f64>,
    limit: i64,
) -> Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    db::init_database(&pool).await?;

    let filter = OpportunityFilter {
        sport,
        min_profit_pct: min_profit,
        since: None,
        limit: Some(limit),
    };
    let opportunities = db::list_opportunities(&pool, &filter).await?;

    if opportunities.is_empty() {
        println!("📭 No opportunities recorded yet. Try: arbscout refresh");
        return Ok(());
    }

    println!("💰 Recorded arbitrage opportunities:\n");
    for (i, op) in opportunities.iter().enumerate() {
        println!(
            "{}. {} vs {}: {} ({})",
            i + 1,
            op.home_team,
            op.away_team,
            op.market,
            op.commence_time.format("%Y-%m-%d %H:%M UTC")
        );
        println!(
            "   Profit: {:.2}% | implied total {:.4} | detected {}",
            op.profit_pct,
            op.total_implied_prob,
            op.detected_at.format("%Y-%m-%d %H:%M")
        );
        for leg in &op.legs {
            let point = leg
                .point
                .map(|p| format!(" {:+}", p))
                .unwrap_or_default();
            println!(
                "   • {}{} @ {} ({}), stake {:.1}%",
                leg.outcome,
                point,
                leg.price,
                leg.bookmaker,
                leg.stake_share * 100.0
            );
        }
        println!();
    }

    Ok(())
}

/// Delete opportunity rows older than the given number of days.
pub async fn purge(config: &AppConfig, days: i64) -> Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    db::init_database(&pool).await?;

    let cutoff = Utc::now() - Duration::days(days);
    let removed = db::purge_opportunities(&pool, cutoff).await?;
    println!("🧹 Removed {} opportunities older than {} days", removed, days);
    Ok(())
}

/// Create or upgrade the schema and exit.
pub async fn init_db(config: &AppConfig) -> Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    db::init_database(&pool).await?;
    println!("✅ Database ready at {}", config.database_url);
    Ok(())
}
