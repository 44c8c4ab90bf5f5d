// ABOUTME: CLI commands for the repair and eviction sweeps
// ABOUTME: Single passes for cron-style use, or the sweeper daemon until Ctrl-C

use anyhow::{Context, Result};
use colored::*;
use sandkeep_cli::context::AppContext;
use sandkeep_cli::render;
use sandkeep_sandbox::Sweeper;
use tracing::info;

pub async fn repair(ctx: &AppContext) -> Result<i32> {
    let report = ctx.reconciler.repair_broken().await?;
    println!("{}", render::repair_summary(&report));
    Ok(0)
}

pub async fn evict(ctx: &AppContext) -> Result<i32> {
    let report = ctx.reconciler.evict_inactive().await?;
    println!("{}", render::eviction_summary(&report));
    Ok(if report.failures == 0 { 0 } else { 1 })
}

pub async fn daemon(ctx: &AppContext) -> Result<i32> {
    let sweeper = Sweeper::new(ctx.reconciler.clone(), ctx.config.sweep_interval);
    sweeper.start().await;
    println!(
        "{} sweeping every {:?}, press Ctrl-C to stop",
        "sandkeep daemon".green().bold(),
        ctx.config.sweep_interval
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutdown requested");
    sweeper.stop().await;
    Ok(0)
}
