mod config;
mod coordinator;
mod mqtt;
mod planner;
mod sensors;
mod service;
mod setup;

use anyhow::Result;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, Interval};
use tracing::{error, info, warn};

use config::Config;
use mqtt::{MqttBridge, Topics};
use setup::SystemContext;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("battery_planner=info".parse()?)
                .add_directive("rumqttc=warn".parse()?),
        )
        .init();

    info!("Battery Planner starting up");

    // Load configuration
    let config = Config::load_from_env_or_file()?;
    info!(
        "Configuration loaded for system {} (token {})",
        config.planner.system_id, config.planner.api_token
    );

    let ctx = set_up_with_retry(&config).await?;

    let topics = Topics::new(&config.mqtt, &ctx.entry.entry_id);
    let (bridge, mut commands) = MqttBridge::connect(&config.mqtt, topics).await?;
    let sensors = sensors::all_sensors();

    bridge
        .publish_discovery(&sensors, &ctx.device, &ctx.entry.entry_id)
        .await?;
    bridge.publish_availability(true).await?;
    let plan = ctx.coordinator.current().await;
    bridge.publish_states(&sensors, plan.as_deref()).await?;

    let mut updates = ctx.coordinator.subscribe();
    let mut poll = poll_interval(config.planner.update_interval_secs);

    loop {
        tokio::select! {
            _ = next_tick(&mut poll) => {
                if ctx.coordinator.refresh().await.is_none() {
                    warn!("No battery plan available (coordinator {:?})", ctx.coordinator.phase().await);
                }
            }
            Some(payload) = commands.recv() => {
                let result = service::handle_command(&ctx, &payload).await;
                if let Err(e) = bridge.publish_command_result(&result).await {
                    error!("Failed to publish create_plan result: {}", e);
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(update) => info!(
                        "Plan #{} from {} received at {}",
                        update.sequence, update.origin, update.received_at
                    ),
                    // Projections only need the latest plan, skipped updates do not matter
                    Err(RecvError::Lagged(skipped)) => warn!("Skipped {} plan updates", skipped),
                    Err(RecvError::Closed) => break,
                }
                let plan = ctx.coordinator.current().await;
                if let Err(e) = bridge.publish_states(&sensors, plan.as_deref()).await {
                    error!("Failed to publish sensor states: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Shutdown requested");
                break;
            }
        }
    }

    if let Err(e) = bridge.publish_availability(false).await {
        warn!("Failed to publish offline availability: {}", e);
    }
    ctx.unload();
    info!("Battery Planner stopped");
    Ok(())
}

/// Validate the configuration and set the system up, retrying while the service
/// cannot be reached. Bad input or credentials stop the addon.
async fn set_up_with_retry(config: &Config) -> Result<SystemContext> {
    let retry = Duration::from_secs(config.planner.setup_retry_secs.max(1));

    loop {
        let entry = match setup::validate_input(&config.planner).await {
            Ok(entry) => entry,
            Err(e @ setup::ConfigFlowError::CannotConnect(_)) => {
                warn!("{}; retrying in {:?}", e, retry);
                tokio::time::sleep(retry).await;
                continue;
            }
            Err(e) => anyhow::bail!("Invalid configuration ({}: {}): {}", e.field(), e.key(), e),
        };

        match setup::setup_entry(&entry).await {
            Ok(ctx) => return Ok(ctx),
            Err(e) if e.is_retryable() => {
                warn!("{}; retrying in {:?}", e, retry);
                tokio::time::sleep(retry).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Scheduled refresh timer, `None` when polling is disabled. The first tick is one
/// full period away since setup has just fetched a plan.
fn poll_interval(secs: u64) -> Option<Interval> {
    if secs == 0 {
        info!("Scheduled polling disabled, plans only arrive through create_plan");
        return None;
    }
    let period = Duration::from_secs(secs);
    Some(tokio::time::interval_at(Instant::now() + period, period))
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
