//! Headless meeting host and participant.
//!
//! Opens the given model files into an in-memory scene, then hosts or joins
//! a meeting and keeps it synchronized until interrupted.

mod address;
mod platform;

use std::error::Error;
use std::time::{Duration, Instant};

use clap::Parser;
use tandem_config::{CliArgs, Command, Config};
use tandem_meeting::{
    FileAlignmentStore, LocalInput, MemoryScene, Session, SessionConfig, SessionEvent,
};
use tokio::time::MissedTickBehavior;

use crate::platform::AppDirs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    let dirs = AppDirs::resolve(args.config.as_deref())?;
    dirs.create()?;
    let mut config = Config::load_or_create(&dirs.config_dir)?;
    config.apply_cli_overrides(&args);

    if let Err(e) = tandem_log::init_logging(
        Some(&dirs.log_dir),
        cfg!(debug_assertions),
        Some(&config),
    ) {
        eprintln!("Failed to initialize logging: {e}");
    }
    tracing::info!(config_dir = %dirs.config_dir.display(), "tandem starting");

    let session_config = SessionConfig::from_config(&config)?;
    let store = FileAlignmentStore::new(&dirs.config_dir);
    let (mut session, mut events) = Session::new(session_config, Box::new(store));

    let mut scene = MemoryScene::new();
    for path in &args.open {
        match scene.open_file(path) {
            Ok(_) => tracing::info!(path = %path.display(), "opened"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not open"),
        }
    }

    match &args.command {
        Command::Host => {
            session.start_hosting()?;
        }
        Command::Join { address } => {
            let addr = address::resolve(address, config.network.port).await?;
            session.join(addr).await?;
        }
    }

    let mut interval = tokio::time::interval(tick_period(config.network.tick_rate));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let input = LocalInput::default();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                session.tick(&mut scene, &input, Instant::now());
                while let Ok(event) = events.try_recv() {
                    report(&event);
                }
                if session.is_idle() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    session.leave();
    Ok(())
}

fn tick_period(tick_rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1)))
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::HostingStarted(addr) => tracing::info!(%addr, "waiting for participants"),
        SessionEvent::JoinSucceeded(addr) => tracing::info!(%addr, "connected to host"),
        SessionEvent::JoinFailed {
            address, message, ..
        } => tracing::error!(%address, "{message}"),
        SessionEvent::ParticipantLeft(participant) => {
            tracing::info!(%participant, "participant left")
        }
        SessionEvent::AvatarVisibility {
            participant,
            visible,
        } => tracing::debug!(%participant, visible, "avatar visibility"),
        SessionEvent::Error(text) => tracing::warn!("{text}"),
        SessionEvent::LeftMeeting => tracing::info!("meeting ended"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_period_follows_rate() {
        assert_eq!(tick_period(50), Duration::from_millis(20));
        assert_eq!(tick_period(0), Duration::from_secs(1));
    }
}
