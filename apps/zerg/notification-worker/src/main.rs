//! Notification Worker - Entry Point
//!
//! Consumes notifications from the broker and delivers them per channel.

use clap::Parser;
use zerg_notification_worker::Args;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_notification_worker::run(Args::parse()).await
}
