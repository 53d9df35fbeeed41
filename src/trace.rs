use anyhow::Context;
use tracing::Level;
use tracing_log::LogTracer;

/// Wires the engine's `tracing` output to stderr and routes `log`
/// records from the underlying RPC and database crates through the same
/// subscriber.
pub fn init_tracing(level: Level) -> anyhow::Result<()> {
    LogTracer::init_with_filter(log::LevelFilter::Info)
        .context("log facade is already claimed")?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("a global tracing subscriber is already set")?;
    tracing::info!(%level, "initialized tracing");

    Ok(())
}
