//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

use crate::config::SyncSettings;

/// Install the global JSON subscriber. Call once at process start; embedders
/// that bring their own subscriber skip this.
pub fn init_subscriber(settings: &SyncSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    let formatter = fmt::layer().json();

    let subscriber = Registry::default().with(filter).with(formatter);

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");
}
