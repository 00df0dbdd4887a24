use std::env;
use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_logging() {
    // Check for a LOG_LEVEL environment variable, defaulting to INFO
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    // RUST_LOG wins when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(&log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    tracing::info!(log_level = %log_level, "Logging initialized");
}

fn default_filter(log_level: &str) -> EnvFilter {
    let filter = EnvFilter::try_new(format!("social_push_notifier={log_level}"))
        .unwrap_or_else(|_| EnvFilter::new("social_push_notifier=info"));

    // Keep third-party chatter down unless explicitly configured
    ["tower_http=warn", "sqlx=warn", "reqwest=warn", "hyper=warn"]
        .into_iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(filter, |filter, directive| filter.add_directive(directive))
}
