use std::sync::Once;

use tracing_subscriber::{prelude::*, EnvFilter};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global fmt subscriber once. `RUST_LOG` overrides the default
/// `info` filter; `log_format` picks compact text or JSON lines.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let result = match log_format {
            LogFormat::Text => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .compact()
                    .with_filter(env_filter);
                tracing_subscriber::registry()
                    .with(fmt_layer)
                    .try_init()
                    .map_err(anyhow::Error::from)
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .json()
                    .with_filter(env_filter);
                tracing_subscriber::registry()
                    .with(fmt_layer)
                    .try_init()
                    .map_err(anyhow::Error::from)
            }
        };
        init_result = Some(result);
    });
    init_result.unwrap_or(Ok(()))
}

/// Run an async test body with the test subscriber installed.
pub async fn with_test_tracing<F, Fut, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let _ = init(LogFormat::Text);
    tracing::debug!(test = test_name, "starting test");
    f().await
}

/// Synchronous counterpart of [`with_test_tracing`].
pub fn with_test_tracing_sync<F, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let _ = init(LogFormat::Text);
    tracing::debug!(test = test_name, "starting test");
    f()
}
