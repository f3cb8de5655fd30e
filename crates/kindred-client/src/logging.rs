use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str =
    "kindred_client=debug,kindred_net=debug,kindred_call=debug,kindred_chat=info,warn";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
