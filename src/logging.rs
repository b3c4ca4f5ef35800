//! Log output for the binary.
//!
//! Library code logs through the `log` macros; the subscriber installed here
//! picks those records up and filters them with `RUST_LOG`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn,html5ever=warn,selectors=warn";
const VERBOSE_FILTER: &str = "debug,hyper=warn,reqwest=warn,html5ever=warn,selectors=warn";

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(verbose: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}
