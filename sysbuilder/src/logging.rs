// SPDX-License-Identifier: GPL-3.0-only

use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "sysbuilder=debug,sysbuilder_sys=debug,warn"
    } else {
        "sysbuilder=info,sysbuilder_sys=info,warn"
    }
}

/// Install the global subscriber, writing to stderr so stdout stays free
/// for command output such as `probe` JSON.
pub fn init(verbose: bool) {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose))),
        )
        .with_writer(std::io::stderr)
        .init();
}
