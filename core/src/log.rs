// SPDX-License-Identifier: MPL-2.0

use tracing_subscriber::{filter::Directive, EnvFilter};

/// Directives that quiet the graphics stack, which is chatty at `INFO`.
const QUIET: [&str; 3] = ["naga=warn", "wgpu_core=warn", "wgpu_hal=warn"];

/// Installs the global `tracing` subscriber.
///
/// Panics if a subscriber has already been installed.
pub fn init() {
    tracing_subscriber::fmt()
        // Set the environment variable `RUST_LOG` to one of `TRACE`, `DEBUG`, `INFO`, `WARN`, or
        // `ERROR`, optionally per target (`RUST_LOG=umbra_gpu=debug`).
        .with_env_filter(filter())
        .with_ansi(true)
        .with_level(true)
        // The target is mostly just noise.
        .with_target(false)
        // Timestamps are mostly noise as well.
        .without_time()
        .init();
}

fn filter() -> EnvFilter {
    QUIET
        .iter()
        .filter_map(|it| it.parse::<Directive>().ok())
        .fold(EnvFilter::from_default_env(), |filter, it| filter.add_directive(it))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_directives_parse() {
        for it in QUIET {
            assert!(it.parse::<Directive>().is_ok(), "{it}");
        }
        assert!(filter().to_string().contains("wgpu_core=warn"));
    }
}
