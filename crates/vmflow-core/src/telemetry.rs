// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracing subscriber initialization.
//!
//! # Usage
//!
//! ```rust,ignore
//! vmflow_core::telemetry::init_subscriber();
//! ```
//!
//! The filter honours `RUST_LOG` and defaults to `vmflow=info`.

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "vmflow=info";

/// Install a fmt subscriber writing to stderr.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case nothing changes. Safe to call more than once.
pub fn init_subscriber() -> bool {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(fmt)
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_subscriber_is_idempotent() {
        init_subscriber();
        assert!(!init_subscriber());
    }
}
