// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging bootstrap.
//!
//! Filters are configured through the `BATCHD_LOG` environment variable
//! (comma-separated `target=level` directives, default level `info`).
//! Line-oriented JSON output can be enabled with `BATCHD_LOGGING_JSONL=1`
//! for log collectors.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "BATCHD_LOG";

/// ENV enabling JSONL output.
const JSONL_ENV: &str = "BATCHD_LOGGING_JSONL";

/// Default log level.
const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

/// Initialize the global subscriber. Idempotent.
pub fn init() {
    INIT.call_once(setup);
}

fn setup() {
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

    let jsonl = std::env::var(JSONL_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if jsonl {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
