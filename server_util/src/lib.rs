// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use tracing_subscriber::filter::targets::Targets;
use tracing_subscriber::prelude::*;

/// Configure logging for a binary.
///
/// `RUST_LOG` selects targets and levels (default `info`); setting
/// `OMNI_CACHE_LOG_FORMAT=json` switches to line-delimited JSON for log
/// collectors.
pub fn setup_logging() {
    // Note: This cannot use `EnvFilter` because EnvFilter filters globally even if it only
    // used in a tracing stack!
    let filter_layer = {
        let directive = std::env::var("RUST_LOG")
            .ok()
            .unwrap_or_else(|| "info".to_owned());
        directive
            .parse::<Targets>()
            .expect("Failed to parse RUST_LOG")
    };

    let json = matches!(
        std::env::var("OMNI_CACHE_LOG_FORMAT").as_deref(),
        Ok("json")
    );

    if json {
        let fmt_layer = tracing_subscriber::fmt::layer().json().with_filter(filter_layer);
        tracing_subscriber::registry().with(fmt_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_filter(filter_layer);
        tracing_subscriber::registry().with(fmt_layer).init();
    }
}
