use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG` with an `INFO` floor. ANSI colours are only
/// used when stdout is a terminal so captured test logs stay readable.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init() {
    let use_color = atty::is(atty::Stream::Stdout);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(true)
        .with_ansi(use_color)
        .try_init();
}

/// Subscriber for tests: writes through the test harness capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_target(true)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init();
        init();
        init_for_tests();
        tracing::info!(target: "qemu", "subscriber installed");
    }
}
