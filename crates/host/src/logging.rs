// Copyright 2025-2026 CEMAXECUTER LLC

/// Install the process logger. Defaults to `info`, overridable with `RUST_LOG`.
/// Calling it more than once is harmless.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
