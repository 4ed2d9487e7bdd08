// Copyright 2025-2026 CEMAXECUTER LLC

pub mod config;
pub mod logging;
pub mod module;
pub mod signal_path;
pub mod stream;

pub use num_complex::Complex32;
