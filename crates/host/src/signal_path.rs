// Copyright 2025-2026 CEMAXECUTER LLC

//! Host signal path seen from a module: VFOs feed sinks, sources feed the
//! host's input stream.

use std::sync::Arc;

use num_complex::Complex32;

use crate::stream::Stream;

/// A host-managed receiver channel whose demodulated IQ feeds a sink.
pub trait Vfo: Send + Sync {
    /// Stream carrying this VFO's output samples.
    fn output(&self) -> Arc<Stream<Complex32>>;

    fn set_sample_rate(&self, sample_rate: f64, bandwidth: f64);
}

pub trait VfoManager: Send + Sync {
    fn create_vfo(&self, name: &str, sample_rate: f64) -> Arc<dyn Vfo>;

    fn delete_vfo(&self, name: &str);
}

/// Callbacks a source module registers with the host.
pub trait SourceHandler: Send + Sync {
    fn select(&self);

    fn deselect(&self);

    fn start(&self);

    fn stop(&self);

    fn tune(&self, freq: f64);

    /// Stream the source writes its samples into.
    fn stream(&self) -> Arc<Stream<Complex32>>;
}

pub trait SourceManager: Send + Sync {
    fn register_source(&self, name: &str, handler: Arc<dyn SourceHandler>);

    fn unregister_source(&self, name: &str);

    fn set_input_sample_rate(&self, sample_rate: f64);
}
