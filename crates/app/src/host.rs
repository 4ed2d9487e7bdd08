// Copyright 2025-2026 CEMAXECUTER LLC

//! Minimal host: forwards the selected source's samples unchanged to every
//! VFO. There is no tuning offset or resampling, so a VFO runs at the input
//! sample rate whatever rate it asked for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use iq_host::signal_path::{SourceHandler, SourceManager, Vfo, VfoManager};
use iq_host::stream::Stream;
use num_complex::Complex32;

pub struct PassthroughVfo {
    stream: Arc<Stream<Complex32>>,
    sample_rate: Mutex<f64>,
}

impl Vfo for PassthroughVfo {
    fn output(&self) -> Arc<Stream<Complex32>> {
        Arc::clone(&self.stream)
    }

    fn set_sample_rate(&self, sample_rate: f64, _bandwidth: f64) {
        *self.sample_rate.lock().unwrap() = sample_rate;
    }
}

type VfoMap = Arc<Mutex<HashMap<String, Arc<PassthroughVfo>>>>;

#[derive(Default)]
pub struct PassthroughHost {
    sources: Mutex<HashMap<String, Arc<dyn SourceHandler>>>,
    selected: Mutex<Option<Arc<dyn SourceHandler>>>,
    vfos: VfoMap,
    input_rate: Mutex<f64>,
    running: Arc<AtomicBool>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl PassthroughHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_sample_rate(&self) -> f64 {
        *self.input_rate.lock().unwrap()
    }

    /// Select a registered source and run its select callback.
    pub fn select_source(&self, name: &str) -> Result<Arc<dyn SourceHandler>, String> {
        let handler = self
            .sources
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| format!("no source named '{}'", name))?;
        if let Some(prev) = self.selected.lock().unwrap().replace(Arc::clone(&handler)) {
            prev.deselect();
        }
        handler.select();
        Ok(handler)
    }

    /// Start the selected source and forward its blocks to the VFOs.
    pub fn start(&self) -> Result<(), String> {
        let handler = self
            .selected
            .lock()
            .unwrap()
            .clone()
            .ok_or("no source selected")?;
        let mut relay = self.relay.lock().unwrap();
        if relay.is_some() {
            return Ok(());
        }
        handler.start();

        self.running.store(true, Ordering::SeqCst);
        let input = handler.stream();
        let vfos = Arc::clone(&self.vfos);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("host-relay".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let Some(block) = input.read() else { break };
                    let outputs: Vec<_> = vfos.lock().unwrap().values().map(|v| v.output()).collect();
                    for out in outputs {
                        out.write(block.clone());
                    }
                }
            })
            .map_err(|e| format!("failed to spawn relay thread: {}", e))?;
        *relay = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        let handle = self.relay.lock().unwrap().take();
        let Some(handle) = handle else { return };
        let handler = self.selected.lock().unwrap().clone();
        self.running.store(false, Ordering::SeqCst);

        // Unblock the relay on both sides before joining it
        if let Some(ref handler) = handler {
            handler.stream().stop_reader();
        }
        let outputs: Vec<_> = self.vfos.lock().unwrap().values().map(|v| v.output()).collect();
        for out in &outputs {
            out.stop_writer();
        }
        let _ = handle.join();
        for out in &outputs {
            out.clear_write_stop();
        }
        if let Some(handler) = handler {
            handler.stop();
            handler.stream().clear_read_stop();
        }
    }
}

impl SourceManager for PassthroughHost {
    fn register_source(&self, name: &str, handler: Arc<dyn SourceHandler>) {
        log::info!("registered source {}", name);
        self.sources.lock().unwrap().insert(name.to_string(), handler);
    }

    fn unregister_source(&self, name: &str) {
        let removed = self.sources.lock().unwrap().remove(name);
        let mut selected = self.selected.lock().unwrap();
        let was_selected = match (&removed, selected.as_ref()) {
            (Some(removed), Some(current)) => Arc::ptr_eq(removed, current),
            _ => false,
        };
        if was_selected {
            *selected = None;
        }
    }

    fn set_input_sample_rate(&self, sample_rate: f64) {
        log::info!("input sample rate {} S/s", sample_rate);
        *self.input_rate.lock().unwrap() = sample_rate;
    }
}

impl VfoManager for PassthroughHost {
    fn create_vfo(&self, name: &str, sample_rate: f64) -> Arc<dyn Vfo> {
        let vfo = Arc::new(PassthroughVfo {
            stream: Arc::new(Stream::new()),
            sample_rate: Mutex::new(sample_rate),
        });
        self.vfos
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&vfo));
        vfo
    }

    fn delete_vfo(&self, name: &str) {
        self.vfos.lock().unwrap().remove(name);
    }
}
