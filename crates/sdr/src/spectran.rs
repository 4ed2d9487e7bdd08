// Copyright 2025-2026 CEMAXECUTER LLC

//! Spectran V6 source.
//!
//! The receiver runs in raw IQ mode. Its sample rate is a receiver clock
//! divided by a power-of-two decimation, so the selectable rates are the
//! cross product of the clocks the device enables and the decimation table.

use std::cmp::Ordering as CmpOrdering;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use iq_host::config::ConfigManager;
use iq_host::module::{Instance, Module, ModuleError, ModuleInfo};
use iq_host::signal_path::{SourceHandler, SourceManager};
use iq_host::stream::{Stream, STREAM_BUFFER_SIZE};
use num_complex::Complex32;
use serde_json::json;

use crate::{ConfigValue, HardwareApi, HwError, PacketDevice};

pub const CONFIG_FILE: &str = "spectran_config.json";

/// Name the source is registered under in the host's source list.
pub const SOURCE_NAME: &str = "Spectran";

const CLOCK_KEY: &str = "device/receiverclock";
const RESCAN_TIMEOUT_MS: u32 = 2000;
const FIRST_PACKET_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Reported before any device was selected.
const FALLBACK_SAMPLE_RATE: f64 = 1_000_000.0;
const DEFAULT_FREQUENCY: f64 = 100_000_000.0;
const REFERENCE_LEVEL_DBM: f64 = -20.0;

const CLOCK_RATES: [f64; 4] = [92_160_000.0, 122_880_000.0, 184_320_000.0, 245_760_000.0];
const CLOCK_NAMES: [&str; 4] = ["92MHz", "122MHz", "184MHz", "245MHz"];
const DECIMATIONS: [u32; 10] = [512, 256, 128, 64, 32, 16, 8, 4, 2, 1];
const DECIMATION_NAMES: [&str; 10] = [
    "1 / 512", "1 / 256", "1 / 128", "1 / 64", "1 / 32", "1 / 16", "1 / 8", "1 / 4", "1 / 2", "Full",
];

// ---------------------------------------------------------------------------
// Sample rate table
// ---------------------------------------------------------------------------

/// One receiver clock / decimation combination.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRateOption {
    /// Index into the receiver clock table
    pub clock: usize,
    /// Index into the decimation table
    pub decimation: usize,
    /// Output sample rate in Hz
    pub effective: f64,
    pub label: String,
}

impl SampleRateOption {
    fn new(clock: usize, decimation: usize) -> Self {
        let effective = CLOCK_RATES[clock] / DECIMATIONS[decimation] as f64;
        let label = format!(
            "{} ({} / {})",
            bandwidth_label(effective),
            bandwidth_label(CLOCK_RATES[clock]),
            DECIMATIONS[decimation]
        );
        Self {
            clock,
            decimation,
            effective,
            label,
        }
    }

    pub fn clock_name(&self) -> &'static str {
        CLOCK_NAMES[self.clock]
    }

    pub fn decimation_name(&self) -> &'static str {
        DECIMATION_NAMES[self.decimation]
    }
}

/// Every rate the hardware offers, ascending, ties broken by clock.
/// Bit `i` of `disabled_clocks` removes receiver clock `i`.
pub fn sample_rate_options(disabled_clocks: u64) -> Vec<SampleRateOption> {
    let mut options: Vec<SampleRateOption> = (0..CLOCK_RATES.len())
        .filter(|&clock| (disabled_clocks >> clock) & 1 == 0)
        .flat_map(|clock| (0..DECIMATIONS.len()).map(move |dec| SampleRateOption::new(clock, dec)))
        .collect();
    options.sort_by(|a, b| {
        a.effective
            .partial_cmp(&b.effective)
            .unwrap_or(CmpOrdering::Equal)
            .then(a.clock.cmp(&b.clock))
    });
    options
}

/// "2.5MHz", "180.0KHz", "900.0Hz"
pub fn bandwidth_label(hz: f64) -> String {
    if hz >= 1_000_000.0 {
        format!("{:.1}MHz", hz / 1_000_000.0)
    } else if hz >= 1000.0 {
        format!("{:.1}KHz", hz / 1000.0)
    } else {
        format!("{:.1}Hz", hz)
    }
}

/// Value of `calibration/preamp` for the amplifier toggles.
pub fn preamp_mode(amp: bool, preamp: bool) -> &'static str {
    match (amp, preamp) {
        (true, true) => "Both",
        (true, false) => "Amp",
        (false, true) => "Preamp",
        (false, false) => "None",
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("settings are locked while streaming")]
    Busy,

    #[error("no device selected")]
    NoDevice,

    #[error("no sample rate option {0}")]
    InvalidSampleRate(usize),

    #[error("hardware: {0}")]
    Hw(#[from] HwError),
}

type SharedDevice = Arc<Mutex<Box<dyn PacketDevice>>>;

struct SourceState {
    /// Serials of ready devices, in enumeration order
    devices: Vec<String>,
    selected: Option<String>,
    sample_rates: Vec<SampleRateOption>,
    rate_index: usize,
    freq: f64,
    amp: bool,
    preamp: bool,
    device: Option<SharedDevice>,
    worker: Option<JoinHandle<()>>,
}

impl SourceState {
    fn rate(&self) -> Option<&SampleRateOption> {
        self.sample_rates.get(self.rate_index)
    }

    fn effective_rate(&self) -> f64 {
        self.rate().map_or(FALLBACK_SAMPLE_RATE, |r| r.effective)
    }
}

pub struct SpectranSource {
    name: String,
    api: Arc<dyn HardwareApi>,
    config: Arc<ConfigManager>,
    sources: Arc<dyn SourceManager>,
    stream: Arc<Stream<Complex32>>,
    running: Arc<AtomicBool>,
    state: Mutex<SourceState>,
}

impl SpectranSource {
    /// Scan for devices and reselect the one saved in the config.
    pub fn new(
        name: &str,
        api: Arc<dyn HardwareApi>,
        config: Arc<ConfigManager>,
        sources: Arc<dyn SourceManager>,
    ) -> Self {
        let source = Self {
            name: name.to_string(),
            api,
            config,
            sources,
            stream: Arc::new(Stream::new()),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SourceState {
                devices: Vec::new(),
                selected: None,
                sample_rates: Vec::new(),
                rate_index: 0,
                freq: DEFAULT_FREQUENCY,
                amp: false,
                preamp: false,
                device: None,
                worker: None,
            }),
        };
        source.refresh();
        let saved = source.config.acquire()["device"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if let Err(e) = source.select_serial(&saved) {
            log::warn!("{}: {}", source.name, e);
        }
        source
    }

    /// Rescan and list the ready devices. The selection is left alone.
    pub fn refresh(&self) {
        let mut state = self.state.lock().unwrap();
        state.devices.clear();
        if let Err(e) = self.api.rescan(RESCAN_TIMEOUT_MS) {
            log::warn!("{}: device rescan failed: {}", self.name, e);
            return;
        }
        state.devices = self
            .api
            .enumerate()
            .into_iter()
            .filter(|d| d.ready)
            .map(|d| d.serial)
            .collect();
        log::info!("{}: found {} device(s)", self.name, state.devices.len());
    }

    /// Select a device by serial, falling back to the first one found. The
    /// device is opened briefly to learn which receiver clocks it supports.
    pub fn select_serial(&self, serial: &str) -> Result<(), SourceError> {
        if self.is_running() {
            return Err(SourceError::Busy);
        }
        let rate = {
            let mut state = self.state.lock().unwrap();
            self.select_locked(&mut state, serial);
            state.effective_rate()
        };
        self.sources.set_input_sample_rate(rate);
        Ok(())
    }

    fn select_locked(&self, state: &mut SourceState, serial: &str) {
        state.selected = None;
        state.sample_rates.clear();
        state.rate_index = 0;

        let serial = match state.devices.iter().find(|s| s.as_str() == serial) {
            Some(s) => s.clone(),
            None => match state.devices.first() {
                Some(first) => first.clone(),
                None => return,
            },
        };

        let disabled = match self.api.open(&serial) {
            Ok(mut dev) => dev.disabled_options(CLOCK_KEY).unwrap_or_else(|e| {
                log::warn!("{}: cannot query receiver clocks: {}", self.name, e);
                0
            }),
            Err(e) => {
                log::error!("{}: failed to open device {}: {}", self.name, serial, e);
                return;
            }
        };
        log::debug!("{}: disabled clock mask {:#x}", self.name, disabled);
        state.sample_rates = sample_rate_options(disabled);

        let saved = {
            let conf = self.config.acquire();
            conf.get("devices")
                .and_then(|d| d.get(&serial))
                .and_then(|d| d.get("sampleRate"))
                .and_then(|r| r.as_f64())
        };
        state.rate_index = saved
            .and_then(|rate| state.sample_rates.iter().position(|o| o.effective == rate))
            .unwrap_or(0);

        log::info!(
            "{}: selected {} at {}",
            self.name,
            serial,
            state.rate().map_or("-", |r| r.label.as_str())
        );
        self.persist_device(&serial, state.effective_rate());
        state.selected = Some(serial);
    }

    fn persist_device(&self, serial: &str, sample_rate: f64) {
        let mut conf = self.config.acquire();
        conf["device"] = json!(serial);
        let devices = &mut conf["devices"];
        if !devices.is_object() {
            *devices = json!({});
        }
        let entry = &mut devices[serial];
        if !entry.is_object() {
            *entry = json!({});
        }
        entry["sampleRate"] = json!(sample_rate);
        conf.mark_modified();
    }

    pub fn devices(&self) -> Vec<String> {
        self.state.lock().unwrap().devices.clone()
    }

    pub fn selected_serial(&self) -> Option<String> {
        self.state.lock().unwrap().selected.clone()
    }

    pub fn sample_rates(&self) -> Vec<SampleRateOption> {
        self.state.lock().unwrap().sample_rates.clone()
    }

    pub fn sample_rate_index(&self) -> usize {
        self.state.lock().unwrap().rate_index
    }

    /// Effective sample rate of the current selection in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.state.lock().unwrap().effective_rate()
    }

    pub fn set_sample_rate_index(&self, index: usize) -> Result<(), SourceError> {
        if self.is_running() {
            return Err(SourceError::Busy);
        }
        let rate = {
            let mut state = self.state.lock().unwrap();
            if index >= state.sample_rates.len() {
                return Err(SourceError::InvalidSampleRate(index));
            }
            state.rate_index = index;
            let rate = state.effective_rate();
            if let Some(ref serial) = state.selected {
                self.persist_device(serial, rate);
            }
            rate
        };
        self.sources.set_input_sample_rate(rate);
        Ok(())
    }

    pub fn frequency(&self) -> f64 {
        self.state.lock().unwrap().freq
    }

    /// Retune; applied to the hardware immediately while streaming.
    pub fn set_frequency(&self, freq: f64) {
        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.device.as_ref().filter(|_| self.is_running()) {
            if let Err(e) = device.lock().unwrap().configure("main/centerfreq", freq.into()) {
                log::warn!("{}: retune to {} Hz failed: {}", self.name, freq, e);
            }
        }
        state.freq = freq;
        log::info!("{}: tune {} Hz", self.name, freq);
    }

    pub fn set_amp(&self, amp: bool) {
        let mut state = self.state.lock().unwrap();
        state.amp = amp;
        self.apply_preamp(&state);
    }

    pub fn set_preamp(&self, preamp: bool) {
        let mut state = self.state.lock().unwrap();
        state.preamp = preamp;
        self.apply_preamp(&state);
    }

    fn apply_preamp(&self, state: &SourceState) {
        if let Some(device) = state.device.as_ref().filter(|_| self.is_running()) {
            let mode = preamp_mode(state.amp, state.preamp);
            if let Err(e) = device.lock().unwrap().configure("calibration/preamp", mode.into()) {
                log::warn!("{}: preamp {} failed: {}", self.name, mode, e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open, configure and start the selected device, then hand packets to
    /// the stream from a worker thread. On failure the device is closed and
    /// the source stays stopped.
    pub fn start_streaming(&self) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        if self.is_running() {
            return Ok(());
        }
        if state.worker.is_some() {
            // The worker ended on its own and already stopped the hardware
            self.release_locked(&mut state, false);
        }
        let serial = state.selected.clone().ok_or(SourceError::NoDevice)?;
        let rate = state.rate().cloned().ok_or(SourceError::NoDevice)?;

        let mut dev = self.api.open(&serial)?;
        configure_device(&mut *dev, &rate, state.freq, preamp_mode(state.amp, state.preamp))?;
        dev.connect()?;
        if let Err(e) = dev.start() {
            let _ = dev.disconnect();
            return Err(e.into());
        }
        if let Err(e) = wait_for_first_packet(&mut *dev) {
            let _ = dev.stop();
            let _ = dev.disconnect();
            return Err(e.into());
        }

        let device: SharedDevice = Arc::new(Mutex::new(dev));
        self.running.store(true, Ordering::SeqCst);
        let worker = {
            let name = self.name.clone();
            let device = Arc::clone(&device);
            let stream = Arc::clone(&self.stream);
            let running = Arc::clone(&self.running);
            thread::Builder::new()
                .name(format!("{}-rx", self.name))
                .spawn(move || run_worker(&name, device, stream, running))
        };
        match worker {
            Ok(handle) => state.worker = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let mut dev = device.lock().unwrap();
                let _ = dev.stop();
                let _ = dev.disconnect();
                return Err(HwError::Io(e).into());
            }
        }
        state.device = Some(device);

        log::info!(
            "{}: streaming {} (clock={}, decim={}, center={} Hz)",
            self.name,
            rate.label,
            rate.clock_name(),
            rate.decimation_name(),
            state.freq
        );
        Ok(())
    }

    pub fn stop_streaming(&self) {
        let mut state = self.state.lock().unwrap();
        let owner = self.running.swap(false, Ordering::SeqCst);
        if state.worker.is_none() {
            return;
        }
        self.release_locked(&mut state, owner);
        log::info!("{}: stopped", self.name);
    }

    /// Join the worker and close the device. Whoever switched `running` off
    /// owns stopping the hardware: `owner` is false when the worker did it.
    fn release_locked(&self, state: &mut SourceState, owner: bool) {
        self.stream.stop_writer();
        if let Some(worker) = state.worker.take() {
            let _ = worker.join();
        }
        if let Some(device) = state.device.take() {
            if owner {
                halt_device(&self.name, &mut **device.lock().unwrap());
            }
        }
        self.stream.clear_write_stop();
    }
}

fn halt_device(name: &str, dev: &mut dyn PacketDevice) {
    if let Err(e) = dev.stop() {
        log::warn!("{}: stop failed: {}", name, e);
    }
    if let Err(e) = dev.disconnect() {
        log::warn!("{}: disconnect failed: {}", name, e);
    }
}

fn configure_device(
    dev: &mut dyn PacketDevice,
    rate: &SampleRateOption,
    freq: f64,
    preamp: &str,
) -> Result<(), HwError> {
    let settings: [(&str, ConfigValue); 8] = [
        ("device/receiverchannel", "Rx1".into()),
        ("device/outputformat", "iq".into()),
        (CLOCK_KEY, rate.clock_name().into()),
        ("main/decimation", rate.decimation_name().into()),
        ("main/centerfreq", freq.into()),
        ("main/reflevel", REFERENCE_LEVEL_DBM.into()),
        ("calibration/rffilter", "Auto Extended".into()),
        ("calibration/preamp", preamp.into()),
    ];
    for (key, value) in settings {
        dev.configure(key, value)?;
    }
    Ok(())
}

/// The packet is left queued for the worker.
fn wait_for_first_packet(dev: &mut dyn PacketDevice) -> Result<(), HwError> {
    let deadline = Instant::now() + FIRST_PACKET_TIMEOUT;
    loop {
        if dev.poll_packet()?.is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(HwError::Timeout);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn run_worker(
    name: &str,
    device: SharedDevice,
    stream: Arc<Stream<Complex32>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let polled = {
            let mut dev = device.lock().unwrap();
            let polled = dev.poll_packet().map(|pkt| {
                pkt.map(|samples| {
                    if samples.len() > STREAM_BUFFER_SIZE {
                        log::warn!(
                            "{}: packet of {} samples truncated to {}",
                            name,
                            samples.len(),
                            STREAM_BUFFER_SIZE
                        );
                    }
                    samples[..samples.len().min(STREAM_BUFFER_SIZE)].to_vec()
                })
            });
            if let Ok(Some(_)) = polled {
                if let Err(e) = dev.consume_packet() {
                    log::warn!("{}: consume failed: {}", name, e);
                }
            }
            polled
        };

        match polled {
            Ok(Some(block)) => {
                if !block.is_empty() && !stream.write(block) {
                    break;
                }
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(HwError::EndOfStream) => {
                log::info!("{}: end of stream", name);
                break;
            }
            Err(e) => {
                log::error!("{}: packet error: {}", name, e);
                break;
            }
        }
    }
    if running.swap(false, Ordering::SeqCst) {
        halt_device(name, &mut **device.lock().unwrap());
        log::warn!("{}: streaming ended without a stop request", name);
    }
    log::debug!("{}: worker exited", name);
}

impl SourceHandler for SpectranSource {
    fn select(&self) {
        self.sources.set_input_sample_rate(self.sample_rate());
        log::info!("{}: selected", self.name);
    }

    fn deselect(&self) {
        log::info!("{}: deselected", self.name);
    }

    fn start(&self) {
        if let Err(e) = self.start_streaming() {
            log::error!("{}: start failed: {}", self.name, e);
        }
    }

    fn stop(&self) {
        self.stop_streaming();
    }

    fn tune(&self, freq: f64) {
        self.set_frequency(freq);
    }

    fn stream(&self) -> Arc<Stream<Complex32>> {
        Arc::clone(&self.stream)
    }
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

/// Module instance: owns the source and its registration with the host.
pub struct SpectranSourceInstance {
    source: Arc<SpectranSource>,
    sources: Arc<dyn SourceManager>,
    enabled: bool,
}

impl SpectranSourceInstance {
    pub fn new(
        name: &str,
        api: Arc<dyn HardwareApi>,
        config: Arc<ConfigManager>,
        sources: Arc<dyn SourceManager>,
    ) -> Self {
        let source = Arc::new(SpectranSource::new(name, api, config, Arc::clone(&sources)));
        sources.register_source(SOURCE_NAME, source.clone());
        Self {
            source,
            sources,
            enabled: true,
        }
    }

    pub fn source(&self) -> &Arc<SpectranSource> {
        &self.source
    }
}

impl Instance for SpectranSourceInstance {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for SpectranSourceInstance {
    fn drop(&mut self) {
        self.source.stop_streaming();
        self.sources.unregister_source(SOURCE_NAME);
    }
}

pub struct SpectranSourceModule {
    info: ModuleInfo,
    api: Arc<dyn HardwareApi>,
    sources: Arc<dyn SourceManager>,
    config: Option<Arc<ConfigManager>>,
}

impl SpectranSourceModule {
    pub fn new(api: Arc<dyn HardwareApi>, sources: Arc<dyn SourceManager>) -> Self {
        Self {
            info: ModuleInfo {
                name: "spectran_source",
                description: "Spectran source module",
                author: "Ryzerth",
                version: (0, 1, 0),
                max_instances: 1,
            },
            api,
            sources,
            config: None,
        }
    }
}

impl Module for SpectranSourceModule {
    fn info(&self) -> &ModuleInfo {
        &self.info
    }

    fn init(&mut self, root: &Path) -> Result<(), ModuleError> {
        let config = ConfigManager::new(root.join(CONFIG_FILE));
        config.load(json!({ "devices": {}, "device": "" }))?;
        config.enable_auto_save();
        self.config = Some(Arc::new(config));
        Ok(())
    }

    fn create_instance(&mut self, name: &str) -> Result<Box<dyn Instance>, ModuleError> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| ModuleError::Other("spectran_source used before init".into()))?;
        Ok(Box::new(SpectranSourceInstance::new(
            name,
            Arc::clone(&self.api),
            config,
            Arc::clone(&self.sources),
        )))
    }

    fn end(&mut self) {
        if let Some(config) = self.config.take() {
            config.disable_auto_save();
            if let Err(e) = config.save() {
                log::error!("spectran_source: failed to save config: {}", e);
            }
        }
    }
}
