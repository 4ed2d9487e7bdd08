// Copyright 2025-2026 CEMAXECUTER LLC

//! Network IQ sink: streams a VFO's output to one TCP client or a UDP peer as
//! fixed-size frames.
//!
//! Two threads touch the connection. The host's handler thread calls
//! [`SinkShared::ingest`] for every sample block, and (TCP only) the accept
//! thread swaps clients in and out. Both go through the same mutex, which also
//! guards the packetizer, so a frame is never written to a connection that is
//! being retired.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use iq_host::config::ConfigManager;
use iq_host::module::{Instance, Module, ModuleError, ModuleInfo};
use iq_host::signal_path::{Vfo, VfoManager};
use iq_host::stream::{HandlerSink, STREAM_BUFFER_SIZE};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::net::{Conn, Listener, Transport};
use crate::packetizer::{is_valid_frame_size, FrameFormat, HeaderMode, Packetizer, SampleEncoding};

pub const CONFIG_FILE: &str = "network_iq_config.json";

const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_PORT: u16 = 7355;
const DEFAULT_SAMPLE_RATE: u32 = 100_000;
const DEFAULT_SAMPLES_PER_PACKET: u32 = 373;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum Protocol {
    Tcp,
    #[default]
    Udp,
}

impl From<Protocol> for i64 {
    fn from(p: Protocol) -> i64 {
        match p {
            Protocol::Tcp => 0,
            Protocol::Udp => 1,
        }
    }
}

impl TryFrom<i64> for Protocol {
    type Error = String;

    fn try_from(id: i64) -> Result<Self, String> {
        match id {
            0 => Ok(Protocol::Tcp),
            1 => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol id {}", other)),
        }
    }
}

/// Per-instance settings, persisted under the instance name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    #[serde(rename = "hostname")]
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    #[serde(rename = "dataType")]
    pub encoding: SampleEncoding,
    #[serde(rename = "samplesPerPacket")]
    pub samples_per_packet: u32,
    #[serde(rename = "packetHeaderType")]
    pub header: HeaderMode,
    /// Last start/stop intent from the UI.
    pub listening: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            protocol: Protocol::Udp,
            sample_rate: DEFAULT_SAMPLE_RATE,
            encoding: SampleEncoding::Int16,
            samples_per_packet: DEFAULT_SAMPLES_PER_PACKET,
            header: HeaderMode::Sequence64,
            listening: false,
        }
    }
}

impl SinkConfig {
    /// Parse a persisted section, replacing anything unusable with defaults.
    fn from_section(name: &str, section: &serde_json::Value) -> Self {
        let mut cfg: SinkConfig = match serde_json::from_value(section.clone()) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("{}: invalid saved settings ({}), using defaults", name, e);
                return Self::default();
            }
        };
        if !is_valid_frame_size(cfg.samples_per_packet as usize) {
            log::warn!(
                "{}: saved samplesPerPacket {} out of range, using {}",
                name,
                cfg.samples_per_packet,
                DEFAULT_SAMPLES_PER_PACKET
            );
            cfg.samples_per_packet = DEFAULT_SAMPLES_PER_PACKET;
        }
        if cfg.sample_rate == 0 {
            log::warn!("{}: saved sampleRate is 0, using {}", name, DEFAULT_SAMPLE_RATE);
            cfg.sample_rate = DEFAULT_SAMPLE_RATE;
        }
        cfg
    }

    pub fn frame_format(&self) -> Option<FrameFormat> {
        FrameFormat::new(self.samples_per_packet as usize, self.encoding, self.header)
    }

    /// Bytes per frame on the wire, header included.
    pub fn packet_size(&self) -> usize {
        self.header.size() + self.samples_per_packet as usize * self.encoding.unit_size()
    }

    pub fn packets_per_second(&self) -> f64 {
        self.sample_rate as f64 / self.samples_per_packet as f64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("instance is disabled")]
    Disabled,

    #[error("settings are locked while streaming")]
    Busy,

    #[error("samples per packet must be within 1..={max}, got {value}")]
    InvalidSamplesPerPacket { value: i64, max: usize },

    #[error("sample rate must be a positive number of samples per second, got {0}")]
    InvalidSampleRate(i64),

    #[error("transport: {0}")]
    Transport(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Idle,
    Listening,
    /// A TCP client is attached.
    Connected,
    /// The UDP destination is open.
    Sending,
}

/// Snapshot of everything the instance menu shows.
#[derive(Debug, Clone)]
pub struct SinkMenu {
    pub enabled: bool,
    pub status: SinkStatus,
    pub settings: SinkConfig,
    pub packet_size: usize,
    pub packets_per_second: f64,
    /// Host, port, protocol and framing are read-only while streaming.
    pub frame_controls_locked: bool,
}

/// The connection frames go to. It lives outside the ring lock: a send may
/// block on a slow TCP peer while holding the ring, and closing the
/// connection through this slot is what unblocks it.
type ConnSlot = Arc<Mutex<Option<Arc<dyn Conn>>>>;

fn current_conn(slot: &ConnSlot) -> Option<Arc<dyn Conn>> {
    slot.lock().ok()?.clone().filter(|c| c.is_open())
}

/// Frame assembly state, owned by the real-time handler.
pub(crate) struct SinkRing {
    packetizer: Packetizer,
}

impl SinkRing {
    /// Real-time entry point. Never fails: without an open connection the
    /// block is dropped.
    pub(crate) fn ingest(&mut self, conn: Option<&dyn Conn>, samples: &[Complex32]) {
        let Some(conn) = conn.filter(|c| c.is_open()) else {
            return;
        };
        self.packetizer.push(samples, |frame| {
            if let Err(e) = conn.write(frame) {
                log::trace!("frame dropped: {}", e);
            }
        });
    }
}

pub struct NetworkIqSink {
    name: String,
    config: Arc<ConfigManager>,
    settings: SinkConfig,
    enabled: bool,
    vfo_manager: Arc<dyn VfoManager>,
    vfo: Arc<dyn Vfo>,
    transport: Arc<dyn Transport>,
    ring: Arc<Mutex<SinkRing>>,
    conn: ConnSlot,
    listener: Option<Arc<dyn Listener>>,
    accept_thread: Option<JoinHandle<()>>,
    handler: HandlerSink<Complex32>,
}

impl NetworkIqSink {
    pub fn new(
        name: &str,
        config: Arc<ConfigManager>,
        vfo_manager: Arc<dyn VfoManager>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let settings = {
            let mut conf = config.acquire();
            let settings = match conf.get(name) {
                Some(section) => SinkConfig::from_section(name, section),
                None => SinkConfig::default(),
            };
            match serde_json::to_value(&settings) {
                Ok(value) if conf.get(name) != Some(&value) => {
                    conf[name] = value;
                    conf.mark_modified();
                }
                Ok(_) => {}
                Err(e) => log::error!("{}: failed to serialize settings: {}", name, e),
            }
            settings
        };

        let format = settings
            .frame_format()
            .unwrap_or_else(|| fallback_format(DEFAULT_SAMPLES_PER_PACKET));
        let ring = Arc::new(Mutex::new(SinkRing {
            packetizer: Packetizer::new(format),
        }));
        let conn: ConnSlot = Arc::new(Mutex::new(None));

        let vfo = vfo_manager.create_vfo(name, settings.sample_rate as f64);
        let rt_ring = Arc::clone(&ring);
        let rt_conn = Arc::clone(&conn);
        let mut handler = HandlerSink::new(vfo.output(), move |samples: &[Complex32]| {
            let Some(conn) = current_conn(&rt_conn) else {
                return;
            };
            if let Ok(mut ring) = rt_ring.lock() {
                ring.ingest(Some(&*conn), samples);
            }
        });
        if let Err(e) = handler.start() {
            log::error!("{}: failed to start sample handler: {}", name, e);
        }

        log::info!(
            "{}: {:?} {}:{}, {} S/s, {:?}, {} samples/packet, header {:?}",
            name,
            settings.protocol,
            settings.host,
            settings.port,
            settings.sample_rate,
            settings.encoding,
            settings.samples_per_packet,
            settings.header
        );

        Self {
            name: name.to_string(),
            config,
            settings,
            enabled: true,
            vfo_manager,
            vfo,
            transport,
            ring,
            conn,
            listener: None,
            accept_thread: None,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &SinkConfig {
        &self.settings
    }

    pub fn status(&self) -> SinkStatus {
        if current_conn(&self.conn).is_some() {
            match self.settings.protocol {
                Protocol::Tcp => SinkStatus::Connected,
                Protocol::Udp => SinkStatus::Sending,
            }
        } else if self.listener.as_ref().is_some_and(|l| l.is_listening()) {
            SinkStatus::Listening
        } else {
            SinkStatus::Idle
        }
    }

    /// True while a listener or a connection is held.
    pub fn is_active(&self) -> bool {
        self.status() != SinkStatus::Idle
    }

    pub fn menu_state(&self) -> SinkMenu {
        let status = self.status();
        SinkMenu {
            enabled: self.enabled,
            status,
            settings: self.settings.clone(),
            packet_size: self.settings.packet_size(),
            packets_per_second: self.settings.packets_per_second(),
            frame_controls_locked: status != SinkStatus::Idle,
        }
    }

    /// Address the TCP listener is bound to.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr())
    }

    /// Address of the peer currently receiving frames.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        current_conn(&self.conn).and_then(|c| c.peer_addr())
    }

    pub fn set_hostname(&mut self, host: &str) -> Result<(), SinkError> {
        self.ensure_editable()?;
        self.settings.host = host.to_string();
        self.persist();
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), SinkError> {
        self.ensure_editable()?;
        self.settings.port = port;
        self.persist();
        Ok(())
    }

    pub fn set_protocol(&mut self, protocol: Protocol) -> Result<(), SinkError> {
        self.ensure_editable()?;
        self.settings.protocol = protocol;
        self.persist();
        Ok(())
    }

    pub fn set_encoding(&mut self, encoding: SampleEncoding) -> Result<(), SinkError> {
        self.ensure_editable()?;
        self.settings.encoding = encoding;
        self.persist();
        Ok(())
    }

    pub fn set_header_mode(&mut self, header: HeaderMode) -> Result<(), SinkError> {
        self.ensure_editable()?;
        self.settings.header = header;
        self.persist();
        Ok(())
    }

    /// Out-of-range values are rejected and the previous value is kept.
    pub fn set_samples_per_packet(&mut self, value: i64) -> Result<(), SinkError> {
        self.ensure_editable()?;
        let valid = usize::try_from(value)
            .ok()
            .filter(|&n| is_valid_frame_size(n))
            .and_then(|n| u32::try_from(n).ok());
        let Some(samples_per_packet) = valid else {
            log::warn!("{}: rejected samples/packet {}", self.name, value);
            return Err(SinkError::InvalidSamplesPerPacket {
                value,
                max: STREAM_BUFFER_SIZE,
            });
        };
        self.settings.samples_per_packet = samples_per_packet;
        self.persist();
        Ok(())
    }

    /// Allowed while streaming; the VFO follows immediately.
    pub fn set_sample_rate(&mut self, value: i64) -> Result<(), SinkError> {
        self.ensure_enabled()?;
        let Some(sample_rate) = u32::try_from(value).ok().filter(|&r| r > 0) else {
            log::warn!("{}: rejected sample rate {}", self.name, value);
            return Err(SinkError::InvalidSampleRate(value));
        };
        self.settings.sample_rate = sample_rate;
        self.vfo.set_sample_rate(sample_rate as f64, sample_rate as f64);
        self.persist();
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), SinkError> {
        self.ensure_enabled()?;
        self.settings.listening = true;
        self.persist();
        self.start_server()
    }

    pub fn stop(&mut self) -> Result<(), SinkError> {
        self.ensure_enabled()?;
        self.stop_server();
        self.settings.listening = false;
        self.persist();
        Ok(())
    }

    fn start_server(&mut self) -> Result<(), SinkError> {
        if self.is_active() {
            return Ok(());
        }
        // Reap a listener whose accept thread already gave up
        self.stop_server();

        let format = self
            .settings
            .frame_format()
            .unwrap_or_else(|| fallback_format(self.settings.samples_per_packet));
        // Nothing can be sending now, so the ring lock is free
        self.ring.lock().unwrap().packetizer.reset(format);
        *self.conn.lock().unwrap() = None;

        let host = self.settings.host.clone();
        let port = self.settings.port;
        match self.settings.protocol {
            Protocol::Tcp => {
                let listener = self.transport.listen(&host, port).map_err(|e| {
                    log::error!("{}: failed to listen on {}:{}: {}", self.name, host, port, e);
                    SinkError::Transport(e)
                })?;

                let name = self.name.clone();
                let slot = Arc::clone(&self.conn);
                let l = Arc::clone(&listener);
                let spawned = thread::Builder::new()
                    .name(format!("{}-accept", self.name))
                    .spawn(move || accept_loop(&name, l, slot));
                match spawned {
                    Ok(handle) => {
                        self.listener = Some(listener);
                        self.accept_thread = Some(handle);
                    }
                    Err(e) => {
                        listener.close();
                        log::error!("{}: failed to spawn accept thread: {}", self.name, e);
                        return Err(SinkError::Transport(e));
                    }
                }
                log::info!("{}: listening on {}:{}", self.name, host, port);
            }
            Protocol::Udp => {
                let conn = self.transport.open_udp(&host, port).map_err(|e| {
                    log::error!("{}: failed to open UDP to {}:{}: {}", self.name, host, port, e);
                    SinkError::Transport(e)
                })?;
                *self.conn.lock().unwrap() = Some(conn);
                log::info!("{}: sending to {}:{}", self.name, host, port);
            }
        }
        Ok(())
    }

    fn stop_server(&mut self) {
        // Close the listener before retiring the connection so the accept
        // thread cannot install a new client after we looked. Closing the
        // connection also unblocks a send stuck on a peer that stopped reading.
        if let Some(ref listener) = self.listener {
            listener.close();
        }
        let conn = self.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            conn.close();
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if self.listener.take().is_some() {
            log::info!("{}: stopped", self.name);
        }
    }

    fn ensure_enabled(&self) -> Result<(), SinkError> {
        if self.enabled {
            Ok(())
        } else {
            Err(SinkError::Disabled)
        }
    }

    fn ensure_editable(&self) -> Result<(), SinkError> {
        self.ensure_enabled()?;
        if self.is_active() {
            return Err(SinkError::Busy);
        }
        Ok(())
    }

    fn persist(&self) {
        match serde_json::to_value(&self.settings) {
            Ok(value) => {
                let mut conf = self.config.acquire();
                conf[self.name.as_str()] = value;
                conf.mark_modified();
            }
            Err(e) => log::error!("{}: failed to serialize settings: {}", self.name, e),
        }
    }
}

/// Frame sizes are validated on every path into `SinkConfig`, so this is
/// never expected to run.
fn fallback_format(samples_per_packet: u32) -> FrameFormat {
    log::error!("invalid samples/packet {} reached the packetizer", samples_per_packet);
    FrameFormat {
        samples_per_frame: DEFAULT_SAMPLES_PER_PACKET as usize,
        encoding: SampleEncoding::Int16,
        header: HeaderMode::Sequence64,
    }
}

/// Serve one client at a time until the listener is closed.
fn accept_loop(name: &str, listener: Arc<dyn Listener>, slot: ConnSlot) {
    while listener.is_listening() {
        let client = match listener.accept() {
            Ok(client) => client,
            Err(e) => {
                if listener.is_listening() {
                    log::error!("{}: accept failed: {}", name, e);
                    listener.close();
                }
                break;
            }
        };

        {
            let mut current = slot.lock().unwrap();
            if !listener.is_listening() {
                client.close();
                break;
            }
            if let Some(prev) = current.replace(Arc::clone(&client)) {
                prev.close();
            }
        }
        log::info!("{}: streaming to {:?}", name, client.peer_addr());

        client.wait_for_end();

        {
            let mut current = slot.lock().unwrap();
            client.close();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &client)) {
                *current = None;
            }
        }
        log::info!("{}: client {:?} disconnected", name, client.peer_addr());
    }
}

impl Instance for NetworkIqSink {
    /// Resume streaming if it was running when the host last shut down.
    fn post_init(&mut self) {
        if self.settings.listening && self.enabled {
            if let Err(e) = self.start_server() {
                log::warn!("{}: could not resume streaming: {}", self.name, e);
            }
        }
    }

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

impl Drop for NetworkIqSink {
    fn drop(&mut self) {
        self.handler.stop();
        self.stop_server();
        self.vfo_manager.delete_vfo(&self.name);
    }
}

/// Module entry points for the network IQ sink.
pub struct NetworkIqModule {
    info: ModuleInfo,
    vfo_manager: Arc<dyn VfoManager>,
    transport: Arc<dyn Transport>,
    config: Option<Arc<ConfigManager>>,
}

impl NetworkIqModule {
    pub fn new(vfo_manager: Arc<dyn VfoManager>, transport: Arc<dyn Transport>) -> Self {
        Self {
            info: ModuleInfo {
                name: "network_iq",
                description: "Send raw IQ over the network",
                author: "mshoemaker",
                version: (0, 1, 0),
                max_instances: -1,
            },
            vfo_manager,
            transport,
            config: None,
        }
    }
}

impl Module for NetworkIqModule {
    fn info(&self) -> &ModuleInfo {
        &self.info
    }

    fn init(&mut self, root: &Path) -> Result<(), ModuleError> {
        let config = ConfigManager::new(root.join(CONFIG_FILE));
        config.load(json!({}))?;
        config.enable_auto_save();
        self.config = Some(Arc::new(config));
        Ok(())
    }

    fn create_instance(&mut self, name: &str) -> Result<Box<dyn Instance>, ModuleError> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| ModuleError::Other("network_iq used before init".into()))?;
        Ok(Box::new(NetworkIqSink::new(
            name,
            config,
            Arc::clone(&self.vfo_manager),
            Arc::clone(&self.transport),
        )))
    }

    fn end(&mut self) {
        if let Some(config) = self.config.take() {
            config.disable_auto_save();
            if let Err(e) = config.save() {
                log::error!("network_iq: failed to save config: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SocketTransport;
    use byteorder::{ByteOrder, LittleEndian};
    use iq_host::stream::Stream;
    use std::collections::HashMap;
    use std::io::{ErrorKind, Read};
    use std::net::{TcpStream, UdpSocket};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct TestVfo {
        stream: Arc<Stream<Complex32>>,
        sample_rate: Mutex<f64>,
    }

    impl Vfo for TestVfo {
        fn output(&self) -> Arc<Stream<Complex32>> {
            Arc::clone(&self.stream)
        }

        fn set_sample_rate(&self, sample_rate: f64, _bandwidth: f64) {
            *self.sample_rate.lock().unwrap() = sample_rate;
        }
    }

    #[derive(Default)]
    struct TestVfoManager {
        vfos: Mutex<HashMap<String, Arc<TestVfo>>>,
        deleted: Mutex<Vec<String>>,
    }

    impl TestVfoManager {
        fn vfo(&self, name: &str) -> Arc<TestVfo> {
            Arc::clone(&self.vfos.lock().unwrap()[name])
        }
    }

    impl VfoManager for TestVfoManager {
        fn create_vfo(&self, name: &str, sample_rate: f64) -> Arc<dyn Vfo> {
            let vfo = Arc::new(TestVfo {
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
            self.deleted.lock().unwrap().push(name.to_string());
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Arc<ConfigManager>,
        vfos: Arc<TestVfoManager>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = ConfigManager::new(dir.path().join(CONFIG_FILE));
            config.load(json!({})).unwrap();
            Self {
                _dir: dir,
                config: Arc::new(config),
                vfos: Arc::new(TestVfoManager::default()),
            }
        }

        fn sink(&self, name: &str) -> NetworkIqSink {
            NetworkIqSink::new(
                name,
                Arc::clone(&self.config),
                self.vfos.clone(),
                Arc::new(SocketTransport),
            )
        }

        fn saved(&self, name: &str) -> serde_json::Value {
            self.config.acquire()[name].clone()
        }
    }

    fn samples(range: std::ops::Range<usize>) -> Vec<Complex32> {
        range
            .map(|i| Complex32::new(i as f32 / 64.0, -(i as f32) / 128.0))
            .collect()
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_defaults_persisted_on_first_load() {
        let fx = Fixture::new();
        let sink = fx.sink("net");
        assert_eq!(sink.settings(), &SinkConfig::default());
        assert_eq!(
            fx.saved("net"),
            json!({
                "hostname": "localhost",
                "port": 7355,
                "protocol": 1,
                "sampleRate": 100000,
                "dataType": 0,
                "samplesPerPacket": 373,
                "packetHeaderType": 1,
                "listening": false,
            })
        );
        assert_eq!(sink.status(), SinkStatus::Idle);
        let menu = sink.menu_state();
        assert_eq!(menu.packet_size, 8 + 373 * 4);
        assert!(!menu.frame_controls_locked);
    }

    #[test]
    fn test_saved_settings_are_validated() {
        let fx = Fixture::new();
        {
            let mut conf = fx.config.acquire();
            conf["net"] = json!({
                "hostname": "10.0.0.2",
                "port": 9000,
                "protocol": 0,
                "samplesPerPacket": 0,
                "sampleRate": 0,
            });
        }
        let sink = fx.sink("net");
        let s = sink.settings();
        assert_eq!(s.host, "10.0.0.2");
        assert_eq!(s.port, 9000);
        assert_eq!(s.protocol, Protocol::Tcp);
        assert_eq!(s.samples_per_packet, DEFAULT_SAMPLES_PER_PACKET);
        assert_eq!(s.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(fx.saved("net")["samplesPerPacket"], json!(373));
    }

    #[test]
    fn test_invalid_samples_per_packet_rejected() {
        let fx = Fixture::new();
        let mut sink = fx.sink("net");
        sink.set_samples_per_packet(512).unwrap();

        for bad in [0, -5, STREAM_BUFFER_SIZE as i64 + 1] {
            assert!(matches!(
                sink.set_samples_per_packet(bad),
                Err(SinkError::InvalidSamplesPerPacket { .. })
            ));
            assert_eq!(sink.settings().samples_per_packet, 512);
            assert_eq!(fx.saved("net")["samplesPerPacket"], json!(512));
        }

        sink.set_samples_per_packet(STREAM_BUFFER_SIZE as i64).unwrap();
        assert_eq!(sink.settings().samples_per_packet as usize, STREAM_BUFFER_SIZE);
    }

    #[test]
    fn test_ingest_without_connection_drops() {
        let format = FrameFormat::new(4, SampleEncoding::Float32, HeaderMode::None).unwrap();
        let mut ring = SinkRing {
            packetizer: Packetizer::new(format),
        };
        ring.ingest(None, &samples(0..3));
        ring.ingest(None, &samples(3..10));
        assert_eq!(ring.packetizer.filled(), 0);
        assert_eq!(ring.packetizer.sequence(), 0);
    }

    #[test]
    fn test_udp_frames_and_locked_settings() {
        let fx = Fixture::new();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut sink = fx.sink("udp");
        sink.set_hostname("127.0.0.1").unwrap();
        sink.set_port(receiver.local_addr().unwrap().port()).unwrap();
        sink.set_encoding(SampleEncoding::Float32).unwrap();
        sink.set_header_mode(HeaderMode::None).unwrap();
        sink.set_samples_per_packet(4).unwrap();

        sink.start().unwrap();
        assert_eq!(sink.status(), SinkStatus::Sending);
        assert_eq!(fx.saved("udp")["listening"], json!(true));

        assert!(matches!(sink.set_samples_per_packet(8), Err(SinkError::Busy)));
        assert!(matches!(sink.set_encoding(SampleEncoding::Int16), Err(SinkError::Busy)));
        assert!(matches!(sink.set_protocol(Protocol::Tcp), Err(SinkError::Busy)));
        assert!(sink.menu_state().frame_controls_locked);

        sink.set_sample_rate(250_000).unwrap();
        assert_eq!(*fx.vfos.vfo("udp").sample_rate.lock().unwrap(), 250_000.0);
        assert!(sink.set_sample_rate(0).is_err());
        assert_eq!(sink.settings().sample_rate, 250_000);

        let stream = fx.vfos.vfo("udp").output();
        let input = samples(0..6);
        assert!(stream.write(input[..3].to_vec()));
        assert!(stream.write(input[3..].to_vec()));

        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(n, 32);
        for (i, s) in input[..4].iter().enumerate() {
            assert_eq!(LittleEndian::read_f32(&buf[i * 8..]), s.re);
            assert_eq!(LittleEndian::read_f32(&buf[i * 8 + 4..]), s.im);
        }

        sink.stop().unwrap();
        assert_eq!(sink.status(), SinkStatus::Idle);
        assert_eq!(fx.saved("udp")["listening"], json!(false));
        sink.set_samples_per_packet(8).unwrap();
    }

    #[test]
    fn test_restart_resets_sequence() {
        let fx = Fixture::new();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut sink = fx.sink("seq");
        sink.set_hostname("127.0.0.1").unwrap();
        sink.set_port(receiver.local_addr().unwrap().port()).unwrap();
        sink.set_samples_per_packet(2).unwrap();
        let stream = fx.vfos.vfo("seq").output();
        let mut buf = [0u8; 64];

        sink.start().unwrap();
        assert!(stream.write(samples(0..5)));
        for expected in 0..2i64 {
            let n = receiver.recv(&mut buf).unwrap();
            assert_eq!(n, 8 + 2 * 4);
            assert_eq!(LittleEndian::read_i64(&buf[..8]), expected);
        }
        sink.stop().unwrap();

        sink.start().unwrap();
        assert!(stream.write(samples(0..2)));
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(n, 12);
        assert_eq!(LittleEndian::read_i64(&buf[..8]), 0);
        sink.stop().unwrap();
    }

    #[test]
    fn test_tcp_clients_are_served_one_at_a_time() {
        let fx = Fixture::new();
        let mut sink = fx.sink("tcp");
        sink.set_protocol(Protocol::Tcp).unwrap();
        sink.set_hostname("127.0.0.1").unwrap();
        sink.set_port(0).unwrap();
        sink.set_samples_per_packet(2).unwrap();
        sink.start().unwrap();
        assert_eq!(sink.status(), SinkStatus::Listening);
        let addr = sink.listen_addr().unwrap();
        let stream = fx.vfos.vfo("tcp").output();

        let mut a = TcpStream::connect(addr).unwrap();
        a.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let a_addr = a.local_addr().unwrap();
        wait_until("client A", || sink.peer_addr() == Some(a_addr));
        assert_eq!(sink.status(), SinkStatus::Connected);

        // B waits in the backlog while A is being served
        let mut b = TcpStream::connect(addr).unwrap();
        let b_addr = b.local_addr().unwrap();

        assert!(stream.write(samples(0..2)));
        let mut frame = [0u8; 12];
        a.read_exact(&mut frame).unwrap();
        assert_eq!(LittleEndian::read_i64(&frame[..8]), 0);

        b.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let err = b.read(&mut frame).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));
        assert_eq!(sink.peer_addr(), Some(a_addr));

        drop(a);
        wait_until("client B", || sink.peer_addr() == Some(b_addr));

        b.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert!(stream.write(samples(2..4)));
        b.read_exact(&mut frame).unwrap();
        assert_eq!(LittleEndian::read_i64(&frame[..8]), 1);

        sink.stop().unwrap();
        assert_eq!(sink.status(), SinkStatus::Idle);
        // The stop closed B from our side
        assert_eq!(b.read(&mut frame).unwrap_or(0), 0);
    }

    #[test]
    fn test_stop_with_unread_tcp_client() {
        const SPP: usize = 100_000;
        let fx = Fixture::new();
        let mut sink = fx.sink("stall");
        sink.set_protocol(Protocol::Tcp).unwrap();
        sink.set_hostname("127.0.0.1").unwrap();
        sink.set_port(0).unwrap();
        sink.set_encoding(SampleEncoding::Float32).unwrap();
        sink.set_samples_per_packet(SPP as i64).unwrap();
        sink.start().unwrap();

        // Connects but never reads: once the socket buffers fill, sends block
        let client = TcpStream::connect(sink.listen_addr().unwrap()).unwrap();
        let client_addr = client.local_addr().unwrap();
        wait_until("client", || sink.peer_addr() == Some(client_addr));

        let stream = fx.vfos.vfo("stall").output();
        let sent = Arc::new(AtomicUsize::new(0));
        let producer = {
            let stream = Arc::clone(&stream);
            let sent = Arc::clone(&sent);
            thread::spawn(move || {
                for i in 0..64 {
                    if !stream.write(samples(i * SPP..(i + 1) * SPP)) {
                        break;
                    }
                    sent.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        wait_until("first frames", || sent.load(Ordering::SeqCst) >= 2);
        thread::sleep(Duration::from_millis(200));

        assert_eq!(sink.status(), SinkStatus::Connected);
        assert!(matches!(sink.set_port(1), Err(SinkError::Busy)));

        let stopped = Arc::new(AtomicBool::new(false));
        let stopper = {
            let stopped = Arc::clone(&stopped);
            thread::spawn(move || {
                sink.stop().unwrap();
                stopped.store(true, Ordering::SeqCst);
                sink
            })
        };
        wait_until("stop", || stopped.load(Ordering::SeqCst));
        let sink = stopper.join().unwrap();
        assert_eq!(sink.status(), SinkStatus::Idle);
        assert!(sink.peer_addr().is_none());

        // Without a connection the remaining blocks are dropped, not sent
        producer.join().unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 64);
        drop(client);
    }

    #[test]
    fn test_failed_listen_stays_idle() {
        let fx = Fixture::new();
        let mut sink = fx.sink("bad");
        sink.set_protocol(Protocol::Tcp).unwrap();
        sink.set_hostname("host.invalid").unwrap();
        assert!(matches!(sink.start(), Err(SinkError::Transport(_))));
        assert_eq!(sink.status(), SinkStatus::Idle);
    }

    #[test]
    fn test_disabled_instance_rejects_ui() {
        let fx = Fixture::new();
        let mut sink = fx.sink("off");
        sink.disable();
        assert!(!sink.is_enabled());
        assert!(matches!(sink.set_port(1), Err(SinkError::Disabled)));
        assert!(matches!(sink.start(), Err(SinkError::Disabled)));
        assert!(!sink.menu_state().enabled);
        sink.enable();
        sink.set_port(1).unwrap();
    }

    #[test]
    fn test_post_init_resumes_streaming() {
        let fx = Fixture::new();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        {
            let mut conf = fx.config.acquire();
            conf["resume"] = json!({
                "hostname": "127.0.0.1",
                "port": port,
                "protocol": 1,
                "listening": true,
            });
        }
        let mut sink = fx.sink("resume");
        assert_eq!(sink.status(), SinkStatus::Idle);
        sink.post_init();
        assert_eq!(sink.status(), SinkStatus::Sending);
    }

    #[test]
    fn test_drop_deletes_vfo() {
        let fx = Fixture::new();
        drop(fx.sink("gone"));
        assert_eq!(*fx.vfos.deleted.lock().unwrap(), vec!["gone".to_string()]);
    }

    #[test]
    fn test_module_lifecycle_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        let vfos = Arc::new(TestVfoManager::default());
        let mut module = NetworkIqModule::new(vfos, Arc::new(SocketTransport));
        assert!(module.create_instance("early").is_err());

        module.init(dir.path()).unwrap();
        assert_eq!(module.info().name, "network_iq");
        let instance = module.create_instance("Network IQ").unwrap();
        assert!(instance.is_enabled());
        drop(instance);
        module.end();

        let text = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        let saved: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(saved["Network IQ"]["port"], json!(7355));
    }
}
