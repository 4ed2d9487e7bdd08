// Copyright 2025-2026 CEMAXECUTER LLC

mod host;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::json;

use iq_host::config::ConfigManager;
use iq_host::signal_path::SourceHandler;
use iq_output::net::SocketTransport;
use iq_output::network_iq::{self, NetworkIqSink, Protocol};
use iq_output::packetizer::{HeaderMode, SampleEncoding};
use iq_sdr::replay::{ReplayApi, SampleFormat};
use iq_sdr::spectran::{self, SpectranSourceInstance};
use iq_sdr::HardwareApi;

use host::PassthroughHost;

#[derive(Parser, Debug)]
#[command(name = "iq-relay")]
#[command(about = "Stream Spectran V6 IQ to a TCP client or UDP peer")]
struct Cli {
    /// IQ file to replay instead of live hardware
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Sample format for file input: ci8, ci16, cf32
    #[arg(long, default_value = "ci16")]
    format: String,

    /// Rewind the input file at end of file
    #[arg(long = "loop")]
    loop_file: bool,

    /// Directory holding the module config files
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Center frequency in MHz
    #[arg(short = 'c', long, default_value = "100")]
    center_freq: f64,

    /// Index into the device's sample rate list (lowest rate first)
    #[arg(short = 'r', long)]
    rate_index: Option<usize>,

    /// Destination host (UDP) or bind address (TCP)
    #[arg(long)]
    host: Option<String>,

    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Serve one TCP client at a time instead of sending UDP
    #[arg(long)]
    tcp: bool,

    /// Send float32 samples instead of int16
    #[arg(long)]
    float: bool,

    /// Omit the 64-bit sequence number header
    #[arg(long)]
    no_header: bool,

    /// Samples per packet
    #[arg(short = 'n', long)]
    samples_per_packet: Option<i64>,

    /// Stop after this many seconds
    #[arg(short = 't', long)]
    duration: Option<u64>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    iq_host::logging::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn open_api(cli: &Cli) -> Result<Arc<dyn HardwareApi>, String> {
    if let Some(ref file) = cli.file {
        let format = match cli.format.as_str() {
            "ci8" => SampleFormat::Ci8,
            "ci16" => SampleFormat::Ci16,
            "cf32" => SampleFormat::Cf32,
            other => {
                return Err(format!("unknown sample format: {} (use ci8, ci16, or cf32)", other));
            }
        };
        return Ok(Arc::new(ReplayApi::new(file, format).with_looping(cli.loop_file)));
    }

    #[cfg(feature = "aaronia")]
    {
        let api = iq_sdr::aaronia::RtsaApi::new().map_err(|e| e.to_string())?;
        Ok(Arc::new(api))
    }
    #[cfg(not(feature = "aaronia"))]
    {
        Err("no input specified. Use -f <file>, or build with --features aaronia for live hardware.".into())
    }
}

fn load_config(cli: &Cli, file: &str, default: serde_json::Value) -> Result<Arc<ConfigManager>, String> {
    let config = ConfigManager::new(cli.root.join(file));
    config.load(default).map_err(|e| e.to_string())?;
    config.enable_auto_save();
    Ok(Arc::new(config))
}

fn configure_sink(cli: &Cli, sink: &mut NetworkIqSink, sample_rate: f64) -> Result<(), String> {
    if let Some(ref host) = cli.host {
        sink.set_hostname(host).map_err(|e| e.to_string())?;
    }
    if let Some(port) = cli.port {
        sink.set_port(port).map_err(|e| e.to_string())?;
    }
    if cli.tcp {
        sink.set_protocol(Protocol::Tcp).map_err(|e| e.to_string())?;
    }
    if cli.float {
        sink.set_encoding(SampleEncoding::Float32).map_err(|e| e.to_string())?;
    }
    if cli.no_header {
        sink.set_header_mode(HeaderMode::None).map_err(|e| e.to_string())?;
    }
    if let Some(n) = cli.samples_per_packet {
        sink.set_samples_per_packet(n).map_err(|e| e.to_string())?;
    }
    sink.set_sample_rate(sample_rate.round() as i64)
        .map_err(|e| e.to_string())
}

fn run(cli: &Cli) -> Result<(), String> {
    let api = open_api(cli)?;
    let host = Arc::new(PassthroughHost::new());

    let source_config = load_config(cli, spectran::CONFIG_FILE, json!({ "devices": {}, "device": "" }))?;
    let source = SpectranSourceInstance::new("Spectran", api, Arc::clone(&source_config), host.clone());
    if let Some(index) = cli.rate_index {
        source
            .source()
            .set_sample_rate_index(index)
            .map_err(|e| e.to_string())?;
    }
    if cli.verbose {
        for (i, rate) in source.source().sample_rates().iter().enumerate() {
            log::info!("rate {:2}: {}", i, rate.label);
        }
    }

    let sink_config = load_config(cli, network_iq::CONFIG_FILE, json!({}))?;
    let mut sink = NetworkIqSink::new(
        "Network IQ",
        Arc::clone(&sink_config),
        host.clone(),
        Arc::new(SocketTransport),
    );
    configure_sink(cli, &mut sink, host.input_sample_rate())?;

    let handler = host.select_source(spectran::SOURCE_NAME)?;
    handler.tune(cli.center_freq * 1e6);
    host.start()?;
    if !source.source().is_running() {
        host.stop();
        return Err("source failed to start".into());
    }
    sink.start().map_err(|e| e.to_string())?;

    let menu = sink.menu_state();
    log::info!(
        "relaying {} S/s, {} bytes/packet, {:.1} packets/s",
        menu.settings.sample_rate,
        menu.packet_size,
        menu.packets_per_second
    );

    let started = Instant::now();
    loop {
        thread::sleep(Duration::from_secs(1));
        if cli.verbose {
            log::info!("status: {:?} peer={:?}", sink.status(), sink.peer_addr());
        }
        if cli.duration.is_some_and(|d| started.elapsed() >= Duration::from_secs(d)) {
            break;
        }
    }

    if let Err(e) = sink.stop() {
        log::warn!("sink stop: {}", e);
    }
    host.stop();
    drop(sink);
    drop(source);
    for config in [sink_config, source_config] {
        config.disable_auto_save();
        config.save().map_err(|e| e.to_string())?;
    }
    Ok(())
}
