// Copyright 2025-2026 CEMAXECUTER LLC

//! Replays a recorded IQ file as if it came from a receiver.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian};
use num_complex::Complex32;

use crate::{ConfigValue, DeviceInfo, HardwareApi, HwError, PacketDevice, Result};

/// IQ sample format for file input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Complex int8 (CS8): pairs of i8
    Ci8,
    /// Complex int16 (CS16): pairs of i16, little-endian
    Ci16,
    /// Complex float32 (CF32): pairs of f32, little-endian
    Cf32,
}

impl SampleFormat {
    /// Bytes per complex sample
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::Ci8 => 2,
            SampleFormat::Ci16 => 4,
            SampleFormat::Cf32 => 8,
        }
    }

    /// Decode whole samples from `buf`, scaled to [-1, 1).
    fn decode(self, buf: &[u8], out: &mut Vec<Complex32>) {
        out.clear();
        match self {
            SampleFormat::Ci8 => out.extend(
                buf.chunks_exact(2)
                    .map(|c| Complex32::new(c[0] as i8 as f32 / 128.0, c[1] as i8 as f32 / 128.0)),
            ),
            SampleFormat::Ci16 => out.extend(buf.chunks_exact(4).map(|c| {
                Complex32::new(
                    LittleEndian::read_i16(&c[..2]) as f32 / 32768.0,
                    LittleEndian::read_i16(&c[2..]) as f32 / 32768.0,
                )
            })),
            SampleFormat::Cf32 => out.extend(buf.chunks_exact(8).map(|c| {
                Complex32::new(LittleEndian::read_f32(&c[..4]), LittleEndian::read_f32(&c[4..]))
            })),
        }
    }
}

/// A single virtual receiver backed by an IQ file.
pub struct ReplayApi {
    serial: String,
    path: PathBuf,
    format: SampleFormat,
    packet_size: usize,
    looping: bool,
    disabled_clocks: u64,
}

impl ReplayApi {
    pub fn new(path: impl Into<PathBuf>, format: SampleFormat) -> Self {
        Self {
            serial: "replay".to_string(),
            path: path.into(),
            format,
            packet_size: 65536, // 64K complex samples per packet
            looping: false,
            disabled_clocks: 0,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = serial.into();
        self
    }

    pub fn with_packet_size(mut self, samples: usize) -> Self {
        self.packet_size = samples.max(1);
        self
    }

    /// Rewind at end of file instead of ending the stream.
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Pretend the given receiver clocks are unavailable.
    pub fn with_disabled_clocks(mut self, mask: u64) -> Self {
        self.disabled_clocks = mask;
        self
    }
}

impl HardwareApi for ReplayApi {
    fn rescan(&self, _timeout_ms: u32) -> Result<()> {
        Ok(())
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            serial: self.serial.clone(),
            ready: self.path.is_file(),
            superspeed: false,
        }]
    }

    fn open(&self, serial: &str) -> Result<Box<dyn PacketDevice>> {
        if serial != self.serial {
            return Err(HwError::NotFound(serial.to_string()));
        }
        let file = File::open(&self.path)?;
        log::info!("replaying {} ({:?})", self.path.display(), self.format);
        Ok(Box::new(ReplayDevice {
            path: self.path.clone(),
            reader: BufReader::with_capacity(1024 * 1024, file),
            format: self.format,
            packet_size: self.packet_size,
            looping: self.looping,
            disabled_clocks: self.disabled_clocks,
            settings: HashMap::new(),
            connected: false,
            streaming: false,
            raw: Vec::new(),
            packet: Vec::new(),
            pending: false,
        }))
    }
}

pub struct ReplayDevice {
    path: PathBuf,
    reader: BufReader<File>,
    format: SampleFormat,
    packet_size: usize,
    looping: bool,
    disabled_clocks: u64,
    settings: HashMap<String, ConfigValue>,
    connected: bool,
    streaming: bool,
    raw: Vec<u8>,
    packet: Vec<Complex32>,
    pending: bool,
}

impl ReplayDevice {
    /// Fill `raw` with up to one packet of whole samples. Returns bytes read.
    fn read_packet(&mut self) -> io::Result<usize> {
        let want = self.packet_size * self.format.sample_size();
        self.raw.resize(want, 0);
        let mut n = 0;
        while n < want {
            match self.reader.read(&mut self.raw[n..]) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(n - n % self.format.sample_size())
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.reader = BufReader::with_capacity(1024 * 1024, File::open(&self.path)?);
        Ok(())
    }
}

impl PacketDevice for ReplayDevice {
    fn configure(&mut self, key: &str, value: ConfigValue) -> Result<()> {
        log::debug!("replay: {} = {:?}", key, value);
        self.settings.insert(key.to_string(), value);
        Ok(())
    }

    fn disabled_options(&mut self, key: &str) -> Result<u64> {
        match key {
            "device/receiverclock" => Ok(self.disabled_clocks),
            _ => Ok(0),
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.connected {
            return Err(HwError::Vendor {
                call: "start",
                code: 1,
            });
        }
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.streaming = false;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn poll_packet(&mut self) -> Result<Option<&[Complex32]>> {
        if !self.streaming {
            return Ok(None);
        }
        if !self.pending {
            let mut n = self.read_packet()?;
            if n == 0 && self.looping {
                self.rewind()?;
                n = self.read_packet()?;
            }
            if n == 0 {
                log::info!("end of file: {}", self.path.display());
                return Err(HwError::EndOfStream);
            }
            self.format.decode(&self.raw[..n], &mut self.packet);
            self.pending = true;
        }
        Ok(Some(&self.packet))
    }

    fn consume_packet(&mut self) -> Result<()> {
        self.pending = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn iq_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    fn started(api: &ReplayApi) -> Box<dyn PacketDevice> {
        let mut dev = api.open("replay").unwrap();
        dev.connect().unwrap();
        dev.start().unwrap();
        dev
    }

    #[test]
    fn test_ci16_packets_peek_until_consumed() {
        let mut bytes = Vec::new();
        for v in [16384i16, -16384, 0, 32767, -32768, 8192] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let f = iq_file(&bytes);
        let api = ReplayApi::new(f.path(), SampleFormat::Ci16).with_packet_size(2);
        let mut dev = started(&api);

        let first = dev.poll_packet().unwrap().unwrap().to_vec();
        assert_eq!(first, vec![Complex32::new(0.5, -0.5), Complex32::new(0.0, 32767.0 / 32768.0)]);
        assert_eq!(dev.poll_packet().unwrap().unwrap(), &first[..]);

        dev.consume_packet().unwrap();
        let second = dev.poll_packet().unwrap().unwrap().to_vec();
        assert_eq!(second, vec![Complex32::new(-1.0, 0.25)]);

        dev.consume_packet().unwrap();
        assert!(matches!(dev.poll_packet(), Err(HwError::EndOfStream)));
    }

    #[test]
    fn test_ci8_and_cf32_decode() {
        let f = iq_file(&[64u8, 0xc0, 0x80, 0x7f]);
        let api = ReplayApi::new(f.path(), SampleFormat::Ci8);
        let mut dev = started(&api);
        assert_eq!(
            dev.poll_packet().unwrap().unwrap(),
            &[Complex32::new(0.5, -0.5), Complex32::new(-1.0, 127.0 / 128.0)]
        );

        let mut bytes = Vec::new();
        for v in [0.25f32, -0.75] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&[1, 2, 3]); // trailing partial sample
        let f = iq_file(&bytes);
        let api = ReplayApi::new(f.path(), SampleFormat::Cf32);
        let mut dev = started(&api);
        assert_eq!(dev.poll_packet().unwrap().unwrap(), &[Complex32::new(0.25, -0.75)]);
    }

    #[test]
    fn test_looping_rewinds() {
        let f = iq_file(&[1, 2]);
        let api = ReplayApi::new(f.path(), SampleFormat::Ci8).with_looping(true);
        let mut dev = started(&api);
        for _ in 0..3 {
            assert_eq!(dev.poll_packet().unwrap().unwrap().len(), 1);
            dev.consume_packet().unwrap();
        }
    }

    #[test]
    fn test_idle_until_started() {
        let f = iq_file(&[1, 2]);
        let api = ReplayApi::new(f.path(), SampleFormat::Ci8).with_serial("R1");
        assert!(matches!(api.open("other"), Err(HwError::NotFound(_))));

        let mut dev = api.open("R1").unwrap();
        assert!(dev.start().is_err());
        assert!(dev.poll_packet().unwrap().is_none());
        dev.connect().unwrap();
        dev.start().unwrap();
        assert!(dev.poll_packet().unwrap().is_some());
        dev.stop().unwrap();
        assert!(dev.poll_packet().unwrap().is_none());
    }
}
