// Copyright 2025-2026 CEMAXECUTER LLC

//! Aaronia RTSA API binding (libAaroniaRTSAAPI.so).
//!
//! Spectran V6 devices are opened as `spectranv6/raw`, which delivers
//! interleaved float32 IQ packets on channel 0.

use std::os::raw::c_void;
use std::ptr;
use std::sync::{Arc, Mutex};

use num_complex::Complex32;

use crate::{ConfigValue, DeviceInfo, HardwareApi, HwError, PacketDevice, Result};

// ---------------------------------------------------------------------------
// FFI types and constants
// ---------------------------------------------------------------------------

type AarResult = u32;
const AAROK: AarResult = 0x0000_0000;
const AAR_EMPTY: AarResult = 0x0000_0001;

const MEMORY_MEDIUM: u32 = 1;

#[allow(dead_code)]
#[repr(C)]
struct AarHandle {
    d: *mut c_void,
}

#[allow(dead_code)]
#[repr(C)]
struct AarDevice {
    d: *mut c_void,
}

#[allow(dead_code)]
#[repr(C)]
struct AarConfig {
    d: *mut c_void,
}

// wchar_t is 4 bytes on Linux, bool is 1 byte.
#[allow(dead_code)]
#[repr(C)]
struct AarDeviceInfo {
    cbsize: i64,
    serial_number: [i32; 120],
    ready: u8,
    boost: u8,
    superspeed: u8,
    active: u8,
}

#[allow(dead_code)]
#[repr(C)]
struct AarPacket {
    cbsize: i64,
    stream_id: u64,
    flags: u64,
    start_time: f64,
    end_time: f64,
    start_frequency: f64,
    step_frequency: f64,
    span_frequency: f64,
    rbw_frequency: f64,
    num: i64,
    total: i64,
    size: i64,
    stride: i64,
    fp32: *mut f32,
    interleave: i64,
}

#[allow(dead_code)]
#[repr(C)]
struct AarConfigInfo {
    cbsize: i64,
    name: [i32; 80],
    title: [i32; 120],
    config_type: i32,
    min_value: f64,
    max_value: f64,
    step_value: f64,
    unit: [i32; 10],
    options: [i32; 1000],
    disabled_options: u64,
}

// Packet flags
const PACKET_WARN_OVERFLOW: u64 = 0x0000_0000_0000_0100;
const PACKET_WARN_DROPPED: u64 = 0x0000_0000_0000_0200;

/// Default path to Aaronia RTSA Suite installation (contains paths.xml).
pub const AARONIA_INSTALL_DIR: &str = "/opt/aaronia-rtsa-suite/Aaronia-RTSA-Suite-PRO";

extern "C" {
    fn AARTSAAPI_Init_With_Path(memory: u32, path: *const i32) -> AarResult;
    fn AARTSAAPI_Shutdown() -> AarResult;
    fn AARTSAAPI_Open(handle: *mut AarHandle) -> AarResult;
    fn AARTSAAPI_Close(handle: *mut AarHandle) -> AarResult;
    fn AARTSAAPI_RescanDevices(handle: *mut AarHandle, timeout: i32) -> AarResult;
    fn AARTSAAPI_EnumDevice(
        handle: *mut AarHandle,
        device_type: *const i32,
        index: i32,
        dinfo: *mut AarDeviceInfo,
    ) -> AarResult;
    fn AARTSAAPI_OpenDevice(
        handle: *mut AarHandle,
        dhandle: *mut AarDevice,
        device_type: *const i32,
        serial: *const i32,
    ) -> AarResult;
    fn AARTSAAPI_CloseDevice(handle: *mut AarHandle, dhandle: *mut AarDevice) -> AarResult;
    fn AARTSAAPI_ConnectDevice(dhandle: *mut AarDevice) -> AarResult;
    fn AARTSAAPI_DisconnectDevice(dhandle: *mut AarDevice) -> AarResult;
    fn AARTSAAPI_StartDevice(dhandle: *mut AarDevice) -> AarResult;
    fn AARTSAAPI_StopDevice(dhandle: *mut AarDevice) -> AarResult;
    fn AARTSAAPI_ConfigRoot(dhandle: *mut AarDevice, config: *mut AarConfig) -> AarResult;
    fn AARTSAAPI_ConfigFind(
        dhandle: *mut AarDevice,
        group: *mut AarConfig,
        config: *mut AarConfig,
        name: *const i32,
    ) -> AarResult;
    fn AARTSAAPI_ConfigSetFloat(
        dhandle: *mut AarDevice,
        config: *mut AarConfig,
        value: f64,
    ) -> AarResult;
    fn AARTSAAPI_ConfigSetString(
        dhandle: *mut AarDevice,
        config: *mut AarConfig,
        value: *const i32,
    ) -> AarResult;
    fn AARTSAAPI_ConfigGetInfo(
        dhandle: *mut AarDevice,
        config: *mut AarConfig,
        cinfo: *mut AarConfigInfo,
    ) -> AarResult;
    fn AARTSAAPI_GetPacket(
        dhandle: *mut AarDevice,
        channel: i32,
        index: i32,
        packet: *mut AarPacket,
    ) -> AarResult;
    fn AARTSAAPI_ConsumePackets(dhandle: *mut AarDevice, channel: i32, num: i32) -> AarResult;
}

fn check(call: &'static str, code: AarResult) -> Result<()> {
    if code == AAROK {
        Ok(())
    } else {
        Err(HwError::Vendor { call, code })
    }
}

// ---------------------------------------------------------------------------
// Wide-char helpers
// ---------------------------------------------------------------------------

/// Convert a Rust &str to a null-terminated wchar_t array (i32 on Linux).
fn to_wchar(s: &str) -> Vec<i32> {
    let mut v: Vec<i32> = s.chars().map(|c| c as i32).collect();
    v.push(0);
    v
}

fn from_wchar(buf: &[i32]) -> String {
    buf.iter()
        .take_while(|&&c| c != 0)
        .filter_map(|&c| char::from_u32(c as u32))
        .collect()
}

// ---------------------------------------------------------------------------
// Library handle
// ---------------------------------------------------------------------------

/// Library session. Shut down when the API and every device are dropped.
struct Session {
    h: Mutex<AarHandle>,
}

// The handle is only touched under the mutex.
unsafe impl Send for Session {}
unsafe impl Sync for Session {}

impl Drop for Session {
    fn drop(&mut self) {
        let h = self.h.get_mut().unwrap_or_else(|e| e.into_inner());
        unsafe {
            AARTSAAPI_Close(h);
            AARTSAAPI_Shutdown();
        }
    }
}

pub struct RtsaApi {
    session: Arc<Session>,
}

impl RtsaApi {
    pub fn new() -> Result<Self> {
        Self::with_install_dir(AARONIA_INSTALL_DIR)
    }

    pub fn with_install_dir(dir: &str) -> Result<Self> {
        let path = to_wchar(dir);
        unsafe {
            check(
                "AARTSAAPI_Init",
                AARTSAAPI_Init_With_Path(MEMORY_MEDIUM, path.as_ptr()),
            )?;
            let mut h = AarHandle { d: ptr::null_mut() };
            if let Err(e) = check("AARTSAAPI_Open", AARTSAAPI_Open(&mut h)) {
                AARTSAAPI_Shutdown();
                return Err(e);
            }
            Ok(Self {
                session: Arc::new(Session { h: Mutex::new(h) }),
            })
        }
    }
}

impl HardwareApi for RtsaApi {
    fn rescan(&self, timeout_ms: u32) -> Result<()> {
        let mut h = self.session.h.lock().unwrap();
        let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);
        unsafe { check("AARTSAAPI_RescanDevices", AARTSAAPI_RescanDevices(&mut *h, timeout)) }
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        let mut h = self.session.h.lock().unwrap();
        let device_type = to_wchar("spectranv6");
        let mut devices = Vec::new();
        for idx in 0.. {
            let mut dinfo = unsafe { std::mem::zeroed::<AarDeviceInfo>() };
            dinfo.cbsize = std::mem::size_of::<AarDeviceInfo>() as i64;
            let res = unsafe { AARTSAAPI_EnumDevice(&mut *h, device_type.as_ptr(), idx, &mut dinfo) };
            if res != AAROK {
                break;
            }
            devices.push(DeviceInfo {
                serial: from_wchar(&dinfo.serial_number),
                ready: dinfo.ready != 0,
                superspeed: dinfo.superspeed != 0,
            });
        }
        devices
    }

    fn open(&self, serial: &str) -> Result<Box<dyn PacketDevice>> {
        let mut h = self.session.h.lock().unwrap();
        let device_type = to_wchar("spectranv6/raw");
        let serial_wc = to_wchar(serial);
        let mut d = AarDevice { d: ptr::null_mut() };
        let mut root = AarConfig { d: ptr::null_mut() };
        unsafe {
            check(
                "AARTSAAPI_OpenDevice",
                AARTSAAPI_OpenDevice(&mut *h, &mut d, device_type.as_ptr(), serial_wc.as_ptr()),
            )?;
            if let Err(e) = check("AARTSAAPI_ConfigRoot", AARTSAAPI_ConfigRoot(&mut d, &mut root)) {
                AARTSAAPI_CloseDevice(&mut *h, &mut d);
                return Err(e);
            }
        }
        log::info!("opened Spectran V6 {}", serial);
        Ok(Box::new(RtsaDevice {
            session: Arc::clone(&self.session),
            d,
            root,
            pkt: unsafe { std::mem::zeroed() },
            scratch: Vec::new(),
            overflows: 0,
            drops: 0,
        }))
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

pub struct RtsaDevice {
    session: Arc<Session>,
    d: AarDevice,
    root: AarConfig,
    pkt: AarPacket,
    /// De-interleave buffer for packets with a stride other than 2
    scratch: Vec<Complex32>,
    overflows: u64,
    drops: u64,
}

// The device handle is owned by exactly one RtsaDevice.
unsafe impl Send for RtsaDevice {}

impl RtsaDevice {
    fn find(&mut self, key: &str) -> Result<AarConfig> {
        let name = to_wchar(key);
        let mut node = AarConfig { d: ptr::null_mut() };
        let res = unsafe { AARTSAAPI_ConfigFind(&mut self.d, &mut self.root, &mut node, name.as_ptr()) };
        if res != AAROK {
            return Err(HwError::UnknownKey(key.to_string()));
        }
        Ok(node)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }

    pub fn drop_count(&self) -> u64 {
        self.drops
    }
}

impl PacketDevice for RtsaDevice {
    fn configure(&mut self, key: &str, value: ConfigValue) -> Result<()> {
        let mut node = self.find(key)?;
        let res = match value {
            ConfigValue::Str(ref s) => {
                let v = to_wchar(s);
                unsafe { AARTSAAPI_ConfigSetString(&mut self.d, &mut node, v.as_ptr()) }
            }
            ConfigValue::Float(v) => unsafe { AARTSAAPI_ConfigSetFloat(&mut self.d, &mut node, v) },
        };
        if res != AAROK {
            log::warn!("ConfigSet({} = {:?}) failed: 0x{:08x}", key, value, res);
            return Err(HwError::InvalidValue {
                key: key.to_string(),
                value,
            });
        }
        Ok(())
    }

    fn disabled_options(&mut self, key: &str) -> Result<u64> {
        let mut node = self.find(key)?;
        unsafe {
            let mut cinfo = std::mem::zeroed::<AarConfigInfo>();
            cinfo.cbsize = std::mem::size_of::<AarConfigInfo>() as i64;
            check(
                "AARTSAAPI_ConfigGetInfo",
                AARTSAAPI_ConfigGetInfo(&mut self.d, &mut node, &mut cinfo),
            )?;
            log::debug!("{} options: {}", key, from_wchar(&cinfo.options));
            Ok(cinfo.disabled_options)
        }
    }

    fn connect(&mut self) -> Result<()> {
        unsafe { check("AARTSAAPI_ConnectDevice", AARTSAAPI_ConnectDevice(&mut self.d)) }
    }

    fn start(&mut self) -> Result<()> {
        unsafe { check("AARTSAAPI_StartDevice", AARTSAAPI_StartDevice(&mut self.d)) }
    }

    fn stop(&mut self) -> Result<()> {
        unsafe { check("AARTSAAPI_StopDevice", AARTSAAPI_StopDevice(&mut self.d)) }
    }

    fn disconnect(&mut self) -> Result<()> {
        unsafe { check("AARTSAAPI_DisconnectDevice", AARTSAAPI_DisconnectDevice(&mut self.d)) }
    }

    fn poll_packet(&mut self) -> Result<Option<&[Complex32]>> {
        unsafe {
            self.pkt = std::mem::zeroed();
            self.pkt.cbsize = std::mem::size_of::<AarPacket>() as i64;
            let res = AARTSAAPI_GetPacket(&mut self.d, 0, 0, &mut self.pkt);
            if res == AAR_EMPTY {
                return Ok(None);
            }
            check("AARTSAAPI_GetPacket", res)?;

            if self.pkt.flags & PACKET_WARN_OVERFLOW != 0 {
                self.overflows += 1;
                log::warn!("receiver overflow ({} total)", self.overflows);
            }
            if self.pkt.flags & PACKET_WARN_DROPPED != 0 {
                self.drops += 1;
                log::warn!("packets dropped ({} total)", self.drops);
            }

            self.scratch.clear();
            let num = self.pkt.num.max(0) as usize;
            let stride = self.pkt.stride.max(0) as usize;
            if num == 0 || self.pkt.fp32.is_null() || stride < 2 {
                return Ok(Some(&self.scratch[..]));
            }
            if stride == 2 {
                // Complex32 is #[repr(C)] { re, im }, the same layout as interleaved f32 pairs
                let samples = std::slice::from_raw_parts(self.pkt.fp32 as *const Complex32, num);
                return Ok(Some(samples));
            }
            for i in 0..num {
                let fi = *self.pkt.fp32.add(i * stride);
                let fq = *self.pkt.fp32.add(i * stride + 1);
                self.scratch.push(Complex32::new(fi, fq));
            }
            Ok(Some(&self.scratch[..]))
        }
    }

    fn consume_packet(&mut self) -> Result<()> {
        unsafe { check("AARTSAAPI_ConsumePackets", AARTSAAPI_ConsumePackets(&mut self.d, 0, 1)) }
    }
}

impl Drop for RtsaDevice {
    fn drop(&mut self) {
        let mut h = self.session.h.lock().unwrap_or_else(|e| e.into_inner());
        unsafe {
            AARTSAAPI_CloseDevice(&mut *h, &mut self.d);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wchar_round_trip() {
        let wide = to_wchar("1234ABCD");
        assert_eq!(wide.len(), 9);
        assert_eq!(*wide.last().unwrap(), 0);
        assert_eq!(from_wchar(&wide), "1234ABCD");
    }

    #[test]
    fn test_from_wchar_stops_at_nul() {
        let mut buf = [0i32; 120];
        for (i, c) in "SN42".chars().enumerate() {
            buf[i] = c as i32;
        }
        buf[6] = 'x' as i32;
        assert_eq!(from_wchar(&buf), "SN42");
    }
}
