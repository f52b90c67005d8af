//! Control surface of the SXM acquisition driver.
//!
//! This is the only place the driver's wire contract is written down:
//!
//! - Device node: `\\.\SXM` on the instrument PC, or a device path exported by
//!   a compatible kernel module.
//! - Control codes are built like the Windows `CTL_CODE` macro with
//!   `FILE_DEVICE_UNKNOWN`, `FILE_ANY_ACCESS` and `METHOD_BUFFERED`.
//! - `IOCTL_GET_KANAL` (function `0xF0D`): input is the channel index as a
//!   4-byte little-endian `i32`; output is the raw channel value as a 4-byte
//!   little-endian `i32`, in place.
//! - `IOCTL_SET_CHANNEL` (function `0xF18`): input is the write index and the
//!   raw counts, two 4-byte little-endian `i32`s (8 bytes); no output. Only
//!   the topography DAC (write index 0) is driven this way, to hold Z while
//!   the host's feedback loop is disabled (see [`write_index`]).
//! - Channel indices: negative values select DAC outputs, non-negative values
//!   select ADC inputs, except index 0 which is the topography DAC (see
//!   [`CHANNEL_TABLE`]).
//!
//! Scale factors in the table convert raw counts to the advisory unit. They
//! are published for calibration tooling; the reader never applies them.

use serde::Serialize;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use super::{ChannelId, DriverDevice};
use crate::error::{DriverError, DriverErrorKind};

/// `FILE_DEVICE_UNKNOWN` device type.
pub const FILE_DEVICE_UNKNOWN: u32 = 0x22;
/// `FILE_ANY_ACCESS` access mode.
pub const FILE_ANY_ACCESS: u32 = 0;
/// `METHOD_BUFFERED` transfer method.
pub const METHOD_BUFFERED: u32 = 0;

/// `CTL_CODE(device_type, function, method, access)`.
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// Read one channel.
pub const IOCTL_GET_KANAL: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 0xF0D, METHOD_BUFFERED, FILE_ANY_ACCESS);

/// Write one DAC output.
pub const IOCTL_SET_CHANNEL: u32 =
    ctl_code(FILE_DEVICE_UNKNOWN, 0xF18, METHOD_BUFFERED, FILE_ANY_ACCESS);

/// Device node of the SXM driver on the instrument PC.
pub const DEFAULT_DEVICE_PATH: &str = r"\\.\SXM";

/// Static description of one driver channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelInfo {
    /// Channel name (`Topo`, `QPlusAmpl`, ...).
    pub name: &'static str,
    /// Index passed to `IOCTL_GET_KANAL`.
    pub index: ChannelId,
    /// Hardware label (`DAC12`, `ADC0`, ...).
    pub label: &'static str,
    /// Advisory unit of `scale`.
    pub unit: &'static str,
    /// Advisory counts-to-unit factor.
    pub scale: f64,
}

impl ChannelInfo {
    const fn new(
        name: &'static str,
        index: ChannelId,
        label: &'static str,
        unit: &'static str,
        scale: f64,
    ) -> Self {
        Self {
            name,
            index,
            label,
            unit,
            scale,
        }
    }

    /// Whether the channel is a DAC output.
    pub fn is_output(&self) -> bool {
        self.label.starts_with("DAC")
    }

    /// Driver write index, for channels that can be written.
    pub fn write_index(&self) -> Option<i32> {
        write_index(self.index)
    }
}

/// `IOCTL_SET_CHANNEL` write index of a channel. Only the topography DAC is
/// writable.
pub fn write_index(channel: ChannelId) -> Option<i32> {
    match channel {
        0 => Some(0),
        _ => None,
    }
}

/// Channels the SXM driver exposes.
pub static CHANNEL_TABLE: &[ChannelInfo] = &[
    ChannelInfo::new("Topo", 0, "DAC0", "nm", -2.60914e-07),
    ChannelInfo::new("Bias", -1, "DAC1", "mV", 9.4e-06),
    ChannelInfo::new("x-direction", -2, "DAC2", "nm", 1.34e-06),
    ChannelInfo::new("y-direction", -3, "DAC3", "nm", 1.34e-06),
    ChannelInfo::new("DA1", -4, "DAC4", "V", -9.41e-09),
    ChannelInfo::new("Frequency", -9, "DAC9", "Hz", 0.00232831),
    ChannelInfo::new("Drive", -10, "DAC10", "V", 4.97789e-09),
    ChannelInfo::new("QPlusAmpl", -12, "DAC12", "V", 3.64244e-09),
    ChannelInfo::new("Phase", -13, "DAC13", "°", 0.001),
    ChannelInfo::new("Lia1X", -14, "DAC14", "A", 1.56618e-19),
    ChannelInfo::new("Lia1Y", -15, "DAC15", "A", 1.56618e-19),
    ChannelInfo::new("Lia2X", -16, "DAC16", "A", 1.56618e-19),
    ChannelInfo::new("Lia2Y", -17, "DAC17", "A", 1.56618e-19),
    ChannelInfo::new("Lia3X", -18, "DAC18", "A", 1.56618e-19),
    ChannelInfo::new("Lia3Y", -19, "DAC19", "A", 1.56618e-19),
    ChannelInfo::new("Lia1R", -22, "DAC22", "A", 9.51067e-20),
    ChannelInfo::new("Lia2R", -23, "DAC23", "A", 9.51067e-20),
    ChannelInfo::new("Lia3R", -24, "DAC24", "A", 9.51067e-20),
    ChannelInfo::new("Lia1Phi", -27, "DAC27", "*", 0.001),
    ChannelInfo::new("Lia2Phi", -28, "DAC28", "*", 0.001),
    ChannelInfo::new("Lia3Phi", -29, "DAC29", "*", 0.001),
    ChannelInfo::new("df", -40, "DAC40", "Hz", 0.00232838),
    ChannelInfo::new("It_ext", 32, "ADC0", "A", 1.011e-19),
    ChannelInfo::new("QPlus_ext", 33, "ADC1", "mV", 1.008e-05),
    ChannelInfo::new("AD1", 34, "ADC2", "V", 1.012e-08),
    ChannelInfo::new("AD2", 35, "ADC3", "mV", 1.011e-05),
    ChannelInfo::new("InA", 8, "ADC4", "V", 3.07991e-09),
    ChannelInfo::new("It_to_PC", 12, "ADC9", "A", 8.04187e-20),
    ChannelInfo::new("Zeit", 23, "ADC12", "s", 0.001),
    ChannelInfo::new("AD3", 36, "ADC13", "mV", 1.01e-05),
    ChannelInfo::new("AD4", 37, "ADC14", "mV", 1.013e-05),
    ChannelInfo::new("AD5", 38, "ADC15", "mV", 1.01e-05),
    ChannelInfo::new("AD6", 39, "ADC16", "mV", 1.009e-05),
    ChannelInfo::new("minmax", 47, "ADC21", "A", 3.35e-07),
];

/// Look up a channel by name (case-insensitive) or by driver index.
pub fn lookup_channel(key: &str) -> Option<&'static ChannelInfo> {
    let key = key.trim();
    if let Ok(index) = key.parse::<ChannelId>() {
        return channel_info(index);
    }
    CHANNEL_TABLE
        .iter()
        .find(|info| info.name.eq_ignore_ascii_case(key))
}

/// Table entry for `index`.
pub fn channel_info(index: ChannelId) -> Option<&'static ChannelInfo> {
    CHANNEL_TABLE.iter().find(|info| info.index == index)
}

/// Input buffer of `IOCTL_GET_KANAL`.
pub fn encode_kanal_request(channel: ChannelId) -> [u8; 4] {
    channel.to_le_bytes()
}

/// Output buffer of `IOCTL_GET_KANAL`.
pub fn decode_kanal_reply(buffer: [u8; 4]) -> i32 {
    i32::from_le_bytes(buffer)
}

/// Input buffer of `IOCTL_SET_CHANNEL`.
pub fn encode_set_channel_request(write_index: i32, counts: i32) -> [u8; 8] {
    let mut buffer = [0u8; 8];
    buffer[..4].copy_from_slice(&write_index.to_le_bytes());
    buffer[4..].copy_from_slice(&counts.to_le_bytes());
    buffer
}

/// Character device speaking the SXM control codes.
#[derive(Debug)]
pub struct IoctlDevice {
    path: String,
    #[cfg(unix)]
    file: std::fs::File,
}

impl IoctlDevice {
    /// Open the driver node. Any failure (missing node, permissions, another
    /// process holding an exclusive lock) is `Unavailable`.
    #[cfg(unix)]
    pub fn open(path: &str) -> Result<Self, DriverError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DriverError::unavailable(path, e.to_string()))?;
        Ok(Self {
            path: path.to_string(),
            file,
        })
    }

    /// Direct driver access needs a unix device node; elsewhere this is always `Unavailable`.
    #[cfg(not(unix))]
    pub fn open(path: &str) -> Result<Self, DriverError> {
        Err(DriverError::unavailable(
            path,
            "direct driver access is not supported on this platform",
        ))
    }
}

impl DriverDevice for IoctlDevice {
    #[cfg(unix)]
    fn read_raw(&mut self, channel: ChannelId) -> Result<i32, DriverError> {
        let mut buffer = encode_kanal_request(channel);

        // SAFETY: `buffer` is a live 4-byte buffer for the duration of the call,
        // which is exactly the in/out size IOCTL_GET_KANAL transfers, and the
        // file descriptor stays open because `self.file` is borrowed.
        #[allow(unsafe_code)]
        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                IOCTL_GET_KANAL as _,
                buffer.as_mut_ptr() as *mut libc::c_void,
            )
        };

        if result < 0 {
            let errno = std::io::Error::last_os_error();
            return Err(DriverError::new(
                &self.path,
                DriverErrorKind::Transfer,
                format!("IOCTL_GET_KANAL({channel}) failed: {errno}"),
            ));
        }

        Ok(decode_kanal_reply(buffer))
    }

    #[cfg(not(unix))]
    fn read_raw(&mut self, channel: ChannelId) -> Result<i32, DriverError> {
        Err(DriverError::new(
            &self.path,
            DriverErrorKind::Transfer,
            format!("IOCTL_GET_KANAL({channel}) unsupported on this platform"),
        ))
    }

    #[cfg(unix)]
    fn write_raw(&mut self, write_index: i32, counts: i32) -> Result<(), DriverError> {
        let mut buffer = encode_set_channel_request(write_index, counts);

        // SAFETY: `buffer` is a live 8-byte buffer for the duration of the call,
        // the input size IOCTL_SET_CHANNEL expects; the driver writes nothing back.
        #[allow(unsafe_code)]
        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                IOCTL_SET_CHANNEL as _,
                buffer.as_mut_ptr() as *mut libc::c_void,
            )
        };

        if result < 0 {
            let errno = std::io::Error::last_os_error();
            return Err(DriverError::new(
                &self.path,
                DriverErrorKind::Transfer,
                format!("IOCTL_SET_CHANNEL({write_index}, {counts}) failed: {errno}"),
            ));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn write_raw(&mut self, write_index: i32, counts: i32) -> Result<(), DriverError> {
        Err(DriverError::new(
            &self.path,
            DriverErrorKind::Transfer,
            format!("IOCTL_SET_CHANNEL({write_index}, {counts}) unsupported on this platform"),
        ))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}
