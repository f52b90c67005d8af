//! Direct read path to the acquisition driver below the host software.
//!
//! The driver is polled with one control transfer per channel. A
//! [`DriverChannelReader`] runs those transfers on a dedicated blocking worker
//! and hands samples to a [`SampleStream`], independent of the protocol
//! client.

pub mod ioctl;
pub mod mock;
pub mod reader;

use serde::Serialize;

use crate::clock::AcquisitionTime;
use crate::error::DriverError;

pub use ioctl::{
    channel_info, lookup_channel, write_index, ChannelInfo, IoctlDevice, CHANNEL_TABLE,
};
pub use mock::{MockScopeConfig, MockScopeDevice};
pub use reader::{DriverChannelReader, ReaderOptions, SampleStream, StopHandle};

/// Driver channel index (see [`CHANNEL_TABLE`]).
pub type ChannelId = i32;

/// One raw reading from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelSample {
    /// Channel the sample was read from.
    pub channel: ChannelId,
    /// Un-scaled driver counts.
    pub raw: i32,
    /// When the transfer completed.
    pub timestamp: AcquisitionTime,
    /// Index of the transfer this sample belongs to.
    pub sequence: u64,
}

/// Blocking device speaking the driver's control transfers.
///
/// Implementations are only ever called from the reader's blocking worker.
pub trait DriverDevice: Send {
    /// One `IOCTL_GET_KANAL` transfer.
    fn read_raw(&mut self, channel: ChannelId) -> Result<i32, DriverError>;

    /// One `IOCTL_SET_CHANNEL` transfer: drive the output at `write_index`
    /// to `counts`.
    fn write_raw(&mut self, write_index: i32, counts: i32) -> Result<(), DriverError>;

    /// Device description for errors and logs.
    fn describe(&self) -> String;

    /// Release the device. Dropping must also release it.
    fn close(&mut self) {}
}

/// Where the acquisition driver is reached.
pub enum DriverEndpoint {
    /// Driver device node.
    Device(String),
    /// Simulated scope device.
    Mock(MockScopeDevice),
}

impl DriverEndpoint {
    /// Open the device. Mock devices always open.
    pub fn open(self) -> Result<Box<dyn DriverDevice>, DriverError> {
        match self {
            DriverEndpoint::Device(path) => Ok(Box::new(IoctlDevice::open(&path)?)),
            DriverEndpoint::Mock(device) => Ok(Box::new(device)),
        }
    }
}

impl std::fmt::Debug for DriverEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverEndpoint::Device(path) => write!(f, "Device({path})"),
            DriverEndpoint::Mock(_) => write!(f, "Mock"),
        }
    }
}
