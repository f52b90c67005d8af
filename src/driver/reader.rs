//! Driver channel reader and its sample stream.
//!
//! # Streaming model
//!
//! ```text
//! blocking worker                          consumer task
//! ───────────────                          ─────────────
//! for each tick:
//!   read every configured channel  ──►  mpsc (capacity = one transfer)  ──►  SampleStream
//!   sleep(poll_interval)                         ▲
//!                                                │
//!                            StreamGate (stop flag + wake) ◄── stop() / StopHandle::stop()
//! ```
//!
//! The stop flag sits behind a lock that `SampleStream::poll_next` holds while
//! it receives, so once `stop()` has returned no poll can hand out another
//! sample. The worker watches the same gate and exits at its next suspension
//! point.

use futures::Stream;
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    channel_info, ChannelId, ChannelInfo, ChannelSample, DriverDevice, DriverEndpoint,
    CHANNEL_TABLE,
};
use crate::clock::AcquisitionClock;
use crate::error::{DriverError, DriverErrorKind, StreamError};

/// Default interval between transfers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tuning of the transfer loop.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Interval between transfers.
    pub poll_interval: Duration,
    /// Bound on waiting for the worker to exit in [`DriverChannelReader::stop`].
    pub stop_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: Duration::from_secs(1),
        }
    }
}

type SharedDevice = Arc<parking_lot::Mutex<Box<dyn DriverDevice>>>;
type StreamItem = Result<ChannelSample, StreamError>;

#[derive(Debug)]
struct StreamGate {
    stopped: RwLock<bool>,
    wake: watch::Sender<bool>,
}

impl StreamGate {
    fn new() -> Self {
        let (wake, _) = watch::channel(false);
        Self {
            stopped: RwLock::new(false),
            wake,
        }
    }

    fn stop(&self) {
        *self.stopped.write() = true;
        self.wake.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.read()
    }
}

struct ActiveStream {
    gate: Arc<StreamGate>,
    worker: JoinHandle<()>,
}

/// Owner of the driver device.
pub struct DriverChannelReader {
    device: SharedDevice,
    name: String,
    clock: AcquisitionClock,
    channels: Vec<ChannelId>,
    options: ReaderOptions,
    active: Option<ActiveStream>,
}

impl DriverChannelReader {
    /// Open the driver. Fails with an `Unavailable` driver error if the device
    /// cannot be opened.
    pub fn open(
        endpoint: DriverEndpoint,
        options: ReaderOptions,
        clock: AcquisitionClock,
    ) -> Result<Self, DriverError> {
        let device = endpoint.open()?;
        let name = device.describe();
        info!(device = %name, "Opened acquisition driver");

        Ok(Self {
            device: Arc::new(parking_lot::Mutex::new(device)),
            name,
            clock,
            channels: Vec::new(),
            options,
            active: None,
        })
    }

    /// Device description used in errors and logs.
    pub fn device_name(&self) -> &str {
        &self.name
    }

    /// Channels of the next stream.
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    /// The driver's channel contract.
    pub fn channel_table(&self) -> &'static [ChannelInfo] {
        CHANNEL_TABLE
    }

    /// Select the channels read by each transfer. Not allowed while streaming.
    pub fn configure_channels(&mut self, channels: &[ChannelId]) -> Result<(), DriverError> {
        if self.is_streaming() {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::Busy,
                "cannot reconfigure channels while streaming",
            ));
        }
        if channels.is_empty() {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::InvalidChannel,
                "no channels selected",
            ));
        }

        let mut selected = Vec::with_capacity(channels.len());
        for &channel in channels {
            if channel_info(channel).is_none() {
                return Err(DriverError::new(
                    &self.name,
                    DriverErrorKind::InvalidChannel,
                    format!("unknown channel {channel}"),
                ));
            }
            if !selected.contains(&channel) {
                selected.push(channel);
            }
        }

        debug!(device = %self.name, channels = ?selected, "Configured channels");
        self.channels = selected;
        Ok(())
    }

    /// Whether a stream is running.
    pub fn is_streaming(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.gate.is_stopped() && !active.worker.is_finished())
    }

    /// Start a transfer loop and return its sample stream.
    ///
    /// Must be called inside a tokio runtime. A stream that has been stopped
    /// (or has ended) can be replaced by calling this again.
    pub fn start_stream(&mut self) -> Result<SampleStream, DriverError> {
        if self.is_streaming() {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::Busy,
                "stream already running",
            ));
        }
        if self.channels.is_empty() {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::InvalidChannel,
                "no channels configured",
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            DriverError::new(&self.name, DriverErrorKind::Transfer, e.to_string())
        })?;

        if let Some(previous) = self.active.take() {
            previous.gate.stop();
        }

        let gate = Arc::new(StreamGate::new());
        let (tx, rx) = mpsc::channel(self.channels.len());
        let transfer = TransferLoop {
            device: self.device.clone(),
            channels: self.channels.clone(),
            clock: self.clock,
            poll_interval: self.options.poll_interval,
            stop: gate.wake.subscribe(),
            tx,
        };
        let worker = tokio::task::spawn_blocking(move || runtime.block_on(transfer.run()));

        info!(
            device = %self.name,
            channels = ?self.channels,
            poll_interval = ?self.options.poll_interval,
            "Started sample stream"
        );

        self.active = Some(ActiveStream {
            gate: gate.clone(),
            worker,
        });
        Ok(SampleStream {
            rx,
            gate,
            finished: false,
        })
    }

    /// Handle that stops the current stream from any context, including
    /// synchronous code.
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.active.as_ref().map(|active| StopHandle {
            gate: active.gate.clone(),
        })
    }

    /// Stop the current stream and wait (bounded) for the worker to exit.
    /// No sample is delivered after this returns. No-op when idle.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.gate.stop();

        match tokio::time::timeout(self.options.stop_timeout, active.worker).await {
            Ok(Ok(())) => info!(device = %self.name, "Stopped sample stream"),
            Ok(Err(e)) => warn!(device = %self.name, error = %e, "Transfer worker failed"),
            Err(_) => warn!(
                device = %self.name,
                timeout = ?self.options.stop_timeout,
                "Transfer worker did not exit in time"
            ),
        }
    }

    /// Drive a writable output channel to `value` in the channel's unit and
    /// return the counts sent. Allowed while streaming: the transfer runs
    /// between two of the worker's reads.
    pub async fn write_output(&self, channel: ChannelId, value: f64) -> Result<i32, DriverError> {
        let info = channel_info(channel).ok_or_else(|| {
            DriverError::new(
                &self.name,
                DriverErrorKind::InvalidChannel,
                format!("unknown channel {channel}"),
            )
        })?;
        let write_index = info.write_index().ok_or_else(|| {
            DriverError::new(
                &self.name,
                DriverErrorKind::InvalidChannel,
                format!("channel {} ({channel}) is not writable", info.name),
            )
        })?;
        let counts = (value / info.scale).round();
        if !counts.is_finite() || counts < f64::from(i32::MIN) || counts > f64::from(i32::MAX) {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::InvalidChannel,
                format!("{value} {} is out of range for {}", info.unit, info.name),
            ));
        }
        let counts = counts as i32;

        let device = self.device.clone();
        tokio::task::spawn_blocking(move || device.lock().write_raw(write_index, counts))
            .await
            .map_err(|e| DriverError::new(&self.name, DriverErrorKind::Transfer, e.to_string()))??;

        debug!(device = %self.name, channel = info.name, value, counts, "Wrote output");
        Ok(counts)
    }

    /// Stop streaming and release the device.
    pub async fn close(&mut self) {
        self.stop().await;
        self.device.lock().close();
        info!(device = %self.name, "Closed acquisition driver");
    }
}

impl Drop for DriverChannelReader {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.gate.stop();
        }
    }
}

/// Stops one stream. Cloneable and usable from any thread.
#[derive(Clone)]
pub struct StopHandle {
    gate: Arc<StreamGate>,
}

impl StopHandle {
    /// Stop the stream. The worker exits after its current transfer.
    pub fn stop(&self) {
        self.gate.stop();
    }

    /// Whether the stream was asked to stop.
    pub fn is_stopped(&self) -> bool {
        self.gate.is_stopped()
    }
}

struct TransferLoop {
    device: SharedDevice,
    channels: Vec<ChannelId>,
    clock: AcquisitionClock,
    poll_interval: Duration,
    stop: watch::Receiver<bool>,
    tx: mpsc::Sender<StreamItem>,
}

impl TransferLoop {
    async fn run(mut self) {
        let mut sequence = 0u64;

        loop {
            if *self.stop.borrow() {
                return;
            }

            let (samples, failure) = self.transfer(sequence);
            for sample in samples {
                if !self.deliver(Ok(sample)).await {
                    return;
                }
            }
            if let Some(error) = failure {
                warn!(channel = error.channel, error = %error.message, "Driver transfer failed");
                self.deliver(Err(error)).await;
                return;
            }
            sequence += 1;

            tokio::select! {
                _ = self.stop.wait_for(|stopped| *stopped) => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// One transfer: every configured channel read once.
    fn transfer(&self, sequence: u64) -> (Vec<ChannelSample>, Option<StreamError>) {
        let mut device = self.device.lock();
        let mut samples = Vec::with_capacity(self.channels.len());

        for &channel in &self.channels {
            match device.read_raw(channel) {
                Ok(raw) => samples.push(ChannelSample {
                    channel,
                    raw,
                    timestamp: self.clock.now(),
                    sequence,
                }),
                Err(e) => {
                    return (
                        samples,
                        Some(StreamError {
                            channel,
                            message: e.message,
                        }),
                    )
                }
            }
        }

        (samples, None)
    }

    /// Returns false when the stream is stopped or its consumer is gone.
    async fn deliver(&mut self, item: StreamItem) -> bool {
        tokio::select! {
            _ = self.stop.wait_for(|stopped| *stopped) => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}

/// Lazy, infinite sequence of samples from one [`DriverChannelReader::start_stream`].
///
/// Ends after `stop()`, after its terminal error item, or when the reader is
/// dropped.
#[derive(Debug)]
pub struct SampleStream {
    rx: mpsc::Receiver<StreamItem>,
    gate: Arc<StreamGate>,
    finished: bool,
}

impl SampleStream {
    /// Stop this stream's transfer loop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            gate: self.gate.clone(),
        }
    }
}

impl Stream for SampleStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let gate = self.gate.clone();
        let stopped = gate.stopped.read();
        if *stopped {
            self.finished = true;
            self.rx.close();
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(error))) => {
                self.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockScopeConfig, MockScopeDevice};
    use crate::simulation::MockInstrument;
    use futures::StreamExt;

    fn mock_reader() -> DriverChannelReader {
        let device = MockScopeDevice::new(
            MockInstrument::new(),
            &MockScopeConfig {
                seed: Some(3),
                ..Default::default()
            },
        );
        DriverChannelReader::open(
            DriverEndpoint::Mock(device),
            ReaderOptions {
                poll_interval: Duration::from_millis(2),
                ..Default::default()
            },
            AcquisitionClock::new(),
        )
        .unwrap()
    }

    #[test]
    fn configure_rejects_unknown_and_dedupes() {
        let mut reader = mock_reader();

        let err = reader.configure_channels(&[-12, 1234]).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidChannel);

        reader.configure_channels(&[-12, -10, -12]).unwrap();
        assert_eq!(reader.channels(), &[-12, -10]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transfers_read_every_channel_in_order() {
        let mut reader = mock_reader();
        reader.configure_channels(&[-12, -10]).unwrap();
        let stream = reader.start_stream().unwrap();

        let samples: Vec<_> = stream.take(6).collect().await;
        reader.stop().await;

        let channels: Vec<_> = samples.iter().map(|s| s.as_ref().unwrap().channel).collect();
        assert_eq!(channels, vec![-12, -10, -12, -10, -12, -10]);
        let sequences: Vec<_> = samples.iter().map(|s| s.as_ref().unwrap().sequence).collect();
        assert_eq!(sequences, vec![0, 0, 1, 1, 2, 2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_while_streaming_is_busy() {
        let mut reader = mock_reader();
        reader.configure_channels(&[-12]).unwrap();
        let _stream = reader.start_stream().unwrap();

        let err = reader.start_stream().unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Busy);
        reader.stop().await;
        assert!(!reader.is_streaming());
    }
}
