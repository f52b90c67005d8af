//! Driver channel reader streaming from the simulated scope device.
//!
//! The transfer loop runs on a blocking thread, so these tests use the
//! multi-threaded runtime and real time.

use futures::StreamExt;
use ncafm_core::clock::AcquisitionClock;
use ncafm_core::driver::{
    DriverChannelReader, DriverEndpoint, MockScopeConfig, MockScopeDevice, ReaderOptions,
};
use ncafm_core::error::DriverErrorKind;
use ncafm_core::simulation::MockInstrument;
use std::collections::HashMap;
use std::time::Duration;

fn reader_with(config: MockScopeConfig) -> DriverChannelReader {
    let device = MockScopeDevice::new(MockInstrument::new(), &config);
    DriverChannelReader::open(
        DriverEndpoint::Mock(device),
        ReaderOptions {
            poll_interval: Duration::from_millis(2),
            stop_timeout: Duration::from_secs(1),
        },
        AcquisitionClock::new(),
    )
    .unwrap()
}

fn quiet_reader() -> DriverChannelReader {
    reader_with(MockScopeConfig {
        seed: Some(11),
        noise_counts: 0.0,
        fail_after_reads: None,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timestamps_increase_per_channel() {
    let mut reader = quiet_reader();
    reader.configure_channels(&[-12, -10, -13]).unwrap();
    let stream = reader.start_stream().unwrap();

    let samples: Vec<_> = stream
        .take(30)
        .map(|item| item.unwrap())
        .collect()
        .await;
    reader.stop().await;

    let mut last = HashMap::new();
    for sample in &samples {
        let previous = last.insert(sample.channel, (sample.timestamp, sample.sequence));
        if let Some((timestamp, sequence)) = previous {
            assert!(sample.timestamp > timestamp, "channel {} went backwards", sample.channel);
            assert_eq!(sample.sequence, sequence + 1);
        }
    }
    assert_eq!(last.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nothing_is_delivered_after_stop() {
    let mut reader = quiet_reader();
    reader.configure_channels(&[-12]).unwrap();
    let mut stream = reader.start_stream().unwrap();

    for _ in 0..3 {
        assert!(stream.next().await.unwrap().is_ok());
    }
    reader.stop().await;
    assert!(!reader.is_streaming());

    // Give a misbehaving worker time to push more.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(stream.next().await.is_none());
    assert!(stream.next().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_reader_can_restart_with_new_channels() {
    let mut reader = quiet_reader();
    reader.configure_channels(&[-12]).unwrap();
    let first = reader.start_stream().unwrap();
    let _ = first.take(2).collect::<Vec<_>>().await;
    reader.stop().await;

    reader.configure_channels(&[-9, 0]).unwrap();
    let second = reader.start_stream().unwrap();
    let samples: Vec<_> = second.take(6).map(|item| item.unwrap()).collect().await;
    reader.stop().await;

    let channels: Vec<_> = samples.iter().map(|s| s.channel).collect();
    assert_eq!(channels, vec![-9, 0, -9, 0, -9, 0]);
    // New stream, new sequence numbering.
    assert_eq!(samples[0].sequence, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transfer_failure_ends_stream_with_one_error() {
    let mut reader = reader_with(MockScopeConfig {
        seed: Some(5),
        noise_counts: 0.0,
        fail_after_reads: Some(5),
    });
    reader.configure_channels(&[-12, -10]).unwrap();
    let stream = reader.start_stream().unwrap();

    let items: Vec<_> = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream should end after the failure");

    let ok = items.iter().filter(|item| item.is_ok()).count();
    let errors: Vec<_> = items.iter().filter_map(|item| item.as_ref().err()).collect();
    assert_eq!(ok, 5);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].channel, -10);
    assert!(items.last().unwrap().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channels_cannot_change_while_streaming() {
    let mut reader = quiet_reader();
    reader.configure_channels(&[-12]).unwrap();
    let _stream = reader.start_stream().unwrap();

    let err = reader.configure_channels(&[-10]).unwrap_err();
    assert_eq!(err.kind, DriverErrorKind::Busy);
    let err = reader.start_stream().unwrap_err();
    assert_eq!(err.kind, DriverErrorKind::Busy);

    reader.stop().await;
    reader.configure_channels(&[-10]).unwrap();
}

#[test]
fn invalid_channel_selection_is_rejected() {
    let mut reader = quiet_reader();

    assert_eq!(
        reader.configure_channels(&[]).unwrap_err().kind,
        DriverErrorKind::InvalidChannel
    );
    assert_eq!(
        reader.configure_channels(&[-12, 77]).unwrap_err().kind,
        DriverErrorKind::InvalidChannel
    );
    assert!(reader.channels().is_empty());
}

#[test]
fn missing_device_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("SXM");

    let err = DriverChannelReader::open(
        DriverEndpoint::Device(path.to_string_lossy().into_owned()),
        ReaderOptions::default(),
        AcquisitionClock::new(),
    )
    .err()
    .unwrap();

    assert_eq!(err.kind, DriverErrorKind::Unavailable);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_handle_works_from_a_plain_thread() {
    let mut reader = quiet_reader();
    reader.configure_channels(&[-13]).unwrap();
    let mut stream = reader.start_stream().unwrap();
    assert!(stream.next().await.unwrap().is_ok());

    let handle = stream.stop_handle();
    std::thread::spawn(move || handle.stop()).join().unwrap();

    assert!(stream.next().await.is_none());
    assert!(!reader.is_streaming());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_reader_ends_the_stream() {
    let mut reader = quiet_reader();
    reader.configure_channels(&[-12]).unwrap();
    let mut stream = reader.start_stream().unwrap();
    assert!(stream.next().await.unwrap().is_ok());

    drop(reader);

    let rest = tokio::time::timeout(Duration::from_secs(2), async {
        while stream.next().await.is_some() {}
    })
    .await;
    assert!(rest.is_ok());
}
