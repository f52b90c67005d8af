//! Protocol client against a scripted host on the other end of a byte stream.

use ncafm_core::clock::ProtocolClock;
use ncafm_core::error::{CommandError, ConnectError};
use ncafm_core::parameter::ParameterRegistry;
use ncafm_core::protocol::{
    ConnectOptions, HostEndpoint, MockHost, ProtocolClient, StreamTransport,
};
use ncafm_core::simulation::MockInstrument;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// What the scripted host does with one program.
enum Reply {
    Now(String),
    After(Duration, String),
    Silent,
    Hangup,
}

type Programs = Arc<Mutex<Vec<String>>>;

/// Serve programs from `stream`, answering the n-th one with `script(n, program)`.
fn scripted_host<F>(stream: DuplexStream, mut script: F) -> Programs
where
    F: FnMut(usize, &str) -> Reply + Send + 'static,
{
    let programs: Programs = Arc::default();
    let log = programs.clone();

    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(stream);
        let mut read = BufReader::new(read);
        let mut n = 0;

        loop {
            let mut program = String::new();
            loop {
                let mut line = String::new();
                if read.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                program.push_str(&line);
                if line.trim() == "end." {
                    break;
                }
            }
            log.lock().push(program.clone());

            match script(n, &program) {
                Reply::Now(text) => {
                    let _ = write.write_all(text.as_bytes()).await;
                }
                Reply::After(delay, text) => {
                    tokio::time::sleep(delay).await;
                    let _ = write.write_all(text.as_bytes()).await;
                }
                Reply::Silent => {}
                Reply::Hangup => return,
            }
            n += 1;
        }
    });

    programs
}

fn handshake_reply() -> Reply {
    Reply::Now("writeln('ncafm-core');\r\nncafm-core\r\n\r\n".to_string())
}

fn options(request_timeout: Duration) -> ConnectOptions {
    ConnectOptions {
        handshake_timeout: Duration::from_millis(200),
        request_timeout,
    }
}

async fn client_over(
    stream: DuplexStream,
    request_timeout: Duration,
) -> Result<ProtocolClient, ConnectError> {
    ProtocolClient::with_transport(
        Box::new(StreamTransport::new(stream, "duplex")),
        options(request_timeout),
        Arc::new(ParameterRegistry::with_defaults()),
        ProtocolClock::new(),
    )
    .await
}

#[tokio::test]
async fn get_parses_decimal_comma_and_updates_cache() {
    let (ours, theirs) = tokio::io::duplex(1024);
    let programs = scripted_host(theirs, |n, _| match n {
        0 => handshake_reply(),
        _ => Reply::Now("a:=GetScanPara('Edit23');\r\n0,125\r\n\r\n".to_string()),
    });
    let client = client_over(ours, Duration::from_secs(1)).await.unwrap();

    let value = client.get_parameter("amp_ref").await.unwrap();

    assert_eq!(value, 0.125);
    assert_eq!(
        client.registry().handle("amp_ref").unwrap().last_known(),
        Some(0.125)
    );
    let sent = programs.lock();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].contains("a:=GetScanPara('Edit23');"));
    assert!(sent[1].contains("writeln(a);"));
}

#[tokio::test]
async fn set_sends_host_program_and_acknowledges() {
    let (ours, theirs) = tokio::io::duplex(1024);
    let programs = scripted_host(theirs, |n, _| match n {
        0 => handshake_reply(),
        _ => Reply::Now("ScanPara('Edit24', 0.25);\r\n\r\n".to_string()),
    });
    let client = client_over(ours, Duration::from_secs(1)).await.unwrap();

    let ack = client.set_parameter("amp_ki", 0.25).await.unwrap();

    assert_eq!(ack.parameter, "amp_ki");
    assert_eq!(ack.value, 0.25);
    assert!(ack.acknowledged_at >= ack.issued_at);
    assert_eq!(
        programs.lock()[1],
        "begin\r\n  ScanPara('Edit24', 0.25);\r\nend.\r\n"
    );
}

#[tokio::test]
async fn host_error_line_is_a_rejection() {
    let (ours, theirs) = tokio::io::duplex(1024);
    scripted_host(theirs, |n, _| match n {
        0 => handshake_reply(),
        _ => Reply::Now("ScanPara('Edit23', 9);\r\nError: value out of range\r\n\r\n".to_string()),
    });
    let client = client_over(ours, Duration::from_secs(1)).await.unwrap();

    let err = client.set_parameter("amp_ref", 9.0).await.unwrap_err();

    match err {
        CommandError::Rejected(reason) => assert!(reason.contains("out of range")),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(
        client.registry().handle("amp_ref").unwrap().last_known(),
        None
    );
    assert!(!client.is_closed());
}

#[tokio::test]
async fn late_reply_is_discarded_after_timeout() {
    let (ours, theirs) = tokio::io::duplex(1024);
    scripted_host(theirs, |n, _| match n {
        0 => handshake_reply(),
        1 => Reply::After(
            Duration::from_millis(250),
            "a:=GetScanPara('Edit23');\r\n1,5\r\n\r\n".to_string(),
        ),
        _ => Reply::Now("a:=GetScanPara('Edit23');\r\n2,5\r\n\r\n".to_string()),
    });
    let client = client_over(ours, Duration::from_millis(100)).await.unwrap();

    let err = client.get_parameter("amp_ref").await.unwrap_err();
    assert_eq!(err, CommandError::Timeout(Duration::from_millis(100)));
    assert!(!client.is_closed());

    // Let the stale reply land in the stream.
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(client.get_parameter("amp_ref").await.unwrap(), 2.5);
}

#[tokio::test]
async fn late_reply_is_never_taken_by_the_next_request() {
    let (ours, theirs) = tokio::io::duplex(1024);
    scripted_host(theirs, |n, _| match n {
        0 => handshake_reply(),
        // Answers after the client gave up and sent the next program.
        1 => Reply::After(
            Duration::from_millis(300),
            "a:=GetScanPara('Edit23');\r\n0,08\r\n\r\n".to_string(),
        ),
        _ => Reply::Now("a:=GetScanPara('Edit24');\r\n0,5\r\n\r\n".to_string()),
    });
    let client = client_over(ours, Duration::from_millis(200)).await.unwrap();

    let err = client.get_parameter("amp_ref").await.unwrap_err();
    assert_eq!(err, CommandError::Timeout(Duration::from_millis(200)));

    // No pause: the stale amp_ref reply lands ahead of this request's answer.
    assert_eq!(client.get_parameter("amp_ki").await.unwrap(), 0.5);
    assert_eq!(
        client.registry().handle("amp_ref").unwrap().last_known(),
        None
    );
    assert_eq!(
        client.registry().handle("amp_ki").unwrap().last_known(),
        Some(0.5)
    );
}

#[tokio::test]
async fn late_set_reply_does_not_acknowledge_a_different_value() {
    let (ours, theirs) = tokio::io::duplex(1024);
    scripted_host(theirs, |n, _| match n {
        0 => handshake_reply(),
        1 => Reply::After(
            Duration::from_millis(300),
            "ScanPara('Edit24', 12);\r\n\r\n".to_string(),
        ),
        _ => Reply::Silent,
    });
    let client = client_over(ours, Duration::from_millis(200)).await.unwrap();

    assert!(matches!(
        client.set_parameter("amp_ki", 12.0).await,
        Err(CommandError::Timeout(_))
    ));
    // The restore is never answered; the step's late reply must not count.
    assert!(matches!(
        client.set_parameter("amp_ki", 10.0).await,
        Err(CommandError::Timeout(_))
    ));
    assert_eq!(
        client.registry().handle("amp_ki").unwrap().last_known(),
        None
    );
}

#[tokio::test]
async fn handshake_measures_the_first_round_trip() {
    let host = MockHost::new(MockInstrument::new()).with_latency(Duration::from_millis(30));
    let client = ProtocolClient::connect(
        HostEndpoint::Mock(host),
        ConnectOptions::default(),
        Arc::new(ParameterRegistry::with_defaults()),
        ProtocolClock::new(),
    )
    .await
    .unwrap();

    let round_trip = client.last_round_trip().unwrap();
    assert!(round_trip >= Duration::from_millis(30));
}

#[tokio::test]
async fn unanswered_handshake_times_out() {
    let (ours, theirs) = tokio::io::duplex(1024);
    scripted_host(theirs, |_, _| Reply::Silent);

    let err = client_over(ours, Duration::from_secs(1)).await.unwrap_err();

    assert_eq!(err, ConnectError::Timeout(Duration::from_millis(200)));
}

#[tokio::test]
async fn host_hangup_loses_the_connection() {
    let (ours, theirs) = tokio::io::duplex(1024);
    scripted_host(theirs, |n, _| match n {
        0 => handshake_reply(),
        _ => Reply::Hangup,
    });
    let client = client_over(ours, Duration::from_secs(1)).await.unwrap();

    let err = client.get_parameter("amp_kp").await.unwrap_err();
    assert!(matches!(err, CommandError::ConnectionLost(_)));
    assert!(client.is_closed());

    let again = client.set_parameter("amp_kp", 0.1).await.unwrap_err();
    assert!(matches!(again, CommandError::ConnectionLost(_)));
}

#[tokio::test]
async fn unreachable_tcp_host_is_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = ProtocolClient::connect(
        HostEndpoint::Tcp(address),
        ConnectOptions::default(),
        Arc::new(ParameterRegistry::with_defaults()),
        ProtocolClock::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ConnectError::HostUnavailable(_)));
}

#[tokio::test]
async fn concurrent_callers_are_serialized() {
    let host = MockHost::new(MockInstrument::new()).with_latency(Duration::from_millis(2));
    let handle = host.handle();
    let client = Arc::new(
        ProtocolClient::connect(
            HostEndpoint::Mock(host),
            ConnectOptions::default(),
            Arc::new(ParameterRegistry::with_defaults()),
            ProtocolClock::new(),
        )
        .await
        .unwrap(),
    );

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.set_parameter("pll_kp", i as f64).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(handle.max_in_flight(), 1);
    // Handshake plus one program per caller.
    assert_eq!(handle.programs().len(), 9);
}

#[tokio::test]
async fn raw_command_returns_text_after_echo() {
    let host = MockHost::new(MockInstrument::new()).with_latency(Duration::ZERO);
    let client = ProtocolClient::connect(
        HostEndpoint::Mock(host),
        ConnectOptions::default(),
        Arc::new(ParameterRegistry::with_defaults()),
        ProtocolClock::new(),
    )
    .await
    .unwrap();

    let reply = client
        .send_raw_command("a:=GetScanPara('Edit27'); writeln(a);")
        .await
        .unwrap();

    assert_eq!(reply, "1");
}

#[tokio::test]
async fn channel_read_goes_through_get_channel() {
    let (ours, theirs) = tokio::io::duplex(1024);
    let programs = scripted_host(theirs, |n, _| match n {
        0 => handshake_reply(),
        _ => Reply::Now("a:=GetChannel(0);\r\n-1,5E-9\r\n\r\n".to_string()),
    });
    let client = client_over(ours, Duration::from_secs(1)).await.unwrap();

    let value = client.read_channel(0).await.unwrap();

    assert_eq!(value, -1.5e-9);
    assert!(programs.lock()[1].contains("a:=GetChannel(0);"));
}
