//! In-process simulated host.
//!
//! Interprets the subset of the SXM remote language the core emits
//! (`ScanPara`, `FeedPara`, `DNCPara`, the matching getters, `GetChannel` and
//! `writeln`) against a shared [`MockInstrument`]. Replies look like the real
//! host's: an echo line, then printed values with a decimal comma.
//!
//! Faults can be queued through a [`MockHostHandle`] to exercise the client's
//! failure paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::codec::{format_number, parse_number};
use super::transport::{HostTransport, TransportError};
use crate::parameter::ParameterAddress;
use crate::simulation::MockInstrument;

/// Default simulated request latency.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(5);

/// Fault applied to the next exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFault {
    /// Answer with `Error: <message>` without executing the program.
    Reject(String),
    /// Never answer. The reply is considered in flight until the next resync.
    NoReply,
    /// Drop the link. Every later exchange fails.
    Disconnect,
}

#[derive(Default)]
struct HostState {
    faults: VecDeque<MockFault>,
    programs: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
    stale_reply: Option<String>,
    disconnected: bool,
}

/// Simulated host transport.
pub struct MockHost {
    instrument: MockInstrument,
    latency: Duration,
    state: Arc<Mutex<HostState>>,
}

/// Test-side view of a [`MockHost`]: fault injection and request log.
#[derive(Clone)]
pub struct MockHostHandle {
    instrument: MockInstrument,
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    /// Host backed by `instrument` with the default latency.
    pub fn new(instrument: MockInstrument) -> Self {
        Self {
            instrument,
            latency: DEFAULT_LATENCY,
            state: Arc::new(Mutex::new(HostState::default())),
        }
    }

    /// Delay applied to every reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Handle for inspecting and scripting the host from tests.
    pub fn handle(&self) -> MockHostHandle {
        MockHostHandle {
            instrument: self.instrument.clone(),
            state: self.state.clone(),
        }
    }

    fn execute(&self, program: &str) -> String {
        let body = program_body(program);

        let mut lines = vec![echo_line(program)];
        let mut register: Option<f64> = None;

        for statement in body.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            match self.execute_statement(statement, &mut register) {
                Ok(Some(output)) => lines.push(output),
                Ok(None) => {}
                Err(message) => {
                    lines.push(format!("Error: {message}"));
                    break;
                }
            }
        }

        lines.join("\r\n")
    }

    fn execute_statement(
        &self,
        statement: &str,
        register: &mut Option<f64>,
    ) -> Result<Option<String>, String> {
        if let Some(call) = statement.strip_prefix("a:=") {
            let (verb, args) = split_call(call).ok_or_else(|| format!("syntax error: {call}"))?;
            let value = match verb {
                "GetScanPara" => self.read(ParameterAddress::ScanPara(unquote(&args)?))?,
                "GetFeedPara" => self.read(ParameterAddress::FeedPara(unquote(&args)?))?,
                "GetChannel" => {
                    let index = args
                        .trim()
                        .parse::<i32>()
                        .map_err(|_| format!("bad channel index {args}"))?;
                    self.instrument.channel(index)
                }
                other => return Err(format!("unknown function {other}")),
            };
            *register = Some(value);
            return Ok(None);
        }

        let (verb, args) =
            split_call(statement).ok_or_else(|| format!("syntax error: {statement}"))?;
        match verb {
            "ScanPara" | "FeedPara" => {
                let (name, value) = two_args(&args)?;
                let name = unquote(name)?;
                let address = if verb == "ScanPara" {
                    ParameterAddress::ScanPara(name)
                } else {
                    ParameterAddress::FeedPara(name)
                };
                self.instrument.write(&address, number(value)?);
                Ok(None)
            }
            "DNCPara" => {
                let (index, value) = two_args(&args)?;
                let index = index
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| format!("bad DNC index {index}"))?;
                self.instrument
                    .write(&ParameterAddress::DncPara(index), number(value)?);
                Ok(None)
            }
            "writeln" => {
                let args = args.trim();
                if args == "a" {
                    let value = register.ok_or("variable a is undefined")?;
                    Ok(Some(format_number(value)))
                } else {
                    Ok(Some(unquote(args)?))
                }
            }
            other => Err(format!("unknown procedure {other}")),
        }
    }

    fn read(&self, address: ParameterAddress) -> Result<f64, String> {
        self.instrument
            .read(&address)
            .ok_or_else(|| format!("unknown parameter {address}"))
    }
}

fn program_body(program: &str) -> &str {
    program
        .trim()
        .trim_start_matches("begin")
        .trim_end_matches("end.")
        .trim()
}

/// The host echoes the first line of the program body.
fn echo_line(program: &str) -> String {
    program_body(program)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn split_call(statement: &str) -> Option<(&str, String)> {
    let open = statement.find('(')?;
    let close = statement.rfind(')')?;
    if close < open {
        return None;
    }
    Some((
        statement[..open].trim(),
        statement[open + 1..close].to_string(),
    ))
}

fn two_args(args: &str) -> Result<(&str, &str), String> {
    args.split_once(',')
        .ok_or_else(|| format!("expected two arguments, got '{args}'"))
}

fn unquote(arg: &str) -> Result<String, String> {
    let arg = arg.trim();
    arg.strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .map(str::to_string)
        .ok_or_else(|| format!("expected quoted string, got {arg}"))
}

fn number(arg: &str) -> Result<f64, String> {
    parse_number(arg).ok_or_else(|| format!("invalid number {}", arg.trim()))
}

#[async_trait]
impl HostTransport for MockHost {
    async fn exchange(&mut self, program: &str) -> Result<String, TransportError> {
        let fault = {
            let mut state = self.state.lock();
            if state.disconnected {
                return Err(TransportError::Closed);
            }
            state.programs.push(program.to_string());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.faults.pop_front()
        };

        tokio::time::sleep(self.latency).await;

        let result = match fault {
            None => Ok(format!("{}\r\n", self.execute(program))),
            Some(MockFault::Reject(message)) => {
                Ok(format!("{}\r\nError: {message}\r\n", echo_line(program)))
            }
            Some(MockFault::NoReply) => {
                self.state.lock().stale_reply = Some(self.execute(program));
                // Dropped by the caller's timeout.
                std::future::pending::<()>().await;
                Err(TransportError::Closed)
            }
            Some(MockFault::Disconnect) => {
                self.state.lock().disconnected = true;
                Err(TransportError::Closed)
            }
        };

        self.state.lock().in_flight -= 1;
        result
    }

    async fn next_reply(&mut self) -> Result<String, TransportError> {
        // Every answered exchange carries its own reply; nothing else arrives.
        std::future::pending::<()>().await;
        Err(TransportError::Closed)
    }

    async fn resync(&mut self) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        // A cancelled exchange never decremented its counter.
        state.in_flight = 0;
        if state.disconnected {
            return Err(TransportError::Closed);
        }
        Ok(state.stale_reply.take().map(|reply| reply.len()).unwrap_or(0))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().disconnected = true;
        Ok(())
    }

    fn describe(&self) -> String {
        "mock://sxm".to_string()
    }
}

impl MockHostHandle {
    /// Queue a fault for a future exchange (FIFO).
    pub fn inject(&self, fault: MockFault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Every program received so far, in arrival order.
    pub fn programs(&self) -> Vec<String> {
        self.state.lock().programs.clone()
    }

    /// Highest number of exchanges observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Whether the client closed the link.
    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    /// The simulated instrument behind this host.
    pub fn instrument(&self) -> &MockInstrument {
        &self.instrument
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{encode_program, HostCommand, HostReply, HANDSHAKE_PROBE};

    async fn run(host: &mut MockHost, command: HostCommand) -> HostReply {
        let program = command.encode().unwrap();
        HostReply::parse(&host.exchange(&program).await.unwrap())
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_instrument() {
        let mut host = MockHost::new(MockInstrument::new()).with_latency(Duration::ZERO);
        let address = ParameterAddress::ScanPara("Edit24".into());

        run(
            &mut host,
            HostCommand::Set {
                address: address.clone(),
                value: 0.35,
            },
        )
        .await;
        let reply = run(&mut host, HostCommand::Get { address }).await;

        assert_eq!(reply.lines()[1], "0,35");
        assert_eq!(reply.value(), Some(0.35));
    }

    #[tokio::test]
    async fn unknown_parameter_is_rejected() {
        let mut host = MockHost::new(MockInstrument::new()).with_latency(Duration::ZERO);
        let reply = run(
            &mut host,
            HostCommand::Get {
                address: ParameterAddress::ScanPara("Edit99".into()),
            },
        )
        .await;

        assert_eq!(reply.rejection(), Some("Error: unknown parameter Edit99"));
    }

    #[tokio::test]
    async fn writeln_literal_answers_handshake() {
        let mut host = MockHost::new(MockInstrument::new()).with_latency(Duration::ZERO);
        let reply = run(&mut host, HostCommand::Handshake).await;
        assert_eq!(reply.text(), "ncafm-core");
    }

    #[tokio::test]
    async fn injected_rejection_skips_execution() {
        let instrument = MockInstrument::new();
        let mut host = MockHost::new(instrument.clone()).with_latency(Duration::ZERO);
        host.handle().inject(MockFault::Reject("locked".into()));

        let program = encode_program("DNCPara(4, 2.5);");
        let reply = HostReply::parse(&host.exchange(&program).await.unwrap());

        assert_eq!(reply.rejection(), Some("Error: locked"));
        assert_eq!(instrument.read(&ParameterAddress::DncPara(4)), Some(0.3));
    }

    #[tokio::test]
    async fn disconnect_fault_is_sticky() {
        let mut host = MockHost::new(MockInstrument::new()).with_latency(Duration::ZERO);
        let handle = host.handle();
        handle.inject(MockFault::Disconnect);

        let program = encode_program(HANDSHAKE_PROBE);
        assert!(host.exchange(&program).await.is_err());
        assert!(host.exchange(&program).await.is_err());
        assert!(handle.is_disconnected());
    }
}
