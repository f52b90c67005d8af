//! Request encoding and reply parsing for the SXM remote-control exchange.
//!
//! Every request is a small Pascal program:
//!
//! ```text
//! begin
//!   ScanPara('Edit23', 0.1);
//! end.
//! ```
//!
//! Reads assign to a variable and `writeln` it. The host answers with text
//! lines; the first line echoes the program, numeric values may use a decimal
//! comma (`0,08`), and lines starting with `Error`/`ERR` mean the host refused
//! the request. Anything else is ignored.

use crate::error::CommandError;
use crate::parameter::ParameterAddress;

/// Statement sent during the handshake. Any reply proves the host is alive.
pub const HANDSHAKE_PROBE: &str = "writeln('ncafm-core');";

/// One host request, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// Liveness check sent on connect.
    Handshake,
    /// Write a parameter.
    Set {
        /// Target parameter.
        address: ParameterAddress,
        /// Value to write.
        value: f64,
    },
    /// Read a parameter.
    Get {
        /// Parameter to read.
        address: ParameterAddress,
    },
    /// `GetChannel(index)` through the host software.
    GetChannel(i32),
    /// Caller text placed verbatim inside the program.
    Raw(String),
}

impl HostCommand {
    /// Program body for this command.
    ///
    /// Fails with `Rejected` for requests the host could never satisfy, so they
    /// never reach the wire.
    pub fn statements(&self) -> Result<String, CommandError> {
        match self {
            HostCommand::Handshake => Ok(HANDSHAKE_PROBE.to_string()),
            HostCommand::Set { address, value } => {
                if !value.is_finite() {
                    return Err(CommandError::Rejected(format!(
                        "value {value} for {address} is not a finite number"
                    )));
                }
                Ok(match address {
                    ParameterAddress::ScanPara(code) => format!("ScanPara('{code}', {value});"),
                    ParameterAddress::FeedPara(item) => format!("FeedPara('{item}', {value});"),
                    ParameterAddress::DncPara(index) => format!("DNCPara({index}, {value});"),
                })
            }
            HostCommand::Get { address } => match address {
                ParameterAddress::ScanPara(code) => Ok(read_program(&format!(
                    "GetScanPara('{code}')"
                ))),
                ParameterAddress::FeedPara(item) => Ok(read_program(&format!(
                    "GetFeedPara('{item}')"
                ))),
                ParameterAddress::DncPara(_) => Err(CommandError::Rejected(format!(
                    "{address} is write-only on the host"
                ))),
            },
            HostCommand::GetChannel(index) => Ok(read_program(&format!("GetChannel({index})"))),
            HostCommand::Raw(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(CommandError::Rejected("empty command".into()));
                }
                Ok(text.to_string())
            }
        }
    }

    /// Full program text ready for the transport.
    pub fn encode(&self) -> Result<String, CommandError> {
        self.statements().map(|body| encode_program(&body))
    }

    /// The line the host echoes back for this command: the first line of the
    /// program body.
    pub fn echo(&self) -> Result<String, CommandError> {
        self.statements()
            .map(|body| body.lines().next().unwrap_or_default().trim().to_string())
    }
}

fn read_program(call: &str) -> String {
    format!("a:={call};\r\n  writeln(a);")
}

/// Wrap statements in the `begin ... end.` frame the host expects.
pub fn encode_program(statements: &str) -> String {
    format!("begin\r\n  {statements}\r\nend.\r\n")
}

/// Parse a host number, accepting a decimal comma.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.replace(',', ".").parse::<f64>().ok()
}

/// Format a number the way the host prints it.
pub fn format_number(value: f64) -> String {
    value.to_string().replace('.', ",")
}

/// Parsed host reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReply {
    lines: Vec<String>,
}

impl HostReply {
    /// Split raw reply text into non-empty trimmed lines.
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self { lines }
    }

    /// Reply lines, echo line first.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether this reply answers the program whose echo line is `echo`.
    ///
    /// Whitespace and letter case are not significant.
    pub fn echoes(&self, echo: &str) -> bool {
        let normalize = |text: &str| -> String {
            text.chars()
                .filter(|c| !c.is_whitespace())
                .flat_map(char::to_lowercase)
                .collect()
        };
        self.lines
            .first()
            .is_some_and(|first| normalize(first) == normalize(echo))
    }

    /// The host's rejection message, if any line reports an error.
    pub fn rejection(&self) -> Option<&str> {
        self.lines
            .iter()
            .map(String::as_str)
            .find(|line| line.starts_with("Error") || line.starts_with("ERR"))
    }

    /// First numeric value after the echo line. A reply that is only one line
    /// long is treated as value-only.
    pub fn value(&self) -> Option<f64> {
        self.lines
            .iter()
            .skip(1)
            .find_map(|line| parse_number(line))
            .or_else(|| match self.lines.as_slice() {
                [only] => parse_number(only),
                _ => None,
            })
    }

    /// Reply text after the echo line.
    pub fn text(&self) -> String {
        match self.lines.as_slice() {
            [] => String::new(),
            [only] => only.clone(),
            [_, rest @ ..] => rest.join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_matches_only_its_own_echo() {
        let get = HostCommand::Get {
            address: ParameterAddress::ScanPara("Edit23".into()),
        };
        let echo = get.echo().unwrap();
        assert_eq!(echo, "a:=GetScanPara('Edit23');");

        let own = HostReply::parse("a:=GetScanPara('Edit23');\r\n0,08\r\n");
        let spaced = HostReply::parse("A:= GetScanPara('Edit23');\r\n0,08\r\n");
        let other = HostReply::parse("a:=GetScanPara('Edit24');\r\n0,5\r\n");
        assert!(own.echoes(&echo));
        assert!(spaced.echoes(&echo));
        assert!(!other.echoes(&echo));
        assert!(!HostReply::parse("").echoes(&echo));
    }

    #[test]
    fn set_scan_parameter_program() {
        let program = HostCommand::Set {
            address: ParameterAddress::ScanPara("Edit23".into()),
            value: 0.1,
        }
        .encode()
        .unwrap();

        assert_eq!(program, "begin\r\n  ScanPara('Edit23', 0.1);\r\nend.\r\n");
    }

    #[test]
    fn set_dnc_parameter_program() {
        let body = HostCommand::Set {
            address: ParameterAddress::DncPara(4),
            value: 12.0,
        }
        .statements()
        .unwrap();

        assert_eq!(body, "DNCPara(4, 12);");
    }

    #[test]
    fn get_programs_assign_and_print() {
        let scan = HostCommand::Get {
            address: ParameterAddress::ScanPara("Edit24".into()),
        };
        let feed = HostCommand::Get {
            address: ParameterAddress::FeedPara("Ki".into()),
        };

        assert_eq!(
            scan.statements().unwrap(),
            "a:=GetScanPara('Edit24');\r\n  writeln(a);"
        );
        assert_eq!(
            feed.statements().unwrap(),
            "a:=GetFeedPara('Ki');\r\n  writeln(a);"
        );
        assert_eq!(
            HostCommand::GetChannel(-12).statements().unwrap(),
            "a:=GetChannel(-12);\r\n  writeln(a);"
        );
    }

    #[test]
    fn unsendable_requests_are_rejected_locally() {
        let dnc_read = HostCommand::Get {
            address: ParameterAddress::DncPara(3),
        };
        let nan = HostCommand::Set {
            address: ParameterAddress::ScanPara("Edit23".into()),
            value: f64::NAN,
        };

        assert!(matches!(dnc_read.statements(), Err(CommandError::Rejected(_))));
        assert!(matches!(nan.statements(), Err(CommandError::Rejected(_))));
        assert!(matches!(
            HostCommand::Raw("   ".into()).statements(),
            Err(CommandError::Rejected(_))
        ));
    }

    #[test]
    fn reply_value_skips_echo_and_accepts_decimal_comma() {
        let reply = HostReply::parse("a:=GetScanPara('Edit23');\r\n0,08\r\n");
        assert_eq!(reply.value(), Some(0.08));
        assert_eq!(reply.rejection(), None);
    }

    #[test]
    fn value_only_reply_is_accepted() {
        assert_eq!(HostReply::parse("42\r\n").value(), Some(42.0));
        assert_eq!(HostReply::parse("").value(), None);
    }

    #[test]
    fn error_lines_are_rejections() {
        let reply = HostReply::parse("ScanPara('Edit99', 1);\r\nError: unknown edit field\r\n");
        assert_eq!(reply.rejection(), Some("Error: unknown edit field"));

        let short = HostReply::parse("echo\r\nERR 12\r\n");
        assert_eq!(short.rejection(), Some("ERR 12"));
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let reply = HostReply::parse("echo\r\nready\r\n-1,5e-3\r\nextra\r\n");
        assert_eq!(reply.value(), Some(-0.0015));
        assert_eq!(reply.text(), "ready\n-1,5e-3\nextra");
    }

    #[test]
    fn number_formatting_uses_decimal_comma() {
        assert_eq!(format_number(0.08), "0,08");
        assert_eq!(parse_number(&format_number(-12.5)), Some(-12.5));
    }
}
