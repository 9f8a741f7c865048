//! Modbus-TCP probe implementation using raw MBAP frames.

use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::classify::{classify_modbus, FailureCause, ModbusAttempt, ModbusReply};
use super::ProbeOutcome;
use crate::db::{ProbeSettings, RegisterKind};

pub const DEFAULT_MODBUS_PORT: u16 = 502;
const DEFAULT_UNIT_ID: u8 = 1;
const MBAP_HEADER_LEN: usize = 7;
/// Largest PDU a Modbus-TCP frame may carry.
const MAX_PDU_LEN: usize = 253;

/// Modbus exchange errors.
#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("malformed Modbus response: {0}")]
    Malformed(String),
}

impl ModbusError {
    fn cause(&self) -> FailureCause {
        match self {
            ModbusError::Io(e) => FailureCause::from_io(e),
            ModbusError::Malformed(_) => FailureCause::from_text(self.to_string()),
        }
    }
}

/// A register read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub unit_id: u8,
    pub kind: RegisterKind,
    pub address: u16,
    pub quantity: u16,
}

impl ReadRequest {
    fn function_code(&self) -> u8 {
        match self.kind {
            RegisterKind::Holding => 0x03,
            RegisterKind::Input => 0x04,
        }
    }
}

/// Run a Modbus-TCP probe: read the configured registers once within `timeout`.
///
/// Any reply frame counts as a live device, whatever its payload.
pub async fn run_modbus_probe(address: &str, settings: &ProbeSettings, timeout: Duration) -> ProbeOutcome {
    let target_addr = if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, settings.port.unwrap_or(DEFAULT_MODBUS_PORT))
    };

    let start = Instant::now();
    let attempt = match tokio::time::timeout(timeout, modbus_attempt(&target_addr, settings)).await {
        Ok(attempt) => attempt,
        Err(_) => ModbusAttempt::Failed(FailureCause::timeout(format!(
            "no reply from {} within {:?}",
            target_addr, timeout
        ))),
    };
    let outcome = classify_modbus(&attempt, start.elapsed());

    tracing::debug!(
        "Modbus probe {} -> {} ({} ms)",
        target_addr,
        outcome.status,
        outcome.duration_ms
    );
    outcome
}

async fn modbus_attempt(target_addr: &str, settings: &ProbeSettings) -> ModbusAttempt {
    let mut stream = match TcpStream::connect(target_addr).await {
        Ok(s) => s,
        Err(e) => return ModbusAttempt::Failed(FailureCause::from_io(&e)),
    };

    let registers = if settings.registers.is_empty() {
        vec![0]
    } else {
        settings.registers.clone()
    };

    let mut collected: Option<ModbusReply> = None;
    for address in registers {
        let request = ReadRequest {
            unit_id: settings.unit_id.unwrap_or(DEFAULT_UNIT_ID),
            kind: settings.register_kind,
            address,
            quantity: settings.quantity.unwrap_or(1),
        };

        match exchange(&mut stream, rand::random(), &request).await {
            Ok(Some(reply)) => {
                collected = Some(match collected {
                    Some(prev) => prev.merge(reply),
                    None => reply,
                });
            }
            Ok(None) => break,
            Err(e) => {
                if collected.is_none() {
                    return ModbusAttempt::Failed(e.cause());
                }
                tracing::debug!("Modbus read of register {} failed after earlier reply: {}", address, e);
                break;
            }
        }
    }

    match collected {
        Some(reply) => ModbusAttempt::Response(reply),
        None => ModbusAttempt::NoResponse,
    }
}

/// Send one request and read its reply. `Ok(None)` means the peer closed first.
async fn exchange(
    stream: &mut TcpStream,
    transaction_id: u16,
    request: &ReadRequest,
) -> Result<Option<ModbusReply>, ModbusError> {
    stream.write_all(&build_read_request(transaction_id, request)).await?;

    let mut header = [0u8; MBAP_HEADER_LEN];
    let first = stream.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    stream.read_exact(&mut header[first..]).await?;

    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length < 2 || length - 1 > MAX_PDU_LEN {
        return Err(ModbusError::Malformed(format!("invalid length field {}", length)));
    }

    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).await?;

    parse_read_response(transaction_id, request, &header, &pdu).map(Some)
}

/// Build a read-registers request frame (MBAP header + PDU).
fn build_read_request(transaction_id: u16, request: &ReadRequest) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // Protocol: Modbus
    frame.extend_from_slice(&6u16.to_be_bytes()); // Unit id + 5 byte PDU
    frame.push(request.unit_id);
    frame.push(request.function_code());
    frame.extend_from_slice(&request.address.to_be_bytes());
    frame.extend_from_slice(&request.quantity.to_be_bytes());
    frame
}

fn parse_read_response(
    transaction_id: u16,
    request: &ReadRequest,
    header: &[u8; MBAP_HEADER_LEN],
    pdu: &[u8],
) -> Result<ModbusReply, ModbusError> {
    let resp_tx_id = u16::from_be_bytes([header[0], header[1]]);
    if resp_tx_id != transaction_id {
        return Err(ModbusError::Malformed(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, transaction_id
        )));
    }

    let function = pdu[0];
    if function == request.function_code() | 0x80 {
        return Ok(ModbusReply {
            registers: Vec::new(),
            exception: Some(pdu.get(1).copied().unwrap_or(0)),
        });
    }
    if function != request.function_code() {
        return Err(ModbusError::Malformed(format!("unexpected function code {:#04x}", function)));
    }

    // Byte count may be missing or short on some gateways; keep what decodes.
    let byte_count = pdu.get(1).copied().unwrap_or(0) as usize;
    let data = &pdu[2.min(pdu.len())..];
    let usable = byte_count.min(data.len());
    let registers = data[..usable]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    Ok(ModbusReply {
        registers,
        exception: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ErrorKind, Status};
    use tokio::net::TcpListener;

    fn holding(address: u16, quantity: u16) -> ReadRequest {
        ReadRequest {
            unit_id: 1,
            kind: RegisterKind::Holding,
            address,
            quantity,
        }
    }

    /// Accept one connection and answer each request with `pdu` under the echoed MBAP id.
    async fn fake_device(pdu: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 12];
                while socket.read_exact(&mut request).await.is_ok() {
                    let mut reply = Vec::new();
                    reply.extend_from_slice(&request[0..2]);
                    reply.extend_from_slice(&[0, 0]);
                    reply.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
                    reply.push(request[6]);
                    reply.extend_from_slice(&pdu);
                    if socket.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            }
        });
        addr.to_string()
    }

    #[test]
    fn test_build_read_request() {
        let frame = build_read_request(0x1234, &holding(100, 2));
        assert_eq!(frame, vec![0x12, 0x34, 0, 0, 0, 6, 1, 0x03, 0, 100, 0, 2]);

        let input = ReadRequest {
            kind: RegisterKind::Input,
            ..holding(0, 1)
        };
        assert_eq!(build_read_request(1, &input)[7], 0x04);
    }

    #[test]
    fn test_parse_read_response() {
        let req = holding(0, 2);
        let header = [0, 7, 0, 0, 0, 7, 1];
        let reply = parse_read_response(7, &req, &header, &[0x03, 4, 0, 10, 0, 20]).unwrap();
        assert_eq!(reply.registers, vec![10, 20]);

        let exception = parse_read_response(7, &req, &header, &[0x83, 2]).unwrap();
        assert_eq!(exception.exception, Some(2));

        assert!(parse_read_response(8, &req, &header, &[0x03, 0]).is_err());
        assert!(parse_read_response(7, &req, &header, &[0x10, 0]).is_err());
    }

    #[tokio::test]
    async fn test_modbus_probe_zero_data_points_is_online() {
        let addr = fake_device(vec![0x03, 0]).await;
        let outcome = run_modbus_probe(&addr, &ProbeSettings::default(), Duration::from_secs(2)).await;
        assert_eq!(outcome.status, Status::Online);
        assert_eq!(outcome.error_kind, None);
        assert!(outcome.message.contains("no register data"));
    }

    #[tokio::test]
    async fn test_modbus_probe_reads_multiple_registers() {
        let addr = fake_device(vec![0x03, 2, 0, 42]).await;
        let settings = ProbeSettings {
            registers: vec![0, 10, 20],
            ..Default::default()
        };
        let outcome = run_modbus_probe(&addr, &settings, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, Status::Online);
        assert!(outcome.message.contains("3 registers"));
    }

    #[tokio::test]
    async fn test_modbus_probe_no_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 12];
                let _ = socket.read_exact(&mut request).await;
                // Close without answering.
            }
        });

        let outcome = run_modbus_probe(&addr.to_string(), &ProbeSettings::default(), Duration::from_secs(2)).await;
        assert_eq!(outcome.status, Status::Offline);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ModbusNoResponse));
    }

    #[tokio::test]
    async fn test_modbus_probe_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = run_modbus_probe(&addr.to_string(), &ProbeSettings::default(), Duration::from_secs(2)).await;
        assert_eq!(outcome.status, Status::Offline);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ModbusConnectionRefused));
    }

    #[tokio::test]
    async fn test_modbus_probe_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(socket);
            }
        });

        let outcome = run_modbus_probe(&addr.to_string(), &ProbeSettings::default(), Duration::from_millis(200)).await;
        assert_eq!(outcome.status, Status::Offline);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ModbusTimeout));
        assert!(outcome.is_timeout);
    }
}
