//! ILPv4 packet codec
//!
//! Packets are framed as a one-byte type tag followed by an OER
//! variable-length envelope. Amounts are fixed 8-byte big-endian integers,
//! expiries are 17-character `YYYYMMDDHHMMSSmmm` UTC timestamps, and
//! addresses, messages, and data are length-prefixed octet strings.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

const TYPE_PREPARE: u8 = 12;
const TYPE_FULFILL: u8 = 13;
const TYPE_REJECT: u8 = 14;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// Maximum accepted envelope size
pub const MAX_PACKET_BYTES: usize = 32_767;

/// Packet decoding/encoding failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Input ended before the structure was complete
    #[error("unexpected end of packet")]
    UnexpectedEnd,
    /// Unknown packet type tag
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    /// Envelope length disagrees with the content
    #[error("invalid length prefix")]
    InvalidLength,
    /// Timestamp field is not a valid ILP timestamp
    #[error("invalid timestamp")]
    InvalidTimestamp,
    /// A text field is not valid UTF-8
    #[error("invalid utf-8 in packet field")]
    InvalidUtf8,
    /// Error code field is not three ASCII characters
    #[error("invalid error code")]
    InvalidErrorCode,
}

/// Typed ILP error codes used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// F00: generic sender error
    BadRequest,
    /// F01: the packet could not be parsed
    InvalidPacket,
    /// F02: no route to the destination
    Unreachable,
    /// F05: the fulfillment did not hash to the condition
    WrongCondition,
    /// F06: the destination rejected an unexpected payment
    UnexpectedPayment,
    /// F08: the amount exceeds the peer's maximum packet amount
    AmountTooLarge,
    /// F99: application-level rejection
    ApplicationError,
    /// T00: temporary internal failure
    InternalError,
    /// T01: the next hop is unavailable
    PeerBusy,
    /// T04: insufficient liquidity to forward
    InsufficientLiquidity,
    /// T05: the sender exceeded its packet rate
    RateLimitExceeded,
    /// R00: the transfer timed out before fulfillment
    TransferTimedOut,
}

impl ErrorCode {
    /// Three-character wire code
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest => "F00",
            Self::InvalidPacket => "F01",
            Self::Unreachable => "F02",
            Self::WrongCondition => "F05",
            Self::UnexpectedPayment => "F06",
            Self::AmountTooLarge => "F08",
            Self::ApplicationError => "F99",
            Self::InternalError => "T00",
            Self::PeerBusy => "T01",
            Self::InsufficientLiquidity => "T04",
            Self::RateLimitExceeded => "T05",
            Self::TransferTimedOut => "R00",
        }
    }

    /// Parse a wire code; unknown codes map onto the closest class
    pub fn parse(code: &str) -> Self {
        match code {
            "F00" => Self::BadRequest,
            "F01" => Self::InvalidPacket,
            "F02" => Self::Unreachable,
            "F05" => Self::WrongCondition,
            "F06" => Self::UnexpectedPayment,
            "F08" => Self::AmountTooLarge,
            "T00" => Self::InternalError,
            "T01" => Self::PeerBusy,
            "T04" => Self::InsufficientLiquidity,
            "T05" => Self::RateLimitExceeded,
            "R00" => Self::TransferTimedOut,
            c if c.starts_with('T') => Self::InternalError,
            c if c.starts_with('R') => Self::TransferTimedOut,
            _ => Self::ApplicationError,
        }
    }

    /// Whether a retry may succeed (T and R classes)
    pub fn is_temporary(&self) -> bool {
        !self.code().starts_with('F')
    }
}

/// An ILP prepare packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    /// Amount in the sending peer's asset
    pub amount: u64,
    /// Hold expiry
    pub expires_at: DateTime<Utc>,
    /// SHA-256 condition the fulfillment must hash to
    pub execution_condition: [u8; 32],
    /// Destination ILP address
    pub destination: String,
    /// End-to-end data (STREAM frames)
    pub data: Vec<u8>,
}

/// An ILP fulfill packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfill {
    /// Preimage of the prepare's execution condition
    pub fulfillment: [u8; 32],
    /// End-to-end data
    pub data: Vec<u8>,
}

/// An ILP reject packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// Error code
    pub code: ErrorCode,
    /// Address of the node that rejected
    pub triggered_by: String,
    /// Human-readable message
    pub message: String,
    /// Machine-readable data (e.g. the F08 amount ceiling)
    pub data: Vec<u8>,
}

impl Reject {
    /// Build a reject with empty data
    pub fn new(code: ErrorCode, triggered_by: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            triggered_by: triggered_by.into(),
            message: message.into(),
            data: Vec::new(),
        }
    }
}

/// Any ILP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Prepare
    Prepare(Prepare),
    /// Fulfill
    Fulfill(Fulfill),
    /// Reject
    Reject(Reject),
}

fn write_length(out: &mut Vec<u8>, length: usize) {
    if length < 128 {
        out.push(length as u8);
    } else {
        let bytes = length.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let significant = &bytes[skip..];
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
}

fn read_length(input: &[u8], pos: &mut usize) -> Result<usize, PacketError> {
    let first = *input.get(*pos).ok_or(PacketError::UnexpectedEnd)?;
    *pos += 1;
    if first < 128 {
        return Ok(first as usize);
    }
    let num_bytes = (first & 0x7f) as usize;
    if num_bytes == 0 || num_bytes > 8 {
        return Err(PacketError::InvalidLength);
    }
    let mut length: usize = 0;
    for _ in 0..num_bytes {
        let byte = *input.get(*pos).ok_or(PacketError::UnexpectedEnd)?;
        *pos += 1;
        length = length
            .checked_mul(256)
            .and_then(|l| l.checked_add(byte as usize))
            .ok_or(PacketError::InvalidLength)?;
    }
    if length > MAX_PACKET_BYTES {
        return Err(PacketError::InvalidLength);
    }
    Ok(length)
}

fn write_var_octets(out: &mut Vec<u8>, bytes: &[u8]) {
    write_length(out, bytes.len());
    out.extend_from_slice(bytes);
}

fn read_var_octets<'a>(input: &'a [u8], pos: &mut usize) -> Result<&'a [u8], PacketError> {
    let length = read_length(input, pos)?;
    let end = pos.checked_add(length).ok_or(PacketError::InvalidLength)?;
    if end > input.len() {
        return Err(PacketError::UnexpectedEnd);
    }
    let slice = &input[*pos..end];
    *pos = end;
    Ok(slice)
}

fn read_fixed<'a>(input: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], PacketError> {
    let end = pos.checked_add(n).ok_or(PacketError::InvalidLength)?;
    if end > input.len() {
        return Err(PacketError::UnexpectedEnd);
    }
    let slice = &input[*pos..end];
    *pos = end;
    Ok(slice)
}

impl Packet {
    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let (type_byte, contents) = match self {
            Packet::Prepare(p) => {
                let mut contents = Vec::with_capacity(64 + p.destination.len() + p.data.len());
                contents.extend_from_slice(&p.amount.to_be_bytes());
                contents.extend_from_slice(
                    p.expires_at.format(TIMESTAMP_FORMAT).to_string().as_bytes(),
                );
                contents.extend_from_slice(&p.execution_condition);
                write_var_octets(&mut contents, p.destination.as_bytes());
                write_var_octets(&mut contents, &p.data);
                (TYPE_PREPARE, contents)
            }
            Packet::Fulfill(f) => {
                let mut contents = Vec::with_capacity(33 + f.data.len());
                contents.extend_from_slice(&f.fulfillment);
                write_var_octets(&mut contents, &f.data);
                (TYPE_FULFILL, contents)
            }
            Packet::Reject(r) => {
                let mut contents =
                    Vec::with_capacity(4 + r.triggered_by.len() + r.message.len() + r.data.len());
                contents.extend_from_slice(r.code.code().as_bytes());
                write_var_octets(&mut contents, r.triggered_by.as_bytes());
                write_var_octets(&mut contents, r.message.as_bytes());
                write_var_octets(&mut contents, &r.data);
                (TYPE_REJECT, contents)
            }
        };
        let mut out = Vec::with_capacity(contents.len() + 4);
        out.push(type_byte);
        write_var_octets(&mut out, &contents);
        out
    }

    /// Parse wire bytes
    pub fn decode(input: &[u8]) -> Result<Packet, PacketError> {
        let mut pos = 0;
        let type_byte = *input.get(pos).ok_or(PacketError::UnexpectedEnd)?;
        pos += 1;
        let contents = read_var_octets(input, &mut pos)?;
        match type_byte {
            TYPE_PREPARE => Self::decode_prepare(contents).map(Packet::Prepare),
            TYPE_FULFILL => Self::decode_fulfill(contents).map(Packet::Fulfill),
            TYPE_REJECT => Self::decode_reject(contents).map(Packet::Reject),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    fn decode_prepare(contents: &[u8]) -> Result<Prepare, PacketError> {
        let mut pos = 0;
        let amount_bytes: [u8; 8] = read_fixed(contents, &mut pos, 8)?
            .try_into()
            .map_err(|_| PacketError::UnexpectedEnd)?;
        let timestamp = read_fixed(contents, &mut pos, 17)?;
        let timestamp = std::str::from_utf8(timestamp).map_err(|_| PacketError::InvalidTimestamp)?;
        let expires_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .map_err(|_| PacketError::InvalidTimestamp)?
            .and_utc();
        let execution_condition: [u8; 32] = read_fixed(contents, &mut pos, 32)?
            .try_into()
            .map_err(|_| PacketError::UnexpectedEnd)?;
        let destination = std::str::from_utf8(read_var_octets(contents, &mut pos)?)
            .map_err(|_| PacketError::InvalidUtf8)?
            .to_string();
        let data = read_var_octets(contents, &mut pos)?.to_vec();
        Ok(Prepare {
            amount: u64::from_be_bytes(amount_bytes),
            expires_at,
            execution_condition,
            destination,
            data,
        })
    }

    fn decode_fulfill(contents: &[u8]) -> Result<Fulfill, PacketError> {
        let mut pos = 0;
        let fulfillment: [u8; 32] = read_fixed(contents, &mut pos, 32)?
            .try_into()
            .map_err(|_| PacketError::UnexpectedEnd)?;
        let data = read_var_octets(contents, &mut pos)?.to_vec();
        Ok(Fulfill { fulfillment, data })
    }

    fn decode_reject(contents: &[u8]) -> Result<Reject, PacketError> {
        let mut pos = 0;
        let code = read_fixed(contents, &mut pos, 3)?;
        let code = std::str::from_utf8(code).map_err(|_| PacketError::InvalidErrorCode)?;
        let triggered_by = std::str::from_utf8(read_var_octets(contents, &mut pos)?)
            .map_err(|_| PacketError::InvalidUtf8)?
            .to_string();
        let message = std::str::from_utf8(read_var_octets(contents, &mut pos)?)
            .map_err(|_| PacketError::InvalidUtf8)?
            .to_string();
        let data = read_var_octets(contents, &mut pos)?.to_vec();
        Ok(Reject {
            code: ErrorCode::parse(code),
            triggered_by,
            message,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_prepare() -> Prepare {
        Prepare {
            amount: 1_000_000,
            expires_at: Utc.with_ymd_and_hms(2026, 8, 2, 12, 30, 45).unwrap()
                + chrono::Duration::milliseconds(123),
            execution_condition: [9u8; 32],
            destination: "test.engine.alice".to_string(),
            data: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_prepare_roundtrip() {
        let prepare = sample_prepare();
        let encoded = Packet::Prepare(prepare.clone()).encode();
        assert_eq!(encoded[0], TYPE_PREPARE);
        match Packet::decode(&encoded).unwrap() {
            Packet::Prepare(decoded) => assert_eq!(decoded, prepare),
            other => panic!("expected prepare, got {:?}", other),
        }
    }

    #[test]
    fn test_fulfill_roundtrip() {
        let fulfill = Fulfill {
            fulfillment: [3u8; 32],
            data: Vec::new(),
        };
        let encoded = Packet::Fulfill(fulfill.clone()).encode();
        match Packet::decode(&encoded).unwrap() {
            Packet::Fulfill(decoded) => assert_eq!(decoded, fulfill),
            other => panic!("expected fulfill, got {:?}", other),
        }
    }

    #[test]
    fn test_reject_roundtrip_and_code_mapping() {
        let reject = Reject {
            code: ErrorCode::AmountTooLarge,
            triggered_by: "test.engine".to_string(),
            message: "amount exceeds maximum packet amount".to_string(),
            data: 5000u64.to_be_bytes().to_vec(),
        };
        let encoded = Packet::Reject(reject.clone()).encode();
        match Packet::decode(&encoded).unwrap() {
            Packet::Reject(decoded) => {
                assert_eq!(decoded.code, ErrorCode::AmountTooLarge);
                assert_eq!(decoded.data, reject.data);
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[test]
    fn test_large_data_uses_multibyte_length() {
        let mut prepare = sample_prepare();
        prepare.data = vec![0xab; 1000];
        let encoded = Packet::Prepare(prepare.clone()).encode();
        match Packet::decode(&encoded).unwrap() {
            Packet::Prepare(decoded) => assert_eq!(decoded.data.len(), 1000),
            other => panic!("expected prepare, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_packet_is_rejected() {
        let encoded = Packet::Prepare(sample_prepare()).encode();
        for cut in [0, 1, 5, encoded.len() - 1] {
            assert!(Packet::decode(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let bytes = [99u8, 1, 0];
        assert_eq!(Packet::decode(&bytes), Err(PacketError::UnknownType(99)));
    }

    #[test]
    fn test_temporary_code_classification() {
        assert!(ErrorCode::PeerBusy.is_temporary());
        assert!(ErrorCode::InsufficientLiquidity.is_temporary());
        assert!(ErrorCode::TransferTimedOut.is_temporary());
        assert!(!ErrorCode::Unreachable.is_temporary());
        assert!(!ErrorCode::AmountTooLarge.is_temporary());
    }

    #[test]
    fn test_unknown_wire_code_maps_to_class() {
        assert_eq!(ErrorCode::parse("T99"), ErrorCode::InternalError);
        assert_eq!(ErrorCode::parse("R01"), ErrorCode::TransferTimedOut);
        assert_eq!(ErrorCode::parse("F42"), ErrorCode::ApplicationError);
    }
}
