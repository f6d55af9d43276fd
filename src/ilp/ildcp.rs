//! ILDCP: Interledger dynamic configuration
//!
//! A peer asks for its account configuration by preparing a packet to
//! `peer.config`. The responder fulfills with the peer's ILP address, asset
//! scale, and asset code. The fulfillment is 32 zero bytes, so the
//! condition is fixed.

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::packet::{Fulfill, PacketError, Prepare};

/// Destination address of ILDCP requests
pub const ILDCP_DESTINATION: &str = "peer.config";

/// The fixed all-zero ILDCP fulfillment
pub const ILDCP_FULFILLMENT: [u8; 32] = [0u8; 32];

/// Condition matching the all-zero fulfillment
pub fn ildcp_condition() -> [u8; 32] {
    let digest = Sha256::digest(ILDCP_FULFILLMENT);
    digest.into()
}

/// ILDCP decode failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IldcpError {
    /// Underlying OER failure
    #[error(transparent)]
    Packet(#[from] PacketError),
    /// Text field is not valid UTF-8
    #[error("invalid utf-8 in ILDCP field")]
    InvalidUtf8,
}

/// An ILDCP response payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IldcpResponse {
    /// The requesting peer's ILP address from our perspective
    pub ilp_address: String,
    /// Asset scale of the peering relationship
    pub asset_scale: u8,
    /// Asset code of the peering relationship
    pub asset_code: String,
}

fn write_var_octets(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.len() < 128 {
        out.push(bytes.len() as u8);
    } else {
        let len_bytes = bytes.len().to_be_bytes();
        let skip = len_bytes.iter().take_while(|b| **b == 0).count();
        let significant = &len_bytes[skip..];
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
    out.extend_from_slice(bytes);
}

fn read_var_octets<'a>(input: &'a [u8], pos: &mut usize) -> Result<&'a [u8], PacketError> {
    let first = *input.get(*pos).ok_or(PacketError::UnexpectedEnd)?;
    *pos += 1;
    let length = if first < 128 {
        first as usize
    } else {
        let num_bytes = (first & 0x7f) as usize;
        if num_bytes == 0 || num_bytes > 8 {
            return Err(PacketError::InvalidLength);
        }
        let mut length: usize = 0;
        for _ in 0..num_bytes {
            let byte = *input.get(*pos).ok_or(PacketError::UnexpectedEnd)?;
            *pos += 1;
            length = length * 256 + byte as usize;
        }
        length
    };
    let end = pos.checked_add(length).ok_or(PacketError::InvalidLength)?;
    if end > input.len() {
        return Err(PacketError::UnexpectedEnd);
    }
    let slice = &input[*pos..end];
    *pos = end;
    Ok(slice)
}

impl IldcpResponse {
    /// Serialize as fulfill data
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ilp_address.len() + self.asset_code.len() + 4);
        write_var_octets(&mut out, self.ilp_address.as_bytes());
        out.push(self.asset_scale);
        write_var_octets(&mut out, self.asset_code.as_bytes());
        out
    }

    /// Parse fulfill data
    pub fn decode(input: &[u8]) -> Result<Self, IldcpError> {
        let mut pos = 0;
        let address = std::str::from_utf8(read_var_octets(input, &mut pos)?)
            .map_err(|_| IldcpError::InvalidUtf8)?
            .to_string();
        let asset_scale = *input.get(pos).ok_or(PacketError::UnexpectedEnd)?;
        pos += 1;
        let asset_code = std::str::from_utf8(read_var_octets(input, &mut pos)?)
            .map_err(|_| IldcpError::InvalidUtf8)?
            .to_string();
        Ok(Self {
            ilp_address: address,
            asset_scale,
            asset_code,
        })
    }

    /// Build the fulfill packet answering an ILDCP request
    pub fn into_fulfill(self) -> Fulfill {
        Fulfill {
            fulfillment: ILDCP_FULFILLMENT,
            data: self.encode(),
        }
    }
}

/// Whether a prepare is an ILDCP request
pub fn is_ildcp_request(prepare: &Prepare) -> bool {
    prepare.destination == ILDCP_DESTINATION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_roundtrip() {
        let response = IldcpResponse {
            ilp_address: "test.engine.peer-a".to_string(),
            asset_scale: 9,
            asset_code: "XRP".to_string(),
        };
        let decoded = IldcpResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_condition_matches_zero_fulfillment() {
        let condition = ildcp_condition();
        let recomputed: [u8; 32] = Sha256::digest(ILDCP_FULFILLMENT).into();
        assert_eq!(condition, recomputed);
    }

    #[test]
    fn test_truncated_response_rejected() {
        let response = IldcpResponse {
            ilp_address: "test.engine.peer-a".to_string(),
            asset_scale: 2,
            asset_code: "USD".to_string(),
        };
        let bytes = response.encode();
        assert!(IldcpResponse::decode(&bytes[..bytes.len() - 2]).is_err());
    }
}
