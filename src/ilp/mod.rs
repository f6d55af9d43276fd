//! Interledger protocol wire types
//!
//! OER framing for ILPv4 prepare/fulfill/reject packets and the ILDCP
//! sub-protocol used by peers to fetch their account configuration.

mod ildcp;
mod packet;

pub use ildcp::{
    ildcp_condition, is_ildcp_request, IldcpError, IldcpResponse, ILDCP_DESTINATION,
    ILDCP_FULFILLMENT,
};
pub use packet::{ErrorCode, Fulfill, Packet, PacketError, Prepare, Reject};
