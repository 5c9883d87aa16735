//! Game server lifecycle packets.

use std::net::SocketAddr;

use super::{Packet, PacketType, SdkVersion};
use crate::MAX_DATACENTER_NAME_LENGTH;
use crate::encoding::{ReadStream, WriteStream};
use crate::error::PacketError;

/// Status codes returned to a registering server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InitResponseCode {
    /// Registration accepted
    Ok = 0,
    /// Buyer id not known
    UnknownBuyer = 1,
    /// Datacenter id not known
    UnknownDatacenter = 2,
    /// SDK older than the configured minimum
    OldSdkVersion = 3,
    /// Packet signature did not verify
    SignatureCheckFailed = 4,
    /// Buyer exists but is not live
    BuyerNotActive = 5,
    /// Buyer may not use this datacenter
    DatacenterNotEnabled = 6,
}

impl TryFrom<u8> for InitResponseCode {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::UnknownBuyer),
            2 => Ok(Self::UnknownDatacenter),
            3 => Ok(Self::OldSdkVersion),
            4 => Ok(Self::SignatureCheckFailed),
            5 => Ok(Self::BuyerNotActive),
            6 => Ok(Self::DatacenterNotEnabled),
            _ => Err(PacketError::UnknownResponseCode(value)),
        }
    }
}

/// Game server registration request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInitRequestPacket {
    /// SDK version of the server
    pub version: SdkVersion,
    /// Buyer (customer) id
    pub buyer_id: u64,
    /// Datacenter id the server claims to run in
    pub datacenter_id: u64,
    /// Opaque id echoed in the response
    pub request_id: u64,
    /// Datacenter name as configured on the server
    pub datacenter_name: String,
}

impl ServerInitRequestPacket {
    /// Decode a request body.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] on truncated or out-of-range input.
    pub fn unmarshal(data: &[u8]) -> Result<Self, PacketError> {
        let mut stream = ReadStream::new(data);
        Ok(Self {
            version: SdkVersion::read(&mut stream)?,
            buyer_id: stream.read_u64()?,
            datacenter_id: stream.read_u64()?,
            request_id: stream.read_u64()?,
            datacenter_name: stream.read_string(MAX_DATACENTER_NAME_LENGTH)?,
        })
    }
}

impl Packet for ServerInitRequestPacket {
    const PACKET_TYPE: PacketType = PacketType::ServerInitRequest;

    fn write(&self, stream: &mut WriteStream) -> Result<(), PacketError> {
        self.version.write(stream)?;
        stream.write_u64(self.buyer_id)?;
        stream.write_u64(self.datacenter_id)?;
        stream.write_u64(self.request_id)?;
        stream.write_string(&self.datacenter_name, MAX_DATACENTER_NAME_LENGTH)?;
        Ok(())
    }
}

/// Registration response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInitResponsePacket {
    /// Request id echoed from the request
    pub request_id: u64,
    /// Outcome
    pub response: InitResponseCode,
}

impl ServerInitResponsePacket {
    /// Decode a response body.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] on truncated input or an unknown status code.
    pub fn unmarshal(data: &[u8]) -> Result<Self, PacketError> {
        let mut stream = ReadStream::new(data);
        let request_id = stream.read_u64()?;
        let response = InitResponseCode::try_from(stream.read_bits(8)? as u8)?;
        Ok(Self {
            request_id,
            response,
        })
    }
}

impl Packet for ServerInitResponsePacket {
    const PACKET_TYPE: PacketType = PacketType::ServerInitResponse;

    fn write(&self, stream: &mut WriteStream) -> Result<(), PacketError> {
        stream.write_u64(self.request_id)?;
        stream.write_bits(self.response as u32, 8)?;
        Ok(())
    }
}

/// Periodic server heartbeat with its current session count
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerUpdatePacket {
    /// SDK version of the server
    pub version: SdkVersion,
    /// Buyer (customer) id
    pub buyer_id: u64,
    /// Datacenter id
    pub datacenter_id: u64,
    /// Sessions currently hosted
    pub num_sessions: u32,
    /// Public address of the server
    pub server_address: Option<SocketAddr>,
}

impl ServerUpdatePacket {
    /// Decode an update body.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] on truncated input.
    pub fn unmarshal(data: &[u8]) -> Result<Self, PacketError> {
        let mut stream = ReadStream::new(data);
        Ok(Self {
            version: SdkVersion::read(&mut stream)?,
            buyer_id: stream.read_u64()?,
            datacenter_id: stream.read_u64()?,
            num_sessions: stream.read_u32()?,
            server_address: stream.read_address()?,
        })
    }
}

impl Packet for ServerUpdatePacket {
    const PACKET_TYPE: PacketType = PacketType::ServerUpdate;

    fn write(&self, stream: &mut WriteStream) -> Result<(), PacketError> {
        self.version.write(stream)?;
        stream.write_u64(self.buyer_id)?;
        stream.write_u64(self.datacenter_id)?;
        stream.write_u32(self.num_sessions)?;
        stream.write_address(self.server_address.as_ref())?;
        Ok(())
    }
}
