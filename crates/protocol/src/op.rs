//! Op-channel messages
//!
//! The command channel carries device discovery and import negotiation
//! before a session switches to the URB channel. Every message starts with
//! an 8-byte header `{version, code, status}`; request codes have the high
//! bit set, replies clear it.

use crate::error::{ProtocolError, Result};
use crate::types::{BusId, DeviceRecord, SYSFS_BUS_ID_SIZE, UsbInterface};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// USB/IP protocol version 1.1.1
pub const USBIP_VERSION: u16 = 0x0111;

/// Retrieve the list of exportable devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Device list reply
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Import (attach) a device by bus id
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Import reply
pub const OP_REP_IMPORT: u16 = 0x0003;

/// 8-byte op-channel header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    pub const SIZE: usize = 8;

    pub fn new(code: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u16::<BigEndian>()?;
        let code = reader.read_u16::<BigEndian>()?;
        let status = reader.read_u32::<BigEndian>()?;
        Ok(Self {
            version,
            code,
            status,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.code)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }

    /// Reject headers from peers speaking another protocol version
    pub fn check_version(&self) -> Result<()> {
        if self.version != USBIP_VERSION {
            return Err(ProtocolError::VersionMismatch {
                found: self.version,
                expected: USBIP_VERSION,
            });
        }
        Ok(())
    }
}

/// A client request on the command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequest {
    DevList,
    Import { bus_id: BusId },
}

impl OpRequest {
    /// Read one request: header plus its deterministic body
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let header = OpHeader::read_from(reader)?;
        header.check_version()?;
        Self::read_body(header, reader)
    }

    /// Read the body of a request whose header was already consumed
    pub fn read_body<R: Read>(header: OpHeader, reader: &mut R) -> Result<Self> {
        match header.code {
            OP_REQ_DEVLIST => Ok(Self::DevList),
            OP_REQ_IMPORT => {
                let mut raw = [0u8; SYSFS_BUS_ID_SIZE];
                reader.read_exact(&mut raw)?;
                let bus_id = BusId::from_wire(&raw)?;
                Ok(Self::Import { bus_id })
            }
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::DevList => OpHeader::new(OP_REQ_DEVLIST, 0).write_to(writer),
            Self::Import { bus_id } => {
                OpHeader::new(OP_REQ_IMPORT, 0).write_to(writer)?;
                writer.write_all(&bus_id.to_wire())?;
                Ok(())
            }
        }
    }
}

/// One device entry in an OP_REP_DEVLIST body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevListDevice {
    pub record: DeviceRecord,
    pub interfaces: Vec<UsbInterface>,
}

/// A server reply on the command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpReply {
    DevList {
        devices: Vec<DevListDevice>,
    },
    Import {
        status: u32,
        /// Present exactly when `status == ST_OK`
        record: Option<DeviceRecord>,
    },
}

impl OpReply {
    /// Decoder-side sanity bound on the advertised device count
    const MAX_DEVICES: u32 = 4096;

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::DevList { devices } => {
                OpHeader::new(OP_REP_DEVLIST, 0).write_to(writer)?;
                writer.write_u32::<BigEndian>(devices.len() as u32)?;
                for dev in devices {
                    dev.record.write_to(writer)?;
                    for iface in &dev.interfaces {
                        iface.write_to(writer)?;
                    }
                }
                Ok(())
            }
            Self::Import { status, record } => {
                OpHeader::new(OP_REP_IMPORT, *status).write_to(writer)?;
                if let Some(record) = record {
                    record.write_to(writer)?;
                }
                Ok(())
            }
        }
    }

    /// Read one reply: header plus its deterministic body
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let header = OpHeader::read_from(reader)?;
        header.check_version()?;
        match header.code {
            OP_REP_DEVLIST => {
                let count = reader.read_u32::<BigEndian>()?;
                if count > Self::MAX_DEVICES {
                    return Err(ProtocolError::malformed(format!(
                        "devlist advertises {count} devices"
                    )));
                }
                let mut devices = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let record = DeviceRecord::read_from(reader)?;
                    let mut interfaces = Vec::with_capacity(record.num_interfaces as usize);
                    for _ in 0..record.num_interfaces {
                        interfaces.push(UsbInterface::read_from(reader)?);
                    }
                    devices.push(DevListDevice { record, interfaces });
                }
                Ok(Self::DevList { devices })
            }
            OP_REP_IMPORT => {
                let record = if header.status == 0 {
                    Some(DeviceRecord::read_from(reader)?)
                } else {
                    None
                };
                Ok(Self::Import {
                    status: header.status,
                    record,
                })
            }
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}
