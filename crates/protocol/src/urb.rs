//! URB-channel messages
//!
//! After a successful import the socket switches to the URB channel: a
//! 48-byte header (20 bytes common, 28 bytes command-specific) followed by
//! transfer data and, for isochronous URBs, per-packet descriptors. Body
//! lengths are fully determined by the header, so the channel can be read
//! greedily without a length prefix.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Execute a USB request
pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
/// Cancel a previously submitted request by seqnum
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
/// Completion of a CMD_SUBMIT
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
/// Completion of a CMD_UNLINK
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

/// Host-to-device
pub const USBIP_DIR_OUT: u32 = 0;
/// Device-to-host
pub const USBIP_DIR_IN: u32 = 1;

/// Total size of the URB-channel header, data excluded
pub const URB_HEADER_SIZE: usize = 48;

/// Size of one isochronous packet descriptor on the wire
pub const ISO_DESCRIPTOR_SIZE: usize = 16;

/// Plausibility bound on `number_of_packets`
pub const MAX_ISO_PACKETS: i32 = 1024;

/// Hard wire bound on a single transfer buffer, independent of the
/// configured per-transfer maximum
pub const MAX_TRANSFER_WIRE: i32 = 16 * 1024 * 1024;

/// The 20-byte portion common to all four URB-channel messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl UrbHeader {
    pub const SIZE: usize = 20;

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            command: reader.read_u32::<BigEndian>()?,
            seqnum: reader.read_u32::<BigEndian>()?,
            devid: reader.read_u32::<BigEndian>()?,
            direction: reader.read_u32::<BigEndian>()?,
            ep: reader.read_u32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.command)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction)?;
        writer.write_u32::<BigEndian>(self.ep)?;
        Ok(())
    }
}

/// One isochronous packet descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            offset: reader.read_u32::<BigEndian>()?,
            length: reader.read_u32::<BigEndian>()?,
            actual_length: reader.read_u32::<BigEndian>()?,
            status: reader.read_i32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.status)?;
        Ok(())
    }
}

/// CMD_SUBMIT: one URB to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    /// Control setup packet; all zeros for non-control URBs
    pub setup: [u8; 8],
    /// OUT payload; empty for IN
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

impl CmdSubmit {
    pub fn is_in(&self) -> bool {
        self.direction == USBIP_DIR_IN
    }

    fn validate(&self) -> Result<()> {
        if self.direction != USBIP_DIR_IN && self.direction != USBIP_DIR_OUT {
            return Err(ProtocolError::malformed(format!(
                "invalid direction {}",
                self.direction
            )));
        }
        if self.transfer_buffer_length < 0 {
            return Err(ProtocolError::malformed(
                "negative transfer_buffer_length",
            ));
        }
        if self.transfer_buffer_length > MAX_TRANSFER_WIRE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.transfer_buffer_length as usize,
                max: MAX_TRANSFER_WIRE as usize,
            });
        }
        if self.number_of_packets < 0 || self.number_of_packets > MAX_ISO_PACKETS {
            return Err(ProtocolError::malformed(format!(
                "implausible iso packet count {}",
                self.number_of_packets
            )));
        }
        Ok(())
    }
}

/// RET_SUBMIT: completion of a CMD_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
    /// IN payload; empty for OUT
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

impl RetSubmit {
    /// Completion with no iso component. Replies zero devid and ep (vhci
    /// matches on seqnum alone); the sender sets `direction` to IN when
    /// payload bytes follow, so the frame declares its own length.
    pub fn completion(seqnum: u32, status: i32, actual_length: i32, data: Vec<u8>) -> Self {
        Self {
            seqnum,
            devid: 0,
            direction: 0,
            ep: 0,
            status,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data,
            iso_packets: Vec::new(),
        }
    }

    /// Failed completion carrying no data
    pub fn error(seqnum: u32, status: i32) -> Self {
        Self::completion(seqnum, status, 0, Vec::new())
    }
}

/// CMD_UNLINK: cancel the URB with `unlink_seqnum`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub unlink_seqnum: u32,
}

/// RET_UNLINK: completion of a CMD_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub seqnum: u32,
    pub status: i32,
}

/// Any message on the URB channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbMessage {
    CmdSubmit(CmdSubmit),
    CmdUnlink(CmdUnlink),
    RetSubmit(RetSubmit),
    RetUnlink(RetUnlink),
}

impl UrbMessage {
    /// Read one complete message, header through trailing descriptors
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let header = UrbHeader::read_from(reader)?;
        Self::read_body(header, reader)
    }

    /// Read the body of a message whose 20-byte header was already consumed
    pub fn read_body<R: Read>(header: UrbHeader, reader: &mut R) -> Result<Self> {
        match header.command {
            USBIP_CMD_SUBMIT => {
                let transfer_flags = reader.read_u32::<BigEndian>()?;
                let transfer_buffer_length = reader.read_i32::<BigEndian>()?;
                let start_frame = reader.read_i32::<BigEndian>()?;
                let number_of_packets = reader.read_i32::<BigEndian>()?;
                let interval = reader.read_i32::<BigEndian>()?;
                let mut setup = [0u8; 8];
                reader.read_exact(&mut setup)?;

                let mut cmd = CmdSubmit {
                    seqnum: header.seqnum,
                    devid: header.devid,
                    direction: header.direction,
                    ep: header.ep,
                    transfer_flags,
                    transfer_buffer_length,
                    start_frame,
                    number_of_packets,
                    interval,
                    setup,
                    data: Vec::new(),
                    iso_packets: Vec::new(),
                };
                cmd.validate()?;

                if cmd.direction == USBIP_DIR_OUT && cmd.transfer_buffer_length > 0 {
                    let mut data = vec![0u8; cmd.transfer_buffer_length as usize];
                    reader.read_exact(&mut data)?;
                    cmd.data = data;
                }
                for _ in 0..cmd.number_of_packets {
                    cmd.iso_packets.push(IsoPacketDescriptor::read_from(reader)?);
                }
                Ok(Self::CmdSubmit(cmd))
            }
            USBIP_CMD_UNLINK => {
                let unlink_seqnum = reader.read_u32::<BigEndian>()?;
                let mut reserved = [0u8; 24];
                reader.read_exact(&mut reserved)?;
                Ok(Self::CmdUnlink(CmdUnlink {
                    seqnum: header.seqnum,
                    devid: header.devid,
                    direction: header.direction,
                    ep: header.ep,
                    unlink_seqnum,
                }))
            }
            USBIP_RET_SUBMIT => {
                let status = reader.read_i32::<BigEndian>()?;
                let actual_length = reader.read_i32::<BigEndian>()?;
                let start_frame = reader.read_i32::<BigEndian>()?;
                let number_of_packets = reader.read_i32::<BigEndian>()?;
                let error_count = reader.read_i32::<BigEndian>()?;
                let mut reserved = [0u8; 8];
                reader.read_exact(&mut reserved)?;

                if actual_length < 0 || actual_length > MAX_TRANSFER_WIRE {
                    return Err(ProtocolError::malformed(format!(
                        "implausible actual_length {actual_length}"
                    )));
                }
                if !(0..=MAX_ISO_PACKETS).contains(&number_of_packets) {
                    return Err(ProtocolError::malformed(format!(
                        "implausible iso packet count {number_of_packets}"
                    )));
                }

                let mut ret = RetSubmit {
                    seqnum: header.seqnum,
                    devid: header.devid,
                    direction: header.direction,
                    ep: header.ep,
                    status,
                    actual_length,
                    start_frame,
                    number_of_packets,
                    error_count,
                    data: Vec::new(),
                    iso_packets: Vec::new(),
                };
                if ret.direction == USBIP_DIR_IN && ret.actual_length > 0 {
                    let mut data = vec![0u8; ret.actual_length as usize];
                    reader.read_exact(&mut data)?;
                    ret.data = data;
                }
                for _ in 0..ret.number_of_packets {
                    ret.iso_packets.push(IsoPacketDescriptor::read_from(reader)?);
                }
                Ok(Self::RetSubmit(ret))
            }
            USBIP_RET_UNLINK => {
                let status = reader.read_i32::<BigEndian>()?;
                let mut reserved = [0u8; 24];
                reader.read_exact(&mut reserved)?;
                Ok(Self::RetUnlink(RetUnlink {
                    seqnum: header.seqnum,
                    status,
                }))
            }
            other => Err(ProtocolError::UnknownUrbCommand(other)),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::CmdSubmit(cmd) => {
                cmd.validate()?;
                UrbHeader {
                    command: USBIP_CMD_SUBMIT,
                    seqnum: cmd.seqnum,
                    devid: cmd.devid,
                    direction: cmd.direction,
                    ep: cmd.ep,
                }
                .write_to(writer)?;
                writer.write_u32::<BigEndian>(cmd.transfer_flags)?;
                writer.write_i32::<BigEndian>(cmd.transfer_buffer_length)?;
                writer.write_i32::<BigEndian>(cmd.start_frame)?;
                writer.write_i32::<BigEndian>(cmd.number_of_packets)?;
                writer.write_i32::<BigEndian>(cmd.interval)?;
                writer.write_all(&cmd.setup)?;
                if cmd.direction == USBIP_DIR_OUT {
                    writer.write_all(&cmd.data)?;
                }
                for pkt in &cmd.iso_packets {
                    pkt.write_to(writer)?;
                }
                Ok(())
            }
            Self::CmdUnlink(cmd) => {
                UrbHeader {
                    command: USBIP_CMD_UNLINK,
                    seqnum: cmd.seqnum,
                    devid: cmd.devid,
                    direction: cmd.direction,
                    ep: cmd.ep,
                }
                .write_to(writer)?;
                writer.write_u32::<BigEndian>(cmd.unlink_seqnum)?;
                writer.write_all(&[0u8; 24])?;
                Ok(())
            }
            Self::RetSubmit(ret) => {
                UrbHeader {
                    command: USBIP_RET_SUBMIT,
                    seqnum: ret.seqnum,
                    devid: ret.devid,
                    direction: ret.direction,
                    ep: ret.ep,
                }
                .write_to(writer)?;
                writer.write_i32::<BigEndian>(ret.status)?;
                writer.write_i32::<BigEndian>(ret.actual_length)?;
                writer.write_i32::<BigEndian>(ret.start_frame)?;
                writer.write_i32::<BigEndian>(ret.number_of_packets)?;
                writer.write_i32::<BigEndian>(ret.error_count)?;
                writer.write_all(&[0u8; 8])?;
                if ret.direction == USBIP_DIR_IN {
                    writer.write_all(&ret.data)?;
                }
                for pkt in &ret.iso_packets {
                    pkt.write_to(writer)?;
                }
                Ok(())
            }
            Self::RetUnlink(ret) => {
                UrbHeader {
                    command: USBIP_RET_UNLINK,
                    seqnum: ret.seqnum,
                    devid: 0,
                    direction: 0,
                    ep: 0,
                }
                .write_to(writer)?;
                writer.write_i32::<BigEndian>(ret.status)?;
                writer.write_all(&[0u8; 24])?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(msg: &UrbMessage) -> UrbMessage {
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        UrbMessage::read_from(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn test_cmd_submit_in_is_48_bytes() {
        let msg = UrbMessage::CmdSubmit(CmdSubmit {
            seqnum: 1,
            devid: (1 << 16) | 2,
            direction: USBIP_DIR_IN,
            ep: 0,
            transfer_flags: 0,
            transfer_buffer_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            data: Vec::new(),
            iso_packets: Vec::new(),
        });
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), URB_HEADER_SIZE);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_cmd_submit_out_carries_data() {
        let msg = UrbMessage::CmdSubmit(CmdSubmit {
            seqnum: 9,
            devid: (1 << 16) | 2,
            direction: USBIP_DIR_OUT,
            ep: 2,
            transfer_flags: 0,
            transfer_buffer_length: 5,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0u8; 8],
            data: vec![1, 2, 3, 4, 5],
            iso_packets: Vec::new(),
        });
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), URB_HEADER_SIZE + 5);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_cmd_submit_iso_descriptors() {
        let packets = vec![
            IsoPacketDescriptor {
                offset: 0,
                length: 192,
                actual_length: 0,
                status: 0,
            },
            IsoPacketDescriptor {
                offset: 192,
                length: 192,
                actual_length: 0,
                status: 0,
            },
        ];
        let msg = UrbMessage::CmdSubmit(CmdSubmit {
            seqnum: 3,
            devid: (1 << 16) | 2,
            direction: USBIP_DIR_IN,
            ep: 1,
            transfer_flags: 0,
            transfer_buffer_length: 384,
            start_frame: 0,
            number_of_packets: 2,
            interval: 1,
            setup: [0u8; 8],
            data: Vec::new(),
            iso_packets: packets,
        });
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), URB_HEADER_SIZE + 2 * ISO_DESCRIPTOR_SIZE);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_cmd_unlink_roundtrip() {
        let msg = UrbMessage::CmdUnlink(CmdUnlink {
            seqnum: 8,
            devid: (1 << 16) | 2,
            direction: 0,
            ep: 0,
            unlink_seqnum: 7,
        });
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), URB_HEADER_SIZE);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_ret_submit_in_roundtrip() {
        let msg = UrbMessage::RetSubmit(RetSubmit::completion(1, 0, 18, vec![0xAA; 18]));
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        // data follows only when direction is IN
        assert_eq!(buf.len(), URB_HEADER_SIZE);

        let mut in_reply = RetSubmit::completion(1, 0, 18, vec![0xAA; 18]);
        in_reply.direction = USBIP_DIR_IN;
        let msg = UrbMessage::RetSubmit(in_reply);
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), URB_HEADER_SIZE + 18);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_ret_unlink_roundtrip() {
        let msg = UrbMessage::RetUnlink(RetUnlink {
            seqnum: 8,
            status: -(crate::status::ECONNRESET),
        });
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), URB_HEADER_SIZE);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_negative_buffer_length_rejected() {
        let mut buf = Vec::new();
        UrbHeader {
            command: USBIP_CMD_SUBMIT,
            seqnum: 1,
            devid: 0,
            direction: USBIP_DIR_IN,
            ep: 0,
        }
        .write_to(&mut buf)
        .unwrap();
        buf.extend_from_slice(&0u32.to_be_bytes()); // transfer_flags
        buf.extend_from_slice(&(-1i32).to_be_bytes()); // transfer_buffer_length
        buf.extend_from_slice(&[0u8; 20]); // start_frame..setup

        let result = UrbMessage::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(ProtocolError::MalformedFrame { .. })));
    }

    #[test]
    fn test_excess_iso_packets_rejected() {
        let mut buf = Vec::new();
        UrbHeader {
            command: USBIP_CMD_SUBMIT,
            seqnum: 1,
            devid: 0,
            direction: USBIP_DIR_IN,
            ep: 1,
        }
        .write_to(&mut buf)
        .unwrap();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&(MAX_ISO_PACKETS + 1).to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let result = UrbMessage::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(ProtocolError::MalformedFrame { .. })));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut buf = Vec::new();
        UrbHeader {
            command: 0xdead_beef,
            seqnum: 1,
            devid: 0,
            direction: 0,
            ep: 0,
        }
        .write_to(&mut buf)
        .unwrap();
        buf.extend_from_slice(&[0u8; 28]);

        let result = UrbMessage::read_from(&mut Cursor::new(buf));
        assert!(matches!(
            result,
            Err(ProtocolError::UnknownUrbCommand(0xdead_beef))
        ));
    }
}
