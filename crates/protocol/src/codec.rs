//! Async frame readers
//!
//! USB/IP has no length prefix: a frame's size is computed from its header.
//! These helpers read exactly one message from an async stream — header
//! first, then the deterministic remainder — and hand the bytes to the sync
//! decoders in [`crate::op`] and [`crate::urb`].
//!
//! Header fields are sanity-checked before any payload allocation, so a
//! hostile peer cannot make the reader balloon memory: the per-message
//! bound is [`crate::urb::MAX_TRANSFER_WIRE`].

use crate::error::{ProtocolError, Result};
use crate::op::{OP_REQ_IMPORT, OpHeader, OpReply, OpRequest};
use crate::types::SYSFS_BUS_ID_SIZE;
use crate::urb::{
    ISO_DESCRIPTOR_SIZE, MAX_ISO_PACKETS, MAX_TRANSFER_WIRE, URB_HEADER_SIZE, USBIP_CMD_SUBMIT,
    USBIP_CMD_UNLINK, USBIP_DIR_IN, USBIP_DIR_OUT, USBIP_RET_SUBMIT, USBIP_RET_UNLINK, UrbHeader,
    UrbMessage,
};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read one op-channel request (header + body)
pub async fn read_op_request<R>(reader: &mut R) -> Result<OpRequest>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; OpHeader::SIZE];
    reader.read_exact(&mut head).await?;
    let header = OpHeader::read_from(&mut Cursor::new(&head))?;
    header.check_version()?;

    let body_len = match header.code {
        OP_REQ_IMPORT => SYSFS_BUS_ID_SIZE,
        _ => 0,
    };
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    OpRequest::read_body(header, &mut Cursor::new(&body))
}

/// Read one op-channel reply (client side of the handshake; used by the
/// status probe and the scenario tests)
pub async fn read_op_reply<R>(reader: &mut R) -> Result<OpReply>
where
    R: AsyncRead + Unpin,
{
    use crate::op::{OP_REP_DEVLIST, OP_REP_IMPORT};
    use crate::types::{DEVICE_RECORD_SIZE, DeviceRecord, INTERFACE_SIZE, UsbInterface};

    let mut head = [0u8; OpHeader::SIZE];
    reader.read_exact(&mut head).await?;
    let header = OpHeader::read_from(&mut Cursor::new(&head))?;
    header.check_version()?;

    match header.code {
        OP_REP_DEVLIST => {
            let mut count_raw = [0u8; 4];
            reader.read_exact(&mut count_raw).await?;
            let count = u32::from_be_bytes(count_raw);
            if count > 4096 {
                return Err(ProtocolError::malformed(format!(
                    "devlist advertises {count} devices"
                )));
            }
            let mut devices = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let mut record_raw = vec![0u8; DEVICE_RECORD_SIZE];
                reader.read_exact(&mut record_raw).await?;
                let record = DeviceRecord::read_from(&mut Cursor::new(&record_raw))?;

                let mut ifaces_raw = vec![0u8; record.num_interfaces as usize * INTERFACE_SIZE];
                reader.read_exact(&mut ifaces_raw).await?;
                let mut cursor = Cursor::new(&ifaces_raw);
                let mut interfaces = Vec::with_capacity(record.num_interfaces as usize);
                for _ in 0..record.num_interfaces {
                    interfaces.push(UsbInterface::read_from(&mut cursor)?);
                }
                devices.push(crate::op::DevListDevice { record, interfaces });
            }
            Ok(OpReply::DevList { devices })
        }
        OP_REP_IMPORT => {
            let record = if header.status == 0 {
                let mut record_raw = vec![0u8; DEVICE_RECORD_SIZE];
                reader.read_exact(&mut record_raw).await?;
                Some(DeviceRecord::read_from(&mut Cursor::new(&record_raw))?)
            } else {
                None
            };
            Ok(OpReply::Import {
                status: header.status,
                record,
            })
        }
        other => Err(ProtocolError::UnknownOpCode(other)),
    }
}

/// Read one URB-channel message (any of the four commands)
pub async fn read_urb_message<R>(reader: &mut R) -> Result<UrbMessage>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; URB_HEADER_SIZE];
    reader.read_exact(&mut fixed).await?;
    let header = UrbHeader::read_from(&mut Cursor::new(&fixed))?;

    let trailing = trailing_len(&header, &fixed)?;
    let mut frame = Vec::with_capacity(URB_HEADER_SIZE + trailing);
    frame.extend_from_slice(&fixed);
    if trailing > 0 {
        let start = frame.len();
        frame.resize(start + trailing, 0);
        reader.read_exact(&mut frame[start..]).await?;
    }

    UrbMessage::read_from(&mut Cursor::new(&frame))
}

/// Bytes that follow the 48-byte header, computed from header fields alone
fn trailing_len(header: &UrbHeader, fixed: &[u8; URB_HEADER_SIZE]) -> Result<usize> {
    let field_i32 = |offset: usize| -> i32 {
        i32::from_be_bytes([
            fixed[offset],
            fixed[offset + 1],
            fixed[offset + 2],
            fixed[offset + 3],
        ])
    };

    match header.command {
        USBIP_CMD_SUBMIT => {
            let buffer_length = field_i32(24);
            let packets = field_i32(32);
            check_lengths(buffer_length, packets)?;
            let data = if header.direction == USBIP_DIR_OUT {
                buffer_length as usize
            } else {
                0
            };
            Ok(data + packets as usize * ISO_DESCRIPTOR_SIZE)
        }
        USBIP_RET_SUBMIT => {
            let actual_length = field_i32(24);
            let packets = field_i32(32);
            check_lengths(actual_length, packets)?;
            let data = if header.direction == USBIP_DIR_IN {
                actual_length as usize
            } else {
                0
            };
            Ok(data + packets as usize * ISO_DESCRIPTOR_SIZE)
        }
        USBIP_CMD_UNLINK | USBIP_RET_UNLINK => Ok(0),
        other => Err(ProtocolError::UnknownUrbCommand(other)),
    }
}

fn check_lengths(buffer_length: i32, packets: i32) -> Result<()> {
    if buffer_length < 0 {
        return Err(ProtocolError::malformed("negative buffer length"));
    }
    if buffer_length > MAX_TRANSFER_WIRE {
        return Err(ProtocolError::FrameTooLarge {
            size: buffer_length as usize,
            max: MAX_TRANSFER_WIRE as usize,
        });
    }
    if !(0..=MAX_ISO_PACKETS).contains(&packets) {
        return Err(ProtocolError::malformed(format!(
            "implausible iso packet count {packets}"
        )));
    }
    Ok(())
}
