//! USB/IP 1.1.1 wire protocol
//!
//! This crate implements the wire format spoken by the Linux kernel's
//! `vhci_hcd` client: big-endian, fixed-layout, version 0x0111. It is split
//! into the op channel (device discovery and import, [`op`]) and the URB
//! channel (transfer submission and cancellation, [`urb`]).
//!
//! # Example
//!
//! ```
//! use protocol::{OpRequest, BusId};
//!
//! let req = OpRequest::Import { bus_id: BusId::new("1-1").unwrap() };
//!
//! // Encode to the wire...
//! let mut buf = Vec::new();
//! req.write_to(&mut buf).unwrap();
//! assert_eq!(buf.len(), 8 + 32); // header + NUL-padded bus id
//!
//! // ...and back.
//! let decoded = OpRequest::read_from(&mut std::io::Cursor::new(buf)).unwrap();
//! assert_eq!(decoded, req);
//! ```

#[cfg(feature = "async")]
pub mod codec;
pub mod error;
pub mod op;
pub mod status;
pub mod types;
pub mod urb;

#[cfg(feature = "async")]
pub use codec::{read_op_reply, read_op_request, read_urb_message};
pub use error::{ProtocolError, Result};
pub use op::{
    DevListDevice, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, OpHeader,
    OpReply, OpRequest, USBIP_VERSION,
};
pub use types::{
    BusId, DEVICE_RECORD_SIZE, DeviceRecord, INTERFACE_SIZE, SYSFS_BUS_ID_SIZE, SYSFS_PATH_MAX,
    UsbInterface, UsbSpeed,
};
pub use urb::{
    CmdSubmit, CmdUnlink, ISO_DESCRIPTOR_SIZE, IsoPacketDescriptor, MAX_ISO_PACKETS,
    MAX_TRANSFER_WIRE, RetSubmit, RetUnlink, URB_HEADER_SIZE, USBIP_CMD_SUBMIT, USBIP_CMD_UNLINK,
    USBIP_DIR_IN, USBIP_DIR_OUT, USBIP_RET_SUBMIT, USBIP_RET_UNLINK, UrbHeader, UrbMessage,
};
