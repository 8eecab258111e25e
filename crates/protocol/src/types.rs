//! Wire-level USB/IP types
//!
//! Fixed-layout structures shared by the op channel and the URB channel.
//! All multi-byte integers on the wire are big-endian; all sizes here are
//! contractual with the Linux `vhci_hcd` client.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Size of the NUL-padded sysfs path field in a device record
pub const SYSFS_PATH_MAX: usize = 256;
/// Size of the NUL-padded bus id field
pub const SYSFS_BUS_ID_SIZE: usize = 32;
/// Size of one exported-device record on the wire
pub const DEVICE_RECORD_SIZE: usize = 312;
/// Size of one interface tuple on the wire (class, subclass, protocol, pad)
pub const INTERFACE_SIZE: usize = 4;

/// Bus id: stable port-location identifier, e.g. `"1-1"`
///
/// At most 31 ASCII characters, NUL-padded to 32 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusId(String);

impl BusId {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || s.len() >= SYSFS_BUS_ID_SIZE || !s.is_ascii() {
            return Err(ProtocolError::BusIdNotAscii);
        }
        if s.bytes().any(|b| b == 0) {
            return Err(ProtocolError::BusIdNotAscii);
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a NUL-padded 32-byte wire field
    pub fn from_wire(raw: &[u8; SYSFS_BUS_ID_SIZE]) -> Result<Self> {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        if end == raw.len() {
            // Unterminated: the field must leave room for at least one NUL.
            return Err(ProtocolError::BusIdNotAscii);
        }
        let s = std::str::from_utf8(&raw[..end]).map_err(|_| ProtocolError::BusIdNotAscii)?;
        Self::new(s)
    }

    pub fn to_wire(&self) -> [u8; SYSFS_BUS_ID_SIZE] {
        let mut out = [0u8; SYSFS_BUS_ID_SIZE];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }
}

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for BusId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// USB device speed, wire values per the Linux `usb_device_speed` enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Unknown,
    /// 1.5 Mbps
    Low,
    /// 12 Mbps
    Full,
    /// 480 Mbps
    High,
    /// 5 Gbps and above
    Super,
}

impl UsbSpeed {
    pub fn to_wire(self) -> u32 {
        match self {
            UsbSpeed::Unknown => 0,
            UsbSpeed::Low => 1,
            UsbSpeed::Full => 2,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 5,
        }
    }

    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => UsbSpeed::Low,
            2 => UsbSpeed::Full,
            3 => UsbSpeed::High,
            // 4 is wireless USB, which no supported host produces; 6 is
            // SuperSpeed+, which the 1.1.1 protocol folds into Super.
            5 | 6 => UsbSpeed::Super,
            _ => UsbSpeed::Unknown,
        }
    }
}

/// One interface tuple in an OP_REP_DEVLIST record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbInterface {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

impl UsbInterface {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let interface_class = reader.read_u8()?;
        let interface_subclass = reader.read_u8()?;
        let interface_protocol = reader.read_u8()?;
        let _pad = reader.read_u8()?;
        Ok(Self {
            interface_class,
            interface_subclass,
            interface_protocol,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.interface_class)?;
        writer.write_u8(self.interface_subclass)?;
        writer.write_u8(self.interface_protocol)?;
        writer.write_u8(0)?;
        Ok(())
    }
}

/// The 312-byte exported-device record
///
/// Sent once per device in OP_REP_DEVLIST (followed by its interface
/// tuples) and once, without interfaces, in a successful OP_REP_IMPORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Opaque device path label, NUL-padded to 256 bytes
    pub path: String,
    pub bus_id: BusId,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: UsbSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl DeviceRecord {
    /// Packed `(bus_num << 16) | dev_num` used on the URB channel
    pub fn devid(&self) -> u32 {
        (self.bus_num << 16) | (self.dev_num & 0xffff)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut path_raw = [0u8; SYSFS_PATH_MAX];
        reader.read_exact(&mut path_raw)?;
        let path_end = path_raw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(path_raw.len());
        let path = std::str::from_utf8(&path_raw[..path_end])
            .map_err(|_| ProtocolError::malformed("device path is not UTF-8"))?
            .to_string();

        let mut busid_raw = [0u8; SYSFS_BUS_ID_SIZE];
        reader.read_exact(&mut busid_raw)?;
        let bus_id = BusId::from_wire(&busid_raw)?;

        let bus_num = reader.read_u32::<BigEndian>()?;
        let dev_num = reader.read_u32::<BigEndian>()?;
        let speed = UsbSpeed::from_wire(reader.read_u32::<BigEndian>()?);
        let vendor_id = reader.read_u16::<BigEndian>()?;
        let product_id = reader.read_u16::<BigEndian>()?;
        let bcd_device = reader.read_u16::<BigEndian>()?;
        let device_class = reader.read_u8()?;
        let device_subclass = reader.read_u8()?;
        let device_protocol = reader.read_u8()?;
        let configuration_value = reader.read_u8()?;
        let num_configurations = reader.read_u8()?;
        let num_interfaces = reader.read_u8()?;

        Ok(Self {
            path,
            bus_id,
            bus_num,
            dev_num,
            speed,
            vendor_id,
            product_id,
            bcd_device,
            device_class,
            device_subclass,
            device_protocol,
            configuration_value,
            num_configurations,
            num_interfaces,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut path_raw = [0u8; SYSFS_PATH_MAX];
        let path_bytes = self.path.as_bytes();
        // Truncate over-long paths rather than corrupt the record; the
        // field is a label, not an address.
        let n = path_bytes.len().min(SYSFS_PATH_MAX - 1);
        path_raw[..n].copy_from_slice(&path_bytes[..n]);
        writer.write_all(&path_raw)?;

        writer.write_all(&self.bus_id.to_wire())?;
        writer.write_u32::<BigEndian>(self.bus_num)?;
        writer.write_u32::<BigEndian>(self.dev_num)?;
        writer.write_u32::<BigEndian>(self.speed.to_wire())?;
        writer.write_u16::<BigEndian>(self.vendor_id)?;
        writer.write_u16::<BigEndian>(self.product_id)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.device_class)?;
        writer.write_u8(self.device_subclass)?;
        writer.write_u8(self.device_protocol)?;
        writer.write_u8(self.configuration_value)?;
        writer.write_u8(self.num_configurations)?;
        writer.write_u8(self.num_interfaces)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_record() -> DeviceRecord {
        DeviceRecord {
            path: "/usbipd/devices/1-1".to_string(),
            bus_id: BusId::new("1-1").unwrap(),
            bus_num: 1,
            dev_num: 2,
            speed: UsbSpeed::High,
            vendor_id: 0x1d6b,
            product_id: 0x0002,
            bcd_device: 0x0200,
            device_class: 9,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
        }
    }

    #[test]
    fn test_bus_id_wire_roundtrip() {
        let id = BusId::new("1-1.4").unwrap();
        let wire = id.to_wire();
        assert_eq!(wire.len(), SYSFS_BUS_ID_SIZE);
        assert_eq!(&wire[..5], b"1-1.4");
        assert!(wire[5..].iter().all(|&b| b == 0));
        assert_eq!(BusId::from_wire(&wire).unwrap(), id);
    }

    #[test]
    fn test_bus_id_rejects_invalid() {
        assert!(BusId::new("").is_err());
        assert!(BusId::new("a".repeat(32)).is_err());
        assert!(BusId::new("busä").is_err());
        assert!(BusId::from_wire(&[b'x'; SYSFS_BUS_ID_SIZE]).is_err());
    }

    #[test]
    fn test_speed_wire_values() {
        assert_eq!(UsbSpeed::Low.to_wire(), 1);
        assert_eq!(UsbSpeed::Full.to_wire(), 2);
        assert_eq!(UsbSpeed::High.to_wire(), 3);
        assert_eq!(UsbSpeed::Super.to_wire(), 5);
        assert_eq!(UsbSpeed::from_wire(3), UsbSpeed::High);
        assert_eq!(UsbSpeed::from_wire(6), UsbSpeed::Super);
        assert_eq!(UsbSpeed::from_wire(99), UsbSpeed::Unknown);
    }

    #[test]
    fn test_device_record_is_312_bytes() {
        let mut buf = Vec::new();
        sample_record().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), DEVICE_RECORD_SIZE);
    }

    #[test]
    fn test_device_record_roundtrip() {
        let record = sample_record();
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();

        let decoded = DeviceRecord::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_devid_packing() {
        let record = sample_record();
        assert_eq!(record.devid(), (1 << 16) | 2);
    }

    #[test]
    fn test_interface_tuple_layout() {
        let iface = UsbInterface {
            interface_class: 9,
            interface_subclass: 0,
            interface_protocol: 0,
        };
        let mut buf = Vec::new();
        iface.write_to(&mut buf).unwrap();
        assert_eq!(buf, vec![0x09, 0x00, 0x00, 0x00]);

        let decoded = UsbInterface::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, iface);
    }
}
