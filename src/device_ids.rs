use std::fmt::Display;

const SILABS_VID: u16 = 0x10c4;

/// USB IDs the EFM8 USB bootloaders enumerate with.
pub const EFM8_HID_LOADERS: &[UsbId] = &[silabs_dev(0xeac9), silabs_dev(0xeaca)];

/// CP2112 HID-to-SMBus bridge.
pub const CP2112: UsbId = silabs_dev(0xea90);

const fn silabs_dev(pid: u16) -> UsbId {
    UsbId {
        vid: SILABS_VID,
        pid,
    }
}

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// How the bootloader is attached, chosen from the user's port argument.
#[derive(Clone, Debug, PartialEq)]
pub enum PortKind {
    /// EFM8 USB bootloader, talked to directly over HID.
    Hid,
    /// SMBus bootloader behind a CP2112.
    Smbus,
    /// UART bootloader on the named serial device.
    Serial(String),
}

impl PortKind {
    /// `hid` and `usb` pick the USB bootloader, `smb` and `i2c` the SMBus bridge (case
    /// insensitive). Anything else is taken as a serial device path.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "hid" | "usb" => PortKind::Hid,
            "smb" | "i2c" => PortKind::Smbus,
            _ => PortKind::Serial(name.to_owned()),
        }
    }
}

impl Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PortKind::Hid => write!(f, "USB HID"),
            PortKind::Smbus => write!(f, "SMBus ({CP2112})"),
            PortKind::Serial(path) => write!(f, "serial port {path}"),
        }
    }
}
