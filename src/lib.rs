/// Split boot record files into the frames the bootloader expects.
pub mod boot_record;

/// USB IDs of EFM8 bootloaders and bridges, and how a port name maps onto them.
pub mod device_ids;

/// Channels to a bootloader over UART, USB HID or SMBus.
pub mod port;

/// Send boot records to an EFM8 bootloader and interpret its replies.
pub mod protocol;
