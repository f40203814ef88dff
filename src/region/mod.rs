//! On-disk layouts: boot region, partition tables, directory entries.
//! Field access goes through the byte codec; nothing here touches
//! the device.

pub(crate) mod boot;
pub(crate) mod dir;
pub(crate) mod partition;
