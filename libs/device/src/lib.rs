//! the device view the rule matcher and name resolver operate over.
//!
//! Builds on the `Device` shape from sysMaster's own `libdevice`, trimmed to
//! a read-only data model: real sysfs traversal is an external collaborator
//! (see [`provider::SysfsProvider`]) so the matcher/resolver stay free of
//! filesystem I/O and are unit-testable against a fully in-memory tree.
pub mod device;
pub mod provider;

pub use device::Device;
pub use provider::{FakeSysfs, RealSysfs, SysfsProvider};
