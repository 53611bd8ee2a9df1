//! Packed bootloaders and the IDB image built from them.

pub mod idb;
pub mod package;

pub use idb::{IDB_LBA, IDB_SECTORS, build_idb, build_idb_from_package};
pub use package::{BootEntry, BootHeader, BootPackage, EntryKind};
