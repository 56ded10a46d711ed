//! Per-machine client identity.
//!
//! Every object this machine uploads is tagged with its [`ClientId`], which
//! is how the reconciler recognises its own writes. The identity is derived
//! from a network interface's hardware address so it survives restarts
//! without any on-disk state.

use crate::error::{ErrorKind, Result};
use cloudsync_storage::ClientId;
use exn::{OptionExt, ResultExt};
use std::fs;
use std::io;
use std::path::PathBuf;

/// Interfaces that win over alphabetical order when they have an address.
const PREFERRED_INTERFACES: [&str; 2] = ["wlan0", "en0"];
const CLIENT_ID_LENGTH: usize = 16;
const SYSFS_NET: &str = "/sys/class/net";

pub type HardwareAddress = [u8; 6];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub address: Option<HardwareAddress>,
}
impl Interface {
    pub fn new(name: impl Into<String>, address: Option<HardwareAddress>) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }

    fn usable_address(&self) -> Option<&HardwareAddress> {
        self.address.as_ref().filter(|address| address.iter().any(|byte| *byte != 0))
    }
}

/// Somewhere to enumerate network interfaces from.
pub trait InterfaceSource {
    fn interfaces(&self) -> io::Result<Vec<Interface>>;
}

/// Reads the Linux interface table under `/sys/class/net`.
#[derive(Debug, Clone)]
pub struct SysfsInterfaces {
    root: PathBuf,
}
impl SysfsInterfaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}
impl Default for SysfsInterfaces {
    fn default() -> Self {
        Self::new(SYSFS_NET)
    }
}
impl InterfaceSource for SysfsInterfaces {
    fn interfaces(&self) -> io::Result<Vec<Interface>> {
        let mut interfaces = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Interfaces without an address file (or unreadable ones) still
            // count, they just can't be chosen.
            let address = fs::read_to_string(entry.path().join("address")).ok().and_then(|s| parse_address(&s));
            interfaces.push(Interface::new(name, address));
        }
        Ok(interfaces)
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` (surrounding whitespace allowed).
pub fn parse_address(value: &str) -> Option<HardwareAddress> {
    let mut address = [0u8; 6];
    let mut parts = value.trim().split(':');
    for byte in address.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    match parts.next() {
        Some(_) => None,
        None => Some(address),
    }
}

/// Hash a hardware address into a short, stable identifier.
pub fn client_id_from_address(address: &HardwareAddress) -> ClientId {
    let hex = blake3::hash(address).to_hex();
    ClientId::new(&hex.as_str()[..CLIENT_ID_LENGTH])
}

/// Pick an interface and derive the identity from its address.
///
/// Interfaces are considered in name order; `wlan0` or `en0` is used when
/// present with a usable (non-zero) address, otherwise the first interface
/// that has one.
pub fn derive_client_id(source: &dyn InterfaceSource) -> Result<ClientId> {
    let mut interfaces = source.interfaces().or_raise(|| ErrorKind::Identity)?;
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    let preferred = PREFERRED_INTERFACES
        .iter()
        .find_map(|name| interfaces.iter().find(|i| i.name == *name).and_then(|i| i.usable_address().map(|a| (i, a))));
    let (interface, address) = preferred
        .or_else(|| interfaces.iter().find_map(|i| i.usable_address().map(|a| (i, a))))
        .ok_or_raise(|| ErrorKind::Identity)?;
    let client_id = client_id_from_address(address);
    tracing::debug!(interface = %interface.name, client_id = %client_id, "derived client identity");
    Ok(client_id)
}

/// Use the pinned identity if there is one, otherwise derive it.
pub fn resolve(pinned: Option<&str>, source: &dyn InterfaceSource) -> Result<ClientId> {
    match pinned.map(str::trim) {
        Some("") => exn::bail!(ErrorKind::Identity),
        Some(id) => Ok(ClientId::new(id)),
        None => derive_client_id(source),
    }
}
