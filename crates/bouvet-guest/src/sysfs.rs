//! Read-only probes over kernel-exposed device trees.
//!
//! Every function here is a single attempt. Callers that need to ride out
//! hotplug lag wrap these in [`crate::device::wait_for`].

use crate::error::{AgentError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, trace, warn};

/// Subdirectory under a PCI bridge listing the bus it exposes.
const PCI_BUS_DIR: &str = "pci_bus";

/// Bridges hang off the root bus of PCI domain 0.
const PCI_ROOT_BUS: &str = "0000:00";

/// Only one SCSI controller is ever attached, on channel 0.
const SCSI_HOST_CHANNEL: &str = "0:0:";

/// Locate the device node of the virtio-serial port whose `name` attribute
/// contains `serial_name`.
///
/// Ports populate asynchronously, so a port without a `name` file yet is
/// skipped rather than treated as an error.
pub fn find_virtual_serial_path(
    ports_dir: &Path,
    dev_root: &Path,
    serial_name: &str,
) -> Result<PathBuf> {
    let ports = fs::read_dir(ports_dir)?;

    for port in ports {
        let port = port?.file_name();
        let name_path = ports_dir.join(&port).join("name");

        let content = match fs::read_to_string(&name_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(file = %name_path.display(), "skip parsing of non-existent file");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if content.contains(serial_name) {
            let path = dev_root.join(&port);
            info!(path = %path.display(), "found virtio serial port");
            return Ok(path);
        }
    }

    Err(AgentError::not_found(format!(
        "could not find virtio port {serial_name}"
    )))
}

/// Whether the vsock device node exists.
pub fn vsock_device_exists(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Validate one PCI slot token: one or two hex digits.
fn parse_pci_slot(token: &str) -> Result<&str> {
    let valid = !token.is_empty()
        && token.len() <= 2
        && token.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(token)
    } else {
        Err(AgentError::invalid(format!(
            "PCI slot {token:?} is not a hex identifier"
        )))
    }
}

/// Resolve a `bridge/device` PCI identifier into the full nested sysfs
/// address, e.g. `02/03` becomes `0000:00:02.0/0000:01:03.0`.
///
/// The bridge sits on the root bus with function 0. The bus it exposes is
/// read from its `pci_bus` directory rather than assumed, and must be the
/// only entry there.
pub fn get_device_pci_address(pci_devices: &Path, pci_id: &str) -> Result<String> {
    let tokens: Vec<&str> = pci_id.split('/').collect();
    let [bridge_id, device_id] = tokens.as_slice() else {
        return Err(AgentError::invalid(format!(
            "PCI identifier for device should be of format [bridgeAddr/deviceAddr], got {pci_id}"
        )));
    };
    let bridge_id = parse_pci_slot(bridge_id)?;
    let device_id = parse_pci_slot(device_id)?;

    let bridge_addr = format!("{PCI_ROOT_BUS}:{bridge_id}.0");
    let bridge_bus_path = pci_devices.join(&bridge_addr).join(PCI_BUS_DIR);

    let entries = match fs::read_dir(&bridge_bus_path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(AgentError::not_found(format!(
                "PCI bridge {bridge_addr} not attached yet"
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let buses = entries
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<Vec<_>>>()?;

    let [bus] = buses.as_slice() else {
        return Err(AgentError::not_found(format!(
            "expected one bus entry in {}, got {}",
            bridge_bus_path.display(),
            buses.len()
        )));
    };

    let address = format!("{bridge_addr}/{bus}:{device_id}.0");
    info!(pci_addr = %address, "fetched PCI address for device");
    Ok(address)
}

/// Split a `scsi_id:lun` address.
pub fn parse_scsi_addr(scsi_addr: &str) -> Result<(&str, &str)> {
    match scsi_addr.split(':').collect::<Vec<_>>().as_slice() {
        [id, lun] if !id.is_empty() && !lun.is_empty() => Ok((*id, *lun)),
        _ => Err(AgentError::invalid(format!(
            "unexpected format for SCSI address {scsi_addr:?}, expect SCSIID:LUN"
        ))),
    }
}

/// Ask every SCSI host to probe for `scsi_id:lun`.
///
/// A missing host root means the controller driver is not loaded. No host
/// entries yet is a successful no-op; retrying is up to the caller.
pub fn scan_scsi_bus(scsi_host: &Path, scsi_addr: &str) -> Result<()> {
    let (id, lun) = parse_scsi_addr(scsi_addr)?;

    if !scsi_host.exists() {
        return Err(AgentError::not_found(format!(
            "SCSI host path {} does not exist",
            scsi_host.display()
        )));
    }

    let scan_data = format!("0 {id} {lun}");
    for host in fs::read_dir(scsi_host)? {
        let host = host?.file_name();
        if !host.to_string_lossy().starts_with("host") {
            continue;
        }
        let scan_path = scsi_host.join(&host).join("scan");
        trace!(path = %scan_path.display(), data = %scan_data, "triggering SCSI scan");
        fs::write(&scan_path, scan_data.as_bytes())?;
    }

    Ok(())
}

/// Directory listing the block device behind a SCSI address.
pub fn scsi_block_dir(scsi_disk: &Path, scsi_addr: &str) -> PathBuf {
    scsi_disk
        .join(format!("{SCSI_HOST_CHANNEL}{scsi_addr}"))
        .join("device/block")
}

/// Block device name of a SCSI disk, if it has shown up.
pub fn find_scsi_disk(scsi_disk: &Path, scsi_addr: &str) -> Result<Option<String>> {
    let block_dir = scsi_block_dir(scsi_disk, scsi_addr);
    let names = match list_names(&block_dir)? {
        Some(names) => names,
        None => return Ok(None),
    };

    match names.as_slice() {
        [] => Ok(None),
        [name] => Ok(Some(name.clone())),
        _ => Err(AgentError::internal(format!(
            "expected one block device in {}, got {}",
            block_dir.display(),
            names.len()
        ))),
    }
}

/// Block device name of a virtio-blk PCI function, if it has shown up.
///
/// `pci_addr` is the nested address from [`get_device_pci_address`]; the
/// device function is looked up under `<pci_devices>/<last component>`.
pub fn find_pci_block_device(pci_devices: &Path, pci_addr: &str) -> Result<Option<String>> {
    let function = pci_addr.rsplit('/').next().unwrap_or(pci_addr);
    let device_dir = pci_devices.join(function);

    let Some(children) = list_names(&device_dir)? else {
        return Ok(None);
    };

    for child in children.iter().filter(|name| name.starts_with("virtio")) {
        let block_dir = device_dir.join(child).join("block");
        if let Some(names) = list_names(&block_dir)? {
            if let Some(name) = names.into_iter().next() {
                return Ok(Some(name));
            }
        }
    }

    Ok(None)
}

/// Sorted entry names of `dir`, or `None` if it does not exist.
fn list_names(dir: &Path) -> Result<Option<Vec<String>>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut names = entries
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<Vec<_>>>()?;
    names.sort();
    Ok(Some(names))
}
