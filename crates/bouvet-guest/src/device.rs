//! Hotplugged block device attachment.
//!
//! The host describes a device by an abstract address (a PCI `bridge/device`
//! pair or a SCSI `id:lun`). A [`DeviceHandler`] chosen by the device's type
//! tag resolves that address into a guest device node and records its
//! major/minor numbers in the container's OCI spec.

use crate::config::{AgentConfig, GuestPaths};
use crate::error::{AgentError, ErrorKind, Result};
use crate::oci::Spec;
use crate::sandbox::Sandbox;
use crate::sysfs::{find_pci_block_device, find_scsi_disk, get_device_pci_address, scan_scsi_bus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Type tag of the virtio-blk handler.
pub const DRIVER_BLK_TYPE: &str = "blk";

/// Type tag of the virtio-scsi handler.
pub const DRIVER_SCSI_TYPE: &str = "scsi";

/// A device the host asks the guest to expose to a container.
///
/// Empty strings mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Logical address; meaning depends on `kind`.
    #[serde(default)]
    pub id: String,
    /// Handler type tag.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Raw guest source path.
    #[serde(default)]
    pub vm_path: String,
    /// Target path inside the container.
    #[serde(default)]
    pub container_path: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Resolves one class of device into the OCI spec.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    async fn handle(&self, device: &Device, spec: &mut Spec, sandbox: &Sandbox) -> Result<()>;
}

/// Type tag → handler table.
///
/// Built once at startup and passed to whoever dispatches device requests.
#[derive(Default)]
pub struct DeviceRegistry {
    handlers: HashMap<String, Arc<dyn DeviceHandler>>,
}

impl DeviceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the virtio-blk and virtio-scsi handlers.
    pub fn with_defaults(config: &AgentConfig) -> Self {
        let mut registry = Self::new();
        registry.register(DRIVER_BLK_TYPE, VirtioBlkHandler::new(config));
        registry.register(DRIVER_SCSI_TYPE, VirtioScsiHandler::new(config));
        registry
    }

    /// Install `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, handler: impl DeviceHandler + 'static) {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    /// Whether a handler exists for `kind`.
    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Apply `devices` in order. `None` entries are skipped.
    pub async fn add_devices(
        &self,
        devices: &[Option<Device>],
        spec: &mut Spec,
        sandbox: &Sandbox,
    ) -> Result<()> {
        for device in devices.iter().flatten() {
            self.add_device(Some(device), spec, sandbox).await?;
        }
        Ok(())
    }

    /// Validate `device` and hand it to the handler for its type.
    pub async fn add_device(
        &self,
        device: Option<&Device>,
        spec: &mut Spec,
        sandbox: &Sandbox,
    ) -> Result<()> {
        let device = device.ok_or_else(|| AgentError::invalid("invalid device"))?;

        if device.kind.is_empty() {
            return Err(AgentError::invalid(format!(
                "invalid type for device {device:?}"
            )));
        }
        if device.id.is_empty() && device.vm_path.is_empty() {
            return Err(AgentError::invalid(format!(
                "invalid ID and VM path for device {device:?}"
            )));
        }
        if device.container_path.is_empty() {
            return Err(AgentError::invalid(format!(
                "invalid container path for device {device:?}"
            )));
        }

        let handler = self
            .handlers
            .get(&device.kind)
            .ok_or_else(|| AgentError::UnknownDeviceType(device.kind.clone()))?;

        info!(
            kind = %device.kind,
            id = %device.id,
            container_path = %device.container_path,
            "adding device"
        );
        handler.handle(device, spec, sandbox).await
    }
}

/// Poll `probe` until it yields a value or `timeout` elapses.
///
/// `probe` is a single attempt; `Ok(None)` means "not there yet" and an
/// error aborts the wait.
pub async fn wait_for<T, F>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = probe()? {
            debug!(
                what,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "hotplug resource ready"
            );
            return Ok(value);
        }
        if start.elapsed() >= timeout {
            return Err(AgentError::Timeout {
                what: what.to_string(),
                after: timeout,
            });
        }
        tokio::time::sleep(interval).await;
    }
}

/// Treat a not-found error as "not there yet".
fn not_yet<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write the major/minor numbers of `vm_path` into the spec entry whose
/// path is the device's container path.
///
/// The spec is only touched once every check has passed.
pub fn update_spec_device_list(device: &Device, vm_path: &Path, spec: &mut Spec) -> Result<()> {
    if device.container_path.is_empty() {
        return Err(AgentError::invalid(format!(
            "container path cannot be empty for device {device:?}"
        )));
    }

    let linux = spec
        .linux
        .as_mut()
        .ok_or_else(|| AgentError::invalid("spec does not contain a linux section"))?;

    let rdev = std::fs::metadata(vm_path)?.rdev();
    let major = nix::sys::stat::major(rdev) as i64;
    let minor = nix::sys::stat::minor(rdev) as i64;

    let entry = linux
        .devices
        .iter_mut()
        .find(|d| d.path == device.container_path)
        .ok_or_else(|| {
            AgentError::not_found(format!(
                "should have found a matching device {} in the spec",
                device.container_path
            ))
        })?;

    debug!(
        path = %entry.path,
        vm_path = %vm_path.display(),
        major,
        minor,
        "updating spec device"
    );
    entry.major = major;
    entry.minor = minor;
    Ok(())
}

/// virtio-blk: `id` is a PCI `bridge/device` pair, otherwise `vm_path` is
/// the node itself.
pub struct VirtioBlkHandler {
    paths: GuestPaths,
    timeout: Duration,
    interval: Duration,
}

impl VirtioBlkHandler {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            paths: config.paths.clone(),
            timeout: config.hotplug_timeout,
            interval: config.hotplug_poll_interval,
        }
    }

    async fn resolve(&self, device: &Device) -> Result<PathBuf> {
        if device.id.is_empty() {
            let vm_path = PathBuf::from(&device.vm_path);
            return wait_for(&device.vm_path, self.timeout, self.interval, || {
                Ok(vm_path.exists().then(|| vm_path.clone()))
            })
            .await;
        }

        let pci_addr = wait_for(&device.id, self.timeout, self.interval, || {
            not_yet(get_device_pci_address(&self.paths.pci_devices, &device.id))
        })
        .await?;
        let name = wait_for(&pci_addr, self.timeout, self.interval, || {
            find_pci_block_device(&self.paths.pci_devices, &pci_addr)
        })
        .await?;
        Ok(self.paths.dev_root.join(name))
    }
}

#[async_trait]
impl DeviceHandler for VirtioBlkHandler {
    async fn handle(&self, device: &Device, spec: &mut Spec, _sandbox: &Sandbox) -> Result<()> {
        let vm_path = self.resolve(device).await?;
        info!(vm_path = %vm_path.display(), "resolved virtio-blk device");
        update_spec_device_list(device, &vm_path, spec)
    }
}

/// virtio-scsi: `id` is `scsi_id:lun`.
pub struct VirtioScsiHandler {
    paths: GuestPaths,
    timeout: Duration,
    interval: Duration,
}

impl VirtioScsiHandler {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            paths: config.paths.clone(),
            timeout: config.hotplug_timeout,
            interval: config.hotplug_poll_interval,
        }
    }
}

#[async_trait]
impl DeviceHandler for VirtioScsiHandler {
    async fn handle(&self, device: &Device, spec: &mut Spec, _sandbox: &Sandbox) -> Result<()> {
        if device.id.is_empty() {
            return Err(AgentError::invalid(format!(
                "SCSI device requires an id:lun address, got {device:?}"
            )));
        }

        scan_scsi_bus(&self.paths.scsi_host, &device.id)?;
        let name = wait_for(&device.id, self.timeout, self.interval, || {
            find_scsi_disk(&self.paths.scsi_disk, &device.id)
        })
        .await?;

        let vm_path = self.paths.dev_root.join(name);
        info!(vm_path = %vm_path.display(), "resolved virtio-scsi device");
        update_spec_device_list(device, &vm_path, spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::netlink::fake::FakeNetlink;
    use crate::oci::LinuxDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct NoopHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeviceHandler for NoopHandler {
        async fn handle(&self, _: &Device, _: &mut Spec, _: &Sandbox) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sandbox() -> Sandbox {
        Sandbox::new(Arc::new(FakeNetlink::new()), &AgentConfig::default())
    }

    fn noop_registry() -> (DeviceRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = DeviceRegistry::new();
        registry.register(
            "noop",
            NoopHandler {
                calls: calls.clone(),
            },
        );
        (registry, calls)
    }

    fn fast_config(tmp: &TempDir) -> AgentConfig {
        let mut paths = GuestPaths::with_sysfs_root(tmp.path().join("sys"));
        paths.dev_root = tmp.path().join("dev");
        AgentConfig {
            paths,
            hotplug_timeout: Duration::from_millis(200),
            hotplug_poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_devices_empty_and_none() {
        let (registry, calls) = noop_registry();
        let sandbox = sandbox();
        let mut spec = Spec::default();

        registry.add_devices(&[], &mut spec, &sandbox).await.unwrap();
        registry
            .add_devices(&[None], &mut spec, &sandbox)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_add_device_validation() {
        let (registry, calls) = noop_registry();
        let sandbox = sandbox();
        let mut spec = Spec::default();

        let cases = [
            (None, false),
            (Some(Device::default()), false),
            (
                Some(Device {
                    kind: "noop".into(),
                    ..Default::default()
                }),
                false,
            ),
            (
                Some(Device {
                    kind: "noop".into(),
                    container_path: "/foo".into(),
                    ..Default::default()
                }),
                false,
            ),
            (
                Some(Device {
                    kind: "noop".into(),
                    vm_path: "/foo".into(),
                    ..Default::default()
                }),
                false,
            ),
            (
                Some(Device {
                    kind: "noop".into(),
                    vm_path: "/foo".into(),
                    container_path: "/foo".into(),
                    ..Default::default()
                }),
                true,
            ),
            (
                Some(Device {
                    kind: "noop".into(),
                    id: "02/03".into(),
                    container_path: "/foo".into(),
                    ..Default::default()
                }),
                true,
            ),
        ];

        let mut expected_calls = 0;
        for (device, ok) in cases {
            let result = registry.add_device(device.as_ref(), &mut spec, &sandbox).await;
            assert_eq!(result.is_ok(), ok, "device {device:?}: {result:?}");
            if ok {
                expected_calls += 1;
            } else {
                assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
    }

    #[tokio::test]
    async fn test_add_device_unknown_type() {
        let (registry, calls) = noop_registry();
        let device = Device {
            kind: "unknown".into(),
            vm_path: "/foo".into(),
            container_path: "/foo".into(),
            ..Default::default()
        };

        let err = registry
            .add_device(Some(&device), &mut Spec::default(), &sandbox())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownDeviceType(ref kind) if kind == "unknown"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_handlers_registered() {
        let registry = DeviceRegistry::with_defaults(&AgentConfig::default());
        assert!(registry.handles(DRIVER_BLK_TYPE));
        assert!(registry.handles(DRIVER_SCSI_TYPE));
        assert!(!registry.handles("noop"));
    }

    #[tokio::test]
    async fn test_blk_vm_path_updates_spec() {
        let tmp = TempDir::new().unwrap();
        let handler = VirtioBlkHandler::new(&fast_config(&tmp));
        let device = Device {
            kind: DRIVER_BLK_TYPE.into(),
            vm_path: "/dev/null".into(),
            container_path: "/dev/xvda".into(),
            ..Default::default()
        };
        let mut spec = Spec::with_devices(vec![LinuxDevice {
            path: "/dev/xvda".into(),
            kind: "c".into(),
            ..Default::default()
        }]);

        handler.handle(&device, &mut spec, &sandbox()).await.unwrap();

        let entry = &spec.linux.unwrap().devices[0];
        assert_eq!(entry.major, 1);
        assert_eq!(entry.minor, 3);
    }

    #[tokio::test]
    async fn test_blk_without_linux_section() {
        let tmp = TempDir::new().unwrap();
        let handler = VirtioBlkHandler::new(&fast_config(&tmp));
        let device = Device {
            kind: DRIVER_BLK_TYPE.into(),
            vm_path: "/dev/null".into(),
            container_path: "/dev/xvda".into(),
            ..Default::default()
        };
        let mut spec = Spec::default();

        let err = handler
            .handle(&device, &mut spec, &sandbox())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(spec, Spec::default());
    }

    #[tokio::test]
    async fn test_blk_without_matching_spec_device() {
        let tmp = TempDir::new().unwrap();
        let handler = VirtioBlkHandler::new(&fast_config(&tmp));
        let device = Device {
            kind: DRIVER_BLK_TYPE.into(),
            vm_path: "/dev/null".into(),
            container_path: "/dev/xvda".into(),
            ..Default::default()
        };
        let original = Spec::with_devices(vec![LinuxDevice {
            path: "/dev/other".into(),
            ..Default::default()
        }]);
        let mut spec = original.clone();

        let err = handler
            .handle(&device, &mut spec, &sandbox())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(spec, original);
    }

    #[tokio::test]
    async fn test_blk_vm_path_never_appears() {
        let tmp = TempDir::new().unwrap();
        let handler = VirtioBlkHandler::new(&fast_config(&tmp));
        let device = Device {
            kind: DRIVER_BLK_TYPE.into(),
            vm_path: tmp.path().join("dev/vdz").to_string_lossy().into_owned(),
            container_path: "/dev/xvda".into(),
            ..Default::default()
        };

        let err = handler
            .handle(&device, &mut Spec::with_devices(vec![]), &sandbox())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_blk_pci_bridge_never_attached() {
        let tmp = TempDir::new().unwrap();
        let handler = VirtioBlkHandler::new(&fast_config(&tmp));
        let device = Device {
            kind: DRIVER_BLK_TYPE.into(),
            id: "02/03".into(),
            container_path: "/dev/xvda".into(),
            ..Default::default()
        };

        let err = handler
            .handle(&device, &mut Spec::with_devices(vec![]), &sandbox())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_blk_malformed_pci_id_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let handler = VirtioBlkHandler::new(&fast_config(&tmp));
        let device = Device {
            kind: DRIVER_BLK_TYPE.into(),
            id: "02".into(),
            container_path: "/dev/xvda".into(),
            ..Default::default()
        };

        let err = handler
            .handle(&device, &mut Spec::with_devices(vec![]), &sandbox())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_scsi_requires_id() {
        let tmp = TempDir::new().unwrap();
        let handler = VirtioScsiHandler::new(&fast_config(&tmp));
        let device = Device {
            kind: DRIVER_SCSI_TYPE.into(),
            vm_path: "/dev/sda".into(),
            container_path: "/dev/sda".into(),
            ..Default::default()
        };

        let err = handler
            .handle(&device, &mut Spec::with_devices(vec![]), &sandbox())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_scsi_scans_then_times_out() {
        let tmp = TempDir::new().unwrap();
        let config = fast_config(&tmp);
        let host = config.paths.scsi_host.join("host0");
        std::fs::create_dir_all(&host).unwrap();

        let handler = VirtioScsiHandler::new(&config);
        let device = Device {
            kind: DRIVER_SCSI_TYPE.into(),
            id: "1:0".into(),
            container_path: "/dev/sda".into(),
            ..Default::default()
        };

        let err = handler
            .handle(&device, &mut Spec::with_devices(vec![]), &sandbox())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(std::fs::read_to_string(host.join("scan")).unwrap(), "0 1 0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_retries_until_ready() {
        let mut attempts = 0;
        let value = wait_for(
            "thing",
            Duration::from_secs(3),
            Duration::from_millis(50),
            || {
                attempts += 1;
                Ok((attempts == 3).then_some("ready"))
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "ready");
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_aborts_on_error() {
        let err = wait_for::<(), _>(
            "thing",
            Duration::from_secs(3),
            Duration::from_millis(50),
            || Err(AgentError::internal("broken")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
