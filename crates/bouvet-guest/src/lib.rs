//! # bouvet-guest
//!
//! In-guest control core for bouvet microVMs.
//!
//! This crate holds everything the guest agent does besides speaking its
//! wire protocol: picking the host transport, attaching hotplugged block
//! devices, and reconciling the guest network with what the host declares.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  bouvet-agent (binary)                   │
//! │        JSON-RPC dispatch over ChannelStream              │
//! └──────────────────────────────────────────────────────────┘
//!            │                    │                  │
//!            ▼                    ▼                  ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │     Channel      │ │  DeviceRegistry  │ │     Sandbox      │
//! │  vsock | serial  │ │   blk | scsi     │ │     Network      │
//! │  (yamux session) │ │  (oci::Spec)     │ │  ifaces | routes │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!            │                    │                  │
//!            ▼                    ▼                  ▼
//!   /sys/class/virtio-ports  /sys/bus/pci       rtnetlink
//!   /dev/vsock               /sys/class/scsi_*
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use bouvet_guest::{AgentConfig, Channel, DeviceRegistry, Sandbox};
//!
//! # async fn example() -> bouvet_guest::Result<()> {
//! let config = AgentConfig::from_env();
//! let sandbox = Sandbox::connect(&config)?;
//! let devices = DeviceRegistry::with_defaults(&config);
//!
//! let mut channel = Channel::negotiate(&config)?;
//! channel.setup()?;
//! channel.wait()?;
//! channel.listen()?;
//!
//! while let Ok(stream) = channel.accept().await {
//!     // serve requests on `stream` using `sandbox` and `devices`
//! }
//! channel.teardown()?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod network;
pub mod oci;
pub mod sandbox;
pub mod sysfs;

pub use channel::{Channel, ChannelStream};
pub use config::{AgentConfig, ConfigError, GuestPaths};
pub use device::{Device, DeviceHandler, DeviceRegistry};
pub use error::{AgentError, ErrorKind, ReconcileError, Result};
pub use network::{Interface, IpAddress, IpFamily, Network, Route};
pub use oci::Spec;
pub use sandbox::Sandbox;
