//! Control channel negotiation.
//!
//! All host/guest command traffic rides a single multiplexed byte stream,
//! carried either by a vsock listener or by a virtio-serial port wrapped in
//! a yamux session. Exactly one [`Channel`] is negotiated per agent process.
//!
//! Lifecycle: [`Channel::negotiate`] → [`Channel::setup`] → [`Channel::wait`]
//! → [`Channel::listen`] → [`Channel::accept`] → [`Channel::teardown`].

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::sysfs::{find_virtual_serial_path, vsock_device_exists};
use futures::StreamExt;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_vsock::{VsockAddr, VsockListener, VsockStream, VMADDR_CID_ANY};
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::session::Session;
use tokio_yamux::stream::StreamHandle;
use tracing::{debug, info, warn};

/// epoll token identifying the serial descriptor.
const SERIAL_TOKEN: u64 = 1;

/// Probe whether the kernel knows the vsock address family.
///
/// `EAFNOSUPPORT` is a normal negative answer; any other failure to create
/// the throwaway socket is fatal.
pub fn is_af_vsock_supported() -> Result<bool> {
    match socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    ) {
        Ok(fd) => {
            drop(fd);
            Ok(true)
        }
        Err(Errno::EAFNOSUPPORT) => Ok(false),
        Err(e) => Err(io::Error::from(e).into()),
    }
}

/// The negotiated control transport.
pub enum Channel {
    /// vsock sockets are created lazily at listen time.
    Vsock(VsockChannel),
    /// virtio-serial character device multiplexed with yamux.
    Serial(SerialChannel),
}

impl Channel {
    /// Pick the transport for this guest.
    ///
    /// vsock is chosen only when the kernel supports the socket family AND
    /// the vsock device node exists; a kernel that supports vsock while the
    /// hypervisor is still wired for serial gets the serial channel.
    pub fn negotiate(config: &AgentConfig) -> Result<Self> {
        let supported = is_af_vsock_supported()?;
        debug!(vsock_supported = supported, "probed vsock support");
        Self::select(supported, config)
    }

    fn select(vsock_supported: bool, config: &AgentConfig) -> Result<Self> {
        if vsock_supported && vsock_device_exists(&config.paths.vsock_device)? {
            info!(port = config.vsock_port, "using vsock channel");
            return Ok(Channel::Vsock(VsockChannel::new(config.vsock_port)));
        }

        if vsock_supported {
            info!(
                path = %config.paths.vsock_device.display(),
                "vsock supported but device missing, falling back to serial"
            );
        }
        info!(name = %config.serial_channel_name, "using serial channel");
        Ok(Channel::Serial(SerialChannel::new(config)))
    }

    /// Short transport name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Channel::Vsock(_) => "vsock",
            Channel::Serial(_) => "serial",
        }
    }

    /// Prepare the transport resource.
    pub fn setup(&mut self) -> Result<()> {
        match self {
            Channel::Vsock(_) => Ok(()),
            Channel::Serial(serial) => serial.setup(),
        }
    }

    /// Block the calling thread until a host peer can be served.
    ///
    /// There is no timeout: the agent has nothing to do before the host
    /// attaches.
    pub fn wait(&self) -> Result<()> {
        match self {
            Channel::Vsock(_) => Ok(()),
            Channel::Serial(serial) => serial.wait(),
        }
    }

    /// Start accepting logical streams. Must run inside a tokio runtime.
    pub fn listen(&mut self) -> Result<()> {
        match self {
            Channel::Vsock(vsock) => vsock.listen(),
            Channel::Serial(serial) => serial.listen(),
        }
    }

    /// Accept the next logical stream.
    ///
    /// For the serial transport this also drives the yamux session, so it
    /// must be polled continuously for open streams to make progress.
    pub async fn accept(&mut self) -> io::Result<ChannelStream> {
        match self {
            Channel::Vsock(vsock) => vsock.accept().await,
            Channel::Serial(serial) => serial.accept().await,
        }
    }

    /// Release the transport resource, closing the listener with it.
    pub fn teardown(&mut self) -> Result<()> {
        match self {
            Channel::Vsock(vsock) => {
                vsock.listener = None;
                Ok(())
            }
            Channel::Serial(serial) => serial.teardown(),
        }
    }
}

fn not_listening() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel is not listening")
}

/// vsock transport. The listener is created lazily by `listen`.
pub struct VsockChannel {
    port: u32,
    listener: Option<VsockListener>,
}

impl VsockChannel {
    pub fn new(port: u32) -> Self {
        Self {
            port,
            listener: None,
        }
    }

    fn listen(&mut self) -> Result<()> {
        let listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, self.port))
            .map_err(|e| bind_error(self.port, e))?;
        info!(port = self.port, "listening on vsock");
        self.listener = Some(listener);
        Ok(())
    }

    async fn accept(&mut self) -> io::Result<ChannelStream> {
        let listener = self.listener.as_mut().ok_or_else(not_listening)?;
        let (stream, addr) = listener.accept().await?;
        debug!(cid = addr.cid(), port = addr.port(), "accepted vsock stream");
        Ok(ChannelStream::Vsock(stream))
    }
}

/// A bind refused for lack of the address family means the kernel cannot
/// serve vsock at all.
fn bind_error(port: u32, e: io::Error) -> AgentError {
    match e.raw_os_error() {
        Some(libc::EAFNOSUPPORT) => AgentError::Unsupported(format!("vsock port {port}: {e}")),
        _ => e.into(),
    }
}

/// virtio-serial transport.
pub struct SerialChannel {
    ports_dir: PathBuf,
    dev_root: PathBuf,
    name: String,
    file: Option<File>,
    /// Owns the descriptor once listening.
    session: Option<Session<SerialStream>>,
}

impl SerialChannel {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            ports_dir: config.paths.virtio_ports.clone(),
            dev_root: config.paths.dev_root.clone(),
            name: config.serial_channel_name.clone(),
            file: None,
            session: None,
        }
    }

    /// Wrap an already-open descriptor, skipping port discovery.
    pub fn from_file(file: File) -> Self {
        Self {
            ports_dir: PathBuf::new(),
            dev_root: PathBuf::new(),
            name: String::new(),
            file: Some(file),
            session: None,
        }
    }

    fn setup(&mut self) -> Result<()> {
        let path = find_virtual_serial_path(&self.ports_dir, &self.dev_root, &self.name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        info!(path = %path.display(), "opened serial channel");
        self.file = Some(file);
        Ok(())
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| AgentError::internal("serial port IO closed"))
    }

    /// Edge-triggered wait for `EPOLLOUT`.
    ///
    /// The port reports `EPOLLHUP` level-triggered for as long as no host is
    /// attached, so hang-ups are ignored and only writability or an error
    /// ends the wait.
    fn wait(&self) -> Result<()> {
        let file = self.file()?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?;
        epoll
            .add(
                file,
                EpollEvent::new(EpollFlags::EPOLLOUT | EpollFlags::EPOLLET, SERIAL_TOKEN),
            )
            .map_err(io::Error::from)?;

        let mut events = [EpollEvent::empty()];
        loop {
            let ready = match epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            };

            for event in events.iter().take(ready) {
                if event.data() != SERIAL_TOKEN {
                    continue;
                }
                let flags = event.events();
                debug!(events = ?flags, "new serial channel event");

                if flags.contains(EpollFlags::EPOLLOUT) {
                    info!("serial channel peer attached");
                    return Ok(());
                }
                if flags.contains(EpollFlags::EPOLLERR) {
                    return Err(AgentError::internal("serial port IO failure"));
                }
                if flags.contains(EpollFlags::EPOLLHUP) {
                    debug!("serial channel hang-up, waiting for host");
                }
            }
        }
    }

    fn listen(&mut self) -> Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| AgentError::internal("serial port IO closed"))?;
        self.session = Some(Session::new_server(
            SerialStream::new(file)?,
            YamuxConfig::default(),
        ));
        info!("serving yamux session on serial channel");
        Ok(())
    }

    async fn accept(&mut self) -> io::Result<ChannelStream> {
        let session = self.session.as_mut().ok_or_else(not_listening)?;
        match session.next().await {
            Some(Ok(stream)) => {
                debug!("accepted yamux stream");
                Ok(ChannelStream::Serial(stream))
            }
            Some(Err(e)) => Err(e),
            None => {
                warn!("yamux session closed");
                Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "yamux session closed",
                ))
            }
        }
    }

    fn teardown(&mut self) -> Result<()> {
        let session = self.session.take();
        let file = self.file.take();
        if session.is_some() || file.is_some() {
            drop(session);
            drop(file);
            debug!("closed serial channel");
        }
        Ok(())
    }
}

/// One logical request/response stream.
pub enum ChannelStream {
    Vsock(VsockStream),
    Serial(StreamHandle),
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Vsock(s) => Pin::new(s).poll_read(cx, buf),
            ChannelStream::Serial(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ChannelStream::Vsock(s) => Pin::new(s).poll_write(cx, buf),
            ChannelStream::Serial(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Vsock(s) => Pin::new(s).poll_flush(cx),
            ChannelStream::Serial(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Vsock(s) => Pin::new(s).poll_shutdown(cx),
            ChannelStream::Serial(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Non-blocking serial descriptor registered with the tokio reactor, so the
/// multiplexer can read and write it concurrently.
pub struct SerialStream {
    inner: AsyncFd<File>,
}

impl SerialStream {
    fn new(file: File) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }
}

impl AsyncRead for SerialStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuestPaths;
    use crate::error::ErrorKind;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config_in(tmp: &TempDir) -> AgentConfig {
        let mut paths = GuestPaths::with_sysfs_root(tmp.path().join("sys"));
        paths.dev_root = tmp.path().join("dev");
        paths.vsock_device = tmp.path().join("dev/vsock");
        AgentConfig {
            paths,
            ..Default::default()
        }
    }

    fn file_from(stream: UnixStream) -> File {
        File::from(OwnedFd::from(stream))
    }

    #[test]
    fn test_select_serial_without_vsock_support() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp);
        std::fs::create_dir_all(tmp.path().join("dev")).unwrap();
        std::fs::write(&config.paths.vsock_device, "").unwrap();

        let channel = Channel::select(false, &config).unwrap();
        assert_eq!(channel.kind(), "serial");
    }

    #[test]
    fn test_select_serial_when_vsock_device_missing() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp);
        let channel = Channel::select(true, &config).unwrap();
        assert_eq!(channel.kind(), "serial");
    }

    #[test]
    fn test_select_vsock() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp);
        std::fs::create_dir_all(tmp.path().join("dev")).unwrap();
        std::fs::write(&config.paths.vsock_device, "").unwrap();

        let mut channel = Channel::select(true, &config).unwrap();
        assert_eq!(channel.kind(), "vsock");
        assert!(channel.setup().is_ok());
        assert!(channel.wait().is_ok());
        assert!(channel.teardown().is_ok());
    }

    #[test]
    fn test_serial_setup_port_not_found() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp);
        std::fs::create_dir_all(&config.paths.virtio_ports).unwrap();

        let mut channel = Channel::Serial(SerialChannel::new(&config));
        let err = channel.setup().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_serial_setup_and_teardown() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp);
        let port = config.paths.virtio_ports.join("vport1p1");
        std::fs::create_dir_all(&port).unwrap();
        std::fs::write(port.join("name"), "agent.channel.0").unwrap();
        std::fs::create_dir_all(&config.paths.dev_root).unwrap();
        std::fs::write(config.paths.dev_root.join("vport1p1"), "").unwrap();

        let mut channel = Channel::Serial(SerialChannel::new(&config));
        channel.setup().unwrap();
        channel.teardown().unwrap();
        // second teardown is a no-op
        channel.teardown().unwrap();
    }

    #[test]
    fn test_serial_wait_returns_when_writable() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let channel = Channel::Serial(SerialChannel::from_file(file_from(ours)));
        assert!(channel.wait().is_ok());
    }

    #[test]
    fn test_serial_wait_without_setup_fails() {
        let tmp = TempDir::new().unwrap();
        let channel = Channel::Serial(SerialChannel::new(&config_in(&tmp)));
        assert!(channel.wait().is_err());
    }

    #[tokio::test]
    async fn test_serial_teardown_closes_listening_descriptor() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        theirs
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();

        let mut channel = Channel::Serial(SerialChannel::from_file(file_from(ours)));
        channel.listen().unwrap();
        channel.teardown().unwrap();

        let mut buf = Vec::new();
        assert_eq!(std::io::Read::read_to_end(&mut theirs, &mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accept_before_listen_fails() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let mut channel = Channel::Serial(SerialChannel::from_file(file_from(ours)));
        let err = channel.accept().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let mut vsock = Channel::Vsock(VsockChannel::new(1024));
        assert!(vsock.accept().await.is_err());
    }

    #[test]
    fn test_vsock_bind_without_family_is_unsupported() {
        let err = bind_error(1024, io::Error::from_raw_os_error(libc::EAFNOSUPPORT));
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        let err = bind_error(1024, io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_serial_stream_io() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        theirs.set_nonblocking(true).unwrap();

        let mut local = SerialStream::new(file_from(ours)).unwrap();
        let mut remote = SerialStream::new(file_from(theirs)).unwrap();

        local.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
