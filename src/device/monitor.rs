//! Block-device notifications from udev.
//!
//! Listens on a `NETLINK_KOBJECT_UEVENT` socket joined to the udev
//! multicast group only. The kernel group carries the same physical events
//! before udev has processed them; subscribing to both would deliver every
//! event twice, and the kernel copies lack the `ID_*` properties anyway.
//!
//! udev frames each message with a small header:
//!
//! ```text
//! 0   "libudev\0"           8-byte prefix
//! 8   0xfeedcafe            magic, big-endian
//! 12  header_size           native-endian u32
//! 16  properties_off        native-endian u32
//! 20  properties_len        native-endian u32
//! 24  filter hashes/bloom   (unused here)
//! ```
//!
//! followed by the NUL-separated `KEY=VALUE` property blob.
//!
//! Any local process may unicast a datagram to our port id, so only
//! multicast messages carrying root credentials are accepted.
use std::collections::HashMap;
use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    bind, recvmsg, setsockopt, socket, sockopt, AddressFamily, ControlMessageOwned, MsgFlags,
    NetlinkAddr, SockFlag, SockProtocol, SockType, UnixCredentials,
};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::Device;

/// Multicast group udevd re-broadcasts processed events on (1 is the raw kernel group).
const UDEV_MONITOR_GROUP: u32 = 2;

const UDEV_PREFIX: &[u8; 8] = b"libudev\0";
const UDEV_MAGIC: u32 = 0xfeed_cafe;
const UDEV_HEADER_MIN: usize = 24;

/// Large enough for any udev message (udevd caps properties at 8 KiB).
const RECV_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("cannot open udev netlink socket: {0}")]
    Socket(#[source] Errno),
    #[error("cannot join udev multicast group: {0}")]
    Bind(#[source] Errno),
    #[error("cannot enable sender credentials: {0}")]
    Credentials(#[source] Errno),
    #[error("netlink receive failed: {0}")]
    Receive(#[from] io::Error),
}

/// Events emitted by the monitor task to the dispatcher
#[derive(Debug)]
pub enum MonitorEvent {
    Device(Device),
    /// The notification bus failed; no further events will arrive.
    Error(String),
}

/// Origin of a datagram as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sender {
    groups: u32,
    uid: Option<u32>,
}

impl Sender {
    /// udevd broadcasts as root. Unicast datagrams and unprivileged senders
    /// are never device events.
    fn is_udev(&self) -> bool {
        self.groups != 0 && self.uid == Some(0)
    }
}

pub struct UdevMonitor {
    socket: AsyncFd<OwnedFd>,
    buf: Vec<u8>,
}

impl UdevMonitor {
    /// Opens the netlink socket. Must be called inside a tokio runtime.
    pub fn open() -> Result<Self, MonitorError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(MonitorError::Socket)?;

        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, UDEV_MONITOR_GROUP))
            .map_err(MonitorError::Bind)?;
        setsockopt(&fd, sockopt::PassCred, &true).map_err(MonitorError::Credentials)?;

        Ok(Self {
            socket: AsyncFd::new(fd)?,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    /// Waits for the next block-subsystem device notification.
    ///
    /// Untrusted, foreign, malformed and non-block messages are skipped.
    pub async fn next_device(&mut self) -> Result<Device, MonitorError> {
        loop {
            let (len, sender) = self.recv_datagram().await?;
            if !sender.is_udev() {
                debug!(
                    "Ignoring netlink message from untrusted sender (groups {}, uid {:?})",
                    sender.groups, sender.uid
                );
                continue;
            }
            let Some(properties) = decode(&self.buf[..len]) else {
                debug!("Skipping {len}-byte netlink message without udev framing");
                continue;
            };

            let device = Device::from_properties(properties);
            if device.subsystem.as_deref() != Some("block") {
                continue;
            }
            return Ok(device);
        }
    }

    async fn recv_datagram(&mut self) -> Result<(usize, Sender), MonitorError> {
        loop {
            let mut guard = self.socket.readable().await?;
            let buf = &mut self.buf;
            match guard.try_io(|inner| receive(inner.as_raw_fd(), buf)) {
                Ok(Ok(received)) => return Ok(received),
                // The socket buffer overflowed during a burst; events were
                // lost but the socket is still usable.
                Ok(Err(e)) if e.raw_os_error() == Some(Errno::ENOBUFS as i32) => {
                    warn!("udev socket overrun, some device events were dropped");
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(MonitorError::Receive(e)),
                Err(_would_block) => {}
            }
        }
    }

    /// Moves the monitor into a background task and returns the event channel.
    ///
    /// On a receive failure a final `MonitorEvent::Error` is sent and the
    /// channel closes.
    pub fn spawn(mut self) -> mpsc::Receiver<MonitorEvent> {
        let (event_tx, event_rx) = mpsc::channel::<MonitorEvent>(100);

        tokio::spawn(async move {
            loop {
                let event = match self.next_device().await {
                    Ok(device) => MonitorEvent::Device(device),
                    Err(e) => {
                        error!("udev monitor stopped: {e}");
                        let _ = event_tx.send(MonitorEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    debug!("Dispatcher gone, udev monitor task exiting");
                    return;
                }
            }
        });

        event_rx
    }
}

/// Subscribes to block-device notifications.
pub fn subscribe() -> anyhow::Result<mpsc::Receiver<MonitorEvent>> {
    let monitor = UdevMonitor::open()?;
    info!("Listening for udev block events");
    Ok(monitor.spawn())
}

fn receive(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Sender)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!(UnixCredentials);
    let msg = recvmsg::<NetlinkAddr>(fd, &mut iov, Some(&mut cmsg), MsgFlags::empty())?;

    let uid = msg.cmsgs()?.find_map(|cmsg| match cmsg {
        ControlMessageOwned::ScmCredentials(cred) => Some(cred.uid()),
        _ => None,
    });
    let sender = Sender {
        groups: msg.address.map_or(0, |addr| addr.groups()),
        uid,
    };
    Ok((msg.bytes, sender))
}

fn read_u32_ne(msg: &[u8], offset: usize) -> Option<u32> {
    let bytes = msg.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

/// Decodes a udev monitor message into its property map.
///
/// Returns `None` for anything not framed by udev, including raw kernel
/// uevents (`add@/devices/...`).
pub fn decode(msg: &[u8]) -> Option<HashMap<String, String>> {
    if msg.len() < UDEV_HEADER_MIN || &msg[..8] != UDEV_PREFIX {
        return None;
    }

    let magic = u32::from_be_bytes(msg[8..12].try_into().ok()?);
    if magic != UDEV_MAGIC {
        return None;
    }

    let header_size = read_u32_ne(msg, 12)? as usize;
    let offset = read_u32_ne(msg, 16)? as usize;
    let len = read_u32_ne(msg, 20)? as usize;
    if header_size < UDEV_HEADER_MIN || offset < header_size {
        return None;
    }
    let blob = msg.get(offset..offset.checked_add(len)?)?;

    let properties = blob
        .split(|b| *b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();

    Some(properties)
}
