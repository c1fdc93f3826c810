use std::{
    fmt, io,
    net::{SocketAddr, ToSocketAddrs as _},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

#[cfg(target_os = "linux")]
use std::path::PathBuf;

pub mod sync;

/// A destination for encoded payloads.
///
/// Transports are owned and driven exclusively by the forwarder thread, so they need no internal synchronization.
/// Sends are best-effort: there is no acknowledgement to wait for and the forwarder never retries a failed payload.
pub trait Transport: Send + 'static {
    /// Sends a single payload.
    ///
    /// # Errors
    ///
    /// If the payload could not be handed to the network, an error is returned. The forwarder logs the error, counts
    /// the payload as dropped, and carries on.
    fn send(&mut self, payload: &[u8]) -> io::Result<usize>;

    /// Returns a short identifier for the transport, such as `udp`.
    fn transport_id(&self) -> &'static str {
        "custom"
    }
}

impl<T> Transport for Box<T>
where
    T: Transport + ?Sized,
{
    fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
        (**self).send(payload)
    }

    fn transport_id(&self) -> &'static str {
        (**self).transport_id()
    }
}

#[derive(Clone, Debug)]
pub(crate) enum RemoteAddr {
    Udp(Vec<SocketAddr>),

    #[cfg(target_os = "linux")]
    Unixgram(PathBuf),
}

impl RemoteAddr {
    /// Returns the transport ID for the remote address.
    pub const fn transport_id(&self) -> &'static str {
        match self {
            RemoteAddr::Udp(_) => "udp",
            #[cfg(target_os = "linux")]
            RemoteAddr::Unixgram(_) => "uds",
        }
    }
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        if let Some((scheme, path)) = addr.split_once("://") {
            return match scheme {
                #[cfg(target_os = "linux")]
                "unixgram" => Ok(RemoteAddr::Unixgram(PathBuf::from(path))),
                "udp" => RemoteAddr::try_from(path),
                _ => Err(format!("invalid scheme '{}'", scheme)),
            };
        }

        match addr.to_socket_addrs() {
            Ok(addrs) => {
                let addrs = addrs.collect::<Vec<_>>();
                if addrs.is_empty() {
                    Err(format!("'{}' did not resolve to any addresses", addr))
                } else {
                    Ok(RemoteAddr::Udp(addrs))
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Forwarder configuration.
#[derive(Clone)]
pub(crate) struct ForwarderConfiguration {
    pub max_payload_len: usize,
    pub prefix: Option<String>,
    pub telemetry_interval: Option<Duration>,
}

/// Lifecycle state of the forwarder thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Forwarding records as they arrive.
    Running,

    /// Shutdown was signalled, and the remaining queued records are being forwarded.
    Draining,

    /// The forwarder has exited and released its transport.
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared, atomically updated view of the forwarder's [`WorkerState`].
#[derive(Clone)]
pub(crate) struct WorkerStateCell(Arc<AtomicU8>);

impl WorkerStateCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Running as u8)))
    }

    pub fn get(&self) -> WorkerState {
        match self.0.load(Ordering::Acquire) {
            0 => WorkerState::Running,
            1 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }

    pub fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
