//! Byte transports for the blocking connection.
//!
//! [`Transport`] is what the connection reads frames from and writes frames
//! to; [`Connector`] opens one from a configuration. The default connector
//! dials TCP or a unix socket. Tests and embedders can supply their own.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::MySqlConfig;

/// A bidirectional byte stream to the server.
pub trait Transport: Read + Write + Send {
    /// Apply a read/write timeout. `None` blocks indefinitely.
    fn set_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    /// Close both directions.
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, std::net::Shutdown::Both)
    }
}

/// Opens transports. Stored by the connection so `ping` can reconnect.
pub trait Connector: Send + Sync {
    fn open(&self, config: &MySqlConfig) -> io::Result<Box<dyn Transport>>;
}

/// Dials the configured unix socket or TCP address.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetConnector;

impl Connector for NetConnector {
    fn open(&self, config: &MySqlConfig) -> io::Result<Box<dyn Transport>> {
        if let Some(path) = config.socket_path() {
            return open_unix(path);
        }

        let mut last_err = None;
        for addr in (config.host.as_str(), config.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(config.no_delay)?;
                    tracing::trace!(addr = %addr, "tcp connected");
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", config.host),
            )
        }))
    }
}

#[cfg(unix)]
fn open_unix(path: &std::path::Path) -> io::Result<Box<dyn Transport>> {
    let stream = std::os::unix::net::UnixStream::connect(path)?;
    tracing::trace!(path = %path.display(), "unix socket connected");
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
fn open_unix(path: &std::path::Path) -> io::Result<Box<dyn Transport>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets are not available here: {}", path.display()),
    ))
}

/// Connector that hands out a fixed sequence of pre-built transports.
///
/// Each `open` takes the next transport; once exhausted it fails with
/// `ConnectionRefused`.
pub struct QueuedConnector {
    queue: std::sync::Mutex<std::collections::VecDeque<Box<dyn Transport>>>,
}

impl QueuedConnector {
    pub fn new(transports: Vec<Box<dyn Transport>>) -> Self {
        Self {
            queue: std::sync::Mutex::new(transports.into()),
        }
    }
}

impl std::fmt::Debug for QueuedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedConnector").finish_non_exhaustive()
    }
}

impl Connector for QueuedConnector {
    fn open(&self, _config: &MySqlConfig) -> io::Result<Box<dyn Transport>> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| io::Error::other("connector queue poisoned"))?;
        queue
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no transport left"))
    }
}
