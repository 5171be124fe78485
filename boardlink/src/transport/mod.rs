//! Physical transport layer for board connections.
//!
//! The USB and LAN transports themselves live outside this crate. This module
//! defines the seam they plug into: a [`Connection`] is one opened duplex
//! channel to a board, and a [`SightingSource`] reports boards as a transport
//! notices them. Everything above this module (discovery, selection, the
//! flash codec) talks to boards only through these traits.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    discovery::DiscoveryFilter,
    error::{Error, Result},
    tracing::prelude::*,
};

#[cfg(test)]
pub(crate) mod mock;

/// Which physical path a connection runs over.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    #[strum(serialize = "USB")]
    Usb,
    #[strum(serialize = "LAN")]
    Lan,
}

/// An opened duplex channel to a board.
///
/// Implemented by the transport layer. Besides raw byte I/O, a connection
/// carries the handful of requests the board answers about itself; transports
/// that cannot serve one of them keep the default, which reports
/// [`Error::Unsupported`].
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Transport this connection runs over.
    fn kind(&self) -> TransportKind;

    /// Whether this host holds credentials for the board. Only meaningful for
    /// LAN connections; USB is implicitly authorized.
    fn authorized(&self) -> bool {
        true
    }

    /// Network address, for LAN connections.
    fn ip(&self) -> Option<IpAddr> {
        None
    }

    /// True once the board itself dropped the connection (e.g. a USB reset
    /// after reboot), in which case it must not be closed again.
    fn is_closed(&self) -> bool {
        false
    }

    /// Open the channel. Called by the transport's [`SightingSource`]
    /// before it reports the sighting, never by anything downstream.
    async fn open(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Write to the output endpoint.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read exactly `len` bytes from the input endpoint.
    async fn read(&mut self, len: usize) -> Result<Bytes>;

    /// SHA of the firmware build the board runs, or `None` when the board has
    /// no version file.
    async fn current_build_sha(&mut self) -> Result<Option<String>> {
        Err(Error::Unsupported("current build query"))
    }

    async fn reboot(&mut self) -> Result<()> {
        Err(Error::Unsupported("reboot"))
    }

    async fn set_name(&mut self, _name: &str) -> Result<()> {
        Err(Error::Unsupported("rename"))
    }

    /// Primary MAC address of the board.
    async fn mac_address(&mut self) -> Result<[u8; 6]> {
        Err(Error::Unsupported("MAC address query"))
    }

    /// Version string of the script runtime on the board.
    async fn runtime_version(&mut self) -> Result<String> {
        Err(Error::Unsupported("runtime version query"))
    }

    /// Install this host's public key on the board. With `force`, the host
    /// side key pair is regenerated first.
    async fn provision(&mut self, _force: bool) -> Result<()> {
        Err(Error::Unsupported("provision"))
    }
}

/// A connection as owned by a [`crate::device::Device`].
///
/// The link owns the `closed` flag: it is set once and never unset, and
/// [`Link::close`] reaches the underlying connection at most once.
#[derive(Debug)]
pub struct Link {
    conn: Box<dyn Connection>,
    closed: bool,
}

impl Link {
    pub fn new(conn: impl Connection + 'static) -> Self {
        Self::from_boxed(Box::new(conn))
    }

    pub fn from_boxed(conn: Box<dyn Connection>) -> Self {
        Self {
            conn,
            closed: false,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.conn.kind()
    }

    /// USB links are always authorized; LAN links ask the connection.
    pub fn authorized(&self) -> bool {
        match self.kind() {
            TransportKind::Usb => true,
            TransportKind::Lan => self.conn.authorized(),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.conn.ip()
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.conn.is_closed()
    }

    /// Whether commands can be issued over this link. An unauthorized LAN
    /// link was never really open.
    pub fn is_open_for_commands(&self) -> bool {
        self.authorized() && !self.is_closed()
    }

    /// Open the underlying connection.
    pub async fn open(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Connection(format!("{} link is closed", self.kind())));
        }
        trace!(transport = %self.kind(), "Opening link");
        self.conn.open().await
    }

    /// Close the link.
    ///
    /// Unauthorized LAN links and links the board already dropped are marked
    /// closed without touching the connection. Repeated calls are no-ops.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.authorized() {
            trace!(transport = %self.kind(), "Unauthorized link, nothing to close");
            return Ok(());
        }
        if self.conn.is_closed() {
            trace!(transport = %self.kind(), "Link already closed by the board");
            return Ok(());
        }

        debug!(transport = %self.kind(), "Closing link");
        self.conn.close().await
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.conn.write(bytes).await
    }

    pub async fn read(&mut self, len: usize) -> Result<Bytes> {
        self.ensure_open()?;
        let bytes = self.conn.read(len).await?;
        if bytes.len() != len {
            return Err(Error::Connection(format!(
                "short read: expected {} bytes, got {}",
                len,
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// The underlying connection, for the board-state requests.
    pub fn connection_mut(&mut self) -> Result<&mut dyn Connection> {
        self.ensure_open()?;
        Ok(self.conn.as_mut())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection(format!("{} link is closed", self.kind())));
        }
        if !self.authorized() {
            return Err(Error::Connection(format!(
                "{} link is not authorized",
                self.kind()
            )));
        }
        Ok(())
    }
}

/// One report of a board seen over one connection.
#[derive(Debug)]
pub struct Sighting {
    /// Name the board reported for itself
    pub name: String,
    /// The opened connection it was seen on
    pub link: Link,
}

impl Sighting {
    pub fn new(name: impl Into<String>, conn: impl Connection + 'static) -> Self {
        Self {
            name: name.into(),
            link: Link::new(conn),
        }
    }
}

/// A transport's discovery side.
///
/// Each enabled source is scanned on its own task. A source reports every
/// board it sees on `sightings` and returns once `shutdown` fires or the
/// receiver goes away; it never decides on its own that the search is over.
/// Links are opened with [`Link::open`] before they are reported, so
/// everything downstream receives them open.
#[async_trait]
pub trait SightingSource: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn scan(
        &self,
        filter: &DiscoveryFilter,
        sightings: mpsc::Sender<Sighting>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}
