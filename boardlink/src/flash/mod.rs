//! Flash transaction codec.
//!
//! Boards expose their SPI flash chip over USB through a small bridge
//! protocol. Every exchange is one transaction: the host writes a fixed
//! 5-byte header followed by any payload, and, only when the header announces
//! a read length, reads exactly that many bytes back.
//!
//! ```text
//! byte 0    read length (0 = no read)
//! byte 1-2  reserved, zero
//! byte 3    flags: bit 0 status poll, bit 1 write enable
//! byte 4    SPI command opcode
//! byte 5..  payload (address, page data)
//! ```
//!
//! With the write-enable flag the bridge issues WREN before the command, and
//! with the status-poll flag it waits for the chip's WIP bit to clear before
//! acknowledging.

pub mod opcodes;
pub mod program;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::Encoder;

use crate::{
    error::{Error, Result},
    tracing::prelude::*,
    transport::Link,
};

pub use program::{restore, upgrade, FirmwareImages, MacPair};

/// Length of the transaction header.
pub const HEADER_LEN: usize = 5;

/// Length of the factory partition blob.
pub const PARTITION_LEN: usize = 46;

/// Leading constant of the factory partition blob.
pub const PARTITION_MAGIC: [u8; 4] = [0x20, 0x76, 0x03, 0x01];

bitflags! {
    /// Header byte 3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u8 {
        const STATUS_POLL = 1 << 0;
        const WRITE_ENABLE = 1 << 1;
    }
}

/// One request/response exchange with the flash chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTransaction {
    pub command: u8,
    pub read_length: u8,
    pub flags: TransactionFlags,
    /// Bytes sent after the command opcode
    pub payload: Bytes,
}

impl FlashTransaction {
    /// A bare command: no read, no flags, no payload.
    pub fn new(command: u8) -> Self {
        Self {
            command,
            read_length: 0,
            flags: TransactionFlags::empty(),
            payload: Bytes::new(),
        }
    }

    pub fn read(mut self, len: u8) -> Self {
        self.read_length = len;
        self
    }

    pub fn status_poll(mut self) -> Self {
        self.flags |= TransactionFlags::STATUS_POLL;
        self
    }

    pub fn write_enable(mut self) -> Self {
        self.flags |= TransactionFlags::WRITE_ENABLE;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Encode the transaction header.
pub fn encode(tx: &FlashTransaction) -> [u8; HEADER_LEN] {
    [tx.read_length, 0x00, 0x00, tx.flags.bits(), tx.command]
}

/// Frames a transaction as written to the output endpoint: header, then
/// payload.
#[derive(Debug, Default)]
pub struct TransactionCodec;

impl Encoder<&FlashTransaction> for TransactionCodec {
    type Error = io::Error;

    fn encode(&mut self, tx: &FlashTransaction, dst: &mut BytesMut) -> io::Result<()> {
        dst.reserve(HEADER_LEN + tx.payload.len());
        dst.put_slice(&encode(tx));
        dst.put_slice(&tx.payload);
        Ok(())
    }
}

/// Run one transaction over `link`.
///
/// Writes the framed transaction, then performs exactly one read of
/// `read_length` bytes if, and only if, a read length is set. Returns the
/// bytes read, empty when no read was expected.
pub async fn execute(link: &mut Link, tx: &FlashTransaction) -> Result<Bytes> {
    let mut frame = BytesMut::new();
    TransactionCodec.encode(tx, &mut frame)?;

    trace!(
        command = %format!("{:02x}", tx.command),
        flags = ?tx.flags,
        read_length = tx.read_length,
        payload_len = tx.payload.len(),
        "Flash transaction"
    );
    link.write(&frame).await?;

    if tx.read_length == 0 {
        return Ok(Bytes::new());
    }
    link.read(tx.read_length as usize).await
}

/// Check that the flash chip answers the JEDEC identification command with
/// the expected ID.
pub async fn validate_device_id(link: &mut Link) -> Result<()> {
    let tx = FlashTransaction::new(opcodes::RDID).read(3);
    let id = execute(link, &tx).await?;

    if id.as_ref() != opcodes::EXPECTED_JEDEC_ID {
        warn!(id = %hex::encode(&id), "Unexpected flash device ID");
        return Err(Error::InvalidDeviceId { found: id.to_vec() });
    }

    debug!(id = %hex::encode(&id), "Flash device ID verified");
    Ok(())
}

/// Build the factory partition blob carrying the two MAC addresses.
///
/// ```text
/// 0..4    magic 20 76 03 01
/// 4..10   mac1
/// 10..40  0xFF padding
/// 40..46  mac2
/// ```
pub fn build_partition(mac1: &[u8; 6], mac2: &[u8; 6]) -> [u8; PARTITION_LEN] {
    let mut blob = [0xFF; PARTITION_LEN];
    blob[0..4].copy_from_slice(&PARTITION_MAGIC);
    blob[4..10].copy_from_slice(mac1);
    blob[40..46].copy_from_slice(mac2);
    blob
}
