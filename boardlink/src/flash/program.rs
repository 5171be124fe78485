//! Reprogramming a board's flash chip.
//!
//! Built on the transaction codec: identify the chip, erase it, then program
//! the boot loader, the factory partition and the root filesystem page by
//! page. Every erase and program transaction carries write-enable and
//! status-poll so the bridge wraps it in the usual WREN / wait-for-WIP
//! handshake.
//!
//! [`restore`] provisions a fresh factory partition. [`upgrade`] reads the
//! existing partition back before the erase and writes it unchanged, so a
//! board keeps its MAC addresses across firmware updates.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use super::{
    build_partition, execute, opcodes, validate_device_id, FlashTransaction, PARTITION_LEN,
    PARTITION_MAGIC,
};
use crate::{
    error::{Error, Result},
    tracing::prelude::*,
    transport::Link,
};

/// Flash offset of the boot loader image.
pub const UBOOT_ADDR: u32 = 0x0;

/// Flash offset of the factory partition blob.
pub const PARTITION_ADDR: u32 = 0x40000;

/// Flash offset of the root filesystem image.
pub const SQUASHFS_ADDR: u32 = 0x50000;

/// Vendor prefixes of the two MAC addresses.
const MAC1_PREFIX: [u8; 2] = [0x02, 0xA3];
const MAC2_PREFIX: [u8; 2] = [0x02, 0xA4];

// A full chip erase takes tens of seconds on the parts we ship.
const ERASE_POLL_DELAY: Duration = Duration::from_millis(100);
const ERASE_TIMEOUT: Duration = Duration::from_secs(120);

/// The two images a board's flash holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImages {
    pub uboot: Bytes,
    pub squashfs: Bytes,
}

/// The MAC addresses written to the factory partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacPair {
    pub mac1: [u8; 6],
    pub mac2: [u8; 6],
}

impl MacPair {
    pub fn from_uid(uid: [u8; 4]) -> Self {
        let mut mac1 = [0u8; 6];
        mac1[..2].copy_from_slice(&MAC1_PREFIX);
        mac1[2..].copy_from_slice(&uid);

        let mut mac2 = [0u8; 6];
        mac2[..2].copy_from_slice(&MAC2_PREFIX);
        mac2[2..].copy_from_slice(&uid);

        Self { mac1, mac2 }
    }
}

/// Derive a 4-byte device UID from `seed` and a timestamp.
pub fn derive_uid(seed: &str, nanos: u128) -> [u8; 4] {
    let digest = Sha256::new()
        .chain_update(seed.as_bytes())
        .chain_update(nanos.to_le_bytes())
        .finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// A fresh UID for the board named `name`.
pub fn new_uid(name: &str) -> [u8; 4] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    derive_uid(name, nanos)
}

/// Poll the status register until the write-in-progress bit clears.
pub async fn wait_ready(link: &mut Link, poll_delay: Duration, timeout: Duration) -> Result<()> {
    let tx = FlashTransaction::new(opcodes::RDSR).read(1);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let status = execute(link, &tx).await?;
        if status[0] & opcodes::SR1_WIP == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() + poll_delay > deadline {
            return Err(Error::Timeout("flash write-in-progress to clear"));
        }
        tokio::time::sleep(poll_delay).await;
    }
}

/// Erase the whole chip and wait for the erase to finish.
pub async fn erase_chip(link: &mut Link) -> Result<()> {
    let tx = FlashTransaction::new(opcodes::CE_60)
        .write_enable()
        .status_poll();
    execute(link, &tx).await?;
    wait_ready(link, ERASE_POLL_DELAY, ERASE_TIMEOUT).await
}

/// Program `data` starting at `address`, one page per transaction.
pub async fn write(link: &mut Link, address: u32, data: &[u8]) -> Result<()> {
    for (index, page) in data.chunks(opcodes::PAGE_SIZE).enumerate() {
        let offset = u32::try_from(index * opcodes::PAGE_SIZE)
            .map_err(|_| Error::Connection("image exceeds the 4-byte address space".into()))?;
        let page_addr = address
            .checked_add(offset)
            .ok_or_else(|| Error::Connection("image exceeds the 4-byte address space".into()))?;

        let mut payload = BytesMut::with_capacity(4 + page.len());
        payload.put_u32(page_addr);
        payload.put_slice(page);

        let tx = FlashTransaction::new(opcodes::PP_4B)
            .write_enable()
            .status_poll()
            .with_payload(payload.freeze());
        execute(link, &tx).await?;
    }
    Ok(())
}

/// Read `len` bytes of flash starting at `address`.
pub async fn read(link: &mut Link, address: u32, len: u8) -> Result<Bytes> {
    let tx = FlashTransaction::new(opcodes::READ_4B)
        .read(len)
        .with_payload(address.to_be_bytes().to_vec());
    execute(link, &tx).await
}

/// Read the factory partition, refusing anything without the magic.
pub async fn read_partition(link: &mut Link) -> Result<[u8; PARTITION_LEN]> {
    let bytes = read(link, PARTITION_ADDR, PARTITION_LEN as u8).await?;
    let partition: [u8; PARTITION_LEN] = bytes[..]
        .try_into()
        .map_err(|_| Error::PartitionMissing)?;

    if partition[..PARTITION_MAGIC.len()] != PARTITION_MAGIC {
        warn!(
            head = %hex::encode(&partition[..PARTITION_MAGIC.len()]),
            "Factory partition magic not found"
        );
        return Err(Error::PartitionMissing);
    }
    Ok(partition)
}

/// Check both images fit their flash regions.
pub fn check_fit(images: &FirmwareImages) -> Result<()> {
    let regions = [
        ("U-Boot", images.uboot.len(), (PARTITION_ADDR - UBOOT_ADDR) as usize),
        (
            "OpenWRT",
            images.squashfs.len(),
            opcodes::FLASH_SIZE - SQUASHFS_ADDR as usize,
        ),
    ];

    for (image, len, max) in regions {
        if len > max {
            return Err(Error::ImageTooLarge { image, len, max });
        }
    }
    Ok(())
}

/// Write a complete firmware set with a new factory partition.
///
/// When `validate` is set the chip ID is checked first and nothing is erased
/// on a mismatch.
pub async fn restore(
    link: &mut Link,
    images: &FirmwareImages,
    macs: MacPair,
    validate: bool,
) -> Result<()> {
    check_fit(images)?;
    identify(link, validate).await?;

    debug!(
        mac1 = %hex::encode(macs.mac1),
        mac2 = %hex::encode(macs.mac2),
        "Provisioning factory partition"
    );
    let partition = build_partition(&macs.mac1, &macs.mac2);
    program(link, images, &partition).await
}

/// Replace the firmware images, keeping the factory partition the board
/// already has.
pub async fn upgrade(link: &mut Link, images: &FirmwareImages, validate: bool) -> Result<()> {
    check_fit(images)?;
    identify(link, validate).await?;

    let partition = read_partition(link).await?;
    debug!(mac1 = %hex::encode(&partition[4..10]), "Keeping factory partition");
    program(link, images, &partition).await
}

async fn identify(link: &mut Link, validate: bool) -> Result<()> {
    if validate {
        validate_device_id(link).await
    } else {
        warn!("Skipping flash device ID check");
        Ok(())
    }
}

async fn program(
    link: &mut Link,
    images: &FirmwareImages,
    partition: &[u8; PARTITION_LEN],
) -> Result<()> {
    info!("Erasing flash");
    erase_chip(link).await?;

    info!(bytes = images.uboot.len(), "Writing U-Boot");
    write(link, UBOOT_ADDR, &images.uboot).await?;

    trace!("Writing factory partition");
    write(link, PARTITION_ADDR, partition).await?;

    info!(bytes = images.squashfs.len(), "Writing OpenWRT");
    write(link, SQUASHFS_ADDR, &images.squashfs).await?;

    info!("Flash complete");
    Ok(())
}
