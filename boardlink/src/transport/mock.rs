//! Scripted connections and sighting sources for tests.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Connection, Sighting, SightingSource, TransportKind};
use crate::discovery::DiscoveryFilter;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct BoardState {
    writes: Vec<Vec<u8>>,
    reads: Vec<usize>,
    responses: VecDeque<Bytes>,
    close_calls: usize,
    reset: bool,
    fail_close: bool,
    build_sha: Option<String>,
    reboots: usize,
    names: Vec<String>,
    opens: usize,
    mac: Option<[u8; 6]>,
    runtime: Option<String>,
    provisions: Vec<bool>,
}

/// Shared view into a [`MockConnection`], kept by the test after the
/// connection itself moved into a device.
#[derive(Debug, Clone, Default)]
pub struct MockBoard {
    state: Arc<Mutex<BoardState>>,
}

impl MockBoard {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    pub fn reads(&self) -> Vec<usize> {
        self.state.lock().reads.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn reboots(&self) -> usize {
        self.state.lock().reboots
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().names.clone()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    /// The `force` flag of every provision request, in order.
    pub fn provisions(&self) -> Vec<bool> {
        self.state.lock().provisions.clone()
    }

    pub fn set_mac(&self, mac: [u8; 6]) {
        self.state.lock().mac = Some(mac);
    }

    pub fn set_runtime(&self, version: &str) {
        self.state.lock().runtime = Some(version.to_string());
    }

    /// Queue the bytes answered to the next read.
    pub fn respond(&self, bytes: &[u8]) {
        self.state
            .lock()
            .responses
            .push_back(Bytes::copy_from_slice(bytes));
    }

    pub fn simulate_reset(&self) {
        self.state.lock().reset = true;
    }

    pub fn fail_close(&self) {
        self.state.lock().fail_close = true;
    }

    pub fn set_build_sha(&self, sha: Option<&str>) {
        self.state.lock().build_sha = sha.map(str::to_string);
    }
}

#[derive(Debug)]
pub struct MockConnection {
    kind: TransportKind,
    authorized: bool,
    board: MockBoard,
}

impl MockConnection {
    pub fn usb(board: &MockBoard) -> Self {
        Self {
            kind: TransportKind::Usb,
            authorized: true,
            board: board.clone(),
        }
    }

    pub fn lan(board: &MockBoard, authorized: bool) -> Self {
        Self {
            kind: TransportKind::Lan,
            authorized,
            board: board.clone(),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn authorized(&self) -> bool {
        self.authorized
    }

    fn ip(&self) -> Option<IpAddr> {
        (self.kind == TransportKind::Lan).then_some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 101)))
    }

    fn is_closed(&self) -> bool {
        self.board.state.lock().reset
    }

    async fn open(&mut self) -> Result<()> {
        self.board.state.lock().opens += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.board.state.lock();
        state.close_calls += 1;
        if state.fail_close {
            return Err(Error::Connection("close failed".into()));
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.board.state.lock().writes.push(bytes.to_vec());
        Ok(())
    }

    async fn read(&mut self, len: usize) -> Result<Bytes> {
        let mut state = self.board.state.lock();
        state.reads.push(len);
        Ok(state
            .responses
            .pop_front()
            .unwrap_or_else(|| Bytes::from(vec![0u8; len])))
    }

    async fn current_build_sha(&mut self) -> Result<Option<String>> {
        Ok(self.board.state.lock().build_sha.clone())
    }

    async fn reboot(&mut self) -> Result<()> {
        self.board.state.lock().reboots += 1;
        Ok(())
    }

    async fn set_name(&mut self, name: &str) -> Result<()> {
        self.board.state.lock().names.push(name.to_string());
        Ok(())
    }

    async fn mac_address(&mut self) -> Result<[u8; 6]> {
        self.board
            .state
            .lock()
            .mac
            .ok_or(Error::Unsupported("MAC address query"))
    }

    async fn runtime_version(&mut self) -> Result<String> {
        self.board
            .state
            .lock()
            .runtime
            .clone()
            .ok_or(Error::Unsupported("runtime version query"))
    }

    async fn provision(&mut self, force: bool) -> Result<()> {
        self.board.state.lock().provisions.push(force);
        Ok(())
    }
}

/// A sighting source that replays a fixed script, each entry after the
/// given delay from scan start, then keeps listening until shut down.
pub struct MockSource {
    kind: TransportKind,
    script: Mutex<Vec<(Duration, Sighting)>>,
    seen_filter: Mutex<Option<DiscoveryFilter>>,
}

impl MockSource {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            script: Mutex::new(Vec::new()),
            seen_filter: Mutex::new(None),
        }
    }

    pub fn with(self, delay: Duration, sighting: Sighting) -> Self {
        self.script.lock().push((delay, sighting));
        self
    }

    /// The filter the last scan ran with.
    pub fn seen_filter(&self) -> Option<DiscoveryFilter> {
        self.seen_filter.lock().clone()
    }
}

#[async_trait]
impl SightingSource for MockSource {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn scan(
        &self,
        filter: &DiscoveryFilter,
        sightings: mpsc::Sender<Sighting>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        *self.seen_filter.lock() = Some(filter.clone());
        let mut script = std::mem::take(&mut *self.script.lock());
        script.sort_by_key(|(delay, _)| *delay);

        let start = tokio::time::Instant::now();
        for (delay, mut sighting) in script {
            tokio::select! {
                _ = tokio::time::sleep_until(start + delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
            sighting.link.open().await?;
            if sightings.send(sighting).await.is_err() {
                return Ok(());
            }
        }

        shutdown.cancelled().await;
        Ok(())
    }
}
