//! Time-boxed discovery across transports.
//!
//! A [`DiscoverySession`] scans every enabled [`SightingSource`] on its own
//! task. Sightings funnel into one channel consumed by a driver task, which
//! applies the [`DiscoveryFilter`] and surfaces each admitted sighting as a
//! [`DiscoveryEvent::Found`] device. The session ends when its timeout
//! elapses or [`DiscoverySession::stop`] is called; the driver then emits a
//! single [`DiscoveryEvent::End`] and closes anything reported afterwards.
//!
//! ```text
//!  SightingSource (USB) ─┐
//!                        ├─ mpsc<Sighting> ─> driver ─ mpsc<DiscoveryEvent> ─> consumer
//!  SightingSource (LAN) ─┘      filter, lan preference, end of session
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    device::Device,
    error::{Error, Result},
    tracing::prelude::*,
    transport::{Link, Sighting, SightingSource, TransportKind},
};

/// Default time a single-device command searches for.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

const SIGHTING_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Which LAN authorization state a sighting must have to be surfaced.
///
/// USB sightings are always authorized and pass every setting.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum Authorization {
    Required,
    Forbidden,
    #[default]
    Any,
}

impl Authorization {
    fn admits(self, link: &Link) -> bool {
        if link.kind() == TransportKind::Usb {
            return true;
        }
        match self {
            Authorization::Required => link.authorized(),
            Authorization::Forbidden => !link.authorized(),
            Authorization::Any => true,
        }
    }
}

/// Parameters of one discovery session. Fixed once the session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub timeout: Duration,
    pub usb: bool,
    pub lan: bool,
    pub authorized: Authorization,
    /// Only surface the board with this name
    pub name: Option<String>,
    /// Issue commands over LAN when a board is reachable both ways
    pub lan_prefer: bool,
    /// Alternate USB interface setting to open boards with
    pub usb_alt_setting: Option<u8>,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            usb: true,
            lan: true,
            authorized: Authorization::Any,
            name: None,
            lan_prefer: false,
            usb_alt_setting: None,
        }
    }
}

impl DiscoveryFilter {
    fn scans(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Usb => self.usb,
            TransportKind::Lan => self.lan,
        }
    }

    fn admits(&self, sighting: &Sighting) -> bool {
        if !self.authorized.admits(&sighting.link) {
            return false;
        }
        match &self.name {
            Some(name) => *name == sighting.name,
            None => true,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Timeout,
    Stopped,
}

/// What a session reports to its consumer.
#[derive(Debug)]
pub enum DiscoveryEvent {
    Found(Device),
    /// Always the last event of a session
    End(EndReason),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Ended,
    Stopped,
}

/// One scan across the enabled transports.
pub struct DiscoverySession {
    sources: Vec<Arc<dyn SightingSource>>,
    state: Arc<Mutex<SessionState>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl DiscoverySession {
    pub fn new(sources: Vec<Arc<dyn SightingSource>>) -> Self {
        Self {
            sources,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Begin scanning. Events arrive on the returned receiver, the last one
    /// being [`DiscoveryEvent::End`].
    pub fn start(&mut self, filter: DiscoveryFilter) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Idle {
                return Err(Error::Connection(format!(
                    "discovery session cannot start from state {}",
                    *state
                )));
            }
            *state = SessionState::Scanning;
        }

        let (sighting_tx, sighting_rx) = mpsc::channel(SIGHTING_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let filter = Arc::new(filter);

        info!(
            timeout_ms = filter.timeout.as_millis() as u64,
            usb = filter.usb,
            lan = filter.lan,
            authorized = %filter.authorized,
            name = filter.name.as_deref().unwrap_or("-"),
            "Searching for devices"
        );

        for source in &self.sources {
            let kind = source.kind();
            if !filter.scans(kind) {
                debug!(transport = %kind, "Transport disabled for this session");
                continue;
            }

            let source = Arc::clone(source);
            let filter = Arc::clone(&filter);
            let sightings = sighting_tx.clone();
            let shutdown = self.shutdown.clone();
            self.tracker.spawn(async move {
                if let Err(e) = source.scan(&filter, sightings, shutdown).await {
                    warn!(transport = %kind, error = %e, "Transport scan failed");
                }
            });
        }
        drop(sighting_tx);

        let driver = Driver {
            filter,
            sightings: sighting_rx,
            events: event_tx,
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.clone(),
        };
        self.tracker.spawn(driver.run());
        self.tracker.close();

        Ok(event_rx)
    }

    /// End the session early. Safe to call any number of times, before or
    /// after the session ended on its own.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Idle | SessionState::Scanning) {
                *state = SessionState::Stopped;
            }
        }
        self.shutdown.cancel();
    }

    /// Wait until every transport task and the driver have exited.
    pub async fn finished(&self) {
        self.tracker.wait().await;
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Driver {
    filter: Arc<DiscoveryFilter>,
    sightings: mpsc::Receiver<Sighting>,
    events: mpsc::Sender<DiscoveryEvent>,
    state: Arc<Mutex<SessionState>>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let deadline = tokio::time::sleep(self.filter.timeout);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break EndReason::Stopped,
                _ = &mut deadline => break EndReason::Timeout,
                sighting = self.sightings.recv() => match sighting {
                    Some(sighting) => self.surface(sighting).await,
                    // Every transport gave up; nothing more can arrive
                    None => break tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => EndReason::Stopped,
                        _ = &mut deadline => EndReason::Timeout,
                    },
                },
            }
        };

        {
            let mut state = self.state.lock();
            if *state == SessionState::Scanning {
                *state = SessionState::Ended;
            }
        }
        self.shutdown.cancel();
        debug!(reason = %reason, "Discovery session ended");
        let _ = self.events.send(DiscoveryEvent::End(reason)).await;

        // Anything still in flight lost the race with the end of the session.
        self.sightings.close();
        while let Some(mut late) = self.sightings.recv().await {
            trace!(device = %late.name, transport = %late.link.kind(), "Discarding late sighting");
            if let Err(e) = late.link.close().await {
                warn!(device = %late.name, error = %e, "Failed to close late sighting");
            }
        }
    }

    async fn surface(&mut self, mut sighting: Sighting) {
        let kind = sighting.link.kind();
        if !self.filter.admits(&sighting) {
            trace!(
                device = %sighting.name,
                transport = %kind,
                authorized = sighting.link.authorized(),
                "Sighting filtered out"
            );
            if let Err(e) = sighting.link.close().await {
                warn!(device = %sighting.name, error = %e, "Failed to close filtered sighting");
            }
            return;
        }

        debug!(
            device = %sighting.name,
            transport = %kind,
            ip = ?sighting.link.ip(),
            "Found device"
        );
        let mut device = Device::new(sighting.name, sighting.link);
        device.set_lan_preference(self.filter.lan_prefer);

        if let Err(mpsc::error::SendError(DiscoveryEvent::Found(mut device))) =
            self.events.send(DiscoveryEvent::Found(device)).await
        {
            let _ = device.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnection, MockBoard, MockSource};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn filter() -> DiscoveryFilter {
        DiscoveryFilter {
            timeout: secs(2),
            ..Default::default()
        }
    }

    /// Collect events up to and including the end marker.
    async fn drain(events: &mut mpsc::Receiver<DiscoveryEvent>) -> (Vec<Device>, EndReason) {
        let mut found = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                DiscoveryEvent::Found(device) => found.push(device),
                DiscoveryEvent::End(reason) => return (found, reason),
            }
        }
        panic!("event stream closed without an end marker");
    }

    fn names(devices: &[Device]) -> Vec<&str> {
        devices.iter().map(Device::name).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_ends_session_after_surfacing_sightings() {
        let board = MockBoard::default();
        let usb = MockSource::new(TransportKind::Usb)
            .with(secs(0), Sighting::new("bulbasaur", MockConnection::usb(&board)));
        let lan = MockSource::new(TransportKind::Lan).with(
            Duration::from_millis(500),
            Sighting::new("ivysaur", MockConnection::lan(&board, true)),
        );

        let mut session = DiscoverySession::new(vec![Arc::new(usb), Arc::new(lan)]);
        let mut events = session.start(filter()).unwrap();
        let (found, reason) = drain(&mut events).await;

        assert_eq!(names(&found), vec!["bulbasaur", "ivysaur"]);
        assert_eq!(reason, EndReason::Timeout);
        assert_eq!(session.state(), SessionState::Ended);
        session.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sightings_after_timeout_are_not_surfaced() {
        let board = MockBoard::default();
        let usb = MockSource::new(TransportKind::Usb)
            .with(secs(5), Sighting::new("late", MockConnection::usb(&board)));

        let mut session = DiscoverySession::new(vec![Arc::new(usb)]);
        let mut events = session.start(filter()).unwrap();
        let (found, _) = drain(&mut events).await;
        session.finished().await;

        assert!(found.is_empty());
        assert!(events.recv().await.is_none());
        // The source shut down before the board showed up
        assert_eq!(board.opens(), 0);
        assert_eq!(board.close_calls(), 0);
    }

    /// Reports its sightings as soon as it is polled, whatever the shutdown
    /// token says.
    struct EagerSource {
        sightings: parking_lot::Mutex<Vec<Sighting>>,
    }

    #[async_trait::async_trait]
    impl SightingSource for EagerSource {
        fn kind(&self) -> TransportKind {
            TransportKind::Usb
        }

        async fn scan(
            &self,
            _filter: &DiscoveryFilter,
            sightings: mpsc::Sender<Sighting>,
            shutdown: CancellationToken,
        ) -> Result<()> {
            let pending = std::mem::take(&mut *self.sightings.lock());
            for mut sighting in pending {
                sighting.link.open().await?;
                let _ = sightings.send(sighting).await;
            }
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sightings_queued_behind_the_end_are_closed() {
        let board = MockBoard::default();
        let source = EagerSource {
            sightings: parking_lot::Mutex::new(vec![Sighting::new(
                "late",
                MockConnection::usb(&board),
            )]),
        };

        let mut session = DiscoverySession::new(vec![Arc::new(source)]);
        let mut events = session.start(filter()).unwrap();
        // Stopped before any task ran: the sighting is queued but the driver
        // sees the shutdown first.
        session.stop();
        let (found, reason) = drain(&mut events).await;
        session.finished().await;

        assert!(found.is_empty());
        assert_eq!(reason, EndReason::Stopped);
        assert_eq!(board.opens(), 1);
        assert_eq!(board.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaced_links_are_open() {
        let board = MockBoard::default();
        let usb = MockSource::new(TransportKind::Usb)
            .with(secs(0), Sighting::new("bulbasaur", MockConnection::usb(&board)));

        let mut session = DiscoverySession::new(vec![Arc::new(usb)]);
        let mut events = session.start(filter()).unwrap();
        let (found, _) = drain(&mut events).await;

        assert_eq!(names(&found), vec!["bulbasaur"]);
        assert_eq!(board.opens(), 1);
        assert_eq!(board.close_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_ends_session() {
        let usb = MockSource::new(TransportKind::Usb);
        let mut session = DiscoverySession::new(vec![Arc::new(usb)]);
        let mut events = session.start(filter()).unwrap();

        session.stop();
        session.stop();
        let (_, reason) = drain(&mut events).await;
        session.stop();

        assert_eq!(reason, EndReason::Stopped);
        assert_eq!(session.state(), SessionState::Stopped);
        session.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn session_cannot_start_twice() {
        let mut session = DiscoverySession::new(Vec::new());
        let _events = session.start(filter()).unwrap();
        assert!(session.start(filter()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_transport_is_not_scanned() {
        let usb = Arc::new(MockSource::new(TransportKind::Usb));
        let lan = Arc::new(MockSource::new(TransportKind::Lan));
        let sources: Vec<Arc<dyn SightingSource>> = vec![usb.clone(), lan.clone()];

        let mut session = DiscoverySession::new(sources);
        let mut events = session
            .start(DiscoveryFilter {
                lan: false,
                ..filter()
            })
            .unwrap();
        drain(&mut events).await;
        session.finished().await;

        assert!(usb.seen_filter().is_some());
        assert!(lan.seen_filter().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_filter_applies_to_lan_only() {
        let usb_board = MockBoard::default();
        let authed = MockBoard::default();
        let unauthed = MockBoard::default();
        let usb = MockSource::new(TransportKind::Usb)
            .with(secs(0), Sighting::new("usb", MockConnection::usb(&usb_board)));
        let lan = MockSource::new(TransportKind::Lan)
            .with(secs(0), Sighting::new("authed", MockConnection::lan(&authed, true)))
            .with(secs(0), Sighting::new("unauthed", MockConnection::lan(&unauthed, false)));

        let mut session = DiscoverySession::new(vec![Arc::new(usb), Arc::new(lan)]);
        let mut events = session
            .start(DiscoveryFilter {
                authorized: Authorization::Forbidden,
                ..filter()
            })
            .unwrap();
        let (found, _) = drain(&mut events).await;

        let mut seen = names(&found);
        seen.sort();
        assert_eq!(seen, vec!["unauthed", "usb"]);
        // The authorized LAN link was filtered out and closed on the spot
        assert_eq!(authed.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn name_filter_closes_other_boards() {
        let other = MockBoard::default();
        let wanted = MockBoard::default();
        let usb = MockSource::new(TransportKind::Usb)
            .with(secs(0), Sighting::new("other", MockConnection::usb(&other)))
            .with(secs(1), Sighting::new("wanted", MockConnection::usb(&wanted)));

        let mut session = DiscoverySession::new(vec![Arc::new(usb)]);
        let mut events = session
            .start(DiscoveryFilter {
                name: Some("wanted".into()),
                ..filter()
            })
            .unwrap();
        let (found, _) = drain(&mut events).await;

        assert_eq!(names(&found), vec!["wanted"]);
        assert_eq!(other.close_calls(), 1);
        assert_eq!(wanted.close_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn found_devices_carry_lan_preference() {
        let board = MockBoard::default();
        let lan = MockSource::new(TransportKind::Lan)
            .with(secs(0), Sighting::new("bulbasaur", MockConnection::lan(&board, true)));

        let mut session = DiscoverySession::new(vec![Arc::new(lan)]);
        let mut events = session
            .start(DiscoveryFilter {
                lan_prefer: true,
                ..filter()
            })
            .unwrap();
        let (mut found, _) = drain(&mut events).await;

        let mut device = found.remove(0);
        device.absorb(Device::new(
            "bulbasaur",
            Link::new(MockConnection::usb(&board)),
        ));
        assert_eq!(
            device.connection().map(Link::kind),
            Some(TransportKind::Lan)
        );
    }

    #[test]
    fn usb_passes_every_authorization_setting() {
        let board = MockBoard::default();
        let link = Link::new(MockConnection::usb(&board));
        for auth in [
            Authorization::Required,
            Authorization::Forbidden,
            Authorization::Any,
        ] {
            assert!(auth.admits(&link));
        }
    }
}
