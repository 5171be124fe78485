//! Device registry entries.
//!
//! A [`Device`] is one physical board, identified by its name, together with
//! every link it was seen on. Discovery creates one device per sighting;
//! reconciliation folds devices with the same name into one.

use std::fmt;

use regex::Regex;

use crate::{
    error::{Error, Result},
    tracing::prelude::*,
    transport::{Link, TransportKind},
};

/// Prefix of the name a board carries from the factory.
const DEFAULT_NAME_PREFIX: &str = "Tessel-";

/// Hostname label: letters, digits and inner hyphens, at most 63 characters.
const NAME_PATTERN: &str = r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$";

/// Check that `name` can be used as a board's hostname.
pub fn validate_name(name: &str) -> Result<()> {
    let re = Regex::new(NAME_PATTERN).map_err(|e| Error::Config(e.to_string()))?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(Error::NameInvalid(name.to_string()))
    }
}

/// The factory name of the board whose primary MAC address is `mac`.
pub fn default_name(mac: &[u8; 6]) -> String {
    format!("{}{}", DEFAULT_NAME_PREFIX, hex::encode_upper(mac))
}

/// One physical board and the links it was seen on, at most one per
/// transport.
#[derive(Debug)]
pub struct Device {
    name: String,
    usb: Option<Link>,
    lan: Option<Link>,
    lan_preferred: bool,
}

impl Device {
    pub fn new(name: impl Into<String>, link: Link) -> Self {
        let mut device = Self {
            name: name.into(),
            usb: None,
            lan: None,
            lan_preferred: false,
        };
        match link.kind() {
            TransportKind::Usb => device.usb = Some(link),
            TransportKind::Lan => device.lan = Some(link),
        }
        device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every link this device owns.
    pub fn connections(&self) -> impl Iterator<Item = &Link> {
        self.usb.iter().chain(self.lan.iter())
    }

    pub fn usb(&self) -> Option<&Link> {
        self.usb.as_ref()
    }

    pub fn lan(&self) -> Option<&Link> {
        self.lan.as_ref()
    }

    pub fn has_usb(&self) -> bool {
        self.usb.is_some()
    }

    pub fn set_lan_preference(&mut self, prefer: bool) {
        self.lan_preferred = prefer;
    }

    /// The link commands go over: LAN when preferred and present, otherwise
    /// USB, otherwise LAN.
    pub fn connection(&self) -> Option<&Link> {
        if self.lan_preferred && self.lan.is_some() {
            return self.lan.as_ref();
        }
        self.usb.as_ref().or(self.lan.as_ref())
    }

    fn connection_mut(&mut self) -> Result<&mut Link> {
        let link = if self.lan_preferred && self.lan.is_some() {
            self.lan.as_mut()
        } else if self.usb.is_some() {
            self.usb.as_mut()
        } else {
            self.lan.as_mut()
        };
        link.ok_or_else(|| Error::Connection(format!("{} has no connection", self.name)))
    }

    /// Whether the command link can carry authorized operations.
    pub fn is_authorized(&self) -> bool {
        self.connection().is_some_and(Link::authorized)
    }

    /// The USB link, which is the only one the flash chip is reachable over.
    pub fn flash_link(&mut self) -> Result<&mut Link> {
        self.usb.as_mut().ok_or(Error::UsbRequired)
    }

    /// Take over the links of `other`, which must carry the same name.
    ///
    /// A link of a kind this device already holds is handed back; the caller
    /// owns it and must close it.
    pub fn absorb(&mut self, other: Device) -> Vec<Link> {
        debug_assert_eq!(self.name, other.name);
        let mut duplicates = Vec::new();

        for link in other.usb.into_iter().chain(other.lan) {
            let slot = match link.kind() {
                TransportKind::Usb => &mut self.usb,
                TransportKind::Lan => &mut self.lan,
            };
            if slot.is_none() {
                *slot = Some(link);
            } else {
                debug!(
                    device = %self.name,
                    transport = %link.kind(),
                    "Second link of the same kind"
                );
                duplicates.push(link);
            }
        }
        duplicates
    }

    /// Close every link. All links are attempted; the first failure is
    /// returned.
    pub async fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for link in self.usb.iter_mut().chain(self.lan.iter_mut()) {
            if let Err(e) = link.close().await {
                warn!(
                    device = %self.name,
                    transport = %link.kind(),
                    error = %e,
                    "Failed to close link"
                );
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// SHA of the firmware build the board runs.
    pub async fn current_build_sha(&mut self) -> Result<Option<String>> {
        self.connection_mut()?
            .connection_mut()?
            .current_build_sha()
            .await
    }

    pub async fn reboot(&mut self) -> Result<()> {
        self.connection_mut()?.connection_mut()?.reboot().await
    }

    /// Give the board a new hostname.
    pub async fn rename(&mut self, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        self.connection_mut()?
            .connection_mut()?
            .set_name(new_name)
            .await?;
        info!(from = %self.name, to = %new_name, "Renamed device");
        self.name = new_name.to_string();
        Ok(())
    }

    /// Give the board back its factory name.
    pub async fn reset_name(&mut self) -> Result<()> {
        let mac = self.connection_mut()?.connection_mut()?.mac_address().await?;
        self.rename(&default_name(&mac)).await
    }

    /// Version of the script runtime on the board.
    pub async fn runtime_version(&mut self) -> Result<String> {
        self.connection_mut()?
            .connection_mut()?
            .runtime_version()
            .await
    }

    /// Install this host's key on the board, which is what authorizes LAN
    /// access. Only possible over USB.
    pub async fn provision(&mut self, force: bool) -> Result<()> {
        let link = self.usb.as_mut().ok_or(Error::UsbRequired)?;
        link.connection_mut()?.provision(force).await?;
        info!(device = %self.name, "Provisioned device");
        Ok(())
    }

    pub fn summary(&self) -> DeviceSummary {
        let mut transports: Vec<TransportKind> = Vec::new();
        if self.usb.is_some() {
            transports.push(TransportKind::Usb);
        }
        if self.lan.is_some() {
            transports.push(TransportKind::Lan);
        }
        DeviceSummary {
            name: self.name.clone(),
            transports,
            authorized: self.is_authorized(),
        }
    }
}

/// What a user sees of a device when listing or choosing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub name: String,
    pub transports: Vec<TransportKind>,
    pub authorized: bool,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transports: Vec<String> = self.transports.iter().map(|t| t.to_string()).collect();
        write!(f, "{}\t{}", transports.join("/"), self.name)?;
        if !self.authorized {
            write!(f, "\t(not authorized)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnection, MockBoard};
    use test_case::test_case;

    fn usb(board: &MockBoard) -> Link {
        Link::new(MockConnection::usb(board))
    }

    fn lan(board: &MockBoard, authorized: bool) -> Link {
        Link::new(MockConnection::lan(board, authorized))
    }

    #[test_case("bulbasaur"; "plain")]
    #[test_case("tessel-02"; "inner hyphen")]
    #[test_case("a"; "single character")]
    #[test_case("A1B2"; "mixed case and digits")]
    fn valid_names(name: &str) {
        validate_name(name).unwrap();
    }

    #[test_case(""; "empty")]
    #[test_case("-leading"; "leading hyphen")]
    #[test_case("trailing-"; "trailing hyphen")]
    #[test_case("has space"; "space")]
    #[test_case("under_score"; "underscore")]
    #[test_case("dot.ted"; "dot")]
    fn invalid_names(name: &str) {
        assert!(matches!(validate_name(name), Err(Error::NameInvalid(n)) if n == name));
    }

    #[test]
    fn name_length_limit() {
        validate_name(&"a".repeat(63)).unwrap();
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn preferred_connection() {
        let board = MockBoard::default();
        let mut device = Device::new("bulbasaur", lan(&board, true));
        device.absorb(Device::new("bulbasaur", usb(&board)));

        assert_eq!(device.connection().map(Link::kind), Some(TransportKind::Usb));
        device.set_lan_preference(true);
        assert_eq!(device.connection().map(Link::kind), Some(TransportKind::Lan));
    }

    #[test]
    fn lan_preference_without_lan_falls_back_to_usb() {
        let board = MockBoard::default();
        let mut device = Device::new("bulbasaur", usb(&board));
        device.set_lan_preference(true);
        assert_eq!(device.connection().map(Link::kind), Some(TransportKind::Usb));
    }

    #[test]
    fn flash_link_requires_usb() {
        let board = MockBoard::default();
        let mut device = Device::new("bulbasaur", lan(&board, true));
        assert!(matches!(device.flash_link(), Err(Error::UsbRequired)));
    }

    #[tokio::test]
    async fn duplicate_kind_is_handed_back() {
        let first = MockBoard::default();
        let second = MockBoard::default();
        let mut device = Device::new("bulbasaur", usb(&first));
        let mut duplicates = device.absorb(Device::new("bulbasaur", usb(&second)));

        assert_eq!(device.connections().count(), 1);
        assert_eq!(duplicates.len(), 1);

        duplicates[0].close().await.unwrap();
        device.close().await.unwrap();
        assert_eq!(first.close_calls(), 1);
        assert_eq!(second.close_calls(), 1);
    }

    #[test]
    fn default_name_from_mac() {
        assert_eq!(
            default_name(&[0x02, 0xA3, 0xDE, 0xAD, 0xBE, 0xEF]),
            "Tessel-02A3DEADBEEF"
        );
    }

    #[tokio::test]
    async fn reset_name_uses_factory_name() {
        let board = MockBoard::default();
        board.set_mac([0x02, 0xA3, 0x00, 0x11, 0x22, 0x33]);
        let mut device = Device::new("bulbasaur", usb(&board));

        device.reset_name().await.unwrap();

        assert_eq!(device.name(), "Tessel-02A300112233");
        assert_eq!(board.names(), vec!["Tessel-02A300112233".to_string()]);
    }

    #[tokio::test]
    async fn provision_goes_over_usb_only() {
        let board = MockBoard::default();
        let mut device = Device::new("bulbasaur", lan(&board, false));
        assert!(matches!(device.provision(false).await, Err(Error::UsbRequired)));

        device.absorb(Device::new("bulbasaur", usb(&board)));
        device.provision(true).await.unwrap();
        assert_eq!(board.provisions(), vec![true]);
    }

    #[tokio::test]
    async fn close_attempts_every_link_and_reports_first_error() {
        let usb_board = MockBoard::default();
        let lan_board = MockBoard::default();
        usb_board.fail_close();

        let mut device = Device::new("bulbasaur", usb(&usb_board));
        device.absorb(Device::new("bulbasaur", lan(&lan_board, true)));

        assert!(device.close().await.is_err());
        assert_eq!(usb_board.close_calls(), 1);
        assert_eq!(lan_board.close_calls(), 1);

        // Second close is a no-op for both
        device.close().await.unwrap();
        assert_eq!(usb_board.close_calls(), 1);
        assert_eq!(lan_board.close_calls(), 1);
    }

    #[tokio::test]
    async fn rename_validates_before_talking_to_board() {
        let board = MockBoard::default();
        let mut device = Device::new("bulbasaur", usb(&board));

        assert!(matches!(
            device.rename("-nope").await,
            Err(Error::NameInvalid(_))
        ));
        assert!(board.names().is_empty());

        device.rename("ivysaur").await.unwrap();
        assert_eq!(board.names(), vec!["ivysaur".to_string()]);
        assert_eq!(device.name(), "ivysaur");
    }

    #[tokio::test]
    async fn unauthorized_lan_device_refuses_commands() {
        let board = MockBoard::default();
        let mut device = Device::new("bulbasaur", lan(&board, false));

        assert!(!device.is_authorized());
        assert!(matches!(device.reboot().await, Err(Error::Connection(_))));
        assert_eq!(board.reboots(), 0);
    }

    #[test]
    fn summary_display() {
        let board = MockBoard::default();
        let mut device = Device::new("bulbasaur", usb(&board));
        device.absorb(Device::new("bulbasaur", lan(&board, true)));
        assert_eq!(device.summary().to_string(), "USB/LAN\tbulbasaur");

        let lonely = Device::new("ivysaur", lan(&board, false));
        let summary = lonely.summary();
        assert_eq!(summary.transports, vec![TransportKind::Lan]);
        assert!(!summary.authorized);
        assert_eq!(summary.to_string(), "LAN\tivysaur\t(not authorized)");
    }
}
