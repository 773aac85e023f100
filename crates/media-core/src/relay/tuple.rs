use std::net::{IpAddr, SocketAddr};

use super::{Interface, Leg, LegAddress, PairKind, PairOptions, PairState, RelayPair};
use crate::error::Result;

/// Data and control relay pairs of one media stream
#[derive(Debug, Clone)]
pub struct RelayTuple {
    data: RelayPair,
    control: RelayPair,
}

impl RelayTuple {
    pub fn new(label: &str, options: PairOptions) -> Self {
        Self {
            data: RelayPair::new(PairKind::Data, format!("{label}/data"), options.clone()),
            control: RelayPair::new(PairKind::Control, format!("{label}/control"), options),
        }
    }

    pub fn data(&self) -> &RelayPair {
        &self.data
    }

    pub fn control(&self) -> &RelayPair {
        &self.control
    }

    /// Bind data on the given even ports and control on the next odd ones
    pub fn open(&self, leg1: Interface, leg1_port: u16, leg2: Interface, leg2_port: u16) -> Result<()> {
        self.data.open(leg1.at_port(leg1_port), leg2.at_port(leg2_port))?;
        if let Err(e) = self.control.open(
            leg1.at_port(leg1_port.saturating_add(1)),
            leg2.at_port(leg2_port.saturating_add(1)),
        ) {
            self.data.stop();
            return Err(e);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.data.state() != PairState::Closed
    }

    pub fn is_started(&self) -> bool {
        self.data.state() == PairState::Started
    }

    pub fn start(&self) -> Result<()> {
        self.data.start()?;
        self.control.start()
    }

    pub fn stop(&self) {
        self.data.stop();
        self.control.stop();
    }

    pub fn reset_leg(&self, leg: Leg) {
        self.data.reset_leg(leg);
        self.control.reset_leg(leg);
    }

    /// Point `leg` at the media endpoint advertised in SDP
    pub fn set_destination(&self, leg: Leg, ip: IpAddr, data_port: u16, control_port: u16) {
        self.data.set_remote(leg, SocketAddr::new(ip, data_port));
        self.control.set_remote(leg, SocketAddr::new(ip, control_port));
    }

    /// Local data address of a leg; used to rewrite SDP
    pub fn data_address(&self, leg: Leg) -> Option<LegAddress> {
        self.data.local_address(leg)
    }

    pub fn control_address(&self, leg: Leg) -> Option<LegAddress> {
        self.control.local_address(leg)
    }

    pub fn is_inactive(&self) -> bool {
        self.data.is_inactive()
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.data.set_verbose(verbose);
        self.control.set_verbose(verbose);
    }

    pub fn force_leg_encryption(&self, leg: Leg, forced: bool) {
        self.data.force_leg_encryption(leg, forced);
        self.control.force_leg_encryption(leg, forced);
    }

    pub fn set_resizer_samples(&self, leg1: u32, leg2: u32) {
        self.data.set_resizer_samples(leg1, leg2);
    }
}
