use serde::Serialize;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvertisingState {
    /// No broadcast and no GATT server.
    #[default]
    Idle,
    /// Broadcasting with zero clients connected.
    Advertising,
    /// At least one client connected.
    Connected,
}

/// What the radio must do after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioAction {
    Suspend,
    Resume,
}

/// Owned by a running session of the orchestrator. A fresh machine starts `Idle`.
#[derive(Debug, Default)]
pub struct AdvertisingMachine {
    state: AdvertisingState,
    continue_while_connected: bool,
}

impl AdvertisingMachine {
    pub fn new(continue_while_connected: bool) -> AdvertisingMachine {
        AdvertisingMachine {
            state: AdvertisingState::Idle,
            continue_while_connected,
        }
    }

    pub fn state(&self) -> AdvertisingState {
        self.state
    }

    /// The transport confirmed the broadcast is up. `clients` is the tracker count at that moment.
    pub fn advertising_started(&mut self, clients: usize) {
        if self.state != AdvertisingState::Idle {
            return;
        }
        self.state = if clients == 0 {
            AdvertisingState::Advertising
        } else {
            AdvertisingState::Connected
        };
        debug!("[Advertising] Idle -> {:?}", self.state);
    }

    /// Called after the tracker accepted a client; `clients` is the new count.
    pub fn client_connected(&mut self, clients: usize) -> Option<RadioAction> {
        if self.state != AdvertisingState::Advertising || clients == 0 {
            return None;
        }
        self.state = AdvertisingState::Connected;
        debug!("[Advertising] Advertising -> Connected");
        (!self.continue_while_connected).then_some(RadioAction::Suspend)
    }

    /// Called after the tracker removed a client; `clients` is the remaining count.
    pub fn client_disconnected(&mut self, clients: usize) -> Option<RadioAction> {
        if self.state != AdvertisingState::Connected || clients > 0 {
            return None;
        }
        self.state = AdvertisingState::Advertising;
        debug!("[Advertising] Connected -> Advertising");
        (!self.continue_while_connected).then_some(RadioAction::Resume)
    }

    pub fn stop(&mut self) {
        if self.state != AdvertisingState::Idle {
            debug!("[Advertising] {:?} -> Idle", self.state);
        }
        self.state = AdvertisingState::Idle;
    }
}
