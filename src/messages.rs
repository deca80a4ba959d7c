/// A device seen by a single discovery scan.
///
/// Two devices are the same entity iff their addresses are equal. No case or
/// separator normalization is applied anywhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub address: String,
    pub name: String,
}

impl Device {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Device {
            address: address.into(),
            name: name.into(),
        }
    }
}

/// A presence transition that fired a device's actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceChange {
    Arrived(Device),
    Departed(Device),
}

impl PresenceChange {
    pub fn device(&self) -> &Device {
        match self {
            PresenceChange::Arrived(device) | PresenceChange::Departed(device) => device,
        }
    }

    /// Confidence reported to MQTT subscribers.
    pub fn confidence(&self) -> u8 {
        match self {
            PresenceChange::Arrived(_) => 100,
            PresenceChange::Departed(_) => 0,
        }
    }
}

/// Out-of-schedule scan request received over MQTT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanRequest {
    Arrive,
    Depart,
}
