use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum ContactState {
    NoContact,
    Stable,
    Loading,
    Unloading,
}

impl Default for ContactState {
    fn default() -> Self {
        ContactState::NoContact
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum Channel {
    Force,
    Displacement,
    Temperature,
    Humidity,
}

/// Channels whose value in a sample is a held-over reading rather than a fresh one.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub struct SubstitutedChannels {
    pub force: bool,
    pub displacement: bool,
    pub temperature: bool,
    pub humidity: bool,
}

impl SubstitutedChannels {
    pub fn mark(&mut self, channel: Channel) {
        match channel {
            Channel::Force => self.force = true,
            Channel::Displacement => self.displacement = true,
            Channel::Temperature => self.temperature = true,
            Channel::Humidity => self.humidity = true,
        }
    }

    pub fn contains(&self, channel: Channel) -> bool {
        match channel {
            Channel::Force => self.force,
            Channel::Displacement => self.displacement,
            Channel::Temperature => self.temperature,
            Channel::Humidity => self.humidity,
        }
    }

    pub fn any(&self) -> bool {
        self.force || self.displacement || self.temperature || self.humidity
    }
}

/// One committed measurement.  Force in µN, displacement in nm (positive into the sample).
#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Duration,
    pub force: f64,
    pub displacement: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub contact_state: ContactState,
    pub substituted: SubstitutedChannels,
}

impl Sample {
    pub fn new(timestamp: Duration, force: f64, displacement: f64) -> Self {
        Self {
            timestamp,
            force,
            displacement,
            temperature: 0.0,
            humidity: 0.0,
            contact_state: ContactState::NoContact,
            substituted: SubstitutedChannels::default(),
        }
    }

    pub fn is_fresh(&self, channel: Channel) -> bool {
        !self.substituted.contains(channel)
    }

    /// Both mechanical channels were read successfully for this sample.
    pub fn is_mechanically_valid(&self) -> bool {
        self.is_fresh(Channel::Force) && self.is_fresh(Channel::Displacement)
    }
}
