//! One-shot calendar events.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::data::DataType;

/// Calendar event kinds that trigger an immediate update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Earnings,
    CentralBankMeeting,
    EconomicRelease,
    GuidanceUpdate,
}

impl EventType {
    /// Data type refreshed when the event fires.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Earnings => DataType::Earnings,
            Self::CentralBankMeeting | Self::EconomicRelease => DataType::EconomicIndicator,
            Self::GuidanceUpdate => DataType::Guidance,
        }
    }

    /// Wait after the scheduled time before the data is expected.
    pub fn default_buffer(&self) -> Duration {
        match self {
            Self::Earnings | Self::GuidanceUpdate => Duration::minutes(30),
            Self::CentralBankMeeting => Duration::minutes(15),
            Self::EconomicRelease => Duration::minutes(5),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earnings => "earnings",
            Self::CentralBankMeeting => "central_bank_meeting",
            Self::EconomicRelease => "economic_release",
            Self::GuidanceUpdate => "guidance_update",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "earnings" => Ok(Self::Earnings),
            "central_bank_meeting" | "central_bank" => Ok(Self::CentralBankMeeting),
            "economic_release" => Ok(Self::EconomicRelease),
            "guidance_update" | "guidance" => Ok(Self::GuidanceUpdate),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// One-shot calendar entry; fires once, at or after `scheduled_time + buffer`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEvent {
    pub id: String,
    pub asset: String,
    pub event_type: EventType,
    pub scheduled_time: DateTime<Utc>,
    pub buffer: Duration,
    pub triggered: bool,
}

impl ScheduledEvent {
    pub fn new(
        asset: impl Into<String>,
        event_type: EventType,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            asset: asset.into(),
            event_type,
            scheduled_time,
            buffer: event_type.default_buffer(),
            triggered: false,
        }
    }

    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn fire_time(&self) -> DateTime<Utc> {
        self.scheduled_time + self.buffer
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.triggered && now >= self.fire_time()
    }

    pub fn data_type(&self) -> DataType {
        self.event_type.data_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_data_type_mapping() {
        assert_eq!(EventType::Earnings.data_type(), DataType::Earnings);
        assert_eq!(EventType::CentralBankMeeting.data_type(), DataType::EconomicIndicator);
        assert_eq!(EventType::EconomicRelease.data_type(), DataType::EconomicIndicator);
        assert_eq!(EventType::GuidanceUpdate.data_type(), DataType::Guidance);
        assert_eq!("central_bank".parse::<EventType>().unwrap(), EventType::CentralBankMeeting);
    }

    #[test]
    fn test_event_due_after_buffer() {
        let at = Utc::now();
        let event = ScheduledEvent::new("AAPL", EventType::Earnings, at);
        assert_eq!(event.buffer, Duration::minutes(30));
        assert!(!event.is_due(at));
        assert!(!event.is_due(at + Duration::minutes(29)));
        assert!(event.is_due(at + Duration::minutes(30)));

        let mut fired = event.clone();
        fired.triggered = true;
        assert!(!fired.is_due(at + Duration::hours(1)));
        assert_ne!(event.id, ScheduledEvent::new("AAPL", EventType::Earnings, at).id);
    }
}
