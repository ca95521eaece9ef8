//! Built-in escalation ladders
//!
//! Waits are cumulative from escalation start, not from the previous
//! step. The runner schedules on a monotonic clock, so wall-clock jumps
//! never accelerate steps.

use serde::Serialize;
use std::time::Duration;

use dastak_core::Purpose;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationChannel {
    Push,
    Chat,
    Ring,
    InteractiveVoice,
    HumanOperator,
}

impl EscalationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Chat => "chat",
            Self::Ring => "ring",
            Self::InteractiveVoice => "interactive_voice",
            Self::HumanOperator => "human_operator",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EscalationStep {
    pub channel: EscalationChannel,
    /// Cumulative wait from escalation start
    #[serde(serialize_with = "serialize_secs", rename = "after_secs")]
    pub after: Duration,
    pub stop_on_ack: bool,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

const fn step(channel: EscalationChannel, after_secs: u64) -> EscalationStep {
    EscalationStep {
        channel,
        after: Duration::from_secs(after_secs),
        stop_on_ack: true,
    }
}

/// The ladder for a purpose, or `None` when the purpose has no
/// escalation flow (inbound calls are not escalated).
pub fn ladder(purpose: Purpose) -> Option<&'static [EscalationStep]> {
    use EscalationChannel::*;
    static VENDOR_NEW_ORDER: [EscalationStep; 5] = [
        step(Push, 0),
        step(Chat, 60),
        step(Ring, 120),
        step(InteractiveVoice, 180),
        step(HumanOperator, 300),
    ];
    static VENDOR_REMINDER: [EscalationStep; 3] =
        [step(Push, 0), step(Ring, 60), step(InteractiveVoice, 120)];
    static RIDER_ASSIGN: [EscalationStep; 4] = [
        step(Push, 0),
        step(Chat, 60),
        step(Ring, 120),
        step(InteractiveVoice, 180),
    ];
    static RIDER_ADDRESS_UPDATE: [EscalationStep; 3] =
        [step(Chat, 0), step(Ring, 30), step(InteractiveVoice, 90)];
    static CUSTOMER_STATUS: [EscalationStep; 2] = [step(Push, 0), step(Chat, 30)];
    static CUSTOMER_DELAY: [EscalationStep; 1] = [step(Chat, 0)];

    match purpose {
        Purpose::VendorNewOrder => Some(&VENDOR_NEW_ORDER),
        Purpose::VendorReminder => Some(&VENDOR_REMINDER),
        Purpose::RiderAssign => Some(&RIDER_ASSIGN),
        Purpose::RiderAddressUpdate => Some(&RIDER_ADDRESS_UPDATE),
        Purpose::CustomerStatus => Some(&CUSTOMER_STATUS),
        Purpose::CustomerDelay => Some(&CUSTOMER_DELAY),
        Purpose::InboundCustomer => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_are_cumulative_and_monotonic() {
        for purpose in [
            Purpose::VendorNewOrder,
            Purpose::VendorReminder,
            Purpose::RiderAssign,
            Purpose::RiderAddressUpdate,
            Purpose::CustomerStatus,
            Purpose::CustomerDelay,
        ] {
            let steps = ladder(purpose).unwrap();
            assert!(!steps.is_empty());
            for pair in steps.windows(2) {
                assert!(
                    pair[0].after <= pair[1].after,
                    "{purpose}: waits must not decrease"
                );
            }
        }
    }

    #[test]
    fn vendor_new_order_ladder_shape() {
        let steps = ladder(Purpose::VendorNewOrder).unwrap();
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[0].channel, EscalationChannel::Push);
        assert_eq!(steps[3].channel, EscalationChannel::InteractiveVoice);
        assert_eq!(steps[3].after, Duration::from_secs(180));
        assert_eq!(steps[4].channel, EscalationChannel::HumanOperator);
    }

    #[test]
    fn inbound_purpose_has_no_ladder() {
        assert!(ladder(Purpose::InboundCustomer).is_none());
    }
}
