//! Core domain types shared across the comms services
//!
//! These are views over Core Backend data, never the system of record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommsError;

/// Order identifier (opaque, minted by the Core Backend)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call identifier (minted by the Telephony Provider)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Party identifier (vendor/rider/customer/admin id in the Core Backend)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId(pub String);

impl PartyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Escalation identifier, deterministic for a (purpose, order) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscalationId(pub String);

impl EscalationId {
    /// Deterministic id so concurrent starts for the same ladder collide.
    pub fn for_order(purpose: Purpose, order_id: &OrderId) -> Self {
        Self(format!("esc:{}:{}", purpose.as_str(), order_id))
    }
}

impl fmt::Display for EscalationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// E.164 phone number, normalized on construction.
///
/// Equality and hashing are on the normalized form, so `+919876543210`,
/// `919876543210` and `9876543210` all compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize a raw phone string.
    ///
    /// Strips whitespace and punctuation, then applies the Indian mobile
    /// rules: a bare 10-digit mobile (leading 6-9) gets the +91 country
    /// code, as do the `91`-prefixed and `0`-prefixed spellings of the
    /// same number. Anything already carrying `+` is kept as-is.
    /// Idempotent: normalizing a normalized number is a no-op.
    pub fn normalize(raw: &str) -> Self {
        let mut cleaned = String::with_capacity(raw.len());
        for (i, c) in raw.chars().enumerate() {
            if c.is_ascii_digit() || (c == '+' && i == 0) {
                cleaned.push(c);
            }
        }

        if let Some(rest) = cleaned.strip_prefix('+') {
            // Already international form; keep digits only after the plus.
            return Self(format!("+{rest}"));
        }

        let digits = cleaned.as_str();
        let normalized = if digits.len() == 10 && digits.starts_with(['6', '7', '8', '9']) {
            format!("+91{digits}")
        } else if digits.len() == 12 && digits.starts_with("91") {
            format!("+{digits}")
        } else if digits.len() == 11 && digits.starts_with('0') {
            format!("+91{}", &digits[1..])
        } else if let Some(rest) = digits.strip_prefix("00") {
            format!("+{rest}")
        } else {
            format!("+{digits}")
        };
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PhoneNumber {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

/// Spoken languages the platform serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Hindi,
    English,
    Marathi,
    Tamil,
    Telugu,
    Kannada,
    Bengali,
}

impl Language {
    /// BCP-47 tag used in provider requests
    pub fn code(&self) -> &'static str {
        match self {
            Self::Hindi => "hi-IN",
            Self::English => "en-IN",
            Self::Marathi => "mr-IN",
            Self::Tamil => "ta-IN",
            Self::Telugu => "te-IN",
            Self::Kannada => "kn-IN",
            Self::Bengali => "bn-IN",
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Self::Hindi
    }
}

impl FromStr for Language {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hi" | "hi-in" | "hindi" => Ok(Self::Hindi),
            "en" | "en-in" | "english" => Ok(Self::English),
            "mr" | "mr-in" | "marathi" => Ok(Self::Marathi),
            "ta" | "ta-in" | "tamil" => Ok(Self::Tamil),
            "te" | "te-in" | "telugu" => Ok(Self::Telugu),
            "kn" | "kn-in" | "kannada" => Ok(Self::Kannada),
            "bn" | "bn-in" | "bengali" => Ok(Self::Bengali),
            other => Err(CommsError::Validation(format!("unknown language: {other}"))),
        }
    }
}

/// Kind of party on the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyKind {
    Vendor,
    Rider,
    Customer,
    Admin,
}

/// A vendor, rider, customer or admin as seen by the comms layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub kind: PartyKind,
    pub id: PartyId,
    pub phone: PhoneNumber,
    pub display_name: String,
    #[serde(default)]
    pub preferred_language: Option<Language>,
}

/// Payment mode on an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    Prepaid,
    Cod,
}

/// Order lifecycle states, owned by the Core Backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Partial,
    Confirmed,
    Processing,
    Handover,
    OutForDelivery,
    Delivered,
    Cancelled,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Confirmed => "confirmed",
            Self::Processing => "processing",
            Self::Handover => "handover",
            Self::OutForDelivery => "out_for_delivery",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A line item on an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub name: String,
    pub qty: u32,
}

/// Read-only view of an order, fetched from the Core Backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Total amount in paise (fixed point, 100 paise = 1 rupee)
    pub amount_paise: i64,
    pub payment_mode: PaymentMode,
    pub state: OrderState,
    pub vendor: Party,
    pub customer: Party,
    #[serde(default)]
    pub rider: Option<Party>,
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub placed_at: Option<DateTime<Utc>>,
}

/// Named reason for a call or notification ladder.
///
/// Selects both the escalation flow and the conversation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    VendorNewOrder,
    VendorReminder,
    RiderAssign,
    RiderAddressUpdate,
    CustomerStatus,
    CustomerDelay,
    InboundCustomer,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VendorNewOrder => "vendor.new_order",
            Self::VendorReminder => "vendor.reminder",
            Self::RiderAssign => "rider.assign",
            Self::RiderAddressUpdate => "rider.address_update",
            Self::CustomerStatus => "customer.status",
            Self::CustomerDelay => "customer.delay",
            Self::InboundCustomer => "customer.inbound",
        }
    }

    /// Which side of the order this purpose talks to
    pub fn target(&self) -> PartyKind {
        match self {
            Self::VendorNewOrder | Self::VendorReminder => PartyKind::Vendor,
            Self::RiderAssign | Self::RiderAddressUpdate => PartyKind::Rider,
            Self::CustomerStatus | Self::CustomerDelay | Self::InboundCustomer => {
                PartyKind::Customer
            }
        }
    }
}

impl FromStr for Purpose {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vendor.new_order" => Ok(Self::VendorNewOrder),
            "vendor.reminder" => Ok(Self::VendorReminder),
            "rider.assign" => Ok(Self::RiderAssign),
            "rider.address_update" => Ok(Self::RiderAddressUpdate),
            "customer.status" => Ok(Self::CustomerStatus),
            "customer.delay" => Ok(Self::CustomerDelay),
            "customer.inbound" => Ok(Self::InboundCustomer),
            other => Err(CommsError::Validation(format!("unknown purpose: {other}"))),
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a call session, reported to the Core Backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome {
    Accepted {
        #[serde(skip_serializing_if = "Option::is_none")]
        prep_minutes: Option<u32>,
    },
    Rejected {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason_recording: Option<String>,
    },
    Confirmed,
    NoAction,
    Completed,
    FailedTts,
    FailedAsr,
    FailedBackend,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Confirmed => "confirmed",
            Self::NoAction => "no_action",
            Self::Completed => "completed",
            Self::FailedTts => "failed_tts",
            Self::FailedAsr => "failed_asr",
            Self::FailedBackend => "failed_backend",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_country_code_to_bare_mobile() {
        assert_eq!(PhoneNumber::normalize("9876543210").as_str(), "+919876543210");
    }

    #[test]
    fn normalize_accepted_spellings_are_equal() {
        let canonical = PhoneNumber::normalize("+919876543210");
        assert_eq!(PhoneNumber::normalize("919876543210"), canonical);
        assert_eq!(PhoneNumber::normalize("9876543210"), canonical);
        assert_eq!(PhoneNumber::normalize("09876543210"), canonical);
        assert_eq!(PhoneNumber::normalize("+91 98765 43210"), canonical);
        assert_eq!(PhoneNumber::normalize("98765-43210"), canonical);
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "9876543210",
            "919876543210",
            "+919876543210",
            "0 98765 43210",
            "+14155550100",
            "0044 20 7946 0958",
        ] {
            let once = PhoneNumber::normalize(raw);
            let twice = PhoneNumber::normalize(once.as_str());
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn normalize_keeps_foreign_numbers() {
        assert_eq!(PhoneNumber::normalize("+14155550100").as_str(), "+14155550100");
        assert_eq!(PhoneNumber::normalize("001415555010").as_str(), "+1415555010");
    }

    #[test]
    fn purpose_round_trips() {
        for p in [
            Purpose::VendorNewOrder,
            Purpose::VendorReminder,
            Purpose::RiderAssign,
            Purpose::RiderAddressUpdate,
            Purpose::CustomerStatus,
            Purpose::CustomerDelay,
            Purpose::InboundCustomer,
        ] {
            assert_eq!(p.as_str().parse::<Purpose>().unwrap(), p);
        }
    }

    #[test]
    fn escalation_id_is_deterministic() {
        let a = EscalationId::for_order(Purpose::VendorNewOrder, &OrderId::new("O-4"));
        let b = EscalationId::for_order(Purpose::VendorNewOrder, &OrderId::new("O-4"));
        assert_eq!(a, b);
        assert_eq!(a.0, "esc:vendor.new_order:O-4");
    }

    #[test]
    fn language_parses_codes_and_names() {
        assert_eq!("hi-IN".parse::<Language>().unwrap(), Language::Hindi);
        assert_eq!("english".parse::<Language>().unwrap(), Language::English);
        assert!("xx".parse::<Language>().is_err());
    }
}
