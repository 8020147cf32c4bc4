pub mod mercadopago;
pub mod sandbox;

use async_trait::async_trait;
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use crate::db;

#[derive(Debug, Display)]
pub enum Error {
    #[display("payment provider timed out")]
    Timeout,

    #[display("payment provider unreachable: {_0}")]
    Transport(reqwest::Error),

    #[display("payment provider answered {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e)
        }
    }
}

/// External payment provider: hosts checkout sessions and holds the
/// authoritative payment records.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, Error>;

    async fn get_payment(&self, id: &str) -> Result<Payment, Error>;
}

/// Checkout session for a single ticket.
#[derive(Clone, Debug, PartialEq)]
pub struct PreferenceRequest {
    pub title: String,
    pub description: String,
    pub unit_price: Decimal,
    pub currency: String,
    pub back_urls: BackUrls,

    /// Ticket id, echoed back on every payment of this session.
    pub external_reference: String,
    pub notification_url: String,
    pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub user_id: String,
    pub schedule_id: Option<String>,
    pub time: String,
    pub date: String,
    pub vehicle_type: db::ticket::VehicleType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Preference {
    pub id: String,
    pub checkout_url: String,
    pub sandbox_checkout_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Payment {
    pub id: String,
    pub status: Status,
    pub external_reference: Option<String>,
}

/// Payment status as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Status {
    Approved,
    Pending,
    Rejected,
    Cancelled,
    Refunded,
    Unrecognized(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl From<&str> for Status {
    fn from(raw: &str) -> Self {
        match raw {
            "approved" => Self::Approved,
            "pending" => Self::Pending,
            "rejected" => Self::Rejected,
            "cancelled" => Self::Cancelled,
            "refunded" => Self::Refunded,
            other => Self::Unrecognized(other.to_string()),
        }
    }
}

impl From<&Status> for db::Status {
    fn from(status: &Status) -> Self {
        match status {
            Status::Approved => Self::Paid,
            Status::Pending | Status::Unrecognized(_) => Self::Pending,
            Status::Rejected => Self::Failed,
            Status::Cancelled => Self::Cancelled,
            Status::Refunded => Self::Refunded,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawReference {
    Text(String),
    Number(u64),
}

/// Deserializes an optional id sent either as a JSON string or number.
pub fn deserialize_reference<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawReference>::deserialize(deserializer)?.map(|raw| match raw {
        RawReference::Text(text) => text,
        RawReference::Number(number) => number.to_string(),
    }))
}
