use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ticket::{Id, Passengers};

/// Purchase request sent by the client. Every field is optional on the wire
/// so that missing ones are reported as validation errors.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BookingRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passengers: Option<Passengers>,

    /// Ticket of an earlier attempt to pay again for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<Id>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issued {
    pub ticket_id: Id,
    pub preference_id: String,
    pub checkout_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_checkout_url: Option<String>,
}
