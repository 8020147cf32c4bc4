use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::db;

pub use crate::db::ticket::{Id, Passengers, Status, VehicleType};

/// Snapshot of a ticket as seen by clients.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: Id,
    pub user_id: String,
    pub schedule_id: Option<String>,
    pub date: String,
    pub time: String,
    pub vehicle_type: VehicleType,
    pub passengers: Passengers,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_price: Decimal,
    pub status: Status,
    pub payment_status: Option<String>,
    pub payment_id: Option<String>,
    pub preference_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Tickets of a single user, newest first.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct List {
    pub tickets: Vec<Ticket>,
}

impl From<db::Ticket> for Ticket {
    fn from(ticket: db::Ticket) -> Self {
        Self {
            id: ticket.id,
            user_id: ticket.user_id,
            schedule_id: ticket.schedule_id,
            date: ticket.date,
            time: ticket.time,
            vehicle_type: ticket.vehicle_type,
            passengers: ticket.passengers,
            total_price: ticket.total_price,
            status: ticket.status,
            payment_status: ticket.payment_status,
            payment_id: ticket.payment_id,
            preference_id: ticket.preference_id,
            created_at: ticket.created_at,
            updated_at: ticket.updated_at,
        }
    }
}
