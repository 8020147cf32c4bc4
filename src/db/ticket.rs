use std::{error::Error as StdError, str::FromStr};

use async_trait::async_trait;
use derive_more::Display;
use enum_utils::TryFromRepr;
use rand::Rng as _;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio_postgres::{
    types::{
        accepts, private::BytesMut, to_sql_checked, FromSql, IsNull, ToSql,
        Type,
    },
    Row,
};
use uuid::Uuid;

use super::{Client, Error, Store, CHANGES_CHANNEL};

#[derive(Clone, Debug, PartialEq)]
pub struct Ticket {
    pub id: Id,
    pub user_id: String,
    pub schedule_id: Option<String>,
    pub date: String,
    pub time: String,
    pub vehicle_type: VehicleType,
    pub passengers: Passengers,
    pub total_price: Decimal,
    pub status: Status,
    pub payment_status: Option<String>,
    pub payment_id: Option<String>,
    pub preference_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,

    /// Bumped on every stored change, used for compare-and-swap writes.
    pub version: i64,
}

impl Ticket {
    /// Computes the ticket resulting from `transition`.
    ///
    /// Returns `Ok(None)` when the transition would not change anything, so
    /// that replayed notifications produce no write at all.
    pub fn apply(
        &self,
        transition: &Transition,
        now: OffsetDateTime,
    ) -> Result<Option<Self>, Rejection> {
        if !self.status.admits(transition.status) {
            return Err(Rejection::Stale {
                current: self.status,
                incoming: transition.status,
            });
        }

        let payment_id = match (&self.payment_id, &transition.payment_id) {
            (Some(stored), Some(incoming)) if stored != incoming => {
                return Err(Rejection::PaymentIdConflict {
                    stored: stored.clone(),
                    incoming: incoming.clone(),
                });
            }
            (stored, incoming) => incoming.clone().or_else(|| stored.clone()),
        };
        let payment_status = transition
            .payment_status
            .clone()
            .or_else(|| self.payment_status.clone());

        if transition.status == self.status
            && payment_id == self.payment_id
            && payment_status == self.payment_status
        {
            return Ok(None);
        }

        Ok(Some(Self {
            status: transition.status,
            payment_status,
            payment_id,
            updated_at: now,
            version: self.version + 1,
            ..self.clone()
        }))
    }

    pub fn with_preference(
        &self,
        preference_id: &str,
        now: OffsetDateTime,
    ) -> Option<Self> {
        (self.preference_id.as_deref() != Some(preference_id)).then(|| Self {
            preference_id: Some(preference_id.to_string()),
            updated_at: now,
            version: self.version + 1,
            ..self.clone()
        })
    }
}

/// Status change requested for a ticket, either by a payment notification or
/// by the client opening the checkout.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub status: Status,
    pub payment_status: Option<String>,
    pub payment_id: Option<String>,
}

#[derive(Clone, Debug, Display, PartialEq)]
pub enum Rejection {
    #[display("{current:?} cannot move to {incoming:?}")]
    Stale { current: Status, incoming: Status },

    #[display("payment {stored} already recorded, refusing {incoming}")]
    PaymentIdConflict { stored: String, incoming: String },
}

#[derive(
    Clone, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize,
)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn generate(scheme: IdScheme) -> Self {
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

        match scheme {
            IdScheme::Uuid => Self(Uuid::new_v4().simple().to_string()),
            IdScheme::Timestamped => {
                let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
                let millis = nanos / 1_000_000;
                let mut rng = rand::rng();
                let suffix = (0..9)
                    .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())])
                    .map(char::from)
                    .collect::<String>();
                Self(format!("ticket_{millis}_{suffix}"))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl FromSql<'_> for Id {
    accepts!(TEXT, VARCHAR);

    fn from_sql(
        ty: &Type,
        raw: &[u8],
    ) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        String::from_sql(ty, raw).map(Self)
    }
}

impl ToSql for Id {
    accepts!(TEXT, VARCHAR);

    to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        self.0.to_sql(ty, out)
    }
}

/// How the issuer allocates ticket ids. The chosen id doubles as the
/// `external_reference` of the checkout session.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IdScheme {
    /// 32 lowercase hex characters.
    #[default]
    Uuid,

    /// `ticket_<unix millis>_<9 base36 characters>`.
    Timestamped,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, TryFromRepr, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Status {
    /// Ticket is booked, nothing is known about its payment yet.
    Pending = 1,

    /// Checkout is open on the client, no provider callback arrived yet.
    AwaitingPayment = 2,

    Paid = 3,

    Failed = 4,

    Cancelled = 5,

    /// Payment was returned to the passenger.
    Refunded = 6,
}

impl Status {
    /// Position in the monotonic order statuses may only climb.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending | Self::AwaitingPayment => 0,
            Self::Failed | Self::Cancelled => 1,
            Self::Paid => 2,
            Self::Refunded => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() > 0
    }

    /// Whether a ticket in this status may be moved to `next`.
    pub fn admits(self, next: Self) -> bool {
        next == self || !self.is_terminal() || next.rank() > self.rank()
    }
}

impl FromSql<'_> for Status {
    accepts!(INT2);

    fn from_sql(
        ty: &Type,
        raw: &[u8],
    ) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        let repr = i16::from_sql(ty, raw)?;
        let repr = u8::try_from(repr)?;
        let status = Self::try_from(repr).map_err(|_| "invalid status")?;
        Ok(status)
    }
}

impl ToSql for Status {
    accepts!(INT2);

    to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        let repr = i16::from((*self) as u8);
        repr.to_sql(ty, out)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    TryFromRepr,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum VehicleType {
    /// Foot passengers only.
    #[serde(rename = "none")]
    OnFoot = 1,
    Motorcycle = 2,
    #[default]
    Car = 3,
    Pickup = 4,
    Van = 5,
    Truck = 6,
    Bus = 7,
}

impl FromStr for VehicleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => Self::OnFoot,
            "motorcycle" => Self::Motorcycle,
            "car" => Self::Car,
            "pickup" => Self::Pickup,
            "van" => Self::Van,
            "truck" => Self::Truck,
            "bus" => Self::Bus,
            other => return Err(format!("unknown vehicle type {other:?}")),
        })
    }
}

impl FromSql<'_> for VehicleType {
    accepts!(INT2);

    fn from_sql(
        ty: &Type,
        raw: &[u8],
    ) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        let repr = i16::from_sql(ty, raw)?;
        let repr = u8::try_from(repr)?;
        let vehicle =
            Self::try_from(repr).map_err(|_| "invalid vehicle type")?;
        Ok(vehicle)
    }
}

impl ToSql for VehicleType {
    accepts!(INT2);

    to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        let repr = i16::from((*self) as u8);
        repr.to_sql(ty, out)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Passengers {
    pub adults: u32,
    pub children: u32,
}

impl Default for Passengers {
    fn default() -> Self {
        Self {
            adults: 1,
            children: 0,
        }
    }
}

const COLUMNS: &str = "\
    id, user_id, schedule_id, travel_date, departure_time, \
    vehicle_type, adults, children, total_price, status, \
    payment_status, payment_id, preference_id, \
    created_at, updated_at, version";

fn ticket_from_row(row: &Row) -> Result<Ticket, Error> {
    let id: Id = row.try_get("id")?;
    let count = |column: &'static str| -> Result<u32, Error> {
        let value = row.try_get::<_, i32>(column)?;
        u32::try_from(value).map_err(|_| Error::Corrupted {
            id: id.clone(),
            column,
        })
    };
    let passengers = Passengers {
        adults: count("adults")?,
        children: count("children")?,
    };

    Ok(Ticket {
        user_id: row.try_get("user_id")?,
        schedule_id: row.try_get("schedule_id")?,
        date: row.try_get("travel_date")?,
        time: row.try_get("departure_time")?,
        vehicle_type: row.try_get("vehicle_type")?,
        passengers,
        total_price: row.try_get("total_price")?,
        status: row.try_get("status")?,
        payment_status: row.try_get("payment_status")?,
        payment_id: row.try_get("payment_id")?,
        preference_id: row.try_get("preference_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
        id,
    })
}

fn count_param(
    ticket: &Ticket,
    column: &'static str,
    value: u32,
) -> Result<i32, Error> {
    i32::try_from(value).map_err(|_| Error::Corrupted {
        id: ticket.id.clone(),
        column,
    })
}

// Every write notifies `CHANGES_CHANNEL` from within its own statement, so
// a change is announced exactly when it commits.
#[async_trait]
impl Store for Client {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), Error> {
        let sql = format!(
            "WITH inserted AS ( \
                INSERT INTO tickets ({COLUMNS}) \
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, \
                        $9, $10, $11, $12, $13, $14, $15, $16) \
                ON CONFLICT (id) DO NOTHING \
                RETURNING id \
            ) \
            SELECT pg_notify($17, id) FROM inserted"
        );

        let adults = count_param(ticket, "adults", ticket.passengers.adults)?;
        let children =
            count_param(ticket, "children", ticket.passengers.children)?;

        let inserted = self
            .inner
            .query(
                &sql,
                &[
                    &ticket.id,
                    &ticket.user_id,
                    &ticket.schedule_id,
                    &ticket.date,
                    &ticket.time,
                    &ticket.vehicle_type,
                    &adults,
                    &children,
                    &ticket.total_price,
                    &ticket.status,
                    &ticket.payment_status,
                    &ticket.payment_id,
                    &ticket.preference_id,
                    &ticket.created_at,
                    &ticket.updated_at,
                    &ticket.version,
                    &CHANGES_CHANNEL,
                ],
            )
            .await?;
        if inserted.is_empty() {
            return Err(Error::Duplicate(ticket.id.clone()));
        }

        Ok(())
    }

    async fn get_ticket_by_id(&self, id: &Id) -> Result<Option<Ticket>, Error> {
        let sql = format!("SELECT {COLUMNS} FROM tickets WHERE id = $1");

        self.inner
            .query_opt(&sql, &[id])
            .await?
            .as_ref()
            .map(ticket_from_row)
            .transpose()
    }

    async fn find_tickets_by_user(
        &self,
        user_id: &str,
        status: Option<Status>,
    ) -> Result<Vec<Ticket>, Error> {
        let sql = format!(
            "SELECT {COLUMNS} FROM tickets \
             WHERE user_id = $1 AND ($2::INT2 IS NULL OR status = $2) \
             ORDER BY created_at DESC"
        );

        self.inner
            .query(&sql, &[&user_id, &status])
            .await?
            .iter()
            .map(ticket_from_row)
            .collect()
    }

    async fn replace_ticket(
        &self,
        expected_version: i64,
        ticket: &Ticket,
    ) -> Result<bool, Error> {
        // Booking attributes are immutable, only the lifecycle columns move.
        const SQL: &str = "\
            WITH replaced AS ( \
                UPDATE tickets \
                SET status = $3, \
                    payment_status = $4, \
                    payment_id = $5, \
                    preference_id = $6, \
                    updated_at = $7, \
                    version = $8 \
                WHERE id = $1 AND version = $2 \
                RETURNING id \
            ) \
            SELECT pg_notify($9, id) FROM replaced";

        let replaced = self
            .inner
            .query(
                SQL,
                &[
                    &ticket.id,
                    &expected_version,
                    &ticket.status,
                    &ticket.payment_status,
                    &ticket.payment_id,
                    &ticket.preference_id,
                    &ticket.updated_at,
                    &ticket.version,
                    &CHANGES_CHANNEL,
                ],
            )
            .await?;

        Ok(!replaced.is_empty())
    }

    fn subscribe(&self) -> broadcast::Receiver<Id> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use rust_decimal::Decimal;
    use time::OffsetDateTime;

    use super::{
        Id, IdScheme, Passengers, Rejection, Status, Ticket, Transition,
        VehicleType,
    };

    pub(crate) fn pending_ticket(id: &str) -> Ticket {
        let now = OffsetDateTime::now_utc();
        Ticket {
            id: Id::from(id),
            user_id: "u1".to_string(),
            schedule_id: None,
            date: "2024-11-16".to_string(),
            time: "14:00".to_string(),
            vehicle_type: VehicleType::Car,
            passengers: Passengers::default(),
            total_price: Decimal::from(40),
            status: Status::Pending,
            payment_status: None,
            payment_id: None,
            preference_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    fn outcome(status: Status, payment_id: Option<&str>) -> Transition {
        Transition {
            status,
            payment_status: Some(format!("{status:?}").to_lowercase()),
            payment_id: payment_id.map(str::to_string),
        }
    }

    #[test]
    fn ranks_statuses() {
        assert_eq!(Status::Pending.rank(), Status::AwaitingPayment.rank());
        assert_eq!(Status::Failed.rank(), Status::Cancelled.rank());
        assert!(Status::Failed.rank() > Status::Pending.rank());
        assert!(Status::Paid.rank() > Status::Failed.rank());
        assert!(Status::Refunded.rank() > Status::Paid.rank());
        assert!(!Status::AwaitingPayment.is_terminal());
        assert!(Status::Cancelled.is_terminal());
    }

    #[test]
    fn non_terminal_admits_any_outcome() {
        for next in [
            Status::Pending,
            Status::AwaitingPayment,
            Status::Paid,
            Status::Failed,
            Status::Cancelled,
            Status::Refunded,
        ] {
            assert!(Status::Pending.admits(next));
            assert!(Status::AwaitingPayment.admits(next));
        }
    }

    #[test]
    fn terminal_admits_only_higher_rank_or_replay() {
        assert!(Status::Paid.admits(Status::Paid));
        assert!(Status::Paid.admits(Status::Refunded));
        assert!(Status::Failed.admits(Status::Paid));
        assert!(!Status::Paid.admits(Status::Pending));
        assert!(!Status::Paid.admits(Status::Failed));
        assert!(!Status::Failed.admits(Status::Cancelled));
        assert!(!Status::Refunded.admits(Status::Paid));
        assert!(!Status::Cancelled.admits(Status::AwaitingPayment));
    }

    #[test]
    fn applies_approved_payment() {
        let ticket = pending_ticket("t1");
        let paid = ticket
            .apply(
                &outcome(Status::Paid, Some("pay_1")),
                OffsetDateTime::now_utc(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(paid.status, Status::Paid);
        assert_eq!(paid.payment_id.as_deref(), Some("pay_1"));
        assert_eq!(paid.version, ticket.version + 1);
        assert_eq!(paid.total_price, ticket.total_price);
    }

    #[test]
    fn replay_changes_nothing() {
        let paid = pending_ticket("t1")
            .apply(
                &outcome(Status::Paid, Some("pay_1")),
                OffsetDateTime::now_utc(),
            )
            .unwrap()
            .unwrap();
        let replay = paid
            .apply(
                &outcome(Status::Paid, Some("pay_1")),
                OffsetDateTime::now_utc(),
            )
            .unwrap();
        assert_eq!(replay, None);
    }

    #[test]
    fn rejects_regression() {
        let paid = pending_ticket("t1")
            .apply(
                &outcome(Status::Paid, Some("pay_1")),
                OffsetDateTime::now_utc(),
            )
            .unwrap()
            .unwrap();
        let rejection = paid
            .apply(&outcome(Status::Pending, None), OffsetDateTime::now_utc())
            .unwrap_err();
        assert_eq!(
            rejection,
            Rejection::Stale {
                current: Status::Paid,
                incoming: Status::Pending,
            }
        );
    }

    #[test]
    fn never_overwrites_payment_id() {
        let paid = pending_ticket("t1")
            .apply(
                &outcome(Status::Paid, Some("pay_1")),
                OffsetDateTime::now_utc(),
            )
            .unwrap()
            .unwrap();
        let rejection = paid
            .apply(
                &outcome(Status::Paid, Some("pay_2")),
                OffsetDateTime::now_utc(),
            )
            .unwrap_err();
        assert!(matches!(rejection, Rejection::PaymentIdConflict { .. }));

        let refunded = paid
            .apply(&outcome(Status::Refunded, None), OffsetDateTime::now_utc())
            .unwrap()
            .unwrap();
        assert_eq!(refunded.payment_id.as_deref(), Some("pay_1"));
    }

    #[test]
    fn attaching_same_preference_is_noop() {
        let ticket = pending_ticket("t1")
            .with_preference("pref_1", OffsetDateTime::now_utc())
            .unwrap();
        assert_eq!(ticket.preference_id.as_deref(), Some("pref_1"));
        assert_eq!(
            ticket.with_preference("pref_1", OffsetDateTime::now_utc()),
            None
        );
    }

    #[test]
    fn generates_ids_per_scheme() {
        let uuid = Id::generate(IdScheme::Uuid);
        assert_eq!(uuid.as_str().len(), 32);
        assert!(uuid.as_str().chars().all(|c| c.is_ascii_hexdigit()));

        let stamped = Id::generate(IdScheme::Timestamped);
        let parts = stamped.as_str().split('_').collect::<Vec<_>>();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ticket");
        assert!(parts[1].parse::<i128>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));

        assert_ne!(Id::generate(IdScheme::Uuid), uuid);
    }
}
