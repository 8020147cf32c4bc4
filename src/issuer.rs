//! Preference Issuer: turns a booking request into a pending ticket and a
//! checkout session correlated with it.

use std::{sync::Arc, time::Duration};

use derive_more::{Display, From};
use rust_decimal::Decimal;
use time::{macros::format_description, Date, OffsetDateTime, Time};
use tracing::{info, warn};

use crate::{
    api::{BookingRequest, Issued},
    config,
    db::{
        self,
        ticket::{IdScheme, Passengers, VehicleType},
        Id, Status, Store, Ticket,
    },
    payment::{self, BackUrls, Metadata, PreferenceRequest, Provider},
    pricing::Tariff,
};

#[derive(Debug, Display, From)]
pub enum Error {
    #[from]
    #[display("{_0}")]
    Validation(ValidationError),

    /// The ticket exists and stays pending, the same ticket can be paid for
    /// again later.
    #[display("payment provider failed for ticket {ticket_id}: {cause}")]
    Upstream {
        ticket_id: Id,
        cause: payment::Error,
    },

    #[from]
    #[display("ticket store failed: {_0}")]
    Store(db::Error),
}

#[derive(Debug, Display, PartialEq)]
pub enum ValidationError {
    #[display("missing required field {_0}")]
    Missing(&'static str),

    #[display("{_0} must be positive")]
    NotPositive(&'static str),

    #[display("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[display("price {given} does not match the fare {expected}")]
    PriceMismatch { expected: Decimal, given: Decimal },

    #[display("unknown ticket {_0}")]
    UnknownTicket(Id),

    #[display("ticket {id} is {status:?} and cannot be paid for")]
    NotPayable { id: Id, status: Status },
}

#[derive(Clone)]
pub struct Settings {
    pub id_scheme: IdScheme,
    pub tariff: Tariff,
    pub currency: String,
    pub notification_url: String,
    pub back_urls: config::BackUrls,
    pub timeout: Duration,
}

impl Settings {
    pub fn new(payment: &config::Payment, booking: &config::Booking) -> Self {
        Self {
            id_scheme: booking.id_scheme,
            tariff: booking.tariff.clone(),
            currency: payment.currency.clone(),
            notification_url: payment.notification_url.clone(),
            back_urls: payment.back_urls.clone(),
            timeout: payment.timeout,
        }
    }
}

/// Booking request that passed validation.
#[derive(Clone, Debug, PartialEq)]
struct Booking {
    user_id: String,
    schedule_id: Option<String>,
    time: String,
    date: String,
    vehicle_type: VehicleType,
    passengers: Passengers,
    price: Decimal,
    ticket_id: Option<Id>,
}

fn required(
    field: &'static str,
    value: Option<String>,
) -> Result<String, ValidationError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::Missing(field))
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate(
    request: BookingRequest,
    tariff: &Tariff,
) -> Result<Booking, ValidationError> {
    use ValidationError as E;

    let user_id = required("userId", request.user_id)?;
    let time = required("time", request.time)?;
    let price = request.price.ok_or(E::Missing("price"))?;

    if price <= Decimal::ZERO {
        return Err(E::NotPositive("price"));
    }
    Time::parse(&time, format_description!("[hour]:[minute]")).map_err(
        |_| E::Invalid {
            field: "time",
            reason: "expected HH:MM".to_string(),
        },
    )?;
    let date = match optional(request.date) {
        Some(date) => {
            Date::parse(&date, format_description!("[year]-[month]-[day]"))
                .map_err(|_| E::Invalid {
                    field: "date",
                    reason: "expected YYYY-MM-DD".to_string(),
                })?;
            date
        }
        None => OffsetDateTime::now_utc().date().to_string(),
    };
    let vehicle_type = optional(request.vehicle_type)
        .map(|v| v.parse::<VehicleType>())
        .transpose()
        .map_err(|reason| E::Invalid {
            field: "vehicleType",
            reason,
        })?
        .unwrap_or_default();

    let passengers = match request.passengers {
        Some(passengers) => {
            if passengers.adults == 0 {
                return Err(E::Invalid {
                    field: "passengers",
                    reason: "at least one adult is required".to_string(),
                });
            }
            let expected = tariff.quote(passengers, vehicle_type);
            if expected != price {
                return Err(E::PriceMismatch {
                    expected,
                    given: price,
                });
            }
            passengers
        }
        None => Passengers::default(),
    };

    Ok(Booking {
        user_id,
        schedule_id: optional(request.schedule_id),
        time,
        date,
        vehicle_type,
        passengers,
        price,
        ticket_id: request.ticket_id,
    })
}

fn back_url(base: &str, id: &Id) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}ticketId={id}")
}

pub struct Issuer {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    settings: Settings,
}

impl Issuer {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
        }
    }

    pub async fn issue(
        &self,
        request: BookingRequest,
    ) -> Result<Issued, Error> {
        let booking = validate(request, &self.settings.tariff)?;
        let ticket = self.ticket_for(booking).await?;

        let urls = &self.settings.back_urls;
        let preference_request = PreferenceRequest {
            title: format!("Ferry passage - {}", ticket.time),
            description: format!("Booking for {}", ticket.date),
            unit_price: ticket.total_price,
            currency: self.settings.currency.clone(),
            back_urls: BackUrls {
                success: back_url(&urls.success, &ticket.id),
                failure: back_url(&urls.failure, &ticket.id),
                pending: back_url(&urls.pending, &ticket.id),
            },
            external_reference: ticket.id.to_string(),
            notification_url: self.settings.notification_url.clone(),
            metadata: Metadata {
                user_id: ticket.user_id.clone(),
                schedule_id: ticket.schedule_id.clone(),
                time: ticket.time.clone(),
                date: ticket.date.clone(),
                vehicle_type: ticket.vehicle_type,
            },
        };

        let created = tokio::time::timeout(
            self.settings.timeout,
            self.provider.create_preference(&preference_request),
        )
        .await
        .unwrap_or(Err(payment::Error::Timeout));
        let preference = match created {
            Ok(preference) => preference,
            Err(cause) => {
                warn!(
                    ticket_id = %ticket.id,
                    %cause,
                    "checkout session not created, ticket stays pending",
                );
                return Err(Error::Upstream {
                    ticket_id: ticket.id,
                    cause,
                });
            }
        };

        // The checkout session already exists, failing here would orphan it.
        let attached = db::attach_preference(
            self.store.as_ref(),
            &ticket.id,
            &preference.id,
        )
        .await;
        match attached {
            Ok(true) => {}
            Ok(false) => warn!(
                ticket_id = %ticket.id,
                "ticket vanished before preference attach",
            ),
            Err(e) => warn!(
                ticket_id = %ticket.id,
                preference_id = %preference.id,
                %e,
                "preference not recorded on ticket",
            ),
        }
        info!(
            ticket_id = %ticket.id,
            preference_id = %preference.id,
            total_price = %ticket.total_price,
            "checkout session created",
        );

        Ok(Issued {
            ticket_id: ticket.id,
            preference_id: preference.id,
            checkout_url: preference.checkout_url,
            sandbox_checkout_url: preference.sandbox_checkout_url,
        })
    }

    /// Reuses the ticket of an earlier attempt, or stores a new pending one.
    async fn ticket_for(&self, booking: Booking) -> Result<Ticket, Error> {
        use ValidationError as E;

        if let Some(id) = booking.ticket_id {
            let ticket = self
                .store
                .get_ticket_by_id(&id)
                .await?
                .filter(|t| t.user_id == booking.user_id)
                .ok_or_else(|| E::UnknownTicket(id.clone()))?;
            if ticket.status.is_terminal() {
                return Err(E::NotPayable {
                    id,
                    status: ticket.status,
                }
                .into());
            }
            return Ok(ticket);
        }

        let now = OffsetDateTime::now_utc();
        let ticket = Ticket {
            id: Id::generate(self.settings.id_scheme),
            user_id: booking.user_id,
            schedule_id: booking.schedule_id,
            date: booking.date,
            time: booking.time,
            vehicle_type: booking.vehicle_type,
            passengers: booking.passengers,
            total_price: booking.price,
            status: Status::Pending,
            payment_status: None,
            payment_id: None,
            preference_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.store.insert_ticket(&ticket).await?;

        Ok(ticket)
    }
}
