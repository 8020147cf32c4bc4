//! Payment Notifier: reconciles tickets with provider notifications.
//!
//! Notifications are delivered at least once and in any order. Each one only
//! points at a payment; the outcome is fetched from the provider and applied
//! through [`db::apply_transition`], so replays and late arrivals can never
//! move a ticket backwards.

use std::{sync::Arc, time::Duration};

use derive_more::{Display, From};
use tracing::{debug, info, warn};

use crate::{
    api::Notification,
    db::{self, IgnoreReason, Id, Outcome, Status, Store, Transition},
    payment::{self, Provider},
};

const PAYMENT_EVENT: &str = "payment";

#[derive(Debug, Display, From)]
pub enum Error {
    #[display("notification carries no payment reference")]
    MissingPaymentReference,

    #[display("payment {_0} carries no external reference")]
    MissingReference(String),

    #[from]
    #[display("payment lookup failed: {_0}")]
    Upstream(payment::Error),

    #[from]
    #[display("ticket store failed: {_0}")]
    Store(db::Error),
}

pub struct Notifier {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            timeout,
        }
    }

    pub async fn handle(
        &self,
        notification: Notification,
    ) -> Result<Outcome, Error> {
        let kind = notification.kind.unwrap_or_default();
        if kind != PAYMENT_EVENT {
            debug!(%kind, "ignoring notification");
            return Ok(Outcome::Ignored(IgnoreReason::UnsupportedEvent(kind)));
        }

        let reference = notification
            .data
            .and_then(|data| data.id)
            .filter(|id| !id.is_empty())
            .ok_or(Error::MissingPaymentReference)?;

        let payment = tokio::time::timeout(
            self.timeout,
            self.provider.get_payment(&reference),
        )
        .await
        .unwrap_or(Err(payment::Error::Timeout))?;
        let Some(ticket_id) = payment.external_reference.map(Id::from) else {
            warn!(
                payment_id = %reference,
                "payment is not correlated with a ticket",
            );
            return Err(Error::MissingReference(reference));
        };

        let status = Status::from(&payment.status);
        let transition = Transition {
            status,
            payment_status: Some(payment.status.as_str().to_string()),
            payment_id: matches!(status, Status::Paid | Status::Refunded)
                .then(|| reference.clone()),
        };
        let outcome =
            db::apply_transition(self.store.as_ref(), &ticket_id, &transition)
                .await?;

        match &outcome {
            Outcome::Recorded { previous, current } => info!(
                %ticket_id,
                payment_id = %reference,
                ?previous,
                ?current,
                "ticket updated",
            ),
            Outcome::Unchanged(status) => debug!(
                %ticket_id,
                payment_id = %reference,
                ?status,
                "notification replayed",
            ),
            Outcome::Ignored(IgnoreReason::NotFound) => warn!(
                %ticket_id,
                payment_id = %reference,
                "reconciliation gap, ticket not found",
            ),
            Outcome::Ignored(reason) => warn!(
                %ticket_id,
                payment_id = %reference,
                %reason,
                "notification dropped",
            ),
        }

        Ok(outcome)
    }
}
