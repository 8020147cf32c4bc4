pub mod memory;
pub mod ticket;

use std::{pin::pin, sync::Arc};

use async_trait::async_trait;
use derive_more::{Display, From};
use futures::{stream, Stream, StreamExt as _};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio_postgres::{tls::NoTlsStream, AsyncMessage, NoTls, Socket};
use tracing::{debug, warn};

use crate::config;

pub use self::ticket::{Id, Rejection, Status, Ticket, Transition};

/// `LISTEN/NOTIFY` channel carrying ids of changed tickets.
pub const CHANGES_CHANNEL: &str = "ticket_changes";

const FEED_CAPACITY: usize = 256;

const MAX_WRITE_ATTEMPTS: usize = 8;

#[derive(Debug, Display, From)]
pub enum Error {
    #[from]
    #[display("postgres: {_0}")]
    Postgres(tokio_postgres::Error),

    #[display("ticket {_0} already exists")]
    Duplicate(Id),

    #[display("ticket {_0} kept changing under concurrent writers")]
    Contention(Id),

    #[display("ticket {id} has an invalid {column}")]
    Corrupted { id: Id, column: &'static str },
}

impl std::error::Error for Error {}

/// Durable keyed ticket records.
///
/// Implementations only have to guarantee atomic per-record writes: every
/// lifecycle change goes through [`Store::replace_ticket`], which must refuse
/// the write when the stored version moved on.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), Error>;

    async fn get_ticket_by_id(&self, id: &Id) -> Result<Option<Ticket>, Error>;

    /// Tickets of `user_id`, newest first, optionally only those in
    /// `status`.
    async fn find_tickets_by_user(
        &self,
        user_id: &str,
        status: Option<Status>,
    ) -> Result<Vec<Ticket>, Error>;

    /// Replaces the lifecycle fields of `ticket` if the stored record still
    /// has `expected_version`. Returns whether the write happened.
    async fn replace_ticket(
        &self,
        expected_version: i64,
        ticket: &Ticket,
    ) -> Result<bool, Error>;

    /// Ids of tickets inserted or changed from now on.
    fn subscribe(&self) -> broadcast::Receiver<Id>;
}

/// Result of applying a [`Transition`] to a stored ticket.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Recorded { previous: Status, current: Status },
    Unchanged(Status),
    Ignored(IgnoreReason),
}

#[derive(Clone, Debug, Display, PartialEq)]
pub enum IgnoreReason {
    #[display("ticket not found")]
    NotFound,

    #[display("stale transition, {current:?} cannot move to {incoming:?}")]
    Stale { current: Status, incoming: Status },

    #[display("payment {stored} already recorded, refusing {incoming}")]
    PaymentIdConflict { stored: String, incoming: String },

    #[display("unsupported event type {_0:?}")]
    UnsupportedEvent(String),
}

impl From<Rejection> for IgnoreReason {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Stale { current, incoming } => {
                Self::Stale { current, incoming }
            }
            Rejection::PaymentIdConflict { stored, incoming } => {
                Self::PaymentIdConflict { stored, incoming }
            }
        }
    }
}

/// Applies `transition` to ticket `id` with read, decide and
/// compare-and-swap, retrying when another writer got in between.
pub async fn apply_transition(
    store: &dyn Store,
    id: &Id,
    transition: &Transition,
) -> Result<Outcome, Error> {
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let Some(current) = store.get_ticket_by_id(id).await? else {
            return Ok(Outcome::Ignored(IgnoreReason::NotFound));
        };

        let next = match current.apply(transition, OffsetDateTime::now_utc()) {
            Ok(Some(next)) => next,
            Ok(None) => return Ok(Outcome::Unchanged(current.status)),
            Err(rejection) => return Ok(Outcome::Ignored(rejection.into())),
        };

        if store.replace_ticket(current.version, &next).await? {
            return Ok(Outcome::Recorded {
                previous: current.status,
                current: next.status,
            });
        }
        debug!(ticket_id = %id, attempt, "ticket changed concurrently");
    }

    Err(Error::Contention(id.clone()))
}

/// Records the checkout session of ticket `id`. Returns `false` if the
/// ticket does not exist.
pub async fn attach_preference(
    store: &dyn Store,
    id: &Id,
    preference_id: &str,
) -> Result<bool, Error> {
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let Some(current) = store.get_ticket_by_id(id).await? else {
            return Ok(false);
        };
        let Some(next) =
            current.with_preference(preference_id, OffsetDateTime::now_utc())
        else {
            return Ok(true);
        };

        if store.replace_ticket(current.version, &next).await? {
            return Ok(true);
        }
        debug!(ticket_id = %id, attempt, "ticket changed concurrently");
    }

    Err(Error::Contention(id.clone()))
}

/// Live snapshots of ticket `id`: the current one first, then one per
/// stored change. Ends when the ticket does not exist, after a store error,
/// or when the feed closes. Dropping the stream drops the subscription.
pub fn watch(
    store: Arc<dyn Store>,
    id: Id,
) -> impl Stream<Item = Result<Ticket, Error>> + Send {
    struct Watch {
        store: Arc<dyn Store>,
        id: Id,
        changes: broadcast::Receiver<Id>,
        last_version: Option<i64>,
    }

    // Subscribing before the first read, so no change slips in between.
    let changes = store.subscribe();
    let watch = Watch {
        store,
        id,
        changes,
        last_version: None,
    };

    stream::unfold(Some(watch), |watch| async move {
        let Some(mut watch) = watch else {
            return None;
        };
        loop {
            if watch.last_version.is_some() {
                match watch.changes.recv().await {
                    Ok(changed) if changed == watch.id => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(
                            ticket_id = %watch.id,
                            skipped,
                            "change feed lagged",
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }

            match watch.store.get_ticket_by_id(&watch.id).await {
                Ok(Some(ticket)) => {
                    if watch.last_version == Some(ticket.version) {
                        continue;
                    }
                    watch.last_version = Some(ticket.version);
                    return Some((Ok(ticket), Some(watch)));
                }
                Ok(None) => return None,
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
}

pub type Connection = tokio_postgres::Connection<Socket, NoTlsStream>;

pub async fn connect(
    config: &config::Postgres,
) -> Result<(Client, Driver), Error> {
    let (inner, connection) =
        tokio_postgres::connect(&config.url, NoTls).await?;
    let (feed, _) = broadcast::channel(FEED_CAPACITY);

    Ok((
        Client {
            inner,
            feed: feed.clone(),
        },
        Driver { connection, feed },
    ))
}

pub struct Client {
    inner: tokio_postgres::Client,
    feed: broadcast::Sender<Id>,
}

impl Client {
    /// Creates the schema if missing and starts listening for changes.
    ///
    /// Requires the [`Driver`] to be running already.
    pub async fn prepare(&self) -> Result<(), Error> {
        const SQL: &str = "\
            CREATE TABLE IF NOT EXISTS tickets ( \
                id TEXT PRIMARY KEY, \
                user_id TEXT NOT NULL, \
                schedule_id TEXT, \
                travel_date TEXT NOT NULL, \
                departure_time TEXT NOT NULL, \
                vehicle_type INT2 NOT NULL, \
                adults INT4 NOT NULL CHECK (adults >= 0), \
                children INT4 NOT NULL CHECK (children >= 0), \
                total_price NUMERIC NOT NULL CHECK (total_price >= 0), \
                status INT2 NOT NULL, \
                payment_status TEXT, \
                payment_id TEXT, \
                preference_id TEXT, \
                created_at TIMESTAMPTZ NOT NULL, \
                updated_at TIMESTAMPTZ NOT NULL, \
                version INT8 NOT NULL \
            ); \
            CREATE INDEX IF NOT EXISTS tickets_user_id_idx \
                ON tickets (user_id); \
            LISTEN ticket_changes;";

        self.inner.batch_execute(SQL).await.map_err(Into::into)
    }
}

/// Drives the database connection and forwards change notifications to the
/// subscribers of the [`Client`] it was created with.
pub struct Driver {
    connection: Connection,
    feed: broadcast::Sender<Id>,
}

impl Driver {
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            mut connection,
            feed,
        } = self;
        let mut messages =
            pin!(stream::poll_fn(move |cx| connection.poll_message(cx)));

        while let Some(message) = messages.next().await {
            match message? {
                AsyncMessage::Notification(n)
                    if n.channel() == CHANGES_CHANNEL =>
                {
                    // No receivers simply means nobody is watching.
                    feed.send(Id::from(n.payload())).ok();
                }
                AsyncMessage::Notice(notice) => {
                    warn!(%notice, "postgres notice");
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use futures::StreamExt as _;
    use tokio::time::timeout;

    use super::{
        apply_transition, attach_preference, memory,
        ticket::tests::pending_ticket, watch, IgnoreReason, Outcome, Status,
        Store as _, Transition,
    };

    fn paid(payment_id: &str) -> Transition {
        Transition {
            status: Status::Paid,
            payment_status: Some("approved".to_string()),
            payment_id: Some(payment_id.to_string()),
        }
    }

    fn pending() -> Transition {
        Transition {
            status: Status::Pending,
            payment_status: Some("pending".to_string()),
            payment_id: None,
        }
    }

    #[tokio::test]
    async fn records_then_reports_replay() {
        let store = memory::Store::new();
        let ticket = pending_ticket("t1");
        store.insert_ticket(&ticket).await.unwrap();

        let first = apply_transition(&store, &ticket.id, &paid("pay_1"))
            .await
            .unwrap();
        assert_eq!(
            first,
            Outcome::Recorded {
                previous: Status::Pending,
                current: Status::Paid,
            }
        );

        let second = apply_transition(&store, &ticket.id, &paid("pay_1"))
            .await
            .unwrap();
        assert_eq!(second, Outcome::Unchanged(Status::Paid));

        let stored = store.get_ticket_by_id(&ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn ignores_late_pending() {
        let store = memory::Store::new();
        let ticket = pending_ticket("t1");
        store.insert_ticket(&ticket).await.unwrap();

        for transition in [pending(), paid("pay_1"), pending()] {
            apply_transition(&store, &ticket.id, &transition)
                .await
                .unwrap();
        }

        let stored = store.get_ticket_by_id(&ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Paid);
        assert_eq!(stored.payment_id.as_deref(), Some("pay_1"));
    }

    #[tokio::test]
    async fn ignores_unknown_ticket() {
        let store = memory::Store::new();
        let outcome = apply_transition(&store, &"missing".into(), &paid("p"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Ignored(IgnoreReason::NotFound));
    }

    #[tokio::test]
    async fn concurrent_writers_converge_on_highest_rank() {
        let store = Arc::new(memory::Store::new());
        let ticket = pending_ticket("t1");
        store.insert_ticket(&ticket).await.unwrap();

        let transitions = [
            pending(),
            paid("pay_1"),
            Transition {
                status: Status::Failed,
                payment_status: Some("rejected".to_string()),
                payment_id: None,
            },
            pending(),
        ];
        let handles = transitions
            .into_iter()
            .map(|transition| {
                let store = Arc::clone(&store);
                let id = ticket.id.clone();
                tokio::spawn(async move {
                    apply_transition(store.as_ref(), &id, &transition).await
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get_ticket_by_id(&ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Paid);
    }

    #[tokio::test]
    async fn attaches_preference() {
        let store = memory::Store::new();
        let ticket = pending_ticket("t1");
        store.insert_ticket(&ticket).await.unwrap();

        assert!(attach_preference(&store, &ticket.id, "pref_1").await.unwrap());
        assert!(!attach_preference(&store, &"missing".into(), "pref_1")
            .await
            .unwrap());

        let stored = store.get_ticket_by_id(&ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.preference_id.as_deref(), Some("pref_1"));
        assert_eq!(stored.status, Status::Pending);
    }

    #[tokio::test]
    async fn watch_yields_current_then_changes() {
        let store = Arc::new(memory::Store::new());
        let ticket = pending_ticket("t1");
        let other = pending_ticket("t2");
        store.insert_ticket(&ticket).await.unwrap();
        store.insert_ticket(&other).await.unwrap();

        let mut snapshots = Box::pin(watch(store.clone(), ticket.id.clone()));
        let first = snapshots.next().await.unwrap().unwrap();
        assert_eq!(first.status, Status::Pending);

        apply_transition(store.as_ref(), &other.id, &paid("pay_2"))
            .await
            .unwrap();
        apply_transition(store.as_ref(), &ticket.id, &paid("pay_1"))
            .await
            .unwrap();
        let second = timeout(Duration::from_secs(1), snapshots.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.id, ticket.id);
        assert_eq!(second.status, Status::Paid);
    }

    #[tokio::test]
    async fn watch_ends_for_unknown_ticket() {
        let store = Arc::new(memory::Store::new());
        let mut snapshots = Box::pin(watch(store, "missing".into()));
        assert!(snapshots.next().await.is_none());
    }
}
