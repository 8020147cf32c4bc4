//! Process-local [`Store`](super::Store), for single-instance deployments and
//! tests.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Error, Id, Status, Ticket, FEED_CAPACITY};

pub struct Store {
    tickets: Mutex<HashMap<Id, Ticket>>,
    feed: broadcast::Sender<Id>,
}

impl Store {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            tickets: Mutex::new(HashMap::new()),
            feed,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Id, Ticket>> {
        // Writers never leave a half-updated map behind.
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, id: &Id) {
        self.feed.send(id.clone()).ok();
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::Store for Store {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), Error> {
        {
            let mut tickets = self.lock();
            if tickets.contains_key(&ticket.id) {
                return Err(Error::Duplicate(ticket.id.clone()));
            }
            tickets.insert(ticket.id.clone(), ticket.clone());
        }
        self.announce(&ticket.id);
        Ok(())
    }

    async fn get_ticket_by_id(&self, id: &Id) -> Result<Option<Ticket>, Error> {
        Ok(self.lock().get(id).cloned())
    }

    async fn find_tickets_by_user(
        &self,
        user_id: &str,
        status: Option<Status>,
    ) -> Result<Vec<Ticket>, Error> {
        let mut found = self
            .lock()
            .values()
            .filter(|t| t.user_id == user_id)
            .filter(|t| status.map_or(true, |status| t.status == status))
            .cloned()
            .collect::<Vec<_>>();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn replace_ticket(
        &self,
        expected_version: i64,
        ticket: &Ticket,
    ) -> Result<bool, Error> {
        {
            let mut tickets = self.lock();
            let Some(stored) = tickets.get_mut(&ticket.id) else {
                return Ok(false);
            };
            if stored.version != expected_version {
                return Ok(false);
            }
            stored.status = ticket.status;
            stored.payment_status.clone_from(&ticket.payment_status);
            stored.payment_id.clone_from(&ticket.payment_id);
            stored.preference_id.clone_from(&ticket.preference_id);
            stored.updated_at = ticket.updated_at;
            stored.version = ticket.version;
        }
        self.announce(&ticket.id);
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<Id> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use time::Duration;

    use super::Store;
    use crate::db::{
        ticket::tests::pending_ticket, Error, Status, Store as _,
    };

    #[tokio::test]
    async fn refuses_duplicate_ids() {
        let store = Store::new();
        let ticket = pending_ticket("t1");
        store.insert_ticket(&ticket).await.unwrap();
        let err = store.insert_ticket(&ticket).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate(id) if id == ticket.id));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn refuses_outdated_version() {
        let store = Store::new();
        let ticket = pending_ticket("t1");
        store.insert_ticket(&ticket).await.unwrap();

        let mut paid = ticket.clone();
        paid.status = Status::Paid;
        paid.version = 1;
        assert!(store.replace_ticket(0, &paid).await.unwrap());
        assert!(!store.replace_ticket(0, &paid).await.unwrap());
    }

    #[tokio::test]
    async fn keeps_booking_attributes() {
        let store = Store::new();
        let ticket = pending_ticket("t1");
        store.insert_ticket(&ticket).await.unwrap();

        let mut changed = ticket.clone();
        changed.total_price = Decimal::from(1);
        changed.version = 1;
        store.replace_ticket(0, &changed).await.unwrap();

        let stored = store.get_ticket_by_id(&ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.total_price, ticket.total_price);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn finds_tickets_of_a_user_newest_first() {
        let store = Store::new();
        let older = pending_ticket("t1");
        let mut newer = pending_ticket("t2");
        newer.created_at = older.created_at + Duration::minutes(5);
        newer.status = Status::Paid;
        let mut foreign = pending_ticket("t3");
        foreign.user_id = "u2".to_string();
        for ticket in [&older, &newer, &foreign] {
            store.insert_ticket(ticket).await.unwrap();
        }

        let all = store.find_tickets_by_user("u1", None).await.unwrap();
        let ids = all.iter().map(|t| t.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["t2", "t1"]);

        let paid = store
            .find_tickets_by_user("u1", Some(Status::Paid))
            .await
            .unwrap();
        assert_eq!(paid, [newer]);
        assert!(store
            .find_tickets_by_user("nobody", None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn announces_changes() {
        let store = Store::new();
        let mut changes = store.subscribe();
        let ticket = pending_ticket("t1");
        store.insert_ticket(&ticket).await.unwrap();
        assert_eq!(changes.recv().await.unwrap(), ticket.id);
    }
}
