//! In-process payment provider for tests and local runs. Checkout sessions
//! are kept in memory and payments are settled by hand through
//! [`Provider::record_payment`], nothing settles them over HTTP.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{Error, Payment, Preference, PreferenceRequest, Status};

#[derive(Default)]
pub struct Provider {
    state: Mutex<State>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

/// Checkout sessions remembered by [`Provider::preferences`]. Older ones are
/// forgotten.
pub const PREFERENCE_HISTORY: usize = 256;

#[derive(Default)]
struct State {
    created: u64,
    preferences: VecDeque<(String, PreferenceRequest)>,
    payments: HashMap<String, Payment>,
}

impl Provider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call fail as if the provider was down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every following call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// The last [`PREFERENCE_HISTORY`] checkout sessions, oldest first.
    pub fn preferences(&self) -> Vec<(String, PreferenceRequest)> {
        self.lock().preferences.iter().cloned().collect()
    }

    /// Stores (or overwrites) payment `id`, as the checkout would once the
    /// passenger pays.
    pub fn record_payment(
        &self,
        id: &str,
        external_reference: Option<&str>,
        status: Status,
    ) {
        self.lock().payments.insert(
            id.to_string(),
            Payment {
                id: id.to_string(),
                status,
                external_reference: external_reference.map(str::to_string),
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call(&self) -> Result<(), Error> {
        let latency =
            *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Rejected {
                status: 503,
                message: "sandbox provider unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl super::Provider for Provider {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, Error> {
        self.call().await?;

        let mut state = self.lock();
        state.created += 1;
        let id = format!("pref_{}", state.created);
        if state.preferences.len() == PREFERENCE_HISTORY {
            state.preferences.pop_front();
        }
        state.preferences.push_back((id.clone(), request.clone()));
        Ok(Preference {
            checkout_url: format!("https://sandbox.invalid/checkout/{id}"),
            sandbox_checkout_url: Some(format!(
                "https://sandbox.invalid/checkout/{id}?sandbox=true"
            )),
            id,
        })
    }

    async fn get_payment(&self, id: &str) -> Result<Payment, Error> {
        self.call().await?;

        self.lock()
            .payments
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Rejected {
                status: 404,
                message: format!("payment {id} not found"),
            })
    }
}
