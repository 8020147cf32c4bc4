use std::{sync::Arc, time::Duration};

use constcat::concat;
use ferry_booking::{
    api, client::BookingFlow, config, db::memory, db::ticket::IdScheme,
    http, issuer, payment::sandbox, pricing::Tariff,
};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::net::TcpListener;

pub const CREATE_PREFERENCE: &str = concat!(API, "/create-preference");
pub const WEBHOOK: &str = concat!(API, "/webhook");
pub const PING: &str = concat!(API, "/ping");

const API: &str = "/api";

/// Server running on an ephemeral port, backed by the in-memory store and the
/// sandbox provider so that tests can inspect and steer both.
pub struct App {
    pub base_url: String,
    pub store: Arc<memory::Store>,
    pub provider: Arc<sandbox::Provider>,
    pub flow: BookingFlow,
    http: reqwest::Client,
}

impl App {
    pub async fn spawn() -> Self {
        let store = Arc::new(memory::Store::new());
        let provider = Arc::new(sandbox::Provider::new());
        let settings = issuer::Settings {
            id_scheme: IdScheme::Uuid,
            tariff: Tariff::default(),
            currency: "BRL".to_string(),
            notification_url: "http://localhost/api/webhook".to_string(),
            back_urls: config::BackUrls {
                success: "myapp://payment/success".to_string(),
                failure: "myapp://payment/failure".to_string(),
                pending: "myapp://payment/pending".to_string(),
            },
            timeout: Duration::from_millis(500),
        };

        let state = Arc::new(http::AppState::new(
            store.clone(),
            provider.clone(),
            settings,
        ));
        let cors = http::cors(&config::Cors::default())
            .expect("default CORS is valid");
        let app = http::router(state, cors);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind a port");
        let base_url = format!(
            "http://{}",
            listener.local_addr().expect("failed to get the address"),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server failed");
        });

        Self {
            flow: BookingFlow::new(base_url.clone()),
            base_url,
            store,
            provider,
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> reqwest::Response {
        self.http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("failed to send a request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.http
            .get(self.url(path))
            .send()
            .await
            .expect("failed to send a request")
    }

    /// Books the scenario passage: one adult with a car at 14:00.
    pub async fn book(&self) -> api::Issued {
        self.flow
            .create_preference(&booking())
            .await
            .expect("failed to book")
    }

    /// Posts the notification the provider sends for `payment_id`.
    pub async fn notify_payment(
        &self,
        payment_id: &str,
    ) -> api::Acknowledgement {
        let notification =
            json!({ "type": "payment", "data": { "id": payment_id } });
        let response = self
            .post(WEBHOOK, notification)
            .await
            .error_for_status()
            .expect("wrong status code");
        response.json().await.expect("failed to get a response")
    }

    pub async fn ticket(&self, id: &api::ticket::Id) -> api::Ticket {
        self.flow
            .get_ticket(id)
            .await
            .expect("failed to get the ticket")
            .expect("ticket not found")
    }
}

pub fn booking() -> api::BookingRequest {
    api::BookingRequest {
        user_id: Some("u1".to_string()),
        time: Some("14:00".to_string()),
        date: Some("2024-11-16".to_string()),
        vehicle_type: Some("car".to_string()),
        price: Some(Decimal::from(40)),
        ..Default::default()
    }
}
