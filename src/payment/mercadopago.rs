//! Mercado Pago REST client: checkout preferences and payment lookups.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    deserialize_reference, Error, Payment, Preference, PreferenceRequest,
    Status,
};
use crate::{config, db::ticket::VehicleType};

pub struct Client {
    http: reqwest::Client,
    api_url: String,
    access_token: String,
}

impl Client {
    pub fn new(
        config: &config::MercadoPago,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        })
    }
}

#[derive(Serialize)]
struct PreferenceBody<'a> {
    items: [Item<'a>; 1],
    back_urls: BackUrls<'a>,
    auto_return: &'static str,
    external_reference: &'a str,
    notification_url: &'a str,
    metadata: Metadata<'a>,
}

#[derive(Serialize)]
struct Item<'a> {
    title: &'a str,
    description: &'a str,
    quantity: u32,
    #[serde(with = "rust_decimal::serde::float")]
    unit_price: Decimal,
    currency_id: &'a str,
}

#[derive(Serialize)]
struct BackUrls<'a> {
    success: &'a str,
    failure: &'a str,
    pending: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata<'a> {
    user_id: &'a str,
    schedule_id: Option<&'a str>,
    time: &'a str,
    date: &'a str,
    vehicle_type: VehicleType,
}

#[derive(Deserialize)]
struct PreferenceResponse {
    id: String,
    init_point: String,
    sandbox_init_point: Option<String>,
}

#[derive(Deserialize)]
struct PaymentResponse {
    #[serde(default, deserialize_with = "deserialize_reference")]
    id: Option<String>,
    status: String,
    external_reference: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: String,
}

async fn rejection(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let message = match response.text().await {
        Ok(body) => serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or(body),
        Err(e) => e.to_string(),
    };
    Error::Rejected { status, message }
}

#[async_trait]
impl super::Provider for Client {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, Error> {
        let body = PreferenceBody {
            items: [Item {
                title: &request.title,
                description: &request.description,
                quantity: 1,
                unit_price: request.unit_price,
                currency_id: &request.currency,
            }],
            back_urls: BackUrls {
                success: &request.back_urls.success,
                failure: &request.back_urls.failure,
                pending: &request.back_urls.pending,
            },
            auto_return: "approved",
            external_reference: &request.external_reference,
            notification_url: &request.notification_url,
            metadata: Metadata {
                user_id: &request.metadata.user_id,
                schedule_id: request.metadata.schedule_id.as_deref(),
                time: &request.metadata.time,
                date: &request.metadata.date,
                vehicle_type: request.metadata.vehicle_type,
            },
        };

        let response = self
            .http
            .post(format!("{}/checkout/preferences", self.api_url))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let preference = response.json::<PreferenceResponse>().await?;
        debug!(
            preference_id = %preference.id,
            external_reference = %request.external_reference,
            "preference created",
        );
        Ok(Preference {
            id: preference.id,
            checkout_url: preference.init_point,
            sandbox_checkout_url: preference.sandbox_init_point,
        })
    }

    async fn get_payment(&self, id: &str) -> Result<Payment, Error> {
        let response = self
            .http
            .get(format!("{}/v1/payments/{id}", self.api_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::Rejected {
                    status: StatusCode::NOT_FOUND.as_u16(),
                    message: format!("payment {id} not found"),
                });
            }
            _ => return Err(rejection(response).await),
        }

        let payment = response.json::<PaymentResponse>().await?;
        Ok(Payment {
            id: payment.id.unwrap_or_else(|| id.to_string()),
            status: Status::from(payment.status.as_str()),
            external_reference: payment
                .external_reference
                .filter(|reference| !reference.is_empty()),
        })
    }
}
