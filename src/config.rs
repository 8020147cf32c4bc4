use std::{net, time};

use serde::Deserialize;

use crate::{db::ticket::IdScheme, pricing::Tariff};

#[derive(Deserialize)]
pub struct Config {
    pub db: Db,
    pub http: Http,
    pub payment: Payment,
    #[serde(default)]
    pub booking: Booking,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Db {
    Postgres(Postgres),
    Memory,
}

#[derive(Deserialize)]
pub struct Postgres {
    pub url: String,
}

#[derive(Deserialize)]
pub struct Http {
    pub server: Server,
    #[serde(default)]
    pub cors: Cors,
}

#[derive(Deserialize)]
pub struct Server {
    pub addr: net::SocketAddr,
}

#[derive(Deserialize)]
pub struct Cors {
    /// `"*"` allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for Cors {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct Payment {
    pub provider: Provider,

    /// Bound on every call the issuer makes to the provider.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: time::Duration,

    #[serde(default = "default_currency")]
    pub currency: String,

    /// Address the provider posts payment notifications to.
    pub notification_url: String,

    pub back_urls: BackUrls,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Provider {
    #[serde(rename = "mercadopago")]
    MercadoPago(MercadoPago),
    Sandbox,
}

#[derive(Clone, Deserialize)]
pub struct MercadoPago {
    pub access_token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

/// Where the checkout sends the passenger back to. The ticket id is appended
/// as a `ticketId` query parameter.
#[derive(Clone, Deserialize)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

#[derive(Clone, Default, Deserialize)]
pub struct Booking {
    #[serde(default)]
    pub id_scheme: IdScheme,
    #[serde(default)]
    pub tariff: Tariff,
}

fn default_timeout() -> time::Duration {
    time::Duration::from_secs(10)
}

fn default_currency() -> String {
    "BRL".to_string()
}

fn default_api_url() -> String {
    "https://api.mercadopago.com".to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal::Decimal;

    use super::{Config, Db, Provider};
    use crate::db::ticket::{IdScheme, VehicleType};

    #[test]
    fn parses_full_config() {
        let config = toml::from_str::<Config>(
            r#"
            [db]
            kind = "postgres"
            url = "postgres://ferry@localhost/ferry"

            [http.server]
            addr = "0.0.0.0:3000"

            [http.cors]
            allowed_origins = ["https://ferry.example"]

            [payment]
            timeout = "5s"
            notification_url = "https://ferry.example/api/webhook"

            [payment.provider]
            kind = "mercadopago"
            access_token = "TEST-token"

            [payment.back_urls]
            success = "myapp://payment/success"
            failure = "myapp://payment/failure"
            pending = "myapp://payment/pending"

            [booking]
            id_scheme = "timestamped"

            [booking.tariff]
            adult = 45
            child = 20

            [booking.tariff.vehicles]
            car = 30
            "#,
        )
        .unwrap();

        let Db::Postgres(pg) = &config.db else {
            panic!("expected a postgres database");
        };
        assert!(pg.url.ends_with("/ferry"));
        assert_eq!(config.http.cors.allowed_origins, ["https://ferry.example"]);
        assert_eq!(config.payment.timeout, Duration::from_secs(5));
        assert_eq!(config.payment.currency, "BRL");
        let Provider::MercadoPago(mp) = &config.payment.provider else {
            panic!("expected mercadopago provider");
        };
        assert_eq!(mp.api_url, "https://api.mercadopago.com");
        assert_eq!(config.booking.id_scheme, IdScheme::Timestamped);
        assert_eq!(config.booking.tariff.adult, Decimal::from(45));
        assert_eq!(
            config.booking.tariff.surcharge(VehicleType::Car),
            Decimal::from(30)
        );
    }

    #[test]
    fn applies_defaults() {
        let config = toml::from_str::<Config>(
            r#"
            [db]
            kind = "memory"

            [http.server]
            addr = "127.0.0.1:3000"

            [payment]
            notification_url = "http://localhost:3000/api/webhook"

            [payment.provider]
            kind = "sandbox"

            [payment.back_urls]
            success = "myapp://payment/success"
            failure = "myapp://payment/failure"
            pending = "myapp://payment/pending"
            "#,
        )
        .unwrap();

        assert!(matches!(config.db, Db::Memory));
        assert_eq!(config.http.cors.allowed_origins, ["*"]);
        assert_eq!(config.payment.timeout, Duration::from_secs(10));
        assert!(matches!(config.payment.provider, Provider::Sandbox));
        assert_eq!(config.booking.id_scheme, IdScheme::Uuid);
        assert_eq!(config.booking.tariff.adult, Decimal::from(40));
    }
}
