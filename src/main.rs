use std::{env, sync::Arc};

use futures::{
    future::{self, BoxFuture},
    FutureExt as _,
};
use tokio::{fs, net, task};
use tracing::{error, info, warn};
use tracing_subscriber::{
    layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter,
};

use ferry_booking::{
    config, db,
    http::{self, AppState, BoxError},
    issuer,
    payment::{mercadopago, sandbox, Provider},
    Config,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = env::args().nth(1).unwrap_or_else(|| "config.toml".into());
    let config = fs::read_to_string(&path).await?;
    let config = toml::from_str::<Config>(&config)?;

    // Resolves once the store can no longer serve requests.
    let store_lost: BoxFuture<'static, BoxError>;
    let store: Arc<dyn db::Store> = match &config.db {
        config::Db::Postgres(pg) => {
            let (client, driver) = db::connect(pg).await?;
            let driver = task::spawn(driver.run());
            store_lost = async move {
                let e: BoxError = match driver.await {
                    Ok(Ok(())) => "database connection closed".into(),
                    Ok(Err(e)) => e.into(),
                    Err(e) => e.into(),
                };
                error!(%e, "database connection failed");
                e
            }
            .boxed();
            client.prepare().await?;
            Arc::new(client)
        }
        config::Db::Memory => {
            warn!("tickets are kept in memory and lost on restart");
            store_lost = future::pending().boxed();
            Arc::new(db::memory::Store::new())
        }
    };

    let provider: Arc<dyn Provider> = match &config.payment.provider {
        config::Provider::MercadoPago(mp) => {
            Arc::new(mercadopago::Client::new(mp, config.payment.timeout)?)
        }
        config::Provider::Sandbox => {
            warn!("payments go to the sandbox provider");
            Arc::new(sandbox::Provider::new())
        }
    };

    let settings = issuer::Settings::new(&config.payment, &config.booking);
    let state = Arc::new(AppState::new(store, provider, settings));
    let app = http::router(state, http::cors(&config.http.cors)?);

    let listener = net::TcpListener::bind(config.http.server.addr).await?;
    info!(addr = %config.http.server.addr, "listening");
    http::serve(listener, app, store_lost).await?;

    Ok(())
}
