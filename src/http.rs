use std::{
    future::{Future, IntoFuture as _},
    sync::Arc,
};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method, StatusCode,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use derive_more::From;
use futures::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};

use crate::{
    api, config,
    db::{self, Outcome, Status, Store, Transition},
    issuer::{self, Issuer, ValidationError},
    notifier::{self, Notifier},
    payment::Provider,
};

pub type SharedAppState = Arc<AppState>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handles shared by every request, constructed once at startup.
pub struct AppState {
    store: Arc<dyn Store>,
    issuer: Issuer,
    notifier: Notifier,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        settings: issuer::Settings,
    ) -> Self {
        let notifier = Notifier::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            settings.timeout,
        );
        Self {
            issuer: Issuer::new(Arc::clone(&store), provider, settings),
            notifier,
            store,
        }
    }
}

/// Both endpoints are called without ambient credentials, so any origin may
/// call them unless the configuration narrows it down.
pub fn cors(
    config: &config::Cors,
) -> Result<CorsLayer, axum::http::header::InvalidHeaderValue> {
    let origins = if config.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .map(|origin| origin.parse::<HeaderValue>())
                .collect::<Result<Vec<_>, _>>()?,
        )
    };

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE]))
}

pub fn router(state: SharedAppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/create-preference", post(create_preference))
        .route("/api/webhook", post(webhook))
        .route("/api/ticket/:id", get(get_ticket))
        .route("/api/ticket/:id/events", get(ticket_events))
        .route("/api/ticket/:id/checkout", post(open_checkout))
        .route("/api/user/:user_id/tickets", get(list_tickets))
        .route("/api/user/:user_id/ticket", get(get_active_ticket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `app` until the server fails or `fatal` resolves with the error
/// that makes further requests pointless.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    fatal: impl Future<Output = BoxError>,
) -> Result<(), BoxError> {
    tokio::select! {
        served = axum::serve(listener, app).into_future() => Ok(served?),
        e = fatal => Err(e),
    }
}

fn error_body(status: StatusCode, error: &str, message: String) -> Response {
    (status, Json(json!({ "error": error, "message": message })))
        .into_response()
}

#[derive(Serialize)]
struct Ping {
    status: &'static str,
    message: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

async fn ping() -> Json<Ping> {
    Json(Ping {
        status: "ok",
        message: "ferry booking api is up",
        timestamp: OffsetDateTime::now_utc(),
    })
}

async fn create_preference(
    State(state): State<SharedAppState>,
    body: Result<Json<api::BookingRequest>, JsonRejection>,
) -> Result<Json<api::Issued>, CreatePreferenceError> {
    let Json(request) = body?;
    Ok(Json(state.issuer.issue(request).await?))
}

#[derive(Debug, From)]
pub enum CreatePreferenceError {
    #[from]
    Issue(issuer::Error),
    #[from]
    MalformedBody(JsonRejection),
}

impl IntoResponse for CreatePreferenceError {
    fn into_response(self) -> Response {
        use issuer::Error as E;

        match self {
            Self::MalformedBody(rejection) => error_body(
                StatusCode::BAD_REQUEST,
                "Malformed request body",
                rejection.body_text(),
            ),
            Self::Issue(E::Validation(e)) => {
                let error = match e {
                    ValidationError::Missing(_) => "Missing required fields",
                    _ => "Invalid booking request",
                };
                error_body(StatusCode::BAD_REQUEST, error, e.to_string())
            }
            Self::Issue(E::Upstream { ticket_id, cause }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Payment provider unavailable",
                    "message": cause.to_string(),
                    "ticketId": ticket_id,
                    "retryable": true,
                })),
            )
                .into_response(),
            Self::Issue(E::Store(e)) => {
                error!(%e, "booking failed");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    e.to_string(),
                )
            }
        }
    }
}

async fn webhook(
    State(state): State<SharedAppState>,
    body: Result<Json<api::Notification>, JsonRejection>,
) -> Result<Json<api::Acknowledgement>, WebhookError> {
    let Json(notification) = body?;
    let outcome = state.notifier.handle(notification).await?;
    Ok(Json(api::Acknowledgement::from(&outcome)))
}

#[derive(Debug, From)]
pub enum WebhookError {
    #[from]
    Notify(notifier::Error),
    #[from]
    MalformedBody(JsonRejection),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        use notifier::Error as E;

        match self {
            Self::MalformedBody(rejection) => error_body(
                StatusCode::BAD_REQUEST,
                "Malformed notification",
                rejection.body_text(),
            ),
            Self::Notify(
                e @ (E::MissingPaymentReference | E::MissingReference(_)),
            ) => error_body(
                StatusCode::BAD_REQUEST,
                "Missing ticket ID",
                e.to_string(),
            ),
            Self::Notify(e @ (E::Upstream(_) | E::Store(_))) => {
                error!(%e, "notification not processed");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    e.to_string(),
                )
            }
        }
    }
}

async fn get_ticket(
    State(state): State<SharedAppState>,
    Path(id): Path<db::Id>,
) -> Result<Json<api::Ticket>, GetTicketError> {
    use GetTicketError as E;

    let ticket = state
        .store
        .get_ticket_by_id(&id)
        .await?
        .ok_or(E::TicketNotFound)?;

    Ok(Json(ticket.into()))
}

#[derive(Debug, From)]
pub enum GetTicketError {
    #[from]
    DbError(db::Error),
    TicketNotFound,
}

impl IntoResponse for GetTicketError {
    fn into_response(self) -> Response {
        match self {
            Self::TicketNotFound => error_body(
                StatusCode::NOT_FOUND,
                "Ticket not found",
                "no ticket with this id".to_string(),
            ),
            Self::DbError(e) => {
                error!(%e, "ticket lookup failed");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    e.to_string(),
                )
            }
        }
    }
}

/// Streams ticket snapshots as server-sent `ticket` events until the client
/// goes away.
async fn ticket_events(
    State(state): State<SharedAppState>,
    Path(id): Path<db::Id>,
) -> Result<Sse<impl Stream<Item = Result<Event, BoxError>>>, GetTicketError>
{
    use GetTicketError as E;

    if state.store.get_ticket_by_id(&id).await?.is_none() {
        return Err(E::TicketNotFound);
    }

    let events = db::watch(Arc::clone(&state.store), id).map(
        |snapshot| -> Result<Event, BoxError> {
            let ticket = api::Ticket::from(snapshot?);
            Ok(Event::default().event("ticket").json_data(ticket)?)
        },
    );

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Marks the ticket as awaiting payment once the client opened its checkout.
async fn open_checkout(
    State(state): State<SharedAppState>,
    Path(id): Path<db::Id>,
) -> Result<Json<api::Ticket>, GetTicketError> {
    use GetTicketError as E;

    let transition = Transition {
        status: Status::AwaitingPayment,
        payment_status: None,
        payment_id: None,
    };
    match db::apply_transition(state.store.as_ref(), &id, &transition).await? {
        Outcome::Ignored(db::IgnoreReason::NotFound) => {
            return Err(E::TicketNotFound)
        }
        Outcome::Ignored(reason) => {
            warn!(ticket_id = %id, %reason, "checkout transition dropped");
        }
        Outcome::Recorded { .. } | Outcome::Unchanged(_) => {}
    }

    let ticket = state
        .store
        .get_ticket_by_id(&id)
        .await?
        .ok_or(E::TicketNotFound)?;

    Ok(Json(ticket.into()))
}

#[derive(Deserialize)]
struct ListTicketsInput {
    status: Option<Status>,
}

async fn list_tickets(
    State(state): State<SharedAppState>,
    Path(user_id): Path<String>,
    Query(ListTicketsInput { status }): Query<ListTicketsInput>,
) -> Result<Json<api::ticket::List>, ListTicketsError> {
    let tickets = state
        .store
        .find_tickets_by_user(&user_id, status)
        .await?
        .into_iter()
        .map(api::Ticket::from)
        .collect();

    Ok(Json(api::ticket::List { tickets }))
}

#[derive(Debug, From)]
pub enum ListTicketsError {
    #[from]
    DbError(db::Error),
}

impl IntoResponse for ListTicketsError {
    fn into_response(self) -> Response {
        match self {
            Self::DbError(e) => {
                error!(%e, "ticket listing failed");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    e.to_string(),
                )
            }
        }
    }
}

/// The most recent paid ticket of a user, the one the boarding screen shows.
async fn get_active_ticket(
    State(state): State<SharedAppState>,
    Path(user_id): Path<String>,
) -> Result<Json<api::Ticket>, GetTicketError> {
    use GetTicketError as E;

    let ticket = state
        .store
        .find_tickets_by_user(&user_id, Some(Status::Paid))
        .await?
        .into_iter()
        .next()
        .ok_or(E::TicketNotFound)?;

    Ok(Json(ticket.into()))
}
