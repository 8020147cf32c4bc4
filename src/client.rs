//! Typed client of the booking endpoints, as used by the purchase screen.
//!
//! A purchase is a booking request, an optional hand-off to the checkout page
//! and a ticket subscription that reports every stored change until dropped.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use derive_more::{Display, From};
use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt as _,
};
use reqwest::{header::ACCEPT, StatusCode};
use serde::Deserialize;

use crate::api::{
    self,
    ticket::{Id, Status},
};

#[derive(Debug, Display, From)]
pub enum Error {
    #[from]
    #[display("request failed: {_0}")]
    Transport(reqwest::Error),

    #[display("server responded with {status}: {error} ({message})")]
    Server {
        status: u16,
        error: String,
        message: String,
        /// Ticket left pending by a failed payment attempt.
        ticket_id: Option<Id>,
        retryable: bool,
    },

    #[display("malformed ticket event: {_0}")]
    MalformedEvent(serde_json::Error),
}

impl Error {
    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Server { retryable, .. } => *retryable,
            Self::MalformedEvent(_) => false,
        }
    }
}

impl std::error::Error for Error {}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    ticket_id: Option<Id>,
    #[serde(default)]
    retryable: bool,
}

async fn check(
    response: reqwest::Response,
) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.json::<ErrorBody>().await.unwrap_or_else(|_| {
        ErrorBody {
            error: status.canonical_reason().unwrap_or_default().to_string(),
            message: String::new(),
            ticket_id: None,
            retryable: false,
        }
    });
    Err(Error::Server {
        status: status.as_u16(),
        error: body.error,
        message: body.message,
        ticket_id: body.ticket_id,
        retryable: body.retryable,
    })
}

#[derive(Clone)]
pub struct BookingFlow {
    http: reqwest::Client,
    base_url: String,
}

impl BookingFlow {
    /// `base_url` is the server root, e.g. `http://localhost:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url)
    }

    pub async fn create_preference(
        &self,
        request: &api::BookingRequest,
    ) -> Result<api::Issued, Error> {
        let response = self
            .http
            .post(self.url("/create-preference"))
            .json(request)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Reports that the checkout page was opened for ticket `id`.
    pub async fn open_checkout(&self, id: &Id) -> Result<api::Ticket, Error> {
        let response = self
            .http
            .post(self.url(&format!("/ticket/{id}/checkout")))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn get_ticket(
        &self,
        id: &Id,
    ) -> Result<Option<api::Ticket>, Error> {
        let response = self
            .http
            .get(self.url(&format!("/ticket/{id}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }

    /// Tickets of `user_id`, newest first, optionally only those in `status`.
    pub async fn list_tickets(
        &self,
        user_id: &str,
        status: Option<Status>,
    ) -> Result<Vec<api::Ticket>, Error> {
        let mut request =
            self.http.get(self.url(&format!("/user/{user_id}/tickets")));
        if let Some(status) = status {
            request = request.query(&[("status", status)]);
        }
        let response = request.send().await?;
        let list: api::ticket::List = check(response).await?.json().await?;
        Ok(list.tickets)
    }

    /// The paid ticket a user boards with, if they hold one.
    pub async fn active_ticket(
        &self,
        user_id: &str,
    ) -> Result<Option<api::Ticket>, Error> {
        let response = self
            .http
            .get(self.url(&format!("/user/{user_id}/ticket")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }

    /// Opens a live view of ticket `id`: its current snapshot first, then one
    /// snapshot per stored change.
    pub async fn subscribe_ticket(
        &self,
        id: &Id,
    ) -> Result<Subscription, Error> {
        let response = self
            .http
            .get(self.url(&format!("/ticket/{id}/events")))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let body = check(response).await?.bytes_stream().boxed();

        let snapshots = stream::unfold(
            (body, Vec::new()),
            |(mut body, mut buffer)| async move {
                loop {
                    if let Some(end) = frame_end(&buffer) {
                        let frame = buffer.drain(..end).collect::<Vec<_>>();
                        match parse_frame(&frame) {
                            Some(snapshot) => {
                                return Some((snapshot, (body, buffer)))
                            }
                            None => continue,
                        }
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            return Some((Err(e.into()), (body, buffer)))
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Subscription {
            snapshots: snapshots.boxed(),
        })
    }

    /// Waits for ticket `id` to reach a terminal status.
    ///
    /// An abandoned checkout leaves the ticket pending, which is reported as
    /// `None` once `timeout` elapses.
    pub async fn await_settlement(
        &self,
        id: &Id,
        timeout: Duration,
    ) -> Result<Option<api::Ticket>, Error> {
        let mut subscription = self.subscribe_ticket(id).await?;
        let settled = async {
            while let Some(ticket) = subscription.next().await {
                let ticket = ticket?;
                if ticket.status.is_terminal() {
                    return Ok(Some(ticket));
                }
            }
            Ok::<_, Error>(None)
        };

        tokio::time::timeout(timeout, settled)
            .await
            .unwrap_or(Ok(None))
    }
}

/// Live ticket snapshots. Dropping it closes the underlying event stream.
pub struct Subscription {
    snapshots: BoxStream<'static, Result<api::Ticket, Error>>,
}

impl Stream for Subscription {
    type Item = Result<api::Ticket, Error>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.snapshots.poll_next_unpin(cx)
    }
}

/// Length of the first complete event in `buffer`, terminator included.
fn frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n").map(|at| at + 2)
}

/// Decodes one event frame. Keep-alives and foreign events yield `None`.
fn parse_frame(frame: &[u8]) -> Option<Result<api::Ticket, Error>> {
    let frame = String::from_utf8_lossy(frame);
    let mut event = None;
    let mut data = Vec::new();
    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim_start());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if event != Some("ticket") || data.is_empty() {
        return None;
    }
    let snapshot = serde_json::from_str::<api::Ticket>(&data.join("\n"));
    Some(snapshot.map_err(Error::MalformedEvent))
}
