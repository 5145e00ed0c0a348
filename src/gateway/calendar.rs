//! Google Calendar bookings through a service account.
//!
//! The calendar must be shared with the service account's `client_email`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_calendar3 as calendar3;

use calendar3::api::{Event, Scope};
use calendar3::common::GetToken;
use calendar3::hyper_rustls::HttpsConnector;
use calendar3::hyper_util::client::legacy::connect::HttpConnector;

use super::{Attendee, Booking, CalendarGateway};
use crate::error::LabError;

type Hub = calendar3::CalendarHub<HttpsConnector<HttpConnector>>;

pub struct GoogleCalendar {
    calendar_id: String,
    hub: Hub,
}

fn calendar_err(context: &str, e: impl std::fmt::Display) -> LabError {
    LabError::Calendar {
        message: format!("{context}: {e}"),
    }
}

impl GoogleCalendar {
    pub async fn connect(calendar_id: &str, service_account: &Path) -> Result<Self, LabError> {
        let key = calendar3::yup_oauth2::read_service_account_key(service_account)
            .await
            .map_err(|e| {
                calendar_err(
                    &format!("read service account key from {}", service_account.display()),
                    e,
                )
            })?;

        // The authenticator brings its own HTTPS client; the hub gets a separate one.
        let auth = calendar3::yup_oauth2::ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(|e| calendar_err("build service account authenticator", e))?;

        tracing::debug!(calendar_id, "calendar client ready");
        Ok(Self {
            calendar_id: calendar_id.to_string(),
            hub: build_hub(auth)?,
        })
    }
}

fn build_hub<A>(auth: A) -> Result<Hub, LabError>
where
    A: GetToken + 'static,
{
    let connector = calendar3::hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| calendar_err("load native root certs", e))?
        .https_only()
        .enable_http2()
        .build();

    let client = calendar3::hyper_util::client::legacy::Client::builder(
        calendar3::hyper_util::rt::TokioExecutor::new(),
    )
    .build(connector);

    Ok(calendar3::CalendarHub::new(client, auth))
}

#[async_trait]
impl CalendarGateway for GoogleCalendar {
    async fn list_bookings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Booking>, LabError> {
        let mut bookings = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut call = self
                .hub
                .events()
                .list(&self.calendar_id)
                .time_min(start)
                .time_max(end)
                .single_events(true)
                .order_by("startTime")
                .add_scope(Scope::Readonly);
            if let Some(token) = &page_token {
                call = call.page_token(token);
            }

            let (_resp, page) = call
                .doit()
                .await
                .map_err(|e| calendar_err("list events", e))?;

            bookings.extend(page.items.unwrap_or_default().into_iter().map(booking_from_event));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(count = bookings.len(), "fetched calendar entries");
        Ok(bookings)
    }
}

/// All-day events only carry a `date`, so they come back without times.
fn booking_from_event(event: Event) -> Booking {
    let attendees = event
        .attendees
        .unwrap_or_default()
        .into_iter()
        .map(|a| Attendee {
            email: a.email.unwrap_or_default(),
            organizer: a.organizer.unwrap_or(false),
        })
        .collect();

    Booking {
        summary: event.summary.unwrap_or_default(),
        start: event.start.and_then(|s| s.date_time),
        end: event.end.and_then(|e| e.date_time),
        attendees,
    }
}
