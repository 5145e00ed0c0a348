use chrono::{DateTime, Duration, Utc};

use crate::gateway::Booking;

/// How far either side of "now" the calendar is queried, in minutes.
pub const QUERY_WINDOW_MINUTES: i64 = 5;

/// A booking that is running right now and who booked it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveBooking {
    pub summary: String,
    /// Empty when no address could be found.
    pub email: String,
}

/// The `[start, end]` range to ask the calendar for around `now`.
pub fn query_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let margin = Duration::minutes(QUERY_WINDOW_MINUTES);
    (now - margin, now + margin)
}

/// Keep bookings with `start <= now < end`, in input order.
///
/// Bookings without both instants (all-day entries) are never active.
pub fn filter_active(bookings: &[Booking], now: DateTime<Utc>) -> Vec<ActiveBooking> {
    bookings
        .iter()
        .filter(|b| match (b.start, b.end) {
            (Some(start), Some(end)) => start <= now && now < end,
            _ => false,
        })
        .map(|b| ActiveBooking {
            summary: b.summary.clone(),
            email: contact_email(b),
        })
        .collect()
}

fn contact_email(booking: &Booking) -> String {
    booking
        .attendees
        .iter()
        .find(|a| !a.organizer && !a.email.is_empty())
        .map(|a| a.email.clone())
        .unwrap_or_else(|| extract_email_from_summary(&booking.summary).to_string())
}

/// Pull the address out of a `Name (address)` summary.
///
/// Every `(` restarts the address, the first `)` after one ends it, so nested
/// parentheses yield the innermost text.
pub fn extract_email_from_summary(summary: &str) -> &str {
    let mut start = None;
    for (i, c) in summary.char_indices() {
        match c {
            '(' => start = Some(i + 1),
            ')' => {
                if let Some(s) = start {
                    return &summary[s..i];
                }
            }
            _ => {}
        }
    }
    ""
}
