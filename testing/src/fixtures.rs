//! Fixtures, invariant assertions and proptest strategies

#![allow(clippy::missing_panics_doc)] // Assertions panic by design

use chrono::NaiveDate;
use party_core::model::{Email, Event, EventDraft, Organizer, RoleShare};
use proptest::prelude::*;

/// Organizer used across tests
#[must_use]
pub fn organizer() -> Organizer {
    Organizer::new("Ana Pop", Email::new("ana@example.com"))
}

/// `guest<n>@example.com`
#[must_use]
pub fn guest(n: usize) -> Email {
    Email::new(format!("guest{n}@example.com"))
}

/// Draft accepting direct joins up to `participant_limit`
#[must_use]
pub fn open_draft(participant_limit: u32) -> EventDraft {
    let mut draft = EventDraft::new("Garden party", party_date(), participant_limit, 20.0);
    draft.description = "Bring snacks".to_string();
    draft.location = "Str. Florilor 3".to_string();
    draft.theme = "Summer".to_string();
    draft
}

/// Draft requiring organizer approval for every join
#[must_use]
pub fn approval_draft(participant_limit: u32) -> EventDraft {
    let mut draft = open_draft(participant_limit);
    draft.is_approval_required = true;
    draft
}

/// Draft with a valid budget split
#[must_use]
pub fn budgeted_draft(participant_limit: u32, shares: &[(&str, f64)]) -> EventDraft {
    let mut draft = open_draft(participant_limit);
    draft.role_percentages = shares
        .iter()
        .map(|(role, percentage)| RoleShare::new(*role, *percentage))
        .collect();
    draft
}

fn party_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 1).unwrap_or_default()
}

/// Assert every structural invariant of an event
///
/// # Panics
///
/// Panics with a description of the first violated invariant.
pub fn assert_event_invariants(event: &Event) {
    assert!(
        event.participants.len() <= event.participant_limit as usize,
        "roster of {} exceeds limit {}",
        event.participants.len(),
        event.participant_limit
    );
    assert!(
        event.participants.is_disjoint(&event.pending_participants),
        "participants and pending overlap: {:?}",
        event
            .participants
            .intersection(&event.pending_participants)
            .collect::<Vec<_>>()
    );
    for holder in event.roles.keys() {
        assert!(
            event.participants.contains(holder),
            "role held by non-participant {holder}"
        );
    }
    assert!(
        !event.participants.contains(&event.organizer.email),
        "organizer is on the roster"
    );
    assert!(
        !event.pending_participants.contains(&event.organizer.email),
        "organizer is pending"
    );
    let percentages: f64 = event.role_percentages.iter().map(|share| share.percentage).sum();
    assert!(percentages <= 100.0 + 1e-9, "role percentages add up to {percentages}");
}

/// Strategy over a small pool of guests, so operations collide often
pub fn guest_strategy(pool: usize) -> impl Strategy<Value = Email> {
    (0..pool).prop_map(guest)
}

/// Strategy over budget splits, valid or not
pub fn role_shares_strategy() -> impl Strategy<Value = Vec<RoleShare>> {
    prop::collection::vec(
        ("[A-Z][a-z]{2,8}", 0.0f64..=80.0)
            .prop_map(|(role, percentage)| RoleShare::new(role, percentage)),
        0..4,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_use_normalized_emails() {
        assert_eq!(guest(3).as_str(), "guest3@example.com");
        assert!(organizer().email.is_well_formed());
        assert!(approval_draft(2).is_approval_required);
    }
}
