//! Domain types for the party planner.
//!
//! Field names serialize in camelCase because they are the document fields the
//! store persists and queries on (`participantLimit`, `pendingParticipants`, ...).

use crate::budget;
use crate::document::{Document, DocumentId};
use crate::store::StoreError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Store-assigned identifier of an event document
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Wrap an identifier handed out by the store
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<EventId> for DocumentId {
    fn from(id: EventId) -> Self {
        Self::new(id.0)
    }
}

impl From<&EventId> for DocumentId {
    fn from(id: &EventId) -> Self {
        Self::new(id.0.clone())
    }
}

impl From<DocumentId> for EventId {
    fn from(id: DocumentId) -> Self {
        Self(id.into_inner())
    }
}

/// Identity-provider identifier of a registered user (also the `users` document id)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an identifier handed out by the identity provider
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&UserId> for DocumentId {
    fn from(id: &UserId) -> Self {
        Self::new(id.0.clone())
    }
}

/// E-mail address, the identity key of organizers and participants
///
/// Addresses are trimmed and lower-cased on construction so that membership
/// checks compare like with like.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Email(String);

impl Email {
    /// Normalize and wrap an address
    #[must_use]
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_lowercase())
    }

    /// Whether the address has the `local@domain` shape
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self.0.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && !domain.is_empty() && !domain.contains('@')
            }
            None => false,
        }
    }

    /// Borrow the normalized address
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Email {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Email> for String {
    fn from(value: Email) -> Self {
        value.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Value objects
// ============================================================================

/// The user who created an event; immutable after creation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organizer {
    /// Display name (`"<first> <last>"`)
    pub name: String,
    /// Identity key used for every organizer-only authorization check
    pub email: Email,
}

impl Organizer {
    /// Creates a new `Organizer`
    #[must_use]
    pub fn new(name: impl Into<String>, email: Email) -> Self {
        Self {
            name: name.into(),
            email,
        }
    }
}

/// Organizer-defined share of the collected budget for one role
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoleShare {
    /// Free-text role label
    pub role: String,
    /// Percentage of the total budget (0..=100)
    pub percentage: f64,
}

impl RoleShare {
    /// Creates a new `RoleShare`
    #[must_use]
    pub fn new(role: impl Into<String>, percentage: f64) -> Self {
        Self {
            role: role.into(),
            percentage,
        }
    }
}

/// Derived monetary share for one role
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAllocation {
    /// Role label copied from the matching [`RoleShare`]
    pub role: String,
    /// Percentage copied from the matching [`RoleShare`]
    pub percentage: f64,
    /// `budget × participantLimit × percentage / 100`, rounded to cents
    pub allocated_budget: f64,
}

/// Self-declared gender collected at registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    /// Male
    Male,
    /// Female
    Female,
    /// Other / undisclosed
    Other,
}

// ============================================================================
// Event
// ============================================================================

/// One party, stored as one document in the `events` collection
///
/// Invariants maintained by the lifecycle:
/// - `participants` and `pending_participants` are disjoint
/// - `participants.len() <= participant_limit`
/// - every key of `roles` is a current participant
/// - the organizer is never in `participants` or `pending_participants`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Document id; not part of the stored body
    #[serde(skip)]
    pub id: EventId,
    /// Event title
    pub event_name: String,
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Optional theme
    #[serde(default)]
    pub theme: String,
    /// Venue, only revealed to participants
    #[serde(default)]
    pub location: String,
    /// Calendar date of the party
    pub date: NaiveDate,
    /// Adults-only flag
    #[serde(default)]
    pub is_adult: bool,
    /// Maximum number of accepted participants
    pub participant_limit: u32,
    /// Contribution per participant
    pub budget: f64,
    /// Whether new join requests are allowed
    #[serde(default)]
    pub accepting: bool,
    /// Selects the approval join flow
    #[serde(default)]
    pub is_approval_required: bool,
    /// Creator and sole authority over the event
    pub organizer: Organizer,
    /// Accepted roster
    #[serde(default)]
    pub participants: BTreeSet<Email>,
    /// Join requests awaiting approval
    #[serde(default)]
    pub pending_participants: BTreeSet<Email>,
    /// Role per participant; `None` is the explicit "no role" sentinel
    #[serde(default)]
    pub roles: BTreeMap<Email, Option<String>>,
    /// Organizer-defined budget split
    #[serde(default)]
    pub role_percentages: Vec<RoleShare>,
    /// Derived from budget, limit and percentages
    #[serde(default)]
    pub budget_allocations: Vec<BudgetAllocation>,
}

impl Event {
    /// Decode an event from a stored document
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the body does not have the event shape.
    pub fn from_document(document: &Document) -> Result<Self, StoreError> {
        let mut event: Self = serde_json::from_value(document.body.clone())
            .map_err(|e| StoreError::Serialization(format!("event {}: {e}", document.id)))?;
        event.id = EventId::new(document.id.as_str());
        Ok(event)
    }

    /// Whether `email` is the organizer
    #[must_use]
    pub fn is_organizer(&self, email: &Email) -> bool {
        self.organizer.email == *email
    }

    /// Whether `email` is on the accepted roster
    #[must_use]
    pub fn is_participant(&self, email: &Email) -> bool {
        self.participants.contains(email)
    }

    /// Whether `email` awaits approval
    #[must_use]
    pub fn is_pending(&self, email: &Email) -> bool {
        self.pending_participants.contains(email)
    }

    /// Seats still free on the roster
    #[must_use]
    pub fn remaining_capacity(&self) -> u32 {
        let taken = u32::try_from(self.participants.len()).unwrap_or(u32::MAX);
        self.participant_limit.saturating_sub(taken)
    }

    /// Amount every participant is expected to contribute
    #[must_use]
    pub const fn contribution_per_person(&self) -> f64 {
        self.budget
    }

    /// Total budget collected when the roster is full
    #[must_use]
    pub fn total_budget(&self) -> f64 {
        budget::total_budget(self.budget, self.participant_limit)
    }

    /// Project the event for one viewer
    ///
    /// Location and organizer contact are only visible to participants and the
    /// organizer.
    #[must_use]
    pub fn view_for(&self, viewer: &Email) -> EventView {
        let is_organizer = self.is_organizer(viewer);
        let has_joined = self.is_participant(viewer);
        let privileged = is_organizer || has_joined;

        EventView {
            id: self.id.clone(),
            event_name: self.event_name.clone(),
            description: self.description.clone(),
            theme: self.theme.clone(),
            date: self.date,
            is_adult: self.is_adult,
            participant_limit: self.participant_limit,
            participant_count: self.participants.len(),
            budget: self.budget,
            accepting: self.accepting,
            is_approval_required: self.is_approval_required,
            location: privileged.then(|| self.location.clone()),
            organizer: privileged.then(|| self.organizer.clone()),
            role: self.roles.get(viewer).cloned().flatten(),
            has_joined,
            is_pending: self.is_pending(viewer),
            is_organizer,
        }
    }
}

/// Viewer-specific projection of an [`Event`]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    /// Event id
    pub id: EventId,
    /// Event title
    pub event_name: String,
    /// Description
    pub description: String,
    /// Theme
    pub theme: String,
    /// Date
    pub date: NaiveDate,
    /// Adults-only flag
    pub is_adult: bool,
    /// Capacity
    pub participant_limit: u32,
    /// Current roster size
    pub participant_count: usize,
    /// Contribution per person
    pub budget: f64,
    /// Accepting join requests
    pub accepting: bool,
    /// Approval flow
    pub is_approval_required: bool,
    /// Venue, `None` unless the viewer participates or organizes
    pub location: Option<String>,
    /// Organizer contact, `None` unless the viewer participates or organizes
    pub organizer: Option<Organizer>,
    /// Role assigned to the viewer
    pub role: Option<String>,
    /// Viewer is on the roster
    pub has_joined: bool,
    /// Viewer awaits approval
    pub is_pending: bool,
    /// Viewer organizes the event
    pub is_organizer: bool,
}

/// Organizer input for a new event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDraft {
    /// Event title
    pub event_name: String,
    /// Description
    pub description: String,
    /// Theme
    pub theme: String,
    /// Venue
    pub location: String,
    /// Date
    pub date: NaiveDate,
    /// Adults-only flag
    pub is_adult: bool,
    /// Capacity
    pub participant_limit: u32,
    /// Contribution per person
    pub budget: f64,
    /// Accept join requests right away
    pub accepting: bool,
    /// Require organizer approval for joins
    pub is_approval_required: bool,
    /// Budget split per role
    pub role_percentages: Vec<RoleShare>,
}

impl EventDraft {
    /// Draft with the mandatory fields set; the event accepts joins directly
    #[must_use]
    pub fn new(
        event_name: impl Into<String>,
        date: NaiveDate,
        participant_limit: u32,
        budget: f64,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            description: String::new(),
            theme: String::new(),
            location: String::new(),
            date,
            is_adult: false,
            participant_limit,
            budget,
            accepting: true,
            is_approval_required: false,
            role_percentages: Vec::new(),
        }
    }

    /// Allocations for the draft as currently filled in
    ///
    /// Presentation layers call this on every change of budget, limit or
    /// percentages to preview the split before submitting.
    #[must_use]
    pub fn budget_allocations(&self) -> Vec<BudgetAllocation> {
        budget::allocate(self.budget, self.participant_limit, &self.role_percentages)
    }
}

/// Partial replacement of organizer-editable event fields
///
/// `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPatch {
    /// New title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    /// New description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New theme
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    /// New venue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// New date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    /// New adults-only flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_adult: Option<bool>,
    /// New capacity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_limit: Option<u32>,
    /// New contribution per person
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    /// Open or close registrations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepting: Option<bool>,
    /// Switch the join flow
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_approval_required: Option<bool>,
    /// New budget split
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_percentages: Option<Vec<RoleShare>>,
}

impl EventPatch {
    /// Whether the patch changes an input of the budget allocation
    #[must_use]
    pub const fn touches_allocations(&self) -> bool {
        self.budget.is_some() || self.participant_limit.is_some() || self.role_percentages.is_some()
    }

    /// Whether the patch changes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ============================================================================
// User
// ============================================================================

/// Profile document stored in the `users` collection at registration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// Birth date as entered
    pub birth_date: NaiveDate,
    /// Gender
    pub gender: Gender,
    /// Identity key
    pub email: Email,
    /// 1 if adult at registration time, 0 otherwise; never recomputed
    pub adult: u8,
}

impl UserProfile {
    /// `"<first> <last>"`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// The profile as the organizer of a new event
    #[must_use]
    pub fn as_organizer(&self) -> Organizer {
        Organizer::new(self.full_name(), self.email.clone())
    }

    /// Whether the stored adult flag is set
    #[must_use]
    pub const fn is_adult(&self) -> bool {
        self.adult == 1
    }
}
