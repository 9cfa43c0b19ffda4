//! Lifecycle commands and the pure planner.
//!
//! [`plan`] turns a command and the current event snapshot into a [`Plan`]: a
//! description of exactly one store write. Authorization and input validation
//! happen here against the snapshot. Everything that can change between the
//! read and the write (roster size, pending queue, registration flags) is
//! re-checked by the store through the plan's guards, evaluated atomically with
//! the transforms.
//!
//! Each [`Guard`] pairs a store precondition with the error reported when it
//! fails, so a rejected write maps back to a typed [`LifecycleError`].

use crate::budget;
use crate::document::{DocumentUpdate, FieldPath, FieldTransform, Precondition};
use crate::error::LifecycleError;
use crate::model::{Email, Event, EventDraft, EventId, EventPatch, Organizer};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

mod fields {
    pub const EVENT_NAME: &str = "eventName";
    pub const DESCRIPTION: &str = "description";
    pub const THEME: &str = "theme";
    pub const LOCATION: &str = "location";
    pub const DATE: &str = "date";
    pub const IS_ADULT: &str = "isAdult";
    pub const PARTICIPANT_LIMIT: &str = "participantLimit";
    pub const BUDGET: &str = "budget";
    pub const ACCEPTING: &str = "accepting";
    pub const IS_APPROVAL_REQUIRED: &str = "isApprovalRequired";
    pub const ORGANIZER: &str = "organizer";
    pub const PARTICIPANTS: &str = "participants";
    pub const PENDING_PARTICIPANTS: &str = "pendingParticipants";
    pub const ROLES: &str = "roles";
    pub const ROLE_PERCENTAGES: &str = "rolePercentages";
    pub const BUDGET_ALLOCATIONS: &str = "budgetAllocations";
}

/// Path of the organizer's e-mail, the field every authorization check reads
#[must_use]
pub fn organizer_email_path() -> FieldPath {
    FieldPath::new(fields::ORGANIZER).child("email")
}

/// Path of the accepted roster
#[must_use]
pub fn participants_path() -> FieldPath {
    FieldPath::new(fields::PARTICIPANTS)
}

/// Path of the pending-approval queue
#[must_use]
pub fn pending_path() -> FieldPath {
    FieldPath::new(fields::PENDING_PARTICIPANTS)
}

fn role_path(participant: &Email) -> FieldPath {
    FieldPath::new(fields::ROLES).child(participant.as_str())
}

/// Tunable lifecycle rules
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Re-check the participant limit when the organizer accepts a request
    pub enforce_capacity_on_accept: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            enforce_capacity_on_accept: true,
        }
    }
}

/// Every operation that changes an event
#[derive(Clone, Debug, PartialEq)]
pub enum EventCommand {
    /// Persist a new event owned by `organizer`
    Create {
        /// Profile of the creating user
        organizer: Organizer,
        /// Organizer input
        draft: EventDraft,
    },
    /// Replace organizer-editable fields
    Update {
        /// Acting user
        actor: Email,
        /// Fields to replace
        patch: EventPatch,
    },
    /// Remove the event
    Delete {
        /// Acting user
        actor: Email,
    },
    /// Join directly, or request to join when approval is required
    Join {
        /// Joining user
        requester: Email,
    },
    /// Leave the roster and withdraw any pending request
    Leave {
        /// Leaving user
        requester: Email,
    },
    /// Move a pending request onto the roster
    Accept {
        /// Acting user
        actor: Email,
        /// Pending user
        candidate: Email,
    },
    /// Drop a pending request
    Reject {
        /// Acting user
        actor: Email,
        /// Pending user
        candidate: Email,
    },
    /// Remove a participant together with their role
    Kick {
        /// Acting user
        actor: Email,
        /// Removed participant
        participant: Email,
    },
    /// Set (or clear, with `None`) a participant's role
    AssignRole {
        /// Acting user
        actor: Email,
        /// Target participant
        participant: Email,
        /// New role; `None` is the "no role" sentinel
        role: Option<String>,
    },
}

impl EventCommand {
    /// Operation name used in logs, metrics and errors
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Accept { .. } => "accept",
            Self::Reject { .. } => "reject",
            Self::Kick { .. } => "kick",
            Self::AssignRole { .. } => "assign_role",
        }
    }

    /// The user issuing the command
    #[must_use]
    pub const fn actor(&self) -> &Email {
        match self {
            Self::Create { organizer, .. } => &organizer.email,
            Self::Join { requester } | Self::Leave { requester } => requester,
            Self::Update { actor, .. }
            | Self::Delete { actor }
            | Self::Accept { actor, .. }
            | Self::Reject { actor, .. }
            | Self::Kick { actor, .. }
            | Self::AssignRole { actor, .. } => actor,
        }
    }
}

/// What the caller learns when a command succeeds
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Event stored
    Created,
    /// Fields replaced
    Updated,
    /// Event removed
    Deleted,
    /// Requester is on the roster and owes `contribution`
    Joined {
        /// Per-person contribution
        contribution: f64,
    },
    /// Requester waits for the organizer
    AwaitingApproval,
    /// Requester is off the roster and the queue
    Left,
    /// Candidate moved onto the roster
    Accepted,
    /// Candidate dropped from the queue
    Rejected,
    /// Participant removed
    Kicked,
    /// Role set
    RoleAssigned,
}

impl Outcome {
    /// Label for logs and metrics
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Joined { .. } => "joined",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Left => "left",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Kicked => "kicked",
            Self::RoleAssigned => "role_assigned",
        }
    }
}

/// A store precondition and the error it stands for
#[derive(Clone, Debug, PartialEq)]
pub struct Guard {
    /// Evaluated by the store inside the write
    pub precondition: Precondition,
    /// Reported when the precondition does not hold
    pub rejection: LifecycleError,
}

/// One store write, or nothing at all
#[derive(Clone, Debug, PartialEq)]
pub enum Plan {
    /// Create a new event document
    Insert {
        /// Document body
        body: Value,
    },
    /// Conditionally transform the event document
    Transform {
        /// Preconditions and transforms; preconditions mirror `guards`
        update: DocumentUpdate,
        /// Error mapping for the preconditions
        guards: Vec<Guard>,
        /// Result on success
        outcome: Outcome,
    },
    /// Conditionally delete the event document
    Remove {
        /// Preconditions and their error mapping
        guards: Vec<Guard>,
    },
    /// The snapshot already reflects the command; nothing to write
    Noop {
        /// Result reported to the caller
        outcome: Outcome,
    },
}

impl Plan {
    /// Result reported once the plan is applied
    #[must_use]
    pub const fn outcome(&self) -> &Outcome {
        match self {
            Self::Insert { .. } => &Outcome::Created,
            Self::Remove { .. } => &Outcome::Deleted,
            Self::Transform { outcome, .. } | Self::Noop { outcome } => outcome,
        }
    }

    /// Error a failed store precondition stands for
    #[must_use]
    pub fn rejection_for(&self, failed: &Precondition) -> Option<LifecycleError> {
        let guards = match self {
            Self::Transform { guards, .. } | Self::Remove { guards } => guards,
            Self::Insert { .. } | Self::Noop { .. } => return None,
        };
        guards
            .iter()
            .find(|guard| guard.precondition == *failed)
            .map(|guard| guard.rejection.clone())
    }
}

/// Accumulates guards and transforms for one [`Plan::Transform`]
#[derive(Default)]
struct TransformPlan {
    guards: Vec<Guard>,
    transforms: Vec<FieldTransform>,
}

impl TransformPlan {
    fn guard(mut self, precondition: Precondition, rejection: LifecycleError) -> Self {
        self.guards.push(Guard {
            precondition,
            rejection,
        });
        self
    }

    fn apply(mut self, transform: FieldTransform) -> Self {
        self.transforms.push(transform);
        self
    }

    fn organizer_only(self, event: &Event, actor: &Email, operation: &'static str) -> Self {
        self.guard(
            Precondition::FieldEquals {
                path: organizer_email_path(),
                value: email_value(&event.organizer.email),
            },
            LifecycleError::PermissionDenied {
                actor: actor.clone(),
                operation,
            },
        )
    }

    fn capacity(self, event: &Event) -> Self {
        self.guard(
            Precondition::ArrayLenBelow {
                path: participants_path(),
                limit_path: FieldPath::new(fields::PARTICIPANT_LIMIT),
            },
            LifecycleError::CapacityExceeded {
                limit: event.participant_limit,
            },
        )
    }

    fn build(self, outcome: Outcome) -> Plan {
        let preconditions = self.guards.iter().map(|guard| guard.precondition.clone()).collect();
        Plan::Transform {
            update: DocumentUpdate {
                preconditions,
                transforms: self.transforms,
            },
            guards: self.guards,
            outcome,
        }
    }
}

fn email_value(email: &Email) -> Value {
    Value::String(email.as_str().to_string())
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, LifecycleError> {
    serde_json::to_value(value).map_err(|e| LifecycleError::MalformedDocument(e.to_string()))
}

fn set<T: Serialize>(field: &str, value: &T) -> Result<FieldTransform, LifecycleError> {
    Ok(FieldTransform::Set {
        path: FieldPath::new(field),
        value: to_value(value)?,
    })
}

fn union(path: FieldPath, email: &Email) -> FieldTransform {
    FieldTransform::ArrayUnion {
        path,
        values: vec![email_value(email)],
    }
}

fn remove(path: FieldPath, email: &Email) -> FieldTransform {
    FieldTransform::ArrayRemove {
        path,
        values: vec![email_value(email)],
    }
}

fn flag_is(field: &str, value: bool) -> Precondition {
    Precondition::FieldEquals {
        path: FieldPath::new(field),
        value: Value::Bool(value),
    }
}

fn deny(actor: &Email, operation: &'static str) -> LifecycleError {
    LifecycleError::PermissionDenied {
        actor: actor.clone(),
        operation,
    }
}

fn validate_limit(limit: u32) -> Result<(), LifecycleError> {
    if limit == 0 {
        return Err(LifecycleError::Validation(
            "participant limit must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

fn validate_budget(amount: f64) -> Result<(), LifecycleError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(LifecycleError::Validation(format!(
            "budget must be a non-negative number (got {amount})"
        )));
    }
    Ok(())
}

/// Plan one command against the current snapshot
///
/// `current` is ignored for [`EventCommand::Create`] and required otherwise.
///
/// # Errors
///
/// Returns the [`LifecycleError`] the command fails with when the snapshot
/// alone is enough to reject it (wrong actor, invalid input, full roster).
pub fn plan(
    command: EventCommand,
    current: Option<&Event>,
    policy: LifecyclePolicy,
) -> Result<Plan, LifecycleError> {
    match (command, current) {
        (EventCommand::Create { organizer, draft }, _) => plan_create(&organizer, &draft),
        (command, Some(event)) => plan_existing(command, event, policy),
        (_, None) => Err(LifecycleError::event_not_found("<unresolved>")),
    }
}

fn plan_existing(
    command: EventCommand,
    event: &Event,
    policy: LifecyclePolicy,
) -> Result<Plan, LifecycleError> {
    match command {
        EventCommand::Create { organizer, draft } => plan_create(&organizer, &draft),
        EventCommand::Update { actor, patch } => plan_update(event, &actor, &patch),
        EventCommand::Delete { actor } => {
            if !event.is_organizer(&actor) {
                return Err(deny(&actor, "delete"));
            }
            let TransformPlan { guards, .. } =
                TransformPlan::default().organizer_only(event, &actor, "delete");
            Ok(Plan::Remove { guards })
        }
        EventCommand::Join { requester } => plan_join(event, &requester),
        EventCommand::Leave { requester } => Ok(plan_leave(event, &requester)),
        EventCommand::Accept { actor, candidate } => plan_accept(event, &actor, &candidate, policy),
        EventCommand::Reject { actor, candidate } => {
            if !event.is_organizer(&actor) {
                return Err(deny(&actor, "reject"));
            }
            Ok(TransformPlan::default()
                .organizer_only(event, &actor, "reject")
                .apply(remove(pending_path(), &candidate))
                .build(Outcome::Rejected))
        }
        EventCommand::Kick { actor, participant } => {
            if !event.is_organizer(&actor) {
                return Err(deny(&actor, "kick"));
            }
            if event.is_organizer(&participant) {
                return Err(deny(&actor, "kick the organizer"));
            }
            Ok(TransformPlan::default()
                .organizer_only(event, &actor, "kick")
                .apply(remove(participants_path(), &participant))
                .apply(FieldTransform::Delete {
                    path: role_path(&participant),
                })
                .build(Outcome::Kicked))
        }
        EventCommand::AssignRole {
            actor,
            participant,
            role,
        } => plan_assign_role(event, &actor, &participant, role),
    }
}

fn plan_create(organizer: &Organizer, draft: &EventDraft) -> Result<Plan, LifecycleError> {
    if !organizer.email.is_well_formed() {
        return Err(LifecycleError::Validation(format!(
            "organizer e-mail '{}' is malformed",
            organizer.email
        )));
    }
    if draft.event_name.trim().is_empty() {
        return Err(LifecycleError::Validation("event name must not be empty".to_string()));
    }
    validate_limit(draft.participant_limit)?;
    validate_budget(draft.budget)?;
    budget::validate_role_percentages(&draft.role_percentages)?;

    let event = Event {
        id: EventId::default(),
        event_name: draft.event_name.clone(),
        description: draft.description.clone(),
        theme: draft.theme.clone(),
        location: draft.location.clone(),
        date: draft.date,
        is_adult: draft.is_adult,
        participant_limit: draft.participant_limit,
        budget: draft.budget,
        accepting: draft.accepting,
        is_approval_required: draft.is_approval_required,
        organizer: organizer.clone(),
        participants: BTreeSet::new(),
        pending_participants: BTreeSet::new(),
        roles: BTreeMap::new(),
        role_percentages: draft.role_percentages.clone(),
        budget_allocations: draft.budget_allocations(),
    };

    Ok(Plan::Insert { body: to_value(&event)? })
}

fn plan_update(event: &Event, actor: &Email, patch: &EventPatch) -> Result<Plan, LifecycleError> {
    if !event.is_organizer(actor) {
        return Err(deny(actor, "update"));
    }
    if let Some(limit) = patch.participant_limit {
        validate_limit(limit)?;
    }
    if let Some(amount) = patch.budget {
        validate_budget(amount)?;
    }
    if let Some(shares) = &patch.role_percentages {
        budget::validate_role_percentages(shares)?;
    }
    if patch.event_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        return Err(LifecycleError::Validation("event name must not be empty".to_string()));
    }

    let mut plan = TransformPlan::default().organizer_only(event, actor, "update");

    let text_fields = [
        (fields::EVENT_NAME, &patch.event_name),
        (fields::DESCRIPTION, &patch.description),
        (fields::THEME, &patch.theme),
        (fields::LOCATION, &patch.location),
    ];
    for (field, value) in text_fields {
        if let Some(value) = value {
            plan = plan.apply(set(field, value)?);
        }
    }
    if let Some(date) = &patch.date {
        plan = plan.apply(set(fields::DATE, date)?);
    }
    if let Some(flag) = patch.is_adult {
        plan = plan.apply(set(fields::IS_ADULT, &flag)?);
    }
    if let Some(flag) = patch.accepting {
        plan = plan.apply(set(fields::ACCEPTING, &flag)?);
    }
    if let Some(flag) = patch.is_approval_required {
        plan = plan.apply(set(fields::IS_APPROVAL_REQUIRED, &flag)?);
    }
    if let Some(limit) = patch.participant_limit {
        plan = plan.apply(set(fields::PARTICIPANT_LIMIT, &limit)?);
    }
    if let Some(amount) = patch.budget {
        plan = plan.apply(set(fields::BUDGET, &amount)?);
    }
    if let Some(shares) = &patch.role_percentages {
        plan = plan.apply(set(fields::ROLE_PERCENTAGES, shares)?);
    }

    if patch.touches_allocations() {
        // Allocation inputs the patch leaves alone are read from the snapshot;
        // they must still hold when the write lands.
        if patch.budget.is_none() {
            plan = plan.guard(
                Precondition::FieldEquals {
                    path: FieldPath::new(fields::BUDGET),
                    value: to_value(&event.budget)?,
                },
                LifecycleError::Conflict,
            );
        }
        if patch.participant_limit.is_none() {
            plan = plan.guard(
                Precondition::FieldEquals {
                    path: FieldPath::new(fields::PARTICIPANT_LIMIT),
                    value: to_value(&event.participant_limit)?,
                },
                LifecycleError::Conflict,
            );
        }
        if patch.role_percentages.is_none() {
            plan = plan.guard(
                Precondition::FieldEquals {
                    path: FieldPath::new(fields::ROLE_PERCENTAGES),
                    value: to_value(&event.role_percentages)?,
                },
                LifecycleError::Conflict,
            );
        }

        let allocations = budget::allocate(
            patch.budget.unwrap_or(event.budget),
            patch.participant_limit.unwrap_or(event.participant_limit),
            patch.role_percentages.as_deref().unwrap_or(&event.role_percentages),
        );
        plan = plan.apply(set(fields::BUDGET_ALLOCATIONS, &allocations)?);
    }

    Ok(plan.build(Outcome::Updated))
}

fn plan_join(event: &Event, requester: &Email) -> Result<Plan, LifecycleError> {
    if event.is_organizer(requester) {
        return Err(deny(requester, "join their own event"));
    }
    if event.is_participant(requester) {
        return Ok(Plan::Noop {
            outcome: Outcome::Joined {
                contribution: event.contribution_per_person(),
            },
        });
    }
    if event.is_approval_required && event.is_pending(requester) {
        return Ok(Plan::Noop {
            outcome: Outcome::AwaitingApproval,
        });
    }
    if !event.accepting {
        return Err(LifecycleError::RegistrationClosed);
    }

    let plan = TransformPlan::default()
        .guard(flag_is(fields::ACCEPTING, true), LifecycleError::RegistrationClosed);

    if event.is_approval_required {
        return Ok(plan
            .guard(flag_is(fields::IS_APPROVAL_REQUIRED, true), LifecycleError::Conflict)
            .guard(
                Precondition::ArrayExcludes {
                    path: participants_path(),
                    value: email_value(requester),
                },
                LifecycleError::Conflict,
            )
            .apply(union(pending_path(), requester))
            .build(Outcome::AwaitingApproval));
    }

    if event.remaining_capacity() == 0 {
        return Err(LifecycleError::CapacityExceeded {
            limit: event.participant_limit,
        });
    }

    Ok(plan
        .guard(flag_is(fields::IS_APPROVAL_REQUIRED, false), LifecycleError::Conflict)
        .capacity(event)
        .apply(union(participants_path(), requester))
        .apply(remove(pending_path(), requester))
        .build(Outcome::Joined {
            contribution: event.contribution_per_person(),
        }))
}

fn plan_leave(event: &Event, requester: &Email) -> Plan {
    if event.is_organizer(requester) {
        return Plan::Noop { outcome: Outcome::Left };
    }

    TransformPlan::default()
        .apply(remove(participants_path(), requester))
        .apply(remove(pending_path(), requester))
        .apply(FieldTransform::Delete {
            path: role_path(requester),
        })
        .build(Outcome::Left)
}

fn plan_accept(
    event: &Event,
    actor: &Email,
    candidate: &Email,
    policy: LifecyclePolicy,
) -> Result<Plan, LifecycleError> {
    if !event.is_organizer(actor) {
        return Err(deny(actor, "accept"));
    }
    if !event.is_pending(candidate) {
        return Err(LifecycleError::NotPending {
            candidate: candidate.clone(),
        });
    }
    if policy.enforce_capacity_on_accept && event.remaining_capacity() == 0 {
        return Err(LifecycleError::CapacityExceeded {
            limit: event.participant_limit,
        });
    }

    let mut plan = TransformPlan::default().organizer_only(event, actor, "accept").guard(
        Precondition::ArrayContains {
            path: pending_path(),
            value: email_value(candidate),
        },
        LifecycleError::NotPending {
            candidate: candidate.clone(),
        },
    );
    if policy.enforce_capacity_on_accept {
        plan = plan.capacity(event);
    }

    Ok(plan
        .apply(remove(pending_path(), candidate))
        .apply(union(participants_path(), candidate))
        .build(Outcome::Accepted))
}

fn plan_assign_role(
    event: &Event,
    actor: &Email,
    participant: &Email,
    role: Option<String>,
) -> Result<Plan, LifecycleError> {
    if !event.is_organizer(actor) {
        return Err(deny(actor, "assign roles"));
    }
    if !event.is_participant(participant) {
        return Err(LifecycleError::NotAParticipant {
            participant: participant.clone(),
        });
    }

    let role = role.filter(|label| !label.trim().is_empty());

    Ok(TransformPlan::default()
        .organizer_only(event, actor, "assign roles")
        .guard(
            Precondition::ArrayContains {
                path: participants_path(),
                value: email_value(participant),
            },
            LifecycleError::NotAParticipant {
                participant: participant.clone(),
            },
        )
        .apply(FieldTransform::Set {
            path: role_path(participant),
            value: role.map_or(Value::Null, Value::String),
        })
        .build(Outcome::RoleAssigned))
}
