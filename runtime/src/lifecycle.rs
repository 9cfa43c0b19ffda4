//! Event lifecycle service.
//!
//! [`EventLifecycle`] is the imperative shell around [`party_core::command::plan`]:
//! it reads the current event, asks the planner for a [`Plan`] and executes the
//! plan as exactly one store call. A precondition the store rejects is mapped
//! back to the typed error of the guard it belongs to.

use crate::metrics::LifecycleMetrics;
use party_core::command::{plan, EventCommand, LifecyclePolicy, Outcome, Plan};
use party_core::document::{Collection, DocumentId, FieldPath, Query};
use party_core::error::{LifecycleError, Result};
use party_core::model::{Email, Event, EventDraft, EventId, EventPatch, EventView, Organizer};
use party_core::store::{DocumentStore, StoreError};
use std::sync::Arc;
use std::time::Instant;

/// Result of a successful [`EventLifecycle::join`]
#[derive(Clone, Debug, PartialEq)]
pub enum JoinOutcome {
    /// On the roster; every participant is expected to contribute `contribution`
    Joined {
        /// Per-person budget
        contribution: f64,
    },
    /// Waiting for the organizer to accept
    AwaitingApproval,
}

/// What a command left behind
#[derive(Debug)]
struct Applied {
    outcome: Outcome,
    event: Option<Event>,
}

/// Executes lifecycle commands against a [`DocumentStore`].
///
/// Cloning is cheap; clones share the store.
///
/// # Example
///
/// ```no_run
/// use party_runtime::EventLifecycle;
/// use party_core::model::{Email, EventDraft, Organizer};
/// use party_core::store::DocumentStore;
/// use std::sync::Arc;
///
/// # async fn example(store: Arc<dyn DocumentStore>) -> Result<(), party_core::LifecycleError> {
/// let lifecycle = EventLifecycle::new(store);
/// let organizer = Organizer::new("Ana Pop", Email::new("ana@example.com"));
/// let draft = EventDraft::new("Garden party", chrono::NaiveDate::default(), 10, 20.0);
///
/// let id = lifecycle.create(organizer, draft).await?;
/// lifecycle.join(&id, &Email::new("bob@example.com")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventLifecycle {
    store: Arc<dyn DocumentStore>,
    policy: LifecyclePolicy,
}

impl EventLifecycle {
    /// Service with the default policy
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_policy(store, LifecyclePolicy::default())
    }

    /// Service with an explicit policy
    #[must_use]
    pub fn with_policy(store: Arc<dyn DocumentStore>, policy: LifecyclePolicy) -> Self {
        Self { store, policy }
    }

    /// Policy in force
    #[must_use]
    pub const fn policy(&self) -> LifecyclePolicy {
        self.policy
    }

    /// Persist a new event owned by `organizer`
    ///
    /// # Errors
    ///
    /// - `InvalidPercentageSum`: role percentages add up to more than 100
    /// - `Validation`: empty name, zero limit, negative budget
    /// - `StoreUnavailable`: backend failure
    #[tracing::instrument(
        skip_all,
        fields(organizer = %organizer.email, event_name = %draft.event_name)
    )]
    pub async fn create(&self, organizer: Organizer, draft: EventDraft) -> Result<EventId> {
        let started = Instant::now();
        let result = self.insert(organizer, draft).await;
        let outcome = result.as_ref().map(|_| &Outcome::Created);
        LifecycleMetrics::record("create", outcome, started.elapsed());

        if let Ok(id) = &result {
            tracing::info!(event_id = %id, "Event created");
        }
        result
    }

    async fn insert(&self, organizer: Organizer, draft: EventDraft) -> Result<EventId> {
        let command = EventCommand::Create { organizer, draft };
        let Plan::Insert { body } = plan(command, None, self.policy)? else {
            return Err(LifecycleError::Validation("create must insert a document".to_string()));
        };
        let id = self.store.create(Collection::Events, None, body).await?;
        Ok(EventId::from(id))
    }

    /// Replace organizer-editable fields and return the updated event
    ///
    /// Budget allocations are recomputed when the patch touches the budget,
    /// the participant limit or the role percentages. Lowering the limit below
    /// the current roster size is accepted.
    ///
    /// # Errors
    ///
    /// - `NotFound`, `PermissionDenied`, `InvalidPercentageSum`, `Validation`
    /// - `Conflict`: an allocation input changed concurrently
    /// - `StoreUnavailable`: backend failure
    #[tracing::instrument(skip_all, fields(event_id = %id, actor = %actor))]
    pub async fn update(&self, id: &EventId, actor: &Email, patch: EventPatch) -> Result<Event> {
        let command = EventCommand::Update {
            actor: actor.clone(),
            patch,
        };
        let applied = self.execute(id, command).await?;
        self.resolve(id, applied.event).await
    }

    /// Remove the event. Irreversible.
    ///
    /// # Errors
    ///
    /// - `NotFound`, `PermissionDenied`, `StoreUnavailable`
    #[tracing::instrument(skip_all, fields(event_id = %id, actor = %actor))]
    pub async fn delete(&self, id: &EventId, actor: &Email) -> Result<()> {
        self.execute(id, EventCommand::Delete { actor: actor.clone() }).await?;
        tracing::info!("Event deleted");
        Ok(())
    }

    /// Join directly, or queue for approval when the event requires it
    ///
    /// Joining twice is not an error: the current membership is reported.
    ///
    /// # Errors
    ///
    /// - `NotFound`
    /// - `PermissionDenied`: the organizer tried to join
    /// - `RegistrationClosed`: the event is not accepting joins
    /// - `CapacityExceeded`: the roster is full
    /// - `Conflict`: the join flow was switched concurrently
    /// - `StoreUnavailable`: backend failure
    #[tracing::instrument(skip_all, fields(event_id = %id, requester = %requester))]
    pub async fn join(&self, id: &EventId, requester: &Email) -> Result<JoinOutcome> {
        let applied = self
            .execute(
                id,
                EventCommand::Join {
                    requester: requester.clone(),
                },
            )
            .await?;

        match applied.outcome {
            Outcome::Joined { contribution } => {
                tracing::info!(contribution, "Joined; contribute {contribution:.2} per person");
                Ok(JoinOutcome::Joined { contribution })
            }
            Outcome::AwaitingApproval => {
                tracing::info!("Join request awaits organizer approval");
                Ok(JoinOutcome::AwaitingApproval)
            }
            other => Err(LifecycleError::Validation(format!(
                "join produced unexpected outcome '{}'",
                other.label()
            ))),
        }
    }

    /// Leave the roster and withdraw any pending request
    ///
    /// Leaving an event one is not part of is a no-op; so is the organizer
    /// leaving their own event.
    ///
    /// # Errors
    ///
    /// - `NotFound`, `StoreUnavailable`
    #[tracing::instrument(skip_all, fields(event_id = %id, requester = %requester))]
    pub async fn leave(&self, id: &EventId, requester: &Email) -> Result<Event> {
        let applied = self
            .execute(
                id,
                EventCommand::Leave {
                    requester: requester.clone(),
                },
            )
            .await?;
        self.resolve(id, applied.event).await
    }

    /// Move a pending request onto the roster
    ///
    /// # Errors
    ///
    /// - `NotFound`, `PermissionDenied`
    /// - `NotPending`: the candidate has no pending request
    /// - `CapacityExceeded`: the roster is full (when the policy enforces it)
    /// - `StoreUnavailable`: backend failure
    #[tracing::instrument(skip_all, fields(event_id = %id, actor = %actor, candidate = %candidate))]
    pub async fn accept(&self, id: &EventId, actor: &Email, candidate: &Email) -> Result<Event> {
        let command = EventCommand::Accept {
            actor: actor.clone(),
            candidate: candidate.clone(),
        };
        let applied = self.execute(id, command).await?;
        self.resolve(id, applied.event).await
    }

    /// Drop a pending request
    ///
    /// # Errors
    ///
    /// - `NotFound`, `PermissionDenied`, `StoreUnavailable`
    #[tracing::instrument(skip_all, fields(event_id = %id, actor = %actor, candidate = %candidate))]
    pub async fn reject(&self, id: &EventId, actor: &Email, candidate: &Email) -> Result<Event> {
        let command = EventCommand::Reject {
            actor: actor.clone(),
            candidate: candidate.clone(),
        };
        let applied = self.execute(id, command).await?;
        self.resolve(id, applied.event).await
    }

    /// Remove a participant and their role in one write
    ///
    /// # Errors
    ///
    /// - `NotFound`, `StoreUnavailable`
    /// - `PermissionDenied`: not the organizer, or the organizer was targeted
    #[tracing::instrument(
        skip_all,
        fields(event_id = %id, actor = %actor, participant = %participant)
    )]
    pub async fn kick(&self, id: &EventId, actor: &Email, participant: &Email) -> Result<Event> {
        let command = EventCommand::Kick {
            actor: actor.clone(),
            participant: participant.clone(),
        };
        let applied = self.execute(id, command).await?;
        self.resolve(id, applied.event).await
    }

    /// Set a participant's role; `None` (or a blank label) clears it
    ///
    /// # Errors
    ///
    /// - `NotFound`, `PermissionDenied`, `StoreUnavailable`
    /// - `NotAParticipant`: the target is not on the roster
    #[tracing::instrument(
        skip_all,
        fields(event_id = %id, actor = %actor, participant = %participant)
    )]
    pub async fn assign_role(
        &self,
        id: &EventId,
        actor: &Email,
        participant: &Email,
        role: Option<String>,
    ) -> Result<Event> {
        let command = EventCommand::AssignRole {
            actor: actor.clone(),
            participant: participant.clone(),
            role,
        };
        let applied = self.execute(id, command).await?;
        self.resolve(id, applied.event).await
    }

    /// Fetch one event
    ///
    /// # Errors
    ///
    /// - `NotFound`, `MalformedDocument`, `StoreUnavailable`
    pub async fn get(&self, id: &EventId) -> Result<Event> {
        let document = self
            .store
            .get(Collection::Events, DocumentId::from(id))
            .await?
            .ok_or_else(|| LifecycleError::event_not_found(id.as_str()))?;
        Ok(Event::from_document(&document)?)
    }

    /// One event as `viewer` may see it
    ///
    /// # Errors
    ///
    /// - `NotFound`, `MalformedDocument`, `StoreUnavailable`
    pub async fn view(&self, id: &EventId, viewer: &Email) -> Result<EventView> {
        Ok(self.get(id).await?.view_for(viewer))
    }

    /// Every event
    ///
    /// # Errors
    ///
    /// - `MalformedDocument`, `StoreUnavailable`
    pub async fn list(&self) -> Result<Vec<Event>> {
        self.find(Query::collection(Collection::Events)).await
    }

    /// Events organized by `email`
    ///
    /// # Errors
    ///
    /// - `MalformedDocument`, `StoreUnavailable`
    pub async fn organized_by(&self, email: &Email) -> Result<Vec<Event>> {
        let query = Query::collection(Collection::Events)
            .where_eq(FieldPath::new("organizer").child("email"), email.as_str());
        self.find(query).await
    }

    /// Events whose roster contains `email`
    ///
    /// Equality queries cannot express array membership, so the roster is
    /// filtered after fetching.
    ///
    /// # Errors
    ///
    /// - `MalformedDocument`, `StoreUnavailable`
    pub async fn joined_by(&self, email: &Email) -> Result<Vec<Event>> {
        let events = self.list().await?;
        Ok(events.into_iter().filter(|event| event.is_participant(email)).collect())
    }

    async fn find(&self, query: Query) -> Result<Vec<Event>> {
        let documents = self.store.query(query).await?;
        documents
            .iter()
            .map(|document| Event::from_document(document).map_err(LifecycleError::from))
            .collect()
    }

    async fn resolve(&self, id: &EventId, event: Option<Event>) -> Result<Event> {
        match event {
            Some(event) => Ok(event),
            None => self.get(id).await,
        }
    }

    async fn execute(&self, id: &EventId, command: EventCommand) -> Result<Applied> {
        let operation = command.name();
        let started = Instant::now();
        let result = self.apply(id, command).await;
        let outcome = result.as_ref().map(|applied| &applied.outcome);
        LifecycleMetrics::record(operation, outcome, started.elapsed());

        match &result {
            Ok(applied) => {
                tracing::debug!(operation, outcome = applied.outcome.label(), "Command applied");
            }
            Err(error) => {
                tracing::debug!(operation, reason = error.kind(), %error, "Command rejected");
            }
        }
        result
    }

    async fn apply(&self, id: &EventId, command: EventCommand) -> Result<Applied> {
        let current = self.get(id).await?;
        let plan = plan(command, Some(&current), self.policy)?;
        let document_id = DocumentId::from(id);

        match &plan {
            Plan::Noop { outcome } => Ok(Applied {
                outcome: outcome.clone(),
                event: Some(current),
            }),
            Plan::Transform { update, .. } => {
                match self.store.update(Collection::Events, document_id, update.clone()).await {
                    Ok(document) => Ok(Applied {
                        outcome: plan.outcome().clone(),
                        event: Some(Event::from_document(&document)?),
                    }),
                    Err(error) => Err(rejection(id, &plan, error)),
                }
            }
            Plan::Remove { guards } => {
                let preconditions = guards.iter().map(|guard| guard.precondition.clone()).collect();
                match self.store.delete(Collection::Events, document_id, preconditions).await {
                    Ok(()) => Ok(Applied {
                        outcome: Outcome::Deleted,
                        event: None,
                    }),
                    Err(error) => Err(rejection(id, &plan, error)),
                }
            }
            Plan::Insert { .. } => Err(LifecycleError::Validation(
                "an existing event cannot be created again".to_string(),
            )),
        }
    }
}

/// Map a failed store write to the error the caller sees
fn rejection(id: &EventId, plan: &Plan, error: StoreError) -> LifecycleError {
    match error {
        StoreError::PreconditionFailed(failed) => plan
            .rejection_for(&failed)
            .unwrap_or_else(|| LifecycleError::from(StoreError::PreconditionFailed(failed))),
        // Deleted between the read and the write.
        StoreError::NotFound { .. } => LifecycleError::event_not_found(id.as_str()),
        other => LifecycleError::from(other),
    }
}

impl std::fmt::Debug for EventLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLifecycle")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
