//! Party Planner Demo
//!
//! Walks through one party end to end:
//! - Organizer registration, e-mail verification and sign-in
//! - Event creation with a role budget split
//! - Approval-gated joins, acceptance and role assignment
//! - A live feed following every change
//!
//! # Usage
//!
//! ```bash
//! # In-memory
//! cargo run --bin demo
//!
//! # Against PostgreSQL
//! STORE_BACKEND=postgres DATABASE_URL=postgres://localhost/party cargo run --bin demo
//! ```

use anyhow::Context;
use chrono::NaiveDate;
use party_core::identity::IdentityError;
use party_core::model::{Email, EventDraft, Gender, RoleShare};
use party_planner::{init_tracing, Config, PartyPlanner};
use party_runtime::{AccountError, JoinOutcome, RegistrationForm};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    init_tracing(&config.observability)?;

    println!("\n🎉 ============================================");
    println!("   Party Planner - Live Demo");
    println!("============================================\n");

    let app = PartyPlanner::build(&config).await?;

    // Restored sessions survive restarts when SESSION_CACHE_PATH is set.
    if let Some(session) = app.accounts.restore_session().await? {
        println!("↩️  Restored session for {}", session.email);
        app.accounts.sign_out().await?;
    }

    // ========== Organizer account ==========

    println!("1️⃣  Registering the organizer...");
    let ana = Email::new("ana@example.com");
    let password = "party-time";
    let registered = app
        .accounts
        .register(RegistrationForm {
            first_name: "Ana".to_string(),
            last_name: "Pop".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1994, 6, 12).context("invalid birth date")?,
            gender: Gender::Female,
            email: ana.clone(),
            password: password.to_string(),
        })
        .await;
    match registered {
        Ok(_) => {
            let token = app
                .pending_verification(&ana)
                .context("no verification e-mail was sent")?;
            app.accounts.verify_email(token).await?;
        }
        Err(AccountError::Identity(IdentityError::EmailAlreadyRegistered(_))) => {
            println!("   {ana} is already registered");
        }
        Err(error) => return Err(error.into()),
    }
    let session = app.accounts.sign_in(&ana, password).await?;
    println!("   ✓ Signed in as {} ({})\n", session.email, session.uid);

    // ========== Event ==========

    println!("2️⃣  Creating the event...");
    let organizer = app.accounts.organizer_profile(&ana).await?;
    let mut draft = EventDraft::new(
        "Garden Party",
        NaiveDate::from_ymd_opt(2025, 7, 19).context("invalid event date")?,
        3,
        25.0,
    );
    draft.location = "12 Linden Street".to_string();
    draft.is_approval_required = true;
    draft.role_percentages = vec![RoleShare::new("Food", 60.0), RoleShare::new("Drinks", 40.0)];
    let event_id = app.lifecycle.create(organizer, draft).await?;

    let mut feed = app.feed.all_events().await?;
    let event = app.lifecycle.get(&event_id).await?;
    for allocation in &event.budget_allocations {
        println!(
            "   {:<8} {:>5.1}%  {:>8.2}",
            allocation.role, allocation.percentage, allocation.allocated_budget
        );
    }
    println!();

    // ========== Guests ==========

    println!("3️⃣  Guests asking to join...");
    let guests: Vec<Email> = [
        "bob@example.com",
        "carol@example.com",
        "dan@example.com",
        "eve@example.com",
    ]
    .into_iter()
    .map(Email::new)
    .collect();
    for guest in &guests {
        let outcome = app.lifecycle.join(&event_id, guest).await?;
        if outcome == JoinOutcome::AwaitingApproval {
            println!("   ⏳ {guest} awaits approval");
        }
    }

    let outsider = app.lifecycle.view(&event_id, &guests[0]).await?;
    println!("   Location visible to pending guest: {}\n", outsider.location.is_some());

    println!("4️⃣  Organizer reviewing requests...");
    for guest in &guests {
        match app.lifecycle.accept(&event_id, &ana, guest).await {
            Ok(event) => {
                println!("   ✓ {guest} accepted ({} seats left)", event.remaining_capacity());
            }
            Err(error) => {
                println!("   ✗ {guest}: {error}");
                app.lifecycle.reject(&event_id, &ana, guest).await?;
            }
        }
    }

    app.lifecycle
        .assign_role(&event_id, &ana, &guests[0], Some("Food".to_string()))
        .await?;
    app.lifecycle.kick(&event_id, &ana, &guests[1]).await?;
    println!("   ✓ {} brings food, {} was removed\n", guests[0], guests[1]);

    // ========== Live feed ==========

    println!("5️⃣  Live feed...");
    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match feed.next().await {
                Some(snapshot)
                    if snapshot.get(&event_id).is_some_and(|event| {
                        event.roles.contains_key(&guests[0]) && !event.is_participant(&guests[1])
                    }) =>
                {
                    return Some(snapshot);
                }
                Some(_) => {}
                None => return None,
            }
        }
    })
    .await
    .context("feed did not catch up")?
    .context("feed closed")?;

    for event in &*snapshot.events {
        println!(
            "   {} on {}: {}/{} joined, {} pending",
            event.event_name,
            event.date,
            event.participants.len(),
            event.participant_limit,
            event.pending_participants.len()
        );
    }

    let mine = app.lifecycle.joined_by(&guests[0]).await?;
    println!("   {} has joined {} event(s)\n", guests[0], mine.len());

    app.accounts.sign_out().await?;
    if let Some(metrics) = app.render_metrics() {
        println!("📈 Metrics:\n{metrics}");
    }
    println!("✓ Demo complete\n");
    Ok(())
}
