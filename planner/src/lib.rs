//! # Party Planner
//!
//! Application wiring: configuration from the environment, backend selection
//! (in-memory or `PostgreSQL`), tracing and metrics setup.
//!
//! ```no_run
//! use party_planner::{init_tracing, Config, PartyPlanner};
//!
//! # async fn example() -> anyhow::Result<()> {
//! dotenvy::dotenv().ok();
//! let config = Config::from_env();
//! init_tracing(&config.observability)?;
//! let app = PartyPlanner::build(&config).await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod mailbox;
pub mod telemetry;

pub use bootstrap::{BootstrapError, PartyPlanner};
pub use config::{Config, StoreBackend};
pub use mailbox::DevMailbox;
pub use telemetry::init_tracing;
