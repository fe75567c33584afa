//! # Kite Configuration
//!
//! Boot plan loading for the Kite actor runtime: how many workers to spawn,
//! which services to create (and in which dependency order), which controllers
//! to bind to a transport, and how to log.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kite_config::BootPlan;
//!
//! let plan = BootPlan::load(None)?;
//! println!("booting {} workers", plan.threads());
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## File format
//!
//! ```toml
//! threads = 4
//!
//! [[services]]
//! name = "zone"
//!
//! [[services]]
//! name = "spawner"
//! depend_on = "zone"
//!
//! [[controllers]]
//! name = "gate"
//! driver = { kind = "ws", port = 8080 }
//! ```
//!
//! Any key can be overridden from the environment with the `KITE_` prefix,
//! e.g. `KITE_THREADS=8` or `KITE_LOGGING_LEVEL=debug`.

pub mod boot_plan;
pub mod defaults;

// Re-export commonly used types
pub use boot_plan::{
    load_plan, BootPlan, ControllerEntry, DriverOptions, LoggingConfig, PlanError, ServiceEntry,
};
