//! Runtime defaults
//!
//! Default values shared by the configuration loader, the coordinator and the
//! playground service.

/// Boot plan file used when no path is given
pub const DEFAULT_PLAN_PATH: &str = "kite.toml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "KITE";

/// Transport kind used by controllers whose driver does not name one
pub const DEFAULT_TRANSPORT: &str = "ws";

/// Listen port used when neither the driver nor the descriptor names one
pub const DEFAULT_CONTROLLER_PORT: u16 = 8080;

/// Log filter used when neither the plan nor `RUST_LOG` sets one
pub const DEFAULT_LOG_LEVEL: &str = "info";
