//! Boot Plan Module
//!
//! Describes what the coordinator stands up at start: the worker count, the
//! services (with optional `depend_on` ordering) and the controllers.
//! Loaded from a file with `KITE_`-prefixed environment overrides.

use crate::defaults::{DEFAULT_LOG_LEVEL, DEFAULT_PLAN_PATH, DEFAULT_TRANSPORT, ENV_PREFIX};
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use kite_types::KiteId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Main boot plan structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BootPlan {
    /// Worker count; defaults to available hardware parallelism
    #[serde(default)]
    pub threads: Option<usize>,

    /// Services created in dependency order
    #[serde(default)]
    pub services: Vec<ServiceEntry>,

    /// Controllers created after every service
    #[serde(default)]
    pub controllers: Vec<ControllerEntry>,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A service to create at boot
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServiceEntry {
    pub name: String,

    /// Absent for global singletons
    #[serde(default)]
    pub id: Option<KiteId>,

    /// Name of a service that must be fully started first
    #[serde(default)]
    pub depend_on: Option<String>,

    #[serde(default)]
    pub options: Option<Value>,
}

/// A controller to create and bind to a transport at boot
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ControllerEntry {
    pub name: String,

    #[serde(default)]
    pub id: Option<KiteId>,

    #[serde(default)]
    pub options: Option<Value>,

    #[serde(default)]
    pub driver: Option<DriverOptions>,
}

/// Transport selection for a controller
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DriverOptions {
    /// Registered transport name
    #[serde(default = "default_transport")]
    pub kind: String,

    /// Listen port; falls back to the controller descriptor's default
    #[serde(default)]
    pub port: Option<u16>,

    /// Transport-specific settings
    #[serde(default)]
    pub options: Value,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of the human-readable format
    #[serde(default)]
    pub json: bool,
}

/// Structural problems in a boot plan
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("threads must be at least 1")]
    NoThreads,

    #[error("{kind} entry #{index} has an empty name")]
    EmptyName { kind: &'static str, index: usize },

    #[error("duplicate service {name}({id})")]
    DuplicateService { name: String, id: String },

    #[error("service {name} depends on unknown service {depend_on}")]
    UnknownDependency { name: String, depend_on: String },

    #[error("service {name} depends on {depend_on}, which is declared more than once")]
    AmbiguousDependency { name: String, depend_on: String },

    #[error("service {name} depends on itself")]
    SelfDependency { name: String },
}

fn default_transport() -> String {
    DEFAULT_TRANSPORT.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            kind: default_transport(),
            port: None,
            options: Value::Null,
        }
    }
}

impl BootPlan {
    /// Load a plan file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_PLAN_PATH));
        info!("Loading boot plan: {:?}", path);

        let builder = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("_")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .with_context(|| format!("Failed to build boot plan from {:?}", path))?;

        let plan: BootPlan = config
            .try_deserialize()
            .context("Failed to deserialize boot plan")?;

        plan.validate().context("Invalid boot plan")?;
        Ok(plan)
    }

    /// Parse an in-memory TOML plan (no environment overrides)
    pub fn from_toml(content: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to parse boot plan")?;

        let plan: BootPlan = config
            .try_deserialize()
            .context("Failed to deserialize boot plan")?;

        plan.validate().context("Invalid boot plan")?;
        Ok(plan)
    }

    /// Effective worker count
    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Check the plan's internal consistency.
    ///
    /// Behavior names are checked later against the registry by the
    /// coordinator; dependency cycles are rejected when the coordinator
    /// builds the boot forest.
    pub fn validate(&self) -> std::result::Result<(), PlanError> {
        if self.threads == Some(0) {
            return Err(PlanError::NoThreads);
        }

        let mut seen = HashSet::new();
        let mut declared: HashMap<&str, usize> = HashMap::new();

        for (index, service) in self.services.iter().enumerate() {
            if service.name.trim().is_empty() {
                return Err(PlanError::EmptyName {
                    kind: "service",
                    index,
                });
            }

            if !seen.insert((service.name.as_str(), service.id.clone())) {
                return Err(PlanError::DuplicateService {
                    name: service.name.clone(),
                    id: service
                        .id
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                });
            }

            *declared.entry(service.name.as_str()).or_default() += 1;
        }

        for service in &self.services {
            let Some(depend_on) = &service.depend_on else {
                continue;
            };

            if depend_on == &service.name {
                return Err(PlanError::SelfDependency {
                    name: service.name.clone(),
                });
            }

            match declared.get(depend_on.as_str()) {
                None => {
                    return Err(PlanError::UnknownDependency {
                        name: service.name.clone(),
                        depend_on: depend_on.clone(),
                    })
                }
                Some(count) if *count > 1 => {
                    return Err(PlanError::AmbiguousDependency {
                        name: service.name.clone(),
                        depend_on: depend_on.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        for (index, controller) in self.controllers.iter().enumerate() {
            if controller.name.trim().is_empty() {
                return Err(PlanError::EmptyName {
                    kind: "controller",
                    index,
                });
            }
        }

        debug!(
            services = self.services.len(),
            controllers = self.controllers.len(),
            "Boot plan validated"
        );
        Ok(())
    }
}

/// Convenience function to load the default plan file
pub fn load_plan(path: Option<&Path>) -> Result<BootPlan> {
    BootPlan::load(path)
}
