//! Phase registry: a directed acyclic graph of named phases.
//!
//! Each phase names the phases it depends on and is bound to an
//! [`Operation`](crate::operation::Operation). The executor walks the graph in
//! topological order, one phase at a time; phases with no dependency
//! relationship run in registration order.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use migrator::dag::PhaseRegistry;
//! use migrator::operation::NoopOperation;
//!
//! # fn example() -> Result<(), migrator::errors::RegistryError> {
//! let mut registry = PhaseRegistry::new();
//! registry.register("init", Vec::<String>::new(), Arc::new(NoopOperation))?;
//! registry.register("infra", ["init"], Arc::new(NoopOperation))?;
//! registry.register("services", ["infra"], Arc::new(NoopOperation))?;
//!
//! let order = registry.execution_order()?;
//! assert_eq!(order[0].name, "init");
//! # Ok(())
//! # }
//! ```

mod definition;
mod registry;

pub use definition::PhaseDefinition;
pub use registry::PhaseRegistry;
