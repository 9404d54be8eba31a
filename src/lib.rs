// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stratus Control
//!
//! A multi-cloud infrastructure control plane: it keeps a local inventory of
//! cloud resources in step with what the providers report, and drives
//! create, delete and status-refresh requests through staged, resumable
//! tasks.
//!
//! ## Overview
//!
//! - Reconcile the local inventory of one scope and resource kind against
//!   the provider's listing, classifying every entity as removed, matched or
//!   added
//! - Run multi-stage procedures whose stages wait on remote operations or
//!   child tasks, persisting progress after every transition
//! - Recover tasks abandoned by a crashed or restarted process
//!
//! ## Architecture
//!
//! 1. **Inventory**: [`state::MemoryStore`], made durable by a local or S3
//!    journal guarded by a lease
//! 2. **Providers**: [`provider::ProviderAdapter`] implementations per
//!    provider family
//! 3. **Reconciler**: [`reconciler::ReconciliationEngine`] and its sync
//!    policies
//! 4. **Tasks**: [`tasks::TaskEngine`] and the built-in procedures
//! 5. **Facade**: [`control::ControlPlane`] wires everything together
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`state`]: Inventory, task records and journal backends
//! - [`provider`]: Provider adapters
//! - [`driver`]: Per-provider, per-kind resource rules
//! - [`reconciler`]: Inventory reconciliation and mark-and-sweep convergence
//! - [`tasks`]: Task orchestration
//! - [`audit`]: Change-log and audit events
//! - [`control`]: Control plane facade
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! control_plane:
//!   name: lab
//!
//! state:
//!   backend: local
//!
//! providers:
//!   - name: aws-main
//!     kind: aws
//!     account: "123456789012"
//!     endpoint: https://cloud-gateway.internal/aws
//!     api_key_env: AWS_GATEWAY_TOKEN
//!     regions: [us-east-1, eu-west-1]
//!
//! sync:
//!   kinds: [network, vm, disk]
//!   cascade: [subnet]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod audit;
pub mod cli;
pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod provider;
pub mod reconciler;
pub mod state;
pub mod tasks;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, MarkerHasher, StratusConfig};
pub use control::{ControlPlane, CreateRequest};
pub use error::{ControlPlaneError, Result};
pub use reconciler::{DiffResult, ReconciliationEngine};
pub use state::{Entity, JournalBackend, LocalJournal, MemoryStore, S3Journal, ScopeRef};
pub use tasks::{TaskEngine, TaskRecord};
