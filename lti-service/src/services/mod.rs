//! Services layer for the LTI tool provider.
//!
//! Leaves first: crypto and identity primitives, then the payload model and
//! verification, then the stateful services that own database writes.

pub mod advantage;
pub mod assignment;
pub mod database;
pub mod error;
pub mod grading;
pub mod grouping;
pub mod identity;
pub mod keys;
pub mod launch;
pub mod membership;
pub mod oauth1;
pub mod oauth2;
pub mod payload;
pub mod plugin;
pub mod roles;
pub mod roster;
pub mod verification;

pub use advantage::AdvantageService;
pub use assignment::AssignmentService;
pub use database::Database;
pub use error::ServiceError;
pub use grading::{GradeSubmission, GradingService};
pub use grouping::GroupingService;
pub use launch::{LaunchOutcome, LaunchService};
pub use membership::MembershipService;
pub use oauth2::{OAuth2Service, TokenOutcome};
pub use payload::{LaunchPayload, LtiVersion};
pub use plugin::{PluginRegistry, ProductPlugin};
pub use roles::RoleService;
pub use roster::RosterService;
pub use verification::VerificationService;
