pub mod assignment;
pub mod grouping;
pub mod membership;
pub mod oauth_token;
pub mod role;
pub mod rsa_key;
pub mod tenant;
pub mod user;

pub use assignment::Assignment;
pub use grouping::{Grouping, GroupingKind, GroupingUpsert};
pub use membership::{AssignmentMembership, CourseMembership, GroupingMembership, RosterRow};
pub use oauth_token::{EXPIRY_SAFETY_MARGIN_SECS, OAuth2Token};
pub use role::{LtiRole, RoleKind, RoleScope};
pub use rsa_key::RsaKey;
pub use tenant::Tenant;
pub use user::LmsUser;
