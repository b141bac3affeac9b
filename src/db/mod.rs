//! Account persistence.
//!
//! Layout:
//! - `models.rs`: documents stored per collection
//! - `store.rs`: the `AccountStore` seam used by the account service
//! - `mongo.rs`: MongoDB implementation
//! - `memory.rs`: in-process implementation for local runs and tests

pub mod memory;
pub mod models;
pub mod mongo;
pub mod store;

pub use memory::MemoryStore;
pub use models::{PasswordChangeOtp, PasswordReset, PendingVerification, Role, UserDoc};
pub use mongo::MongoStore;
pub use store::AccountStore;
