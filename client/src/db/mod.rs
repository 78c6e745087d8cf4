//! SQLite persistence for records, audit trail, queue, users, and meta.

mod audit;
mod meta;
mod pool;
mod queue;
mod records;
mod users;

pub use audit::*;
pub use meta::*;
pub use pool::*;
pub use queue::*;
pub use records::*;
pub use users::*;
