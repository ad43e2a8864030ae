//! Instance records.
//!
//! Layout of one instance:
//! - `<root>/instances/<name>.ini` - the record, single source of truth for
//!   version and working directory
//! - `<working_dir>/{install,backups,saves,temp,logs,config}` - derived dirs

mod store;
mod types;

pub use store::{generate_name, CreateOptions, InstanceStore};
pub use types::{Instance, InstanceStatus, LifecycleManager, DERIVED_DIRS};
