//! Git-backed discovery and synchronization of test metadata

pub mod discovery;
pub mod error;
pub mod git;
pub mod sync;

pub use discovery::{DiscoveredTest, discover_file, module_from_path, parse_staging_list};
pub use error::{MetadataError, MetadataResult};
pub use git::MirrorRepo;
pub use sync::{MetadataSync, ProgressFn, SyncOutcome};
