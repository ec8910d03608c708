pub mod comparator;
pub mod engine;
pub mod file_state;
pub mod registry;
pub mod scanner;
pub mod suppressor;
pub mod watcher;

pub use comparator::{ActionKind, ActionSummary, FileComparator, SyncAction};
pub use engine::{FullSyncOutcome, KeyLocks, PartialOutcome, ReconcileEngine, SyncMode};
pub use file_state::{FileKey, FileKind, FileRecord, RecordMap};
pub use registry::{PeerRegistration, PeerRegistry};
pub use scanner::{FileScanner, ScanConfig, ScanResult};
pub use suppressor::{EchoSuppressor, PendingUploads};
pub use watcher::{DirectoryWatcher, WatchEvent};
