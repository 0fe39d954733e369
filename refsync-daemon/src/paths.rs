use std::path::{Path, PathBuf};
use std::time::Duration;

use refsync_core::ConsumerId;

/// How often processing records past retention are pruned.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub fn refsync_root(home: &Path) -> PathBuf {
    home.join(".refsync")
}

pub fn processing_dir(home: &Path) -> PathBuf {
    refsync_root(home).join("processing")
}

/// `<home>/.refsync/processing/<consumer>.json`
pub fn processing_path(home: &Path, consumer: &ConsumerId) -> PathBuf {
    processing_dir(home).join(format!("{}.json", consumer.0))
}
