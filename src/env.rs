//! Crate-wide constants and path utilities.
//!
//! Centralizes default intervals and config file locations so the scheduler,
//! its configuration and the binary agree on them.

/// Hidden application directory name
pub const COTASK_DIR_NAME: &str = ".cotask";

/// Configuration file name inside [`COTASK_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "cotask.toml";

/// Default polling interval of an idle scheduler
pub const DEFAULT_IDLE_INTERVAL_MS: u64 = 100;

/// Worker priorities are re-balanced every N-th tick
pub const DEFAULT_PRIORITY_REBALANCE_TICKS: u32 = 10;

/// Running time after which a top-level task's threads are demoted
pub const DEFAULT_LONG_RUNNING_THRESHOLD_SECS: u64 = 60;

/// Epsilon added to the weight sum of subtask progress
pub const DEFAULT_PROGRESS_WEIGHT_EPSILON: f32 = 0.001;

/// Cancellation check period of message-loop threads
pub const DEFAULT_MESSAGE_LOOP_TIMER_MS: u64 = 1;

/// Thread count used when available parallelism cannot be detected
pub const DEFAULT_THREAD_COUNT: usize = 4;

use std::path::{Path, PathBuf};

/// Build the hidden directory path from a root
pub fn cotask_dir_path(root: &Path) -> PathBuf {
    root.join(COTASK_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    cotask_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Config file candidates inside the current directory, most specific first
pub fn local_config_file_paths(current_dir: &Path) -> Vec<PathBuf> {
    vec![
        current_dir.join(LOCAL_CONFIG_FILE_NAME),
        cotask_dir_path(current_dir).join(CONFIG_FILE_NAME),
    ]
}
