use std::path::{Path, PathBuf};

use crate::core::clock::{Clock, SystemClock};
use crate::core::fs;

pub const DEFAULT_FILE_PAGE_SIZE: usize = 4 * 1024;
pub const DEFAULT_PUBLICATION_UNBLOCK_TIMEOUT_NS: i64 = 15_000_000_000;
pub const DEFAULT_UNTETHERED_WINDOW_LIMIT_TIMEOUT_NS: i64 = 5_000_000_000;
pub const DEFAULT_UNTETHERED_RESTING_TIMEOUT_NS: i64 = 10_000_000_000;

/// Driver configuration threaded through publication construction and every
/// duty-cycle call. Supplies the clock, the free-space probe, timeouts and
/// the flow-control window policy.
pub struct DriverContext {
    dir: PathBuf,
    file_page_size: usize,
    ipc_publication_window_length: usize,
    publication_unblock_timeout_ns: i64,
    untethered_window_limit_timeout_ns: i64,
    untethered_resting_timeout_ns: i64,
    clock: Box<dyn Clock>,
    usable_fs_space: Box<dyn Fn(&Path) -> u64 + Send + Sync>,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("logbus"),
            file_page_size: DEFAULT_FILE_PAGE_SIZE,
            ipc_publication_window_length: 0,
            publication_unblock_timeout_ns: DEFAULT_PUBLICATION_UNBLOCK_TIMEOUT_NS,
            untethered_window_limit_timeout_ns: DEFAULT_UNTETHERED_WINDOW_LIMIT_TIMEOUT_NS,
            untethered_resting_timeout_ns: DEFAULT_UNTETHERED_RESTING_TIMEOUT_NS,
            clock: Box::new(SystemClock::new()),
            usable_fs_space: Box::new(fs::usable_fs_space),
        }
    }
}

impl DriverContext {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::default().with_dir(dir)
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_file_page_size(mut self, page_size: usize) -> Self {
        self.file_page_size = page_size;
        self
    }

    /// Publication window length. Zero derives half the term length.
    pub fn with_publication_window_length(mut self, length: usize) -> Self {
        self.ipc_publication_window_length = length;
        self
    }

    pub fn with_publication_unblock_timeout_ns(mut self, timeout_ns: i64) -> Self {
        self.publication_unblock_timeout_ns = timeout_ns;
        self
    }

    pub fn with_untethered_window_limit_timeout_ns(mut self, timeout_ns: i64) -> Self {
        self.untethered_window_limit_timeout_ns = timeout_ns;
        self
    }

    pub fn with_untethered_resting_timeout_ns(mut self, timeout_ns: i64) -> Self {
        self.untethered_resting_timeout_ns = timeout_ns;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_fs_space_probe(
        mut self,
        probe: impl Fn(&Path) -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.usable_fs_space = Box::new(probe);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_page_size(&self) -> usize {
        self.file_page_size
    }

    pub fn publication_unblock_timeout_ns(&self) -> i64 {
        self.publication_unblock_timeout_ns
    }

    pub fn untethered_window_limit_timeout_ns(&self) -> i64 {
        self.untethered_window_limit_timeout_ns
    }

    pub fn untethered_resting_timeout_ns(&self) -> i64 {
        self.untethered_resting_timeout_ns
    }

    pub fn nano_time(&self) -> i64 {
        self.clock.nano_time()
    }

    pub fn usable_fs_space(&self, dir: &Path) -> u64 {
        (self.usable_fs_space)(dir)
    }

    /// Flow-control window for a publication: the configured length capped at
    /// half the term, or half the term when unconfigured.
    pub fn producer_window_length(&self, term_length: usize) -> i64 {
        let half_term = term_length / 2;
        let window = if self.ipc_publication_window_length == 0 {
            half_term
        } else {
            self.ipc_publication_window_length.min(half_term)
        };
        window as i64
    }
}
