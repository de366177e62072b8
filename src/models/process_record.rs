//! Tracking record for a live kernel subprocess.

/// Marker written into every record file.
pub const KERNEL_MARKER: &str = "kernel";

/// One live kernel subprocess, persisted as a file named after its pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessRecord {
    /// Operating-system process id.
    pub pid: u32,
}

impl ProcessRecord {
    /// Record for `pid`.
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// File name the record is stored under.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.pid.to_string()
    }

    /// Parse a record file name; anything that is not a pid yields `None`.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.parse::<u32>().ok().filter(|pid| *pid > 0).map(Self::new)
    }
}
