//! Normalized filesystem change events
//!
//! Every stage of the pipeline works on [`Event`] values. An event carries the
//! path that changed, the set of operations the native layer reported for it and
//! the time it was observed.

use bitflags::bitflags;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

bitflags! {
    /// Set of operations reported for a single path.
    ///
    /// The native notification layer may report several bits at once, so this is
    /// a set rather than a single kind. Bits are kept exactly as reported: on some
    /// platforms a deleted file shows up as `RENAME` rather than `REMOVE`, and no
    /// attempt is made to guess which one was meant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Operation: u8 {
        const CREATE = 1 << 0;
        const WRITE = 1 << 1;
        const REMOVE = 1 << 2;
        const RENAME = 1 << 3;
        const CHMOD = 1 << 4;
    }
}

/// Names in the order used to pick a single name for a multi-bit set
const PRIORITY: [(Operation, &str); 5] = [
    (Operation::CREATE, "create"),
    (Operation::WRITE, "write"),
    (Operation::REMOVE, "remove"),
    (Operation::RENAME, "rename"),
    (Operation::CHMOD, "chmod"),
];

impl Operation {
    pub fn is_create(&self) -> bool {
        self.contains(Operation::CREATE)
    }

    pub fn is_write(&self) -> bool {
        self.contains(Operation::WRITE)
    }

    pub fn is_remove(&self) -> bool {
        self.contains(Operation::REMOVE)
    }

    pub fn is_rename(&self) -> bool {
        self.contains(Operation::RENAME)
    }

    pub fn is_chmod(&self) -> bool {
        self.contains(Operation::CHMOD)
    }

    /// Parse a single operation name, ignoring case and surrounding whitespace
    pub fn parse_name(name: &str) -> Option<Operation> {
        let name = name.trim().to_ascii_lowercase();
        PRIORITY
            .iter()
            .find(|(_, candidate)| *candidate == name)
            .map(|(op, _)| *op)
    }

    /// Parse a comma separated list such as `"create, write"`.
    ///
    /// Unknown names are skipped with a warning so one typo does not disable the
    /// whole list.
    pub fn parse_list(list: &str) -> Operation {
        let mut ops = Operation::empty();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match Operation::parse_name(item) {
                Some(op) => ops |= op,
                None => warn!("Unknown operation name: {}", item),
            }
        }
        ops
    }

    /// Build a set from a list of names, as found in config files
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Operation {
        let joined = names.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
        Operation::parse_list(&joined)
    }

    /// Single lowercase name used on the wire.
    ///
    /// When several bits are set the first one in the order
    /// create, write, remove, rename, chmod wins. The empty set is `"unknown"`.
    pub fn wire_name(&self) -> &'static str {
        PRIORITY
            .iter()
            .find(|(op, _)| self.contains(*op))
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = PRIORITY
            .iter()
            .filter(|(op, _)| self.contains(*op))
            .map(|(_, name)| name.to_ascii_uppercase())
            .collect();
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// A single observed change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    path: PathBuf,
    operation: Operation,
    time: SystemTime,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(path: impl Into<PathBuf>, operation: Operation) -> Self {
        Self::at(path, operation, SystemTime::now())
    }

    /// Create an event with an explicit timestamp
    pub fn at(path: impl Into<PathBuf>, operation: Operation, time: SystemTime) -> Self {
        Self {
            path: path.into(),
            operation,
            time,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn time(&self) -> SystemTime {
        self.time
    }

    /// Milliseconds since the Unix epoch, zero for times before it
    pub fn timestamp_millis(&self) -> i64 {
        self.time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Path rendered with `/` separators
    pub fn path_string(&self) -> String {
        crate::filter::normalize_path(&self.path)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.path.display())
    }
}
