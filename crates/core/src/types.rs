use std::fmt;

use serde::{Deserialize, Serialize};

/// A resolved source locator (URL, data URI or file path).
///
/// Doubles as job identity: results are correlated back to their origin
/// through the locator.
pub type Locator = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identity of an image element inside a document.
///
/// Ids are never reused within one document, so a replacement node always
/// receives a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "el-{}", self.0)
    }
}
