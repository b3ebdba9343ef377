//! Distributed store key layout
//!
//! | Purpose        | Key                                               |
//! |----------------|---------------------------------------------------|
//! | data hash      | `<prefix>::<type>:<id>`                           |
//! | routing hash   | `<prefix>::info:<type>` (field `<id>`)            |
//! | expire marker  | `<prefix>::expire::<type>::<id>::<traceId>`       |
//! | marker pointer | `<prefix>::expire-at::<type>::<id>`               |
//! | lock           | `<prefix>::lock::<type>::<id>::<traceId>`         |

use super::kv::INFO_TYPE;

const SEP: &str = "::";

/// Key names under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn data(&self, kind: &str, id: &str) -> String {
        format!("{}{}{}:{}", self.prefix, SEP, kind, id)
    }

    /// Hash holding the routing records of one namespace.
    pub fn routing(&self, kind: &str) -> String {
        format!("{}{}{}:{}", self.prefix, SEP, INFO_TYPE, kind)
    }

    pub fn marker(&self, kind: &str, id: &str, trace_id: &str) -> String {
        format!("{}{}{}{}{}{}", self.marker_prefix(), kind, SEP, id, SEP, trace_id)
    }

    pub fn pointer(&self, kind: &str, id: &str) -> String {
        format!("{}{}expire-at{}{}{}{}", self.prefix, SEP, SEP, kind, SEP, id)
    }

    pub fn lock(&self, kind: &str, id: &str, trace_id: &str) -> String {
        format!(
            "{}{}lock{}{}{}{}{}{}",
            self.prefix, SEP, SEP, kind, SEP, id, SEP, trace_id
        )
    }

    /// Glob matching every key under the prefix.
    pub fn pattern(&self) -> String {
        format!("{}{}*", self.prefix, SEP)
    }

    fn marker_prefix(&self) -> String {
        format!("{}{}expire{}", self.prefix, SEP, SEP)
    }

    /// Split an expire marker into `(type, id, trace_id)`.
    ///
    /// Returns `None` for keys that are not markers of this prefix.
    pub fn parse_marker<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
        let rest = key.strip_prefix(self.marker_prefix().as_str())?;
        let (kind, rest) = rest.split_once(SEP)?;
        let (id, trace_id) = rest.rsplit_once(SEP)?;
        if kind.is_empty() || id.is_empty() || trace_id.is_empty() {
            return None;
        }
        Some((kind, id, trace_id))
    }
}
