// SPDX-License-Identifier: MIT

//! Core type definitions for torchlite
//!
//! The data model is shared between the online runtime engine and the
//! offline trace analyzer: access kinds, static program locations, value
//! identity tokens and the candidate-race record that both sides exchange
//! through the persisted tables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamps are counted in 100 ns ticks, matching the resolution of the
/// instrumented runtime's high-precision clock.
pub const TICKS_PER_MS: u64 = 10_000;

/// Separator between the owning object id and the field name in a memory id.
pub const OBJECT_ID_SEPARATOR: char = '@';

/// Separator between the caller method and the code offset in a static site.
pub const SITE_SEPARATOR: char = '|';

/// Callee names recognized as mutual-exclusion primitive entry/exit.
pub const LOCK_ENTER_CALLEE: &str = "System.Threading.Monitor::Enter";
pub const LOCK_EXIT_CALLEE: &str = "System.Threading.Monitor::Exit";

/// Callee suffix recognized as a disposal.
pub const DISPOSE_SUFFIX: &str = "::Dispose";

/// Caller fragment identifying a static initializer.
pub const STATIC_INIT_FRAGMENT: &str = "::.cctor";

/// Caller fragment identifying a compiler-generated async continuation.
pub const CONTINUATION_FRAGMENT: &str = "::MoveNext";

/// Identity token of a value observed at an access, assigned by the
/// instrumentation layer. Zero is the null sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u64);

impl ValueId {
    pub const NULL: ValueId = ValueId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for ValueId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(ValueId)
    }
}

/// Identity token of an object owning an instrumented field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Builds the synthetic memory id for a field of an object.
pub fn memory_id(owner: ObjectId, field_name: &str) -> String {
    format!("{}{}{}", owner, OBJECT_ID_SEPARATOR, field_name)
}

/// Strips the owning object id off a memory id, leaving the field name.
pub fn field_name_of(memory_id: &str) -> &str {
    match memory_id.find(OBJECT_ID_SEPARATOR) {
        Some(idx) => &memory_id[idx + 1..],
        None => memory_id,
    }
}

/// Strips the field name off a memory id, leaving the owning object id.
pub fn object_id_of(memory_id: &str) -> &str {
    match memory_id.find(OBJECT_ID_SEPARATOR) {
        Some(idx) => &memory_id[..idx],
        None => memory_id,
    }
}

/// Kinds of observed memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    None,
    Read,
    Write,
    Use,
    Dispose,
    Lock,
}

impl AccessKind {
    pub fn is_read_like(self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::Use)
    }

    pub fn is_write_like(self) -> bool {
        matches!(self, AccessKind::Write | AccessKind::Dispose)
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessKind::None => "None",
            AccessKind::Read => "Read",
            AccessKind::Write => "Write",
            AccessKind::Use => "Use",
            AccessKind::Dispose => "Dispose",
            AccessKind::Lock => "Lock",
        };
        f.write_str(name)
    }
}

impl FromStr for AccessKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(AccessKind::None),
            "Read" => Ok(AccessKind::Read),
            "Write" | "NullToNonNull" | "NonNullToNull" => Ok(AccessKind::Write),
            "Use" => Ok(AccessKind::Use),
            "Dispose" => Ok(AccessKind::Dispose),
            "Lock" => Ok(AccessKind::Lock),
            _ => Err(()),
        }
    }
}

/// Classification of the write half of a candidate race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    /// A construction-like write: null before, non-null after.
    NullToNonNull,
    /// A teardown-like write: non-null before, null after.
    NonNullToNull,
    /// A recognized disposal call on the field value.
    Dispose,
    /// Any other write.
    Other,
    /// Not a write at all.
    NotWrite,
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteType::NullToNonNull => "NullToNonNull",
            WriteType::NonNullToNull => "NonNullToNull",
            WriteType::Dispose => "Dispose",
            WriteType::Other => "Other",
            WriteType::NotWrite => "NotWrite",
        };
        f.write_str(name)
    }
}

impl FromStr for WriteType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NullToNonNull" => Ok(WriteType::NullToNonNull),
            "NonNullToNull" => Ok(WriteType::NonNullToNull),
            "Dispose" => Ok(WriteType::Dispose),
            "Other" => Ok(WriteType::Other),
            "NotWrite" => Ok(WriteType::NotWrite),
            _ => Err(()),
        }
    }
}

/// Classification of the read half of a candidate race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadType {
    /// A plain field load.
    Read,
    /// A method invoked through the field value.
    Use,
}

impl fmt::Display for ReadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadType::Read => "Read",
            ReadType::Use => "Use",
        })
    }
}

impl FromStr for ReadType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Read" => Ok(ReadType::Read),
            "Use" => Ok(ReadType::Use),
            _ => Err(()),
        }
    }
}

/// A static program location: (containing method, code offset within it).
///
/// Races and delay decisions are indexed at this granularity, never at the
/// dynamic instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StaticSite {
    pub caller: String,
    pub offset: u32,
}

impl StaticSite {
    pub fn new(caller: impl Into<String>, offset: u32) -> Self {
        Self {
            caller: caller.into(),
            offset,
        }
    }

    /// Parses `caller|offset`; the offset half must be an integer.
    pub fn parse(loc: &str) -> Option<Self> {
        let idx = loc.rfind(SITE_SEPARATOR)?;
        let offset = loc[idx + 1..].parse().ok()?;
        Some(Self::new(&loc[..idx], offset))
    }
}

impl fmt::Display for StaticSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.caller, SITE_SEPARATOR, self.offset)
    }
}

/// Number of milliseconds spanned by two tick timestamps, rounded up.
pub fn gap_ms(a: u64, b: u64) -> u64 {
    let ticks = a.abs_diff(b);
    ticks.div_ceil(TICKS_PER_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_id_round_trips_field_and_object() {
        let id = memory_id(ObjectId(0xbeef), "Cache::connection");
        assert_eq!(field_name_of(&id), "Cache::connection");
        assert_eq!(object_id_of(&id), "beef");
    }

    #[test]
    fn static_site_parses_with_embedded_separator() {
        let site = StaticSite::parse("Namespace.Type::Method|42").unwrap();
        assert_eq!(site.caller, "Namespace.Type::Method");
        assert_eq!(site.offset, 42);
        assert_eq!(site.to_string(), "Namespace.Type::Method|42");
    }

    #[test]
    fn gap_rounds_up_to_whole_milliseconds() {
        assert_eq!(gap_ms(0, 1), 1);
        assert_eq!(gap_ms(0, TICKS_PER_MS), 1);
        assert_eq!(gap_ms(TICKS_PER_MS + 1, 0), 2);
        assert_eq!(gap_ms(5, 5), 0);
    }

    #[test]
    fn write_type_parses_its_own_display() {
        for wt in [
            WriteType::NullToNonNull,
            WriteType::NonNullToNull,
            WriteType::Dispose,
            WriteType::Other,
            WriteType::NotWrite,
        ] {
            assert_eq!(wt.to_string().parse::<WriteType>(), Ok(wt));
        }
    }
}
