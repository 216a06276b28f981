//! Log records: the wire-level [`Record`] and the producer-side [`LogEvent`].

use crate::value::{Attr, Group};
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use std::panic::Location;

/// Severity level. The discriminant is the wire number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Level {
    #[default]
    Unset = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Debug = 4,
}

impl Level {
    /// Canonical upper-case name, as bound to `level` in filter expressions.
    pub fn name(self) -> &'static str {
        match self {
            Level::Unset => "UNSET",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Debug => "DEBUG",
        }
    }

    pub fn from_wire(b: u8) -> Option<Level> {
        match b {
            0 => Some(Level::Unset),
            1 => Some(Level::Info),
            2 => Some(Level::Warn),
            3 => Some(Level::Error),
            4 => Some(Level::Debug),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Rank used for enablement checks: Debug < Info (and Unset) < Warn < Error.
    pub fn severity(self) -> u8 {
        match self {
            Level::Debug => 0,
            Level::Unset | Level::Info => 1,
            Level::Warn => 2,
            Level::Error => 3,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One structured log event as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    /// `None` means no time was recorded.
    pub time: Option<DateTime<Utc>>,
    pub message: String,
    pub level: Level,
    pub attrs: Group,
}

impl Record {
    /// Blank the record while keeping its allocations.
    pub fn reset(&mut self) {
        self.time = None;
        self.message.clear();
        self.level = Level::Unset;
        self.attrs.clear();
    }
}

/// JSON line shape used by the `slp` tool: `time`, `level`, `msg`, then the attributes.
impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.attrs.len() + 2 + usize::from(self.time.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(t) = self.time {
            map.serialize_entry("time", &t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))?;
        }
        map.serialize_entry("level", self.level.name())?;
        map.serialize_entry("msg", &self.message)?;
        let mut keys: Vec<&String> = self.attrs.keys().collect();
        keys.sort();
        for k in keys {
            map.serialize_entry(k, &self.attrs[k])?;
        }
        map.end()
    }
}

/// Source location of a logging call. Its absence marks an event that did not come from a
/// real call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub file: &'static str,
    pub line: u32,
}

impl Origin {
    #[track_caller]
    pub fn caller() -> Self {
        let loc = Location::caller();
        Origin { file: loc.file(), line: loc.line() }
    }
}

/// A log call as seen by a [`Handler`](crate::handler::Handler).
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub time: Option<DateTime<Utc>>,
    pub level: Level,
    pub message: String,
    pub attrs: Vec<Attr>,
    pub origin: Option<Origin>,
}

impl LogEvent {
    /// Event stamped with the current time and the caller's location.
    #[track_caller]
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        LogEvent {
            time: Some(Utc::now()),
            level,
            message: message.into(),
            attrs: Vec::new(),
            origin: Some(Origin::caller()),
        }
    }

    pub fn attr(mut self, attr: Attr) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn attrs(mut self, attrs: impl IntoIterator<Item = Attr>) -> Self {
        self.attrs.extend(attrs);
        self
    }

    pub fn at(mut self, time: Option<DateTime<Utc>>) -> Self {
        self.time = time;
        self
    }

    pub fn origin(mut self, origin: Option<Origin>) -> Self {
        self.origin = origin;
        self
    }
}
