//! Write side: a [`Handler`] turns [`LogEvent`]s into frames on a shared sink.
//!
//! Handlers form a lineage. [`Handler::with_attrs`] and [`Handler::with_group`] return a new
//! handler whose state links back to its parent's; links are immutable and shared, so sibling
//! handlers never observe each other's attributes. Every call rebuilds its attribute tree by
//! walking the chain from the root:
//!
//! * a link that opens a group pushes a container; later attributes land in the innermost one,
//! * a group attribute with an empty key is inlined into the enclosing mapping,
//! * a non-group attribute with an empty key is dropped,
//! * containers that end up empty are not attached, even when named.

use crate::codec::{Codec, CodecError, DEFAULT_MAX_DEPTH};
use crate::frame::{self, FrameError};
use crate::pool::{Pool, Reset};
use crate::record::{Level, LogEvent, Record};
use crate::value::{Attr, AttrValue, Group, Value};
use parking_lot::{Mutex, MutexGuard};
use std::io::Write;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Lazy value for {key:?} did not resolve within {} steps", crate::value::MAX_RESOLVE_DEPTH)]
    Unresolved { key: String },
    #[error("Opaque value for {key:?}: {source}")]
    Opaque {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Encode: {0}")]
    Codec(#[from] CodecError),
    #[error("Frame: {0}")]
    Frame(#[from] FrameError),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Lowest level for which [`Handler::enabled`] is true.
    pub min_level: Level,
    /// Idle scratch entries kept for reuse.
    pub pool_capacity: usize,
    pub max_depth: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        HandlerOptions { min_level: Level::Debug, pool_capacity: 64, max_depth: DEFAULT_MAX_DEPTH }
    }
}

#[derive(Default)]
struct Scratch {
    record: Record,
    buf: Vec<u8>,
}

impl Reset for Scratch {
    fn reset(&mut self) {
        self.record.reset();
        self.buf.clear();
    }
}

struct Shared<W> {
    sink: Mutex<W>,
    codec: Codec,
    pool: Pool<Scratch>,
    min_level: Level,
}

/// One link of the lineage.
struct State {
    parent: Option<Arc<State>>,
    group: Option<String>,
    attrs: Vec<Attr>,
}

pub struct Handler<W> {
    shared: Arc<Shared<W>>,
    state: Option<Arc<State>>,
}

impl<W> Clone for Handler<W> {
    fn clone(&self) -> Self {
        Handler { shared: Arc::clone(&self.shared), state: self.state.clone() }
    }
}

impl<W: Write> Handler<W> {
    pub fn new(sink: W) -> Self {
        Self::with_options(sink, HandlerOptions::default())
    }

    pub fn with_options(sink: W, options: HandlerOptions) -> Self {
        Handler {
            shared: Arc::new(Shared {
                sink: Mutex::new(sink),
                codec: Codec::new(options.max_depth),
                pool: Pool::new(options.pool_capacity),
                min_level: options.min_level,
            }),
            state: None,
        }
    }

    /// Encode `event` and write it as one frame.
    ///
    /// An event with neither an origin nor a time is discarded. The whole frame is built before
    /// the sink is touched, so an error never leaves a partial frame behind.
    pub fn handle(&self, event: &LogEvent) -> Result<(), HandlerError> {
        if event.origin.is_none() && event.time.is_none() {
            return Ok(());
        }
        let mut scratch = self.shared.pool.get();
        let Scratch { record, buf } = &mut *scratch;
        self.fill(&event.attrs, &mut record.attrs)?;
        record.time = event.time;
        record.level = event.level;
        record.message.push_str(&event.message);

        let start = frame::begin_frame(buf);
        self.shared.codec.encode_record(record, buf)?;
        frame::finish_frame(buf, start)?;

        self.shared.sink.lock().write_all(buf)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), HandlerError> {
        self.shared.sink.lock().flush()?;
        Ok(())
    }
}

impl<W> Handler<W> {
    /// Derive a handler whose records also carry `attrs`, placed in the innermost open group.
    pub fn with_attrs(&self, attrs: impl IntoIterator<Item = Attr>) -> Self {
        let attrs: Vec<Attr> = attrs.into_iter().collect();
        if attrs.is_empty() {
            return self.clone();
        }
        self.derive(None, attrs)
    }

    /// Derive a handler that nests all later attributes under `name`. An empty name is a no-op.
    pub fn with_group(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        if name.is_empty() {
            return self.clone();
        }
        self.derive(Some(name), Vec::new())
    }

    pub fn enabled(&self, level: Level) -> bool {
        level.severity() >= self.shared.min_level.severity()
    }

    /// The attribute tree a call carrying `call_attrs` would produce.
    pub fn build_attrs(&self, call_attrs: &[Attr]) -> Result<Group, HandlerError> {
        let mut top = Group::new();
        self.fill(call_attrs, &mut top)?;
        Ok(top)
    }

    /// Direct access to the sink, e.g. to inspect an in-memory buffer.
    pub fn lock_sink(&self) -> MutexGuard<'_, W> {
        self.shared.sink.lock()
    }

    fn derive(&self, group: Option<String>, attrs: Vec<Attr>) -> Self {
        Handler {
            shared: Arc::clone(&self.shared),
            state: Some(Arc::new(State { parent: self.state.clone(), group, attrs })),
        }
    }

    fn fill(&self, call_attrs: &[Attr], top: &mut Group) -> Result<(), HandlerError> {
        let mut chain: Vec<&State> = Vec::new();
        let mut link = self.state.as_deref();
        while let Some(s) = link {
            chain.push(s);
            link = s.parent.as_deref();
        }

        let mut open: Vec<(&str, Group)> = Vec::new();
        for s in chain.iter().rev() {
            if let Some(name) = &s.group {
                open.push((name.as_str(), Group::new()));
            }
            let target = match open.last_mut() {
                Some((_, g)) => g,
                None => &mut *top,
            };
            for a in &s.attrs {
                insert_attr(target, a)?;
            }
        }
        let target = match open.last_mut() {
            Some((_, g)) => g,
            None => &mut *top,
        };
        for a in call_attrs {
            insert_attr(target, a)?;
        }

        while let Some((name, g)) = open.pop() {
            if g.is_empty() {
                continue;
            }
            let parent = match open.last_mut() {
                Some((_, p)) => p,
                None => &mut *top,
            };
            parent.insert(name.to_string(), Value::Group(g));
        }
        Ok(())
    }
}

fn insert_attr(target: &mut Group, attr: &Attr) -> Result<(), HandlerError> {
    let resolved = attr
        .value
        .resolve()
        .ok_or_else(|| HandlerError::Unresolved { key: attr.key.clone() })?;
    match resolved.as_ref() {
        AttrValue::Group(children) if attr.key.is_empty() => {
            for c in children {
                insert_attr(target, c)?;
            }
        }
        AttrValue::Group(children) => {
            let mut g = Group::new();
            for c in children {
                insert_attr(&mut g, c)?;
            }
            if !g.is_empty() {
                target.insert(attr.key.clone(), Value::Group(g));
            }
        }
        _ if attr.key.is_empty() => {}
        scalar => {
            target.insert(attr.key.clone(), to_value(&attr.key, scalar)?);
        }
    }
    Ok(())
}

fn to_value(key: &str, v: &AttrValue) -> Result<Value, HandlerError> {
    Ok(match v {
        AttrValue::Empty => Value::Empty,
        AttrValue::Bool(b) => Value::Bool(*b),
        AttrValue::Float(x) => Value::Float(*x),
        AttrValue::Int(x) => Value::Int(*x),
        AttrValue::Uint(x) => Value::Uint(*x),
        AttrValue::String(s) => Value::String(s.clone()),
        AttrValue::Time(t) => Value::Time(*t),
        AttrValue::Duration(d) => Value::Duration(*d),
        AttrValue::Any(o) => Value::Opaque {
            type_tag: o.type_tag(),
            bytes: o
                .to_bytes()
                .map_err(|source| HandlerError::Opaque { key: key.to_string(), source })?,
        },
        // Groups are handled by the caller and lazy values are resolved before this point.
        AttrValue::Group(_) | AttrValue::Lazy(_) => Value::Empty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_is_recycled_after_errors() {
        let h = Handler::with_options(
            Vec::<u8>::new(),
            HandlerOptions { max_depth: 0, ..HandlerOptions::default() },
        );
        let ev = LogEvent::new(Level::Info, "deep").attr(Attr::group("g", [Attr::int("x", 1)]));
        assert!(matches!(h.handle(&ev), Err(HandlerError::Codec(CodecError::TooDeep(0)))));
        assert!(h.lock_sink().is_empty());
        assert_eq!(h.shared.pool.idle(), 1);
    }

    #[test]
    fn chain_links_are_shared_not_copied() {
        let base = Handler::new(Vec::<u8>::new()).with_attrs([Attr::int("a", 1)]);
        let child = base.with_group("g");
        let parent = child.state.as_ref().and_then(|s| s.parent.clone()).expect("parent link");
        assert!(Arc::ptr_eq(&parent, base.state.as_ref().expect("base link")));
    }
}
