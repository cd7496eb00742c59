//! Handle table and the scope stack that bounds handle lifetimes.

use threadbridge_common::constants::handle;

use super::value::{JsObject, Value};
use crate::{Error, Result};

/// A stable integer alias for a value inside one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u32);

impl HandleId {
    /// `undefined`.
    pub const UNDEFINED: HandleId = HandleId(handle::UNDEFINED);
    /// `null`.
    pub const NULL: HandleId = HandleId(handle::NULL);
    /// `false`.
    pub const FALSE: HandleId = HandleId(handle::FALSE);
    /// `true`.
    pub const TRUE: HandleId = HandleId(handle::TRUE);
    /// The global object.
    pub const GLOBAL: HandleId = HandleId(handle::GLOBAL);

    /// The raw id.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Whether the id is one of the reserved constants.
    pub fn is_reserved(self) -> bool {
        self.0 > handle::INVALID && self.0 < handle::MIN_ID
    }
}

/// Array-backed slot table. Slot `i` holds handle id `MIN_ID + i`.
pub(crate) struct HandleStore {
    slots: Vec<Option<Value>>,
    global: JsObject,
}

impl HandleStore {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            global: JsObject::plain(),
        }
    }

    /// Id the next pushed value receives.
    pub(crate) fn next(&self) -> u32 {
        handle::MIN_ID + self.slots.len() as u32
    }

    pub(crate) fn global(&self) -> &JsObject {
        &self.global
    }

    pub(crate) fn push(&mut self, value: Value) -> HandleId {
        match value {
            Value::Undefined => HandleId::UNDEFINED,
            Value::Null => HandleId::NULL,
            Value::Boolean(false) => HandleId::FALSE,
            Value::Boolean(true) => HandleId::TRUE,
            value => {
                let id = self.next();
                self.slots.push(Some(value));
                HandleId(id)
            }
        }
    }

    pub(crate) fn get(&self, id: HandleId) -> Result<Value> {
        match id.0 {
            handle::INVALID => Err(Error::invalid_arg("null handle")),
            handle::UNDEFINED => Ok(Value::Undefined),
            handle::NULL => Ok(Value::Null),
            handle::FALSE => Ok(Value::Boolean(false)),
            handle::TRUE => Ok(Value::Boolean(true)),
            handle::GLOBAL => Ok(Value::Object(self.global().clone())),
            raw => self
                .slots
                .get((raw - handle::MIN_ID) as usize)
                .and_then(|slot| slot.clone())
                .ok_or(Error::DisposedHandle(raw)),
        }
    }

    /// Dispose every slot from `start` on.
    pub(crate) fn truncate(&mut self, start: u32) {
        let keep = start.saturating_sub(handle::MIN_ID) as usize;
        self.slots.truncate(keep);
    }

    pub(crate) fn swap(&mut self, a: u32, b: u32) {
        self.slots
            .swap((a - handle::MIN_ID) as usize, (b - handle::MIN_ID) as usize);
    }
}

/// Identity of an open scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) u32);

#[derive(Debug)]
struct Scope {
    id: ScopeId,
    start: u32,
    end: u32,
    escapable: bool,
    escape_called: bool,
}

/// Stack of open scopes, rooted at a scope that is never closed.
pub(crate) struct ScopeStore {
    stack: Vec<Scope>,
    next_id: u32,
}

const ROOT: ScopeId = ScopeId(0);

impl ScopeStore {
    pub(crate) fn new() -> Self {
        Self {
            stack: vec![Scope {
                id: ROOT,
                start: handle::MIN_ID,
                end: handle::MIN_ID,
                escapable: false,
                escape_called: false,
            }],
            next_id: 1,
        }
    }

    /// Open scopes, excluding the root.
    pub(crate) fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// Record that a value was pushed into the current scope.
    pub(crate) fn track(&mut self, store: &HandleStore) {
        if let Some(top) = self.stack.last_mut() {
            top.end = store.next();
        }
    }

    pub(crate) fn open(&mut self, store: &HandleStore, escapable: bool) -> ScopeId {
        let id = ScopeId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let at = store.next();
        self.stack.push(Scope {
            id,
            start: at,
            end: at,
            escapable,
            escape_called: false,
        });
        id
    }

    /// Close `id` if it is the innermost scope.
    ///
    /// Closing a scope that is no longer open is a no-op. Closing an open
    /// scope that has inner scopes still open is a mismatch.
    pub(crate) fn close(&mut self, store: &mut HandleStore, id: ScopeId) -> Result<()> {
        if id == ROOT {
            return Err(Error::invalid_arg("the root handle scope cannot be closed"));
        }
        match self.stack.iter().rposition(|s| s.id == id) {
            None => Ok(()),
            Some(pos) if pos + 1 != self.stack.len() => Err(Error::HandleScopeMismatch),
            Some(_) => {
                if let Some(scope) = self.stack.pop() {
                    store.truncate(scope.start);
                }
                Ok(())
            }
        }
    }

    /// Promote `handle` from scope `id` into its parent.
    pub(crate) fn escape(
        &mut self,
        store: &mut HandleStore,
        id: ScopeId,
        handle: HandleId,
    ) -> Result<HandleId> {
        let pos = self
            .stack
            .iter()
            .rposition(|s| s.id == id)
            .ok_or_else(|| Error::invalid_arg("handle scope is not open"))?;
        if pos == 0 {
            return Err(Error::invalid_arg("the root handle scope cannot escape"));
        }
        let scope = &mut self.stack[pos];
        if !scope.escapable {
            return Err(Error::invalid_arg("handle scope is not escapable"));
        }
        if scope.escape_called {
            return Err(Error::EscapeCalledTwice);
        }
        scope.escape_called = true;
        if handle.is_reserved() {
            return Ok(handle);
        }
        if handle.0 < scope.start || handle.0 >= scope.end {
            return Err(Error::invalid_arg(format!(
                "handle {} is outside the escaping scope",
                handle.0
            )));
        }
        let slot = scope.start;
        store.swap(handle.0, slot);
        scope.start += 1;
        self.stack[pos - 1].end += 1;
        Ok(HandleId(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(store: &HandleStore, id: HandleId) -> f64 {
        match store.get(id).unwrap() {
            Value::Number(n) => n,
            other => panic!("expected a number, got {other:?}"),
        }
    }

    fn push(store: &mut HandleStore, scopes: &mut ScopeStore, n: f64) -> HandleId {
        let id = store.push(Value::Number(n));
        scopes.track(store);
        id
    }

    #[test]
    fn reserved_constants_never_take_slots() {
        let mut store = HandleStore::new();
        assert_eq!(store.push(Value::Undefined), HandleId::UNDEFINED);
        assert_eq!(store.push(Value::Boolean(true)), HandleId::TRUE);
        assert_eq!(store.next(), handle::MIN_ID);
        assert!(matches!(store.get(HandleId::GLOBAL), Ok(Value::Object(_))));
        assert!(store.get(HandleId(0)).is_err());
    }

    #[test]
    fn closed_scope_handles_are_disposed() {
        let mut store = HandleStore::new();
        let mut scopes = ScopeStore::new();
        let outer = push(&mut store, &mut scopes, 1.0);
        let scope = scopes.open(&store, false);
        let inner = push(&mut store, &mut scopes, 2.0);
        assert_eq!(number(&store, inner), 2.0);
        scopes.close(&mut store, scope).unwrap();
        assert!(matches!(store.get(inner), Err(Error::DisposedHandle(_))));
        assert_eq!(number(&store, outer), 1.0);
        // a second close is a no-op
        scopes.close(&mut store, scope).unwrap();
        assert_eq!(scopes.depth(), 0);
    }

    #[test]
    fn out_of_order_close_is_a_mismatch() {
        let mut store = HandleStore::new();
        let mut scopes = ScopeStore::new();
        let a = scopes.open(&store, false);
        let b = scopes.open(&store, false);
        assert!(matches!(
            scopes.close(&mut store, a),
            Err(Error::HandleScopeMismatch)
        ));
        scopes.close(&mut store, b).unwrap();
        scopes.close(&mut store, a).unwrap();
    }

    #[test]
    fn escape_moves_value_into_parent() {
        let mut store = HandleStore::new();
        let mut scopes = ScopeStore::new();
        let scope = scopes.open(&store, true);
        let _filler = push(&mut store, &mut scopes, 1.0);
        let keep = push(&mut store, &mut scopes, 2.0);
        let escaped = scopes.escape(&mut store, scope, keep).unwrap();
        scopes.close(&mut store, scope).unwrap();
        assert_eq!(number(&store, escaped), 2.0);
    }

    #[test]
    fn second_escape_leaves_parent_untouched() {
        let mut store = HandleStore::new();
        let mut scopes = ScopeStore::new();
        let scope = scopes.open(&store, true);
        let a = push(&mut store, &mut scopes, 1.0);
        let b = push(&mut store, &mut scopes, 2.0);
        scopes.escape(&mut store, scope, a).unwrap();
        let parent_end = scopes.stack[0].end;
        assert!(matches!(
            scopes.escape(&mut store, scope, b),
            Err(Error::EscapeCalledTwice)
        ));
        assert_eq!(scopes.stack[0].end, parent_end);
    }

    #[test]
    fn escape_rejects_foreign_handles() {
        let mut store = HandleStore::new();
        let mut scopes = ScopeStore::new();
        let outside = push(&mut store, &mut scopes, 1.0);
        let scope = scopes.open(&store, true);
        assert!(matches!(
            scopes.escape(&mut store, scope, outside),
            Err(Error::InvalidArg(_))
        ));
        let plain = scopes.open(&store, false);
        assert!(scopes.escape(&mut store, plain, outside).is_err());
    }
}
