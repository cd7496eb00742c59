use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use super::Env;
use super::reference::RefId;
use crate::Result;

/// Native body of a function value.
pub type FunctionBody = Rc<dyn Fn(&Env, &[Value]) -> Result<Value>>;

type DropHook = Box<dyn FnOnce()>;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Native data attached with `Env::wrap`, plus the reference carrying its
/// finalizer.
#[derive(Clone)]
pub(crate) struct Wrapped {
    pub(crate) data: Rc<dyn Any>,
    pub(crate) reference: Option<RefId>,
}

pub(crate) enum ObjectKind {
    Plain,
    Function { name: String, body: FunctionBody },
    External(Box<dyn Any>),
}

pub(crate) struct HeapCell {
    id: u64,
    kind: ObjectKind,
    props: RefCell<BTreeMap<String, Value>>,
    wrapped: RefCell<Option<Wrapped>>,
    drop_hooks: RefCell<Vec<DropHook>>,
}

impl Drop for HeapCell {
    fn drop(&mut self) {
        for hook in self.drop_hooks.get_mut().drain(..) {
            hook();
        }
    }
}

/// The kind of a value, as `typeof` would report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Object,
    Function,
    External,
}

/// A collectable value: plain object, function or external.
///
/// Cloning shares the value. When the last strong holder goes away the value
/// is collected and its drop hooks run, which is how finalizers learn about
/// collection.
#[derive(Clone)]
pub struct JsObject(Rc<HeapCell>);

/// A lookup-only handle to a [`JsObject`] that does not keep it alive.
#[derive(Clone)]
pub struct WeakObject(Weak<HeapCell>);

/// A value held by an environment.
#[derive(Clone)]
pub enum Value {
    /// `undefined`.
    Undefined,
    /// `null`.
    Null,
    /// A boolean.
    Boolean(bool),
    /// A number.
    Number(f64),
    /// An immutable string.
    String(Rc<str>),
    /// A collectable value.
    Object(JsObject),
}

impl JsObject {
    fn with_kind(kind: ObjectKind) -> Self {
        Self(Rc::new(HeapCell {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            props: RefCell::new(BTreeMap::new()),
            wrapped: RefCell::new(None),
            drop_hooks: RefCell::new(Vec::new()),
        }))
    }

    pub(crate) fn plain() -> Self {
        Self::with_kind(ObjectKind::Plain)
    }

    pub(crate) fn function(name: String, body: FunctionBody) -> Self {
        Self::with_kind(ObjectKind::Function { name, body })
    }

    pub(crate) fn external(data: Box<dyn Any>) -> Self {
        Self::with_kind(ObjectKind::External(data))
    }

    /// Process-unique identity of the object.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Whether two handles refer to the same object.
    pub fn same_as(&self, other: &JsObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// `typeof` of the object.
    pub fn value_type(&self) -> ValueType {
        match self.0.kind {
            ObjectKind::Plain => ValueType::Object,
            ObjectKind::Function { .. } => ValueType::Function,
            ObjectKind::External(_) => ValueType::External,
        }
    }

    /// Function name and body, if this is a function.
    pub(crate) fn function_body(&self) -> Option<(&str, FunctionBody)> {
        match &self.0.kind {
            ObjectKind::Function { name, body } => Some((name.as_str(), body.clone())),
            _ => None,
        }
    }

    /// The data of an external value.
    pub fn external_data<T: 'static>(&self) -> Option<&T> {
        match &self.0.kind {
            ObjectKind::External(data) => data.downcast_ref(),
            _ => None,
        }
    }

    /// Read a property.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.props.borrow().get(name).cloned()
    }

    /// Write a property, returning the previous value.
    pub fn set(&self, name: &str, value: Value) -> Option<Value> {
        self.0.props.borrow_mut().insert(name.to_string(), value)
    }

    pub(crate) fn wrapped(&self) -> Option<Wrapped> {
        self.0.wrapped.borrow().clone()
    }

    pub(crate) fn set_wrapped(&self, wrapped: Option<Wrapped>) -> Option<Wrapped> {
        std::mem::replace(&mut *self.0.wrapped.borrow_mut(), wrapped)
    }

    /// Run `hook` when the object is collected.
    pub(crate) fn on_drop(&self, hook: impl FnOnce() + 'static) {
        self.0.drop_hooks.borrow_mut().push(Box::new(hook));
    }

    /// A weak handle to this object.
    pub fn downgrade(&self) -> WeakObject {
        WeakObject(Rc::downgrade(&self.0))
    }
}

impl WeakObject {
    /// The object, if it has not been collected.
    pub fn upgrade(&self) -> Option<JsObject> {
        self.0.upgrade().map(JsObject)
    }

    /// Whether the object has been collected.
    pub fn is_collected(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl Value {
    /// `typeof` of the value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Undefined => ValueType::Undefined,
            Value::Null => ValueType::Null,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Object(o) => o.value_type(),
        }
    }

    /// A string value.
    pub fn string(s: &str) -> Self {
        Value::String(Rc::from(s))
    }

    /// The object, if this is a collectable value.
    pub fn as_object(&self) -> Option<&JsObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Whether the value can be held without keeping it alive.
    pub fn can_be_held_weakly(&self) -> bool {
        matches!(self, Value::Object(_))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Object(o) => write!(f, "[{:?} #{}]", o.value_type(), o.id()),
        }
    }
}

impl fmt::Debug for JsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?} #{}]", self.value_type(), self.id())
    }
}

impl fmt::Debug for WeakObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(o) => write!(f, "Weak({o:?})"),
            None => f.write_str("Weak(<collected>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn drop_hooks_run_once_on_collection() {
        let hits = Rc::new(Cell::new(0));
        let obj = JsObject::plain();
        let weak = obj.downgrade();
        let counter = hits.clone();
        obj.on_drop(move || counter.set(counter.get() + 1));
        let alias = obj.clone();
        drop(obj);
        assert_eq!(hits.get(), 0);
        assert!(!weak.is_collected());
        drop(alias);
        assert_eq!(hits.get(), 1);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn externals_expose_typed_data() {
        let ext = JsObject::external(Box::new(41u32));
        assert_eq!(ext.value_type(), ValueType::External);
        assert_eq!(ext.external_data::<u32>(), Some(&41));
        assert_eq!(ext.external_data::<i64>(), None);
    }

    #[test]
    fn only_objects_are_weakly_holdable() {
        assert!(!Value::Number(1.0).can_be_held_weakly());
        assert!(Value::Object(JsObject::plain()).can_be_held_weakly());
    }
}
