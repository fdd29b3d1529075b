//! This module defines the core data types shared by both evaluation engines.
//! The main enum, [`Value`], covers literal data (numbers, strings, lists,
//! keyword maps), evaluable expressions ([`Symbol`]s, [`CallNode`]s and quoted
//! values), callables ([`Function`]s tagged plain or macro), and the
//! stack-engine types ([`Combinator`], [`Def`], [`Stack`]). Ergonomic helpers
//! such as [`val`], [`sym`], [`nil`] and [`call`] are provided for building
//! expression trees in code and tests, and conversion traits are implemented
//! for common Rust types.

use crate::Error;
use crate::combinator::{Combinator, Def};
use crate::evaluator::intooperation::{
    IntoOperation, IntoVariadicOperation, MacroFn, OperationFn,
};
use crate::evaluator::{Arity, Environment};
use crate::stack::Stack;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

/// Type alias for number values
pub(crate) type NumberType = i64;

//
// Symbols
//

/// Interned symbol names. One allocation exists per distinct name, so every
/// symbol built with [`Symbol::new`] shares it. Entries are never removed;
/// gensyms stay out of the table.
static SYMBOL_TABLE: LazyLock<Mutex<HashSet<Arc<str>>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

static GENSYM_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A named, unresolved reference, looked up in an [`Environment`] only when
/// evaluated. Two symbols with the same name are interchangeable.
#[derive(Clone)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        let mut table = SYMBOL_TABLE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = table.get(name) {
            return Symbol(Arc::clone(existing));
        }
        let interned: Arc<str> = Arc::from(name);
        table.insert(Arc::clone(&interned));
        Symbol(interned)
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Check if two symbols share the same interned name
    #[cfg_attr(not(test), expect(dead_code))]
    pub(crate) fn same_allocation(&self, other: &Symbol) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl std::borrow::Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a fresh symbol that cannot collide with ordinary names.
///
/// Gensyms have the form `#:{prefix}${n}`; the counter is process-wide, so a
/// gensym is unique per process but must not be relied upon across processes.
/// Macros use them to introduce temporary bindings.
///
/// Gensyms are not interned: each owns its name, which is freed with the
/// last copy of the symbol.
pub fn gensym(prefix: &str) -> Symbol {
    let n = GENSYM_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    Symbol(Arc::from(format!("#:{prefix}${n}")))
}

//
// Keyword maps
//

/// Insertion-ordered mapping from names to values with unique keys.
///
/// Used for the named sub-values of a call node, for keyword arguments passed
/// to callables, and as the keyword layer of a stack.
#[derive(Clone, Default)]
pub struct Keywords {
    entries: Vec<(String, Value)>,
}

impl Keywords {
    pub fn new() -> Self {
        Keywords {
            entries: Vec::new(),
        }
    }

    /// Insert a binding, returning the previous value for this name if any.
    /// Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        let name = name.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Keywords {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut keywords = Keywords::new();
        for (k, v) in iter {
            keywords.insert(k, v);
        }
        keywords
    }
}

impl IntoIterator for Keywords {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

// Equality ignores insertion order, as for any mapping
impl PartialEq for Keywords {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|ov| ov == v))
    }
}

impl fmt::Debug for Keywords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl fmt::Display for Keywords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        write!(f, "}}")
    }
}

//
// Call nodes
//

/// An immutable, lazily evaluated function call.
///
/// The target may be a callable value or any expression that evaluates to
/// one. Positional and named sub-values may be literals, symbols or nested
/// call nodes. A node never changes once wrapped into a [`Value`]; the
/// builder methods consume and return an unpublished node.
#[derive(Clone, PartialEq)]
pub struct CallNode {
    target: Value,
    positional: Vec<Value>,
    named: Keywords,
}

impl CallNode {
    pub fn new(target: impl Into<Value>) -> Self {
        CallNode {
            target: target.into(),
            positional: Vec::new(),
            named: Keywords::new(),
        }
    }

    /// Append a positional sub-value
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Append several positional sub-values
    pub fn args<I, T>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        self.positional.extend(values.into_iter().map(Into::into));
        self
    }

    /// Add a named sub-value
    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name, value.into());
        self
    }

    pub fn target(&self) -> &Value {
        &self.target
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn named_args(&self) -> &Keywords {
        &self.named
    }

    /// Build a new node with the same arguments and a different target
    pub fn with_target(&self, target: impl Into<Value>) -> CallNode {
        CallNode {
            target: target.into(),
            positional: self.positional.clone(),
            named: self.named.clone(),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Call(Arc::new(self))
    }
}

impl fmt::Debug for CallNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallNode({:?}", self.target)?;
        for arg in &self.positional {
            write!(f, ", {arg:?}")?;
        }
        for (k, v) in self.named.iter() {
            write!(f, ", {k}={v:?}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for CallNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.target)?;
        let mut first = true;
        for arg in &self.positional {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{arg}")?;
        }
        for (k, v) in self.named.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{k}={v}")?;
        }
        write!(f, ")")
    }
}

//
// Callables
//

/// How a [`Function`] receives its arguments. Decided once at construction.
#[derive(Clone)]
pub enum FunctionKind {
    /// Receives fully evaluated positional and keyword arguments
    Plain(Arc<OperationFn>),
    /// Receives the raw sub-values of the call node plus the environment
    Macro(Arc<MacroFn>),
}

/// A named callable usable as a call-node target or from stack programs.
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    kind: FunctionKind,
}

impl Function {
    /// Wrap a function over evaluated positional and keyword arguments
    pub fn plain<F>(name: &str, func: F) -> Self
    where
        F: Fn(Vec<Value>, Keywords) -> Result<Value, Error> + Send + Sync + 'static,
    {
        Function {
            name: Arc::from(name),
            kind: FunctionKind::Plain(Arc::new(func)),
        }
    }

    /// Tag a function as a macro: it is handed the unevaluated sub-values of
    /// the call node together with the environment, and its result is
    /// evaluated once more by the evaluator.
    pub fn macro_fn<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[Value], &Keywords, &mut Environment) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        Function {
            name: Arc::from(name),
            kind: FunctionKind::Macro(Arc::new(func)),
        }
    }

    /// Wrap an already erased callable, sharing it rather than re-boxing
    pub fn from_kind(name: &str, kind: FunctionKind) -> Self {
        Function {
            name: Arc::from(name),
            kind,
        }
    }

    /// Wrap a strongly-typed Rust function or closure with automatic
    /// argument extraction, result conversion and arity checking.
    ///
    /// ```
    /// use expressive::ast::{Function, val};
    ///
    /// let upper = Function::from_typed::<_, (&str,)>("upper", |s: &str| s.to_uppercase());
    /// assert_eq!(upper.call(vec![val("hi")], Default::default()).unwrap(), val("HI"));
    /// ```
    pub fn from_typed<F, Args>(name: &str, func: F) -> Self
    where
        F: IntoOperation<Args>,
    {
        Function {
            name: Arc::from(name),
            kind: FunctionKind::Plain(func.into_operation()),
        }
    }

    /// Wrap a typed Rust function whose last parameter is a rest iterator,
    /// checking the total argument count against `arity`
    pub fn variadic<F, Args>(name: &str, arity: Arity, func: F) -> Self
    where
        F: IntoVariadicOperation<Args>,
    {
        let inner = func.into_variadic_operation();
        Function::plain(name, move |args, kwargs| {
            arity.validate(args.len())?;
            inner(args, kwargs)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    pub fn is_macro(&self) -> bool {
        matches!(self.kind, FunctionKind::Macro(_))
    }

    /// Apply a plain function to already evaluated arguments.
    /// Macros cannot be applied this way.
    pub fn call(&self, args: Vec<Value>, kwargs: Keywords) -> Result<Value, Error> {
        match &self.kind {
            FunctionKind::Plain(func) => func(args, kwargs),
            FunctionKind::Macro(_) => Err(Error::NotCallable(format!(
                "macro {} cannot be applied to evaluated arguments",
                self.name
            ))),
        }
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        // Compare by name and identity of the underlying callable
        self.name == other.name
            && match (&self.kind, &other.kind) {
                (FunctionKind::Plain(a), FunctionKind::Plain(b)) => Arc::ptr_eq(a, b),
                (FunctionKind::Macro(a), FunctionKind::Macro(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FunctionKind::Plain(_) => write!(f, "Function({})", self.name),
            FunctionKind::Macro(_) => write!(f, "Macro({})", self.name),
        }
    }
}

//
// Values
//

/// Core value type shared by the call-tree evaluator and the stack engine.
///
/// To build expressions, use the helper functions:
/// - `val(42)` for values, `sym("name")` for symbols, `nil()` for the empty value
/// - `call(f, [val(1), sym("x")])` for call nodes
/// - `val([1, 2, 3])` for homogeneous lists
#[derive(Clone)]
pub enum Value {
    /// The empty value; returned by procedures run for their side effects
    Nil,
    Bool(bool),
    /// Numbers (integers only)
    Number(NumberType),
    String(String),
    /// Ordered sequences; also quoted stack programs
    List(Vec<Value>),
    /// Keyword mappings
    Map(Keywords),
    /// Unresolved names, looked up at evaluation time
    Symbol(Symbol),
    /// Lazily evaluated function calls
    Call(Arc<CallNode>),
    /// Evaluates to the wrapped value without evaluating it
    Quote(Box<Value>),
    /// Plain functions and macros
    Function(Function),
    /// Stack transformers; applied when folded, carried as data elsewhere
    Combinator(Combinator),
    /// Callable combinator programs
    Def(Def),
    Stack(Stack),
}

impl Value {
    /// Symbols, call nodes and quotes are evaluable; everything else is a
    /// self-evaluating literal
    pub fn is_evaluable(&self) -> bool {
        matches!(self, Value::Symbol(_) | Value::Call(_) | Value::Quote(_))
    }

    /// Truthiness used by the conditional macros and combinators: nil,
    /// `false`, zero and empty strings, lists and maps are false
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Stack(stack) => !stack.is_empty(),
            _ => true,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Symbol(_) => "symbol",
            Value::Call(_) => "call",
            Value::Quote(_) => "quote",
            Value::Function(f) if f.is_macro() => "macro",
            Value::Function(_) => "function",
            Value::Combinator(_) => "combinator",
            Value::Def(_) => "def",
            Value::Stack(_) => "stack",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String(\"{s}\")"),
            Value::List(list) => {
                write!(f, "List(")?;
                for (i, v) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v:?}")?;
                }
                write!(f, ")")
            }
            Value::Map(map) => write!(f, "Map({map:?})"),
            Value::Symbol(s) => write!(f, "Symbol({s})"),
            Value::Call(node) => write!(f, "{node:?}"),
            Value::Quote(inner) => write!(f, "Quote({inner:?})"),
            Value::Function(func) => write!(f, "{func:?}"),
            Value::Combinator(c) => write!(f, "Combinator({c})"),
            Value::Def(def) => write!(f, "{def}"),
            Value::Stack(stack) => write!(f, "{stack}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\r' => write!(f, "\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Value::List(elements) => {
                write!(f, "[")?;
                for (i, elem) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => write!(f, "{map}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Call(node) => write!(f, "{node}"),
            Value::Quote(inner) => write!(f, "'{inner}"),
            Value::Function(func) => write!(f, "{}", func.name()),
            Value::Combinator(c) => write!(f, "{c}"),
            Value::Def(def) => write!(f, "{def}"),
            Value::Stack(stack) => write!(f, "{stack}"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Call(a), Value::Call(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Quote(a), Value::Quote(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Combinator(a), Value::Combinator(b)) => a == b,
            (Value::Def(a), Value::Def(b)) => a == b,
            (Value::Stack(a), Value::Stack(b)) => a == b,
            _ => false, // Different variants are never equal
        }
    }
}

// From trait implementations for Value - enables .into() conversion
impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Number(n as i64)
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(NumberType); // Special case - no casting
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl From<Symbol> for Value {
    fn from(s: Symbol) -> Self {
        Value::Symbol(s)
    }
}

impl From<CallNode> for Value {
    fn from(node: CallNode) -> Self {
        node.into_value()
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Keywords> for Value {
    fn from(k: Keywords) -> Self {
        Value::Map(k)
    }
}

impl From<Combinator> for Value {
    fn from(c: Combinator) -> Self {
        Value::Combinator(c)
    }
}

impl From<Def> for Value {
    fn from(d: Def) -> Self {
        Value::Def(d)
    }
}

impl From<Stack> for Value {
    fn from(s: Stack) -> Self {
        Value::Stack(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(|x| x.into()).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::List(arr.into_iter().map(|x| x.into()).collect())
    }
}

impl<T: Into<Value> + Clone> From<&[T]> for Value {
    fn from(slice: &[T]) -> Self {
        Value::List(slice.iter().cloned().map(|x| x.into()).collect())
    }
}

// Fallible conversions from `Value` back into primitive Rust types.

impl std::convert::TryInto<NumberType> for Value {
    type Error = Error;

    fn try_into(self) -> Result<NumberType, Error> {
        if let Value::Number(n) = self {
            Ok(n)
        } else {
            Err(Error::TypeError(format!(
                "expected number, got {}",
                self.type_name()
            )))
        }
    }
}

impl std::convert::TryInto<bool> for Value {
    type Error = Error;

    fn try_into(self) -> Result<bool, Error> {
        if let Value::Bool(b) = self {
            Ok(b)
        } else {
            Err(Error::TypeError(format!(
                "expected boolean, got {}",
                self.type_name()
            )))
        }
    }
}

impl std::convert::TryInto<String> for Value {
    type Error = Error;

    fn try_into(self) -> Result<String, Error> {
        if let Value::String(s) = self {
            Ok(s)
        } else {
            Err(Error::TypeError(format!(
                "expected string, got {}",
                self.type_name()
            )))
        }
    }
}

/// Helper function for creating symbols - works great in mixed lists!
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::Symbol(Symbol::new(name.as_ref()))
}

/// Helper function for creating Values - works great in mixed lists!
/// Accepts any type that can be converted to Value
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// Helper function for the empty value
pub fn nil() -> Value {
    Value::Nil
}

/// Helper function for building a call node from a target and positional
/// sub-values
pub fn call<T, I, A>(target: T, args: I) -> Value
where
    T: Into<Value>,
    I: IntoIterator<Item = A>,
    A: Into<Value>,
{
    CallNode::new(target).args(args).into_value()
}

/// Helper function for quoting a value so it evaluates to itself
pub fn quote<T: Into<Value>>(value: T) -> Value {
    Value::Quote(Box::new(value.into()))
}
