//! The combinator protocol.
//!
//! A program is a sequence of [`Value`]s folded over a [`Stack`] from left to
//! right: [`Combinator`] items are applied to the stack, every other item is
//! pushed as data. A `List` on the stack is a quoted program; combinators such
//! as `i` or `dip` fold it in turn.
//!
//! Combinators come in two flavours. Explicit combinators receive and return
//! the whole stack. Default-converted combinators wrap a plain function and
//! fix at construction time how its arguments are taken off the stack:
//!
//! - [`Combinator::positional`] pops one list of positional arguments
//! - [`Combinator::keyword`] pops a keyword map, then a list of positional
//!   arguments from beneath it
//! - [`Combinator::op`] pops a fixed number of values
//!
//! In every case the single result is pushed back.

use crate::ast::{Keywords, Value};
use crate::evaluator::intooperation::{IntoOperation, OperationFn};
use crate::stack::Stack;
use crate::{DepthGuard, Error, MAX_FOLD_DEPTH};
use std::cell::Cell;
use std::fmt;
use std::io;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;
use tracing::{debug, trace as trace_event};

/// Signature of explicit combinators
pub type StackFn = dyn Fn(Stack) -> Result<Stack, Error> + Send + Sync;

/// How a combinator consumes the stack. Decided once at construction.
#[derive(Clone)]
pub enum CombinatorKind {
    /// Receives and returns the whole stack
    Explicit(Arc<StackFn>),
    /// Pops a list of positional arguments
    Positional(Arc<OperationFn>),
    /// Pops a keyword map, then a list of positional arguments
    Keyword(Arc<OperationFn>),
    /// Pops `arity` values as positional arguments
    Op { func: Arc<OperationFn>, arity: usize },
    /// Folds a named sub-program over the stack
    Phrase(Phrase),
}

/// A named stack transformer
#[derive(Clone)]
pub struct Combinator {
    name: Arc<str>,
    kind: CombinatorKind,
}

impl Combinator {
    /// A combinator that receives the current stack and returns a new one
    pub fn explicit<F>(name: &str, func: F) -> Self
    where
        F: Fn(Stack) -> Result<Stack, Error> + Send + Sync + 'static,
    {
        Combinator {
            name: Arc::from(name),
            kind: CombinatorKind::Explicit(Arc::new(func)),
        }
    }

    /// Default conversion taking positional arguments only
    pub fn positional<F>(name: &str, func: F) -> Self
    where
        F: Fn(Vec<Value>, Keywords) -> Result<Value, Error> + Send + Sync + 'static,
    {
        Combinator {
            name: Arc::from(name),
            kind: CombinatorKind::Positional(Arc::new(func)),
        }
    }

    /// Default conversion taking positional arguments and a keyword layer
    pub fn keyword<F>(name: &str, func: F) -> Self
    where
        F: Fn(Vec<Value>, Keywords) -> Result<Value, Error> + Send + Sync + 'static,
    {
        Combinator {
            name: Arc::from(name),
            kind: CombinatorKind::Keyword(Arc::new(func)),
        }
    }

    /// Default conversion popping `arity` values for a typed Rust function
    ///
    /// ```
    /// use expressive::ast::val;
    /// use expressive::combinator::{Combinator, fold};
    /// use expressive::stack::Stack;
    ///
    /// let add = Combinator::op::<_, (i64, i64)>("add", 2, |a: i64, b: i64| a + b);
    /// let result = fold(Stack::new(), &[val(2), val(3), add.into()]).unwrap();
    /// assert_eq!(result.peek().unwrap(), &val(5));
    /// ```
    pub fn op<F, Args>(name: &str, arity: usize, func: F) -> Self
    where
        F: IntoOperation<Args>,
    {
        Combinator {
            name: Arc::from(name),
            kind: CombinatorKind::Op {
                func: func.into_operation(),
                arity,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &CombinatorKind {
        &self.kind
    }

    /// Apply this combinator to `stack`
    pub fn apply(&self, stack: Stack) -> Result<Stack, Error> {
        match &self.kind {
            CombinatorKind::Explicit(func) => func(stack),
            CombinatorKind::Positional(func) => {
                let (rest, args) = stack.pop()?;
                let args = positional_arguments(&self.name, args)?;
                Ok(rest.push(func(args, Keywords::new())?))
            }
            CombinatorKind::Keyword(func) => {
                let (rest, kwargs) = stack.pop()?;
                let kwargs = match kwargs {
                    Value::Map(kwargs) => kwargs,
                    other => {
                        return Err(Error::NotIterable(format!(
                            "{} expected a keyword map on top of the stack, got {}",
                            self.name,
                            other.type_name()
                        )));
                    }
                };
                let (rest, args) = rest.pop()?;
                let args = positional_arguments(&self.name, args)?;
                Ok(rest.push(func(args, kwargs)?))
            }
            CombinatorKind::Op { func, arity } => {
                let (rest, args) = stack.pop_n(*arity)?;
                Ok(rest.push(func(args, Keywords::new())?))
            }
            CombinatorKind::Phrase(phrase) => fold(stack, phrase.program()),
        }
    }
}

pub(crate) fn positional_arguments(name: &str, value: Value) -> Result<Vec<Value>, Error> {
    match value {
        Value::List(items) => Ok(items),
        Value::Stack(stack) => Ok(stack.to_vec()),
        other => Err(Error::NotIterable(format!(
            "{name} expected a list of positional arguments, got {}",
            other.type_name()
        ))),
    }
}

impl PartialEq for Combinator {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && match (&self.kind, &other.kind) {
                (CombinatorKind::Explicit(a), CombinatorKind::Explicit(b)) => Arc::ptr_eq(a, b),
                (CombinatorKind::Positional(a), CombinatorKind::Positional(b))
                | (CombinatorKind::Keyword(a), CombinatorKind::Keyword(b)) => Arc::ptr_eq(a, b),
                (
                    CombinatorKind::Op { func: a, arity: m },
                    CombinatorKind::Op { func: b, arity: n },
                ) => m == n && Arc::ptr_eq(a, b),
                (CombinatorKind::Phrase(a), CombinatorKind::Phrase(b)) => a == b,
                _ => false,
            }
    }
}

impl fmt::Display for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CombinatorKind::Op { arity: 2, .. } => write!(f, "op({})", self.name),
            CombinatorKind::Op { arity, .. } => write!(f, "op({}, {arity})", self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Debug for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Combinator({self})")
    }
}

impl From<Phrase> for Combinator {
    fn from(phrase: Phrase) -> Self {
        Combinator {
            name: Arc::clone(&phrase.name),
            kind: CombinatorKind::Phrase(phrase),
        }
    }
}

impl From<Phrase> for Value {
    fn from(phrase: Phrase) -> Self {
        Value::Combinator(phrase.into())
    }
}

//
// Folding
//

thread_local! {
    static FOLD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn step(stack: Stack, item: &Value) -> Result<Stack, Error> {
    match item {
        Value::Combinator(combinator) => {
            trace_event!(combinator = %combinator, depth = stack.len(), "applying combinator");
            combinator.apply(stack)
        }
        data => Ok(stack.push(data.clone())),
    }
}

/// Thread `stack` through `program` from left to right
pub fn fold(stack: Stack, program: &[Value]) -> Result<Stack, Error> {
    let _depth = DepthGuard::enter(&FOLD_DEPTH, MAX_FOLD_DEPTH, "Fold")?;
    program.iter().try_fold(stack, step)
}

fn trace_failed(err: io::Error) -> Error {
    Error::EvalError(format!("trace output failed: {err}"))
}

/// Like [`fold`], also writing the stack before and after each item to `out`
/// and to `tracing` at debug level. The resulting stack is the same.
pub fn trace<W>(stack: Stack, program: &[Value], out: &mut W) -> Result<Stack, Error>
where
    W: io::Write + ?Sized,
{
    let _depth = DepthGuard::enter(&FOLD_DEPTH, MAX_FOLD_DEPTH, "Fold")?;
    let mut stack = stack;
    for item in program {
        let before = format!("{stack} << {item}");
        debug!("{before}");
        writeln!(out, "{before}").map_err(trace_failed)?;

        stack = step(stack, item)?;

        let after = format!("  => {stack}");
        debug!("{after}");
        writeln!(out, "{after}").map_err(trace_failed)?;
    }
    Ok(stack)
}

fn slice_program<R: RangeBounds<usize>>(program: &[Value], range: R) -> Option<Arc<[Value]>> {
    let bounds: (Bound<usize>, Bound<usize>) = (range.start_bound().cloned(), range.end_bound().cloned());
    program.get(bounds).map(Arc::from)
}

fn write_program(f: &mut fmt::Formatter<'_>, program: &[Value]) -> fmt::Result {
    for (i, item) in program.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

//
// Def
//

/// How a [`Def`] lays out its call arguments on the initial stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// `[List(args), Map(kwargs)]`: the keyword map on top, always present
    Packed,
    /// Each positional argument pushed in order; no keyword arguments
    Spread,
}

/// A program usable as an ordinary callable.
///
/// Calling it builds an initial stack from the arguments, folds the program
/// over it and returns the top of the final stack.
#[derive(Clone)]
pub struct Def {
    program: Arc<[Value]>,
    convention: Convention,
    min_args: Option<usize>,
    max_args: Option<usize>,
}

impl Def {
    /// A def with the packed convention
    pub fn new<I>(program: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Def::with_convention(program, Convention::Packed)
    }

    /// A def with the spread convention
    pub fn spread<I>(program: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Def::with_convention(program, Convention::Spread)
    }

    pub fn with_convention<I>(program: I, convention: Convention) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Def {
            program: program.into_iter().collect(),
            convention,
            min_args: None,
            max_args: None,
        }
    }

    /// Bounds on the number of positional arguments, checked before folding
    pub fn with_arg_bounds(mut self, min_args: Option<usize>, max_args: Option<usize>) -> Self {
        self.min_args = min_args;
        self.max_args = max_args;
        self
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    pub fn program(&self) -> &[Value] {
        &self.program
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.program.iter()
    }

    /// A def over part of the program, with the same convention and no
    /// argument bounds. `None` if the range is out of bounds.
    pub fn slice<R: RangeBounds<usize>>(&self, range: R) -> Option<Def> {
        slice_program(&self.program, range).map(|program| Def {
            program,
            convention: self.convention,
            min_args: None,
            max_args: None,
        })
    }

    fn check_bounds(&self, got: usize) -> Result<(), Error> {
        if let Some(min) = self.min_args
            && got < min
        {
            return Err(Error::arity_error_with_expr(min, got, self.to_string()));
        }
        if let Some(max) = self.max_args
            && got > max
        {
            return Err(Error::arity_error_with_expr(max, got, self.to_string()));
        }
        Ok(())
    }

    /// The stack the program is folded over for these arguments
    pub fn initial_stack(&self, args: Vec<Value>, kwargs: Keywords) -> Result<Stack, Error> {
        self.check_bounds(args.len())?;
        match self.convention {
            Convention::Packed => Ok(Stack::new()
                .push(Value::List(args))
                .push(Value::Map(kwargs))),
            Convention::Spread => match kwargs.keys().next() {
                Some(key) => Err(Error::TypeError(format!(
                    "{self} got an unexpected keyword argument '{key}'"
                ))),
                None => Ok(Stack::from_values(args)),
            },
        }
    }

    /// Call the def: the top of the final stack is the result
    pub fn call(&self, args: Vec<Value>, kwargs: Keywords) -> Result<Value, Error> {
        let stack = self.initial_stack(args, kwargs)?;
        let result = fold(stack, &self.program)?;
        result.peek().cloned()
    }
}

impl<'a> IntoIterator for &'a Def {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl PartialEq for Def {
    fn eq(&self, other: &Self) -> bool {
        self.convention == other.convention
            && self.min_args == other.min_args
            && self.max_args == other.max_args
            && (Arc::ptr_eq(&self.program, &other.program) || self.program == other.program)
    }
}

impl fmt::Display for Def {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Def(")?;
        write_program(f, &self.program)?;
        write!(f, ")")
    }
}

impl fmt::Debug for Def {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self} [{:?}]", self.convention)
    }
}

//
// Phrase
//

/// A named sub-program. Applying it is the same as splicing its items into
/// the enclosing program.
#[derive(Clone)]
pub struct Phrase {
    name: Arc<str>,
    program: Arc<[Value]>,
}

impl Phrase {
    pub fn new<I>(name: &str, program: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Phrase {
            name: Arc::from(name),
            program: program.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &[Value] {
        &self.program
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.program.iter()
    }

    /// A phrase with the same name over part of the program. `None` if the
    /// range is out of bounds.
    pub fn slice<R: RangeBounds<usize>>(&self, range: R) -> Option<Phrase> {
        slice_program(&self.program, range).map(|program| Phrase {
            name: Arc::clone(&self.name),
            program,
        })
    }
}

impl<'a> IntoIterator for &'a Phrase {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl PartialEq for Phrase {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && (Arc::ptr_eq(&self.program, &other.program) || self.program == other.program)
    }
}

impl fmt::Display for Phrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        write_program(f, &self.program)?;
        write!(f, ")")
    }
}

impl fmt::Debug for Phrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phrase({self})")
    }
}
