//! Expressive - programs as inspectable data
//!
//! This crate provides two ways of holding a computation as an ordinary value
//! that can be built, inspected, rewritten and re-run before anything executes:
//!
//! - **Call trees**: a [`ast::CallNode`] is an immutable, lazily evaluated
//!   function call whose target and arguments may be literals, [`ast::Symbol`]s
//!   resolved against a caller-supplied [`evaluator::Environment`], or further
//!   call nodes. Targets tagged as macros receive their arguments unevaluated
//!   and may rewrite them.
//! - **Stack programs**: a [`stack::Stack`] is threaded through a sequence of
//!   [`combinator::Combinator`]s. Sequences can be packaged as callable
//!   [`combinator::Def`]s or spliced into other sequences as
//!   [`combinator::Phrase`]s.
//!
//! ```
//! use expressive::ast::{CallNode, Function, Value, sym, val};
//! use expressive::evaluator::{Environment, eval};
//!
//! let add = Function::from_typed::<_, (i64, i64)>("add", |a: i64, b: i64| a + b);
//! let expr = CallNode::new(add).arg(sym("x")).arg(val(2)).into_value();
//!
//! let mut env = Environment::new();
//! env.define("x", val(40));
//! assert_eq!(eval(&expr, &mut env).unwrap(), Value::Number(42));
//! ```
//!
//! ```
//! use expressive::ast::val;
//! use expressive::combinator::{Combinator, Def};
//! use expressive::combinators::dup;
//!
//! let square = Def::spread(vec![
//!     dup().into(),
//!     Combinator::op::<_, (i64, i64)>("mul", 2, |a: i64, b: i64| a * b).into(),
//! ]);
//! assert_eq!(square.call(vec![val(7)], Default::default()).unwrap(), val(49));
//! ```
//!
//! ## Modules
//!
//! - `ast`: values, symbols, call nodes and callables
//! - `evaluator`: environments, the call-tree evaluator and the builtin macros
//! - `builtinops`: registry of builtin functions and macros
//! - `stack`: the persistent stack
//! - `combinator`: the combinator protocol, folding, tracing, `Def` and `Phrase`
//! - `combinators`: the standard combinator library
//! - `json`: conversions to and from `serde_json` (feature `json`)

use std::cell::Cell;
use std::fmt;
use std::thread::LocalKey;

/// Maximum evaluation depth to prevent stack overflow in recursive evaluation
/// This limits deeply nested calls and chains of macro expansion
pub const MAX_EVAL_DEPTH: usize = 256;

/// Maximum nesting of quoted programs folded by other combinators
/// (`i`, `dip`, `ifte`, phrases, ...)
pub const MAX_FOLD_DEPTH: usize = 256;

/// Nesting counter for recursion that re-enters through user callbacks
/// (macros calling `eval`, combinators calling `fold`), where the depth
/// cannot be threaded as a parameter. Decremented on drop.
pub(crate) struct DepthGuard {
    counter: &'static LocalKey<Cell<usize>>,
}

impl DepthGuard {
    pub(crate) fn enter(
        counter: &'static LocalKey<Cell<usize>>,
        limit: usize,
        what: &str,
    ) -> Result<Self, Error> {
        let depth = counter.get();
        if depth >= limit {
            return Err(Error::EvalError(format!(
                "{what} depth limit exceeded (max: {limit})"
            )));
        }
        counter.set(depth + 1);
        Ok(DepthGuard { counter })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.counter.set(self.counter.get().saturating_sub(1));
    }
}

/// Error types for evaluation and folding
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A symbol was not bound in the environment it was resolved against
    UnboundName(String),
    /// A call target resolved to something that cannot be invoked
    NotCallable(String),
    /// A combinator needed more stack elements than were present
    StackUnderflow { needed: usize, available: usize },
    /// A default-converted combinator found a non-iterable where its
    /// positional argument list (or a mapping where its keyword layer) belonged
    NotIterable(String),
    EvalError(String),
    TypeError(String),
    ArityError {
        expected: usize,
        got: usize,
        expression: Option<String>, // Optional callable context
    },
}

impl Error {
    /// Create an ArityError without expression context
    pub fn arity_error(expected: usize, got: usize) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: None,
        }
    }

    /// Create an ArityError with expression context
    pub fn arity_error_with_expr(expected: usize, got: usize, expression: String) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: Some(expression),
        }
    }

    /// True for failures raised by stack operations: underflow, and default
    /// conversions finding the wrong shape on top of the stack
    pub fn is_stack_error(&self) -> bool {
        matches!(self, Error::StackUnderflow { .. } | Error::NotIterable(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnboundName(name) => {
                write!(f, "Unbound name: symbol {name} is not bound in the given scope")
            }
            Error::NotCallable(what) => write!(f, "Not callable: {what}"),
            Error::StackUnderflow { needed, available } => write!(
                f,
                "Stack underflow: needed {needed} elements, stack holds {available}"
            ),
            Error::NotIterable(msg) => write!(f, "Stack underflow: {msg}"),
            Error::EvalError(msg) => write!(f, "EvaluationError: {msg}"),
            Error::TypeError(msg) => write!(f, "Type error: {msg}"),
            Error::ArityError {
                expected,
                got,
                expression,
            } => match expression {
                Some(expr) => write!(
                    f,
                    "ArityError: {expr}: expected {expected} arguments, got {got}"
                ),
                None => write!(
                    f,
                    "ArityError: function expected {expected} arguments but got {got}"
                ),
            },
        }
    }
}

impl std::error::Error for Error {}

pub mod ast;
pub mod builtinops;
pub mod combinator;
pub mod combinators;
pub mod evaluator;
pub mod stack;

#[cfg(feature = "json")]
pub mod json;
