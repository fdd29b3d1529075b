//! Built-in operations registry.
//!
//! A single table of builtin functions and macros, installed into an
//! environment by [`Environment::with_builtins`]. Every entry is shared: all
//! environments built from the registry hold the same callables.
//!
//! ## Functions vs Macros
//!
//! - **Functions**: Evaluate all arguments before application (e.g. `+`, `not`, `list`)
//! - **Macros**: Receive their arguments unevaluated (e.g. `if`, `and`, `setq`)
//!
//! ## Error Handling
//!
//! - **Type Safety**: Numeric operations reject non-numbers (no coercion)
//! - **Overflow Detection**: Arithmetic operations detect and report overflow
//! - **Arity Checking**: Each entry's declared arity is checked before the
//!   function runs or the macro expands
//!
//! ## Adding New Operations
//!
//! 1. **Implement the function** as a typed Rust function (see
//!    [`crate::evaluator::intooperation`]) or a macro with the
//!    [`MacroFn`] signature
//! 2. **Add it to `BUILTIN_OPS`** with `BuiltinOp::function` or
//!    `BuiltinOp::special`, giving its identifier and arity
//! 3. **Add tests** covering edge cases and error conditions

use crate::Error;
use crate::ast::{CallNode, Function, FunctionKind, Keywords, NumberType, Value, gensym};
use crate::evaluator::intooperation::{IntoOperation, IntoVariadicOperation, MacroFn, OperationFn};
use crate::evaluator::{
    Arity, Environment, NumIter, StringIter, ValueIter, eval_and, eval_defmac, eval_defn, eval_eval,
    eval_if, eval_lambda, eval_let, eval_mac, eval_or, eval_quote, eval_scope, eval_setq,
    eval_thread, eval_thread_tail,
};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Definition of a built-in operation
#[derive(Clone)]
pub struct BuiltinOp {
    /// The name the operation is bound to
    pub id: &'static str,
    /// The implementation, tagged plain or macro
    pub kind: FunctionKind,
    /// Expected number of arguments, checked on every call
    pub arity: Arity,
}

impl std::fmt::Debug for BuiltinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FunctionKind::Plain(_) => "Function",
            FunctionKind::Macro(_) => "Macro",
        };
        write!(f, "BuiltinOp({}, {kind}, {:?})", self.id, self.arity)
    }
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        // Compare operations by their id, which uniquely identifies them
        self.id == other.id
    }
}

impl BuiltinOp {
    pub fn is_macro(&self) -> bool {
        matches!(self.kind, FunctionKind::Macro(_))
    }

    /// The operation as a callable value, sharing the registry's callable
    pub fn to_value(&self) -> Value {
        Function::from_kind(self.id, self.kind.clone()).into()
    }
}

//
// Builtin Function Implementations
//

// Macro to generate chained numeric comparison functions
macro_rules! numeric_comparison {
    ($name:ident, $op:tt) => {
        fn $name(first: NumberType, rest: NumIter<'_>) -> Result<bool, Error> {
            let mut iter = rest.peekable();
            if iter.peek().is_none() {
                return Err(Error::arity_error(2, 1));
            }

            // All adjacent pairs must satisfy the comparison
            let mut prev = first;
            for current in iter {
                if !(prev $op current) {
                    return Ok(false);
                }
                prev = current;
            }
            Ok(true)
        }
    };
}

numeric_comparison!(builtin_lt, <);
numeric_comparison!(builtin_gt, >);
numeric_comparison!(builtin_le, <=);
numeric_comparison!(builtin_ge, >=);

fn builtin_add(args: NumIter<'_>) -> Result<NumberType, Error> {
    let mut sum = 0 as NumberType;
    for arg in args {
        sum = sum
            .checked_add(arg)
            .ok_or_else(|| Error::EvalError("Integer overflow in addition".into()))?;
    }
    Ok(sum)
}

fn builtin_sub(first: NumberType, rest: NumIter<'_>) -> Result<NumberType, Error> {
    let mut iter = rest.peekable();

    if iter.peek().is_none() {
        return first
            .checked_neg()
            .ok_or_else(|| Error::EvalError("Integer overflow in negation".into()));
    }

    let mut result = first;
    for n in iter {
        result = result
            .checked_sub(n)
            .ok_or_else(|| Error::EvalError("Integer overflow in subtraction".into()))?;
    }
    Ok(result)
}

fn builtin_mul(args: NumIter<'_>) -> Result<NumberType, Error> {
    let mut product = 1 as NumberType;
    for n in args {
        product = product
            .checked_mul(n)
            .ok_or_else(|| Error::EvalError("Integer overflow in multiplication".into()))?;
    }
    Ok(product)
}

/// Structural equality of all arguments
fn builtin_equal(first: Value, mut rest: ValueIter<'_>) -> bool {
    rest.all(|v| *v == first)
}

fn builtin_not(value: Value) -> bool {
    !value.is_truthy()
}

fn builtin_list(items: ValueIter<'_>) -> Value {
    Value::List(items.cloned().collect())
}

fn builtin_concat(parts: StringIter<'_>) -> String {
    parts.collect()
}

fn builtin_join(separator: &str, parts: StringIter<'_>) -> String {
    parts.collect::<Vec<_>>().join(separator)
}

fn builtin_upper(s: &str) -> String {
    s.to_uppercase()
}

fn builtin_lower(s: &str) -> String {
    s.to_lowercase()
}

fn builtin_len(value: Value) -> Result<NumberType, Error> {
    let len = match &value {
        Value::String(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(map) => map.len(),
        Value::Stack(stack) => stack.len(),
        other => {
            return Err(Error::TypeError(format!(
                "len requires a string, list, map or stack, got {}",
                other.type_name()
            )));
        }
    };
    NumberType::try_from(len).map_err(|_| Error::EvalError("length out of range".into()))
}

fn builtin_identity(value: Value) -> Value {
    value
}

/// Sequencing: arguments are already evaluated in order, the last one is the
/// result
fn builtin_do(args: ValueIter<'_>) -> Value {
    args.last().cloned().unwrap_or(Value::Nil)
}

fn builtin_gensym(mut prefix: StringIter<'_>) -> Value {
    Value::Symbol(gensym(prefix.next().unwrap_or("g")))
}

/// Builds a call node from evaluated parts: `node(target, args..., k=v)`.
/// Macros use it to construct their expansions.
fn builtin_node(args: Vec<Value>, kwargs: Keywords) -> Result<Value, Error> {
    let mut args = args.into_iter();
    let target = args.next().ok_or_else(|| Error::arity_error(1, 0))?;
    let mut node = CallNode::new(target).args(args);
    for (name, value) in kwargs {
        node = node.named(name, value);
    }
    Ok(node.into_value())
}

impl BuiltinOp {
    /// A plain function whose argument count is checked against `arity`
    /// before it runs
    fn function(id: &'static str, arity: Arity, op: Arc<OperationFn>) -> Self {
        let checked: Arc<OperationFn> = Arc::new(move |args: Vec<Value>, kwargs: Keywords| {
            arity.validate(args.len())?;
            op(args, kwargs)
        });
        BuiltinOp {
            id,
            kind: FunctionKind::Plain(checked),
            arity,
        }
    }

    /// A macro whose count of positional sub-values is checked against
    /// `arity` before it expands
    fn special(
        id: &'static str,
        arity: Arity,
        f: fn(&[Value], &Keywords, &mut Environment) -> Result<Value, Error>,
    ) -> Self {
        let checked: Arc<MacroFn> =
            Arc::new(move |args: &[Value], kwargs: &Keywords, env: &mut Environment| {
                arity.validate(args.len())?;
                f(args, kwargs, env)
            });
        BuiltinOp {
            id,
            kind: FunctionKind::Macro(checked),
            arity,
        }
    }
}

fn fixed<Args, F>(f: F) -> Arc<OperationFn>
where
    F: IntoOperation<Args>,
{
    <F as IntoOperation<Args>>::into_operation(f)
}

fn variadic<Args, F>(f: F) -> Arc<OperationFn>
where
    F: IntoVariadicOperation<Args>,
{
    <F as IntoVariadicOperation<Args>>::into_variadic_operation(f)
}

/// Global registry of all built-in operations. Each entry's `arity` is the
/// one enforced when it is called.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    use Arity::{Any, AtLeast, Exact, Range};

    vec![
        // Arithmetic operations
        BuiltinOp::function("+", Any, variadic::<(NumIter<'static>,), _>(builtin_add)),
        BuiltinOp::function(
            "-",
            AtLeast(1),
            variadic::<(NumberType, NumIter<'static>), _>(builtin_sub),
        ),
        BuiltinOp::function("*", Any, variadic::<(NumIter<'static>,), _>(builtin_mul)),
        // Comparison operations
        BuiltinOp::function(
            "<",
            AtLeast(2),
            variadic::<(NumberType, NumIter<'static>), _>(builtin_lt),
        ),
        BuiltinOp::function(
            ">",
            AtLeast(2),
            variadic::<(NumberType, NumIter<'static>), _>(builtin_gt),
        ),
        BuiltinOp::function(
            "<=",
            AtLeast(2),
            variadic::<(NumberType, NumIter<'static>), _>(builtin_le),
        ),
        BuiltinOp::function(
            ">=",
            AtLeast(2),
            variadic::<(NumberType, NumIter<'static>), _>(builtin_ge),
        ),
        BuiltinOp::function(
            "=",
            AtLeast(2),
            variadic::<(Value, ValueIter<'static>), _>(builtin_equal),
        ),
        BuiltinOp::function("not", Exact(1), fixed::<(Value,), _>(builtin_not)),
        // Data operations
        BuiltinOp::function("list", Any, variadic::<(ValueIter<'static>,), _>(builtin_list)),
        BuiltinOp::function("len", Exact(1), fixed::<(Value,), _>(builtin_len)),
        BuiltinOp::function("identity", Exact(1), fixed::<(Value,), _>(builtin_identity)),
        BuiltinOp::function("do", Any, variadic::<(ValueIter<'static>,), _>(builtin_do)),
        BuiltinOp::function(
            "gensym",
            Range(0, 1),
            variadic::<(StringIter<'static>,), _>(builtin_gensym),
        ),
        BuiltinOp::function("node", AtLeast(1), Arc::new(builtin_node)),
        // String operations
        BuiltinOp::function(
            "concat",
            Any,
            variadic::<(StringIter<'static>,), _>(builtin_concat),
        ),
        BuiltinOp::function(
            "join",
            AtLeast(1),
            variadic::<(&str, StringIter<'static>), _>(builtin_join),
        ),
        BuiltinOp::function("upper", Exact(1), fixed::<(&str,), _>(builtin_upper)),
        BuiltinOp::function("lower", Exact(1), fixed::<(&str,), _>(builtin_lower)),
        // Macros
        BuiltinOp::special("quote", Exact(1), eval_quote),
        BuiltinOp::special("if", AtLeast(2), eval_if),
        BuiltinOp::special("and", Any, eval_and),
        BuiltinOp::special("or", Any, eval_or),
        BuiltinOp::special("setq", AtLeast(2), eval_setq),
        BuiltinOp::special("lambda", AtLeast(2), eval_lambda),
        BuiltinOp::special("mac", AtLeast(2), eval_mac),
        BuiltinOp::special("defn", AtLeast(3), eval_defn),
        BuiltinOp::special("defmac", AtLeast(3), eval_defmac),
        BuiltinOp::special("let", AtLeast(1), eval_let),
        BuiltinOp::special("thread", AtLeast(1), eval_thread),
        BuiltinOp::special("thread_tail", AtLeast(1), eval_thread_tail),
        BuiltinOp::special("eval", Exact(1), eval_eval),
        BuiltinOp::special("scope", Exact(0), eval_scope),
    ]
});

/// Lazy static map from id to BuiltinOp (private - use find_builtin_op)
static BUILTIN_INDEX: LazyLock<HashMap<&'static str, &'static BuiltinOp>> = LazyLock::new(|| {
    let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
    ops.iter().map(|op| (op.id, op)).collect()
});

/// Get all builtin operations
pub fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin operation by its id
pub fn find_builtin_op(id: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_INDEX.get(id).copied()
}
