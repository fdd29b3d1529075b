use crate::ast::{CallNode, Function, FunctionKind, Keywords, Symbol, Value};
use crate::builtinops::get_builtin_ops;
use crate::{DepthGuard, Error, MAX_EVAL_DEPTH};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

pub mod intooperation;

use self::intooperation::{IntoOperation, IntoVariadicOperation, OperationFn};
pub use self::intooperation::{NumIter, StringIter, ValueIter};

/// Expected number of arguments for a callable
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    /// Inclusive bounds
    Range(usize, usize),
    Any,
}

impl Arity {
    pub fn validate(self, got: usize) -> Result<(), Error> {
        match self {
            Arity::Exact(expected) if got != expected => Err(Error::arity_error(expected, got)),
            Arity::AtLeast(min) | Arity::Range(min, _) if got < min => {
                Err(Error::arity_error(min, got))
            }
            Arity::Range(_, max) if got > max => Err(Error::arity_error(max, got)),
            _ => Ok(()),
        }
    }
}

/// Caller-owned mapping from names to values, with an optional parent scope.
///
/// Cloning an environment shares its scope: a binding made through one clone
/// is visible through every other clone and through every child scope built
/// on it. Names are resolved when they are evaluated, so a closure sees
/// bindings made after it was created, including its own.
///
/// The evaluator never creates a default environment on its own: every
/// evaluation is handed one explicitly. Use [`Environment::with_builtins`] to
/// start from the builtin functions and macros.
#[derive(Clone, Default)]
pub struct Environment {
    scope: Arc<Scope>,
}

#[derive(Default)]
struct Scope {
    bindings: RwLock<HashMap<Symbol, Value>>,
    parent: Option<Environment>,
}

impl Scope {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Symbol, Value>> {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Symbol, Value>> {
        self.bindings.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    /// A child scope. Lookups fall through to `parent`, which stays live:
    /// later bindings in `parent` are visible here.
    pub fn with_parent(parent: Environment) -> Self {
        Environment {
            scope: Arc::new(Scope {
                bindings: RwLock::new(HashMap::new()),
                parent: Some(parent),
            }),
        }
    }

    /// An environment holding every builtin function and macro
    pub fn with_builtins() -> Self {
        let mut env = Environment::new();
        for op in get_builtin_ops() {
            env.define(op.id, op.to_value());
        }
        env
    }

    /// This scope followed by its ancestors, innermost first
    fn scopes(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(Some(&*self.scope), |&scope| {
            scope.parent.as_ref().map(|parent| &*parent.scope)
        })
    }

    /// Bind `name` in this scope, shadowing any binding in a parent scope
    pub fn define(&mut self, name: &str, value: Value) {
        self.bind(Symbol::new(name), value);
    }

    pub(crate) fn bind(&mut self, name: Symbol, value: Value) {
        self.scope.write().insert(name, value);
    }

    /// Assign to the nearest scope that already binds `name`, or define it in
    /// this scope if none does
    pub fn set(&mut self, name: &Symbol, value: Value) {
        let owner = self
            .scopes()
            .find(|scope| scope.read().contains_key(name.name()))
            .unwrap_or(&*self.scope);
        owner.write().insert(name.clone(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.scopes()
            .find_map(|scope| scope.read().get(name).cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scopes().any(|scope| scope.read().contains_key(name))
    }

    /// True if both handles share the same scope
    pub fn same_scope(&self, other: &Environment) -> bool {
        Arc::ptr_eq(&self.scope, &other.scope)
    }

    /// Get all bindings in this environment and its parents
    /// Returns a Vec of (name, value) pairs sorted by name
    pub fn get_all_bindings(&self) -> Vec<(String, Value)> {
        let mut bindings = HashMap::new();

        // Innermost scope first, so local bindings shadow their parents
        for scope in self.scopes() {
            for (name, value) in scope.read().iter() {
                bindings
                    .entry(name.name().to_owned())
                    .or_insert_with(|| value.clone());
            }
        }

        let mut result: Vec<_> = bindings.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    /// Register a builtin function working directly on evaluated argument
    /// slices. Keyword arguments are rejected.
    ///
    /// ```
    /// use expressive::ast::{Value, call, sym, val};
    /// use expressive::evaluator::{Environment, eval};
    /// use expressive::Error;
    ///
    /// fn count(args: &[Value]) -> Result<Value, Error> {
    ///     Ok(Value::Number(args.len() as i64))
    /// }
    ///
    /// let mut env = Environment::new();
    /// env.register_builtin_function("count", count);
    /// let expr = call(sym("count"), [val(1), val("two")]);
    /// assert_eq!(eval(&expr, &mut env).unwrap(), val(2));
    /// ```
    pub fn register_builtin_function(
        &mut self,
        name: &str,
        func: fn(&[Value]) -> Result<Value, Error>,
    ) {
        let wrapped: Arc<OperationFn> = Arc::new(move |args: Vec<Value>, kwargs: Keywords| {
            match kwargs.keys().next() {
                Some(key) => Err(Error::TypeError(format!(
                    "unexpected keyword argument '{key}'"
                ))),
                None => func(&args),
            }
        });
        self.define(name, Function::from_kind(name, FunctionKind::Plain(wrapped)).into());
    }

    /// Register a strongly-typed Rust function as a builtin operation using
    /// automatic argument extraction and result conversion.
    ///
    /// Supported parameter types: `i64`, `bool`, `String`, `&str`, `Value`
    /// and the list iterators (`ValueIter`, `NumIter`, `StringIter`).
    /// Return types are anything `Into<Value>`, or `Result<R, Error>` of it.
    /// Arity is enforced automatically.
    pub fn register_builtin_operation<F, Args>(&mut self, name: &str, func: F)
    where
        F: IntoOperation<Args>,
    {
        self.define(name, Function::from_typed(name, func).into());
    }

    /// Register a variadic builtin operation with explicit arity metadata.
    /// The last parameter of `func` is a rest iterator over the remaining
    /// arguments.
    pub fn register_variadic_builtin_operation<F, Args>(
        &mut self,
        name: &str,
        arity: Arity,
        func: F,
    ) where
        F: IntoVariadicOperation<Args>,
    {
        self.define(name, Function::variadic(name, arity, func).into());
    }

    /// Register a macro: it receives the unevaluated sub-values of the call
    /// node together with this environment
    pub fn register_macro<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&[Value], &Keywords, &mut Environment) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        self.define(name, Function::macro_fn(name, func).into());
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Closures held in bindings may refer back to this scope, so only
        // names are shown
        let mut names: Vec<String> = self
            .scope
            .read()
            .keys()
            .map(|name| name.name().to_owned())
            .collect();
        names.sort();
        f.debug_struct("Environment")
            .field("bindings", &names)
            .field("parent", &self.scope.parent)
            .finish()
    }
}

thread_local! {
    static EVAL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Evaluate a value against `env`.
///
/// Symbols are resolved, quotes are unwrapped and call nodes are applied;
/// every other value evaluates to itself. The result of a macro is evaluated
/// exactly once more if it is itself evaluable; results of plain callables
/// are returned as they are.
pub fn eval(expr: &Value, env: &mut Environment) -> Result<Value, Error> {
    let _depth = DepthGuard::enter(&EVAL_DEPTH, MAX_EVAL_DEPTH, "Evaluation")?;
    match expr {
        Value::Symbol(name) => env
            .get(name.name())
            .ok_or_else(|| Error::UnboundName(name.name().to_owned())),
        Value::Quote(inner) => Ok((**inner).clone()),
        Value::Call(node) => eval_call(node, env),
        _ => Ok(expr.clone()),
    }
}

fn eval_call(node: &CallNode, env: &mut Environment) -> Result<Value, Error> {
    let target = eval(node.target(), env)?;

    if let Value::Function(func) = &target
        && let FunctionKind::Macro(expand) = func.kind()
    {
        trace!(name = func.name(), "expanding macro");
        let form = expand(node.positional(), node.named_args(), env)?;
        if !form.is_evaluable() {
            return Ok(form);
        }
        debug!(name = func.name(), expansion = %form, "evaluating macro expansion");
        return eval(&form, env);
    }

    let (args, kwargs) = eval_arguments(node, env)?;
    apply(&target, args, kwargs)
}

/// Evaluate positional sub-values left to right, then named ones in
/// insertion order
fn eval_arguments(node: &CallNode, env: &mut Environment) -> Result<(Vec<Value>, Keywords), Error> {
    let args = node
        .positional()
        .iter()
        .map(|arg| eval(arg, env))
        .collect::<Result<Vec<_>, _>>()?;

    let mut kwargs = Keywords::new();
    for (name, expr) in node.named_args().iter() {
        kwargs.insert(name, eval(expr, env)?);
    }
    Ok((args, kwargs))
}

/// Apply an evaluated callable (a plain function or a `Def`) to evaluated
/// arguments
pub fn apply(target: &Value, args: Vec<Value>, kwargs: Keywords) -> Result<Value, Error> {
    match target {
        Value::Function(func) => func.call(args, kwargs),
        Value::Def(def) => def.call(args, kwargs),
        other => Err(Error::NotCallable(format!(
            "{other} is a {}",
            other.type_name()
        ))),
    }
}

impl CallNode {
    /// Evaluate this node against `env`
    pub fn evaluate(&self, env: &mut Environment) -> Result<Value, Error> {
        let _depth = DepthGuard::enter(&EVAL_DEPTH, MAX_EVAL_DEPTH, "Evaluation")?;
        eval_call(self, env)
    }

    /// Evaluate this node against a fresh environment built from `kwargs`
    pub fn call(&self, kwargs: Keywords) -> Result<Value, Error> {
        let mut env = Environment::new();
        for (name, value) in kwargs {
            env.define(&name, value);
        }
        self.evaluate(&mut env)
    }
}

//
// Builtin macros
//
// Each receives the raw sub-values of its call node. A macro that has
// already evaluated a value it returns wraps it with `protect` so the
// flattening step does not evaluate it a second time.
//

fn protect(value: Value) -> Value {
    if value.is_evaluable() {
        Value::Quote(Box::new(value))
    } else {
        value
    }
}

fn reject_keywords(form: &str, kwargs: &Keywords) -> Result<(), Error> {
    match kwargs.keys().next() {
        None => Ok(()),
        Some(key) => Err(Error::TypeError(format!(
            "{form} does not take keyword arguments (got '{key}')"
        ))),
    }
}

fn expect_symbol<'a>(form: &str, value: &'a Value) -> Result<&'a Symbol, Error> {
    match value {
        Value::Symbol(s) => Ok(s),
        other => Err(Error::TypeError(format!(
            "{form} requires a symbol, got {}",
            other.type_name()
        ))),
    }
}

/// `quote(x)`: `x` as data
pub(crate) fn eval_quote(
    args: &[Value],
    kwargs: &Keywords,
    _env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("quote", kwargs)?;
    match args {
        [expr] => Ok(Value::Quote(Box::new(expr.clone()))),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

/// `if(cond, then, [cond2, then2, ...], [else])`
///
/// Conditions are evaluated in turn until one is truthy; the matching branch
/// is returned unevaluated for the flattening step. Branches not taken are
/// never evaluated. Without an else branch the result is nil.
pub(crate) fn eval_if(
    args: &[Value],
    kwargs: &Keywords,
    env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("if", kwargs)?;
    if args.len() < 2 {
        return Err(Error::arity_error(2, args.len()));
    }

    let mut rest = args;
    loop {
        match rest {
            [] => return Ok(Value::Nil),
            [otherwise] => return Ok(otherwise.clone()),
            [condition, then, tail @ ..] => {
                if eval(condition, env)?.is_truthy() {
                    return Ok(then.clone());
                }
                rest = tail;
            }
        }
    }
}

macro_rules! short_circuit_op {
    ($name:ident, $form:expr, $stop_when:expr, $empty:expr) => {
        /// Evaluates arguments left to right and stops at the first one
        /// whose truthiness decides the result, returning that value. The
        /// last argument is returned unevaluated for the flattening step.
        pub(crate) fn $name(
            args: &[Value],
            kwargs: &Keywords,
            env: &mut Environment,
        ) -> Result<Value, Error> {
            reject_keywords($form, kwargs)?;
            let Some((last, init)) = args.split_last() else {
                return Ok($empty);
            };
            for arg in init {
                let value = eval(arg, env)?;
                if value.is_truthy() == $stop_when {
                    return Ok(protect(value));
                }
            }
            Ok(last.clone())
        }
    };
}

short_circuit_op!(eval_and, "and", false, Value::Bool(true));
short_circuit_op!(eval_or, "or", true, Value::Nil);

/// `setq(name, expr, ...)`: evaluates and assigns each pair in order,
/// returning the last value assigned
pub(crate) fn eval_setq(
    args: &[Value],
    kwargs: &Keywords,
    env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("setq", kwargs)?;
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(Error::EvalError(format!(
            "setq expects name/value pairs, got {} arguments",
            args.len()
        )));
    }

    let mut last = Value::Nil;
    for pair in args.chunks_exact(2) {
        let name = expect_symbol("setq", &pair[0])?;
        let value = eval(&pair[1], env)?;
        env.set(name, value.clone());
        last = value;
    }
    Ok(protect(last))
}

fn eval_body(body: &[Value], env: &mut Environment) -> Result<Value, Error> {
    let mut result = Value::Nil;
    for expr in body {
        result = eval(expr, env)?;
    }
    Ok(result)
}

/// Marks the parameter collecting extra positional arguments
const REST_MARKER: &str = "&rest";
/// Marks the parameter collecting extra keyword arguments
const KWARGS_MARKER: &str = "&kwargs";

/// Parameter list of a `lambda` or `mac`:
/// `[a, b, [c, default], &rest, more, &kwargs, options]`.
///
/// Required names come first, then optional `[name, default]` pairs whose
/// defaults are evaluated once, when the parameter list is read.
#[derive(Default)]
struct Params {
    required: Vec<Symbol>,
    optional: Vec<(Symbol, Value)>,
    rest: Option<Symbol>,
    kwargs: Option<Symbol>,
}

impl Params {
    fn parse(form: &str, list: &[Value], env: &mut Environment) -> Result<Params, Error> {
        let mut params = Params::default();
        let mut seen: Vec<Symbol> = Vec::with_capacity(list.len());
        let mut claim = |name: &Symbol| {
            if seen.contains(name) {
                return Err(Error::EvalError(format!(
                    "Duplicate parameter name: {name}"
                )));
            }
            seen.push(name.clone());
            Ok(name.clone())
        };

        let mut items = list.iter();
        while let Some(item) = items.next() {
            match item {
                Value::Symbol(marker)
                    if marker.name() == REST_MARKER || marker.name() == KWARGS_MARKER =>
                {
                    let Some(Value::Symbol(name)) = items.next() else {
                        return Err(Error::TypeError(format!(
                            "{form}: {marker} must be followed by a symbol"
                        )));
                    };
                    let slot = if marker.name() == REST_MARKER && params.kwargs.is_none() {
                        &mut params.rest
                    } else {
                        &mut params.kwargs
                    };
                    if slot.is_some() {
                        return Err(Error::EvalError(format!("{form}: misplaced {marker}")));
                    }
                    *slot = Some(claim(name)?);
                }
                Value::Symbol(name) => {
                    if !params.optional.is_empty() || params.collects_extras() {
                        return Err(Error::EvalError(format!(
                            "{form}: required parameter {name} follows optional ones"
                        )));
                    }
                    params.required.push(claim(name)?);
                }
                Value::List(pair) => {
                    let [Value::Symbol(name), default] = pair.as_slice() else {
                        return Err(Error::TypeError(format!(
                            "{form}: optional parameters are [name, default] pairs"
                        )));
                    };
                    if params.collects_extras() {
                        return Err(Error::EvalError(format!(
                            "{form}: optional parameter {name} follows {REST_MARKER}"
                        )));
                    }
                    let name = claim(name)?;
                    params.optional.push((name, eval(default, env)?));
                }
                other => {
                    return Err(Error::TypeError(format!(
                        "{form} requires a symbol, got {}",
                        other.type_name()
                    )));
                }
            }
        }
        Ok(params)
    }

    fn collects_extras(&self) -> bool {
        self.rest.is_some() || self.kwargs.is_some()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.required
            .iter()
            .chain(self.optional.iter().map(|(name, _)| name))
            .position(|name| name.name() == key)
    }

    /// Bind call arguments into `local`. Positional arguments fill required
    /// then optional slots; keywords fill slots by name. Leftovers go to the
    /// `&rest` and `&kwargs` parameters, or are an error without them.
    fn bind(&self, args: Vec<Value>, kwargs: Keywords, local: &mut Environment) -> Result<(), Error> {
        let positional = self.required.len() + self.optional.len();
        if args.len() > positional && self.rest.is_none() {
            return Err(Error::arity_error(positional, args.len()));
        }
        let supplied = args.len() + kwargs.len();

        let mut args = args.into_iter();
        let mut slots: Vec<Option<Value>> = args.by_ref().take(positional).map(Some).collect();
        slots.resize(positional, None);
        let extra: Vec<Value> = args.collect();

        let mut extra_kwargs = Keywords::new();
        for (key, value) in kwargs {
            match self.position(&key) {
                Some(index) => {
                    if slots[index].replace(value).is_some() {
                        return Err(Error::TypeError(format!(
                            "multiple values for argument '{key}'"
                        )));
                    }
                }
                None if self.kwargs.is_some() => {
                    extra_kwargs.insert(key, value);
                }
                None => {
                    return Err(Error::TypeError(format!(
                        "unexpected keyword argument '{key}'"
                    )));
                }
            }
        }

        let mut slots = slots.into_iter();
        for (name, slot) in self.required.iter().zip(slots.by_ref()) {
            let value = slot.ok_or_else(|| Error::arity_error(self.required.len(), supplied))?;
            local.bind(name.clone(), value);
        }
        for ((name, default), slot) in self.optional.iter().zip(slots) {
            local.bind(name.clone(), slot.unwrap_or_else(|| default.clone()));
        }
        if let Some(name) = &self.rest {
            local.bind(name.clone(), Value::List(extra));
        }
        if let Some(name) = &self.kwargs {
            local.bind(name.clone(), Value::Map(extra_kwargs));
        }
        Ok(())
    }
}

/// Split `[params], body...` and read the parameter list
fn closure_parts<'a>(
    form: &str,
    args: &'a [Value],
    env: &mut Environment,
) -> Result<(Params, &'a [Value]), Error> {
    let [Value::List(param_list), body @ ..] = args else {
        return match args {
            [] => Err(Error::arity_error(2, 0)),
            _ => Err(Error::TypeError(format!(
                "{form} parameters must be a list"
            ))),
        };
    };
    if body.is_empty() {
        return Err(Error::arity_error(2, args.len()));
    }
    Ok((Params::parse(form, param_list, env)?, body))
}

/// A plain function evaluating `body` in a fresh child of `env`. The parent
/// scope is shared, not copied, so names are resolved at call time.
fn lambda_function(name: &str, params: Params, body: &[Value], env: &Environment) -> Function {
    let captured = env.clone();
    let body = body.to_vec();
    Function::plain(name, move |args, kwargs| {
        let mut local = Environment::with_parent(captured.clone());
        params.bind(args, kwargs, &mut local)?;
        eval_body(&body, &mut local)
    })
}

/// A macro binding the raw sub-values of its call node to `params`. The
/// value of `body` is the expansion.
fn macro_function(name: &str, params: Params, body: &[Value], env: &Environment) -> Function {
    let captured = env.clone();
    let body = body.to_vec();
    Function::macro_fn(name, move |args, kwargs, _env| {
        let mut local = Environment::with_parent(captured.clone());
        params.bind(args.to_vec(), kwargs.clone(), &mut local)?;
        eval_body(&body, &mut local)
    })
}

/// `lambda([params...], body...)`: a plain function over the live defining
/// environment
pub(crate) fn eval_lambda(
    args: &[Value],
    kwargs: &Keywords,
    env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("lambda", kwargs)?;
    let (params, body) = closure_parts("lambda", args, env)?;
    Ok(lambda_function("lambda", params, body, env).into())
}

/// `mac([params...], body...)`: a macro whose body computes its expansion
/// from the unevaluated arguments
pub(crate) fn eval_mac(
    args: &[Value],
    kwargs: &Keywords,
    env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("mac", kwargs)?;
    let (params, body) = closure_parts("mac", args, env)?;
    Ok(macro_function("mac", params, body, env).into())
}

/// `defn(name, [params...], body...)`: `setq(name, lambda(...))`
pub(crate) fn eval_defn(
    args: &[Value],
    kwargs: &Keywords,
    env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("defn", kwargs)?;
    let Some((name, rest)) = args.split_first() else {
        return Err(Error::arity_error(3, 0));
    };
    let name = expect_symbol("defn", name)?;
    let (params, body) = closure_parts("defn", rest, env)?;
    let func: Value = lambda_function(name.name(), params, body, env).into();
    env.set(name, func.clone());
    Ok(protect(func))
}

/// `defmac(name, [params...], body...)`: `setq(name, mac(...))`
pub(crate) fn eval_defmac(
    args: &[Value],
    kwargs: &Keywords,
    env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("defmac", kwargs)?;
    let Some((name, rest)) = args.split_first() else {
        return Err(Error::arity_error(3, 0));
    };
    let name = expect_symbol("defmac", name)?;
    let (params, body) = closure_parts("defmac", rest, env)?;
    let func: Value = macro_function(name.name(), params, body, env).into();
    env.set(name, func.clone());
    Ok(protect(func))
}

/// `let([name, expr, ...], body...)`: binds sequentially in a child scope.
/// Names first bound inside the scope are not visible to the caller
/// afterwards; `setq` of a name the caller already binds assigns it there.
pub(crate) fn eval_let(
    args: &[Value],
    kwargs: &Keywords,
    env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("let", kwargs)?;
    let [Value::List(bindings), body @ ..] = args else {
        return match args {
            [] => Err(Error::arity_error(1, 0)),
            _ => Err(Error::TypeError("let bindings must be a list".to_owned())),
        };
    };
    if bindings.len() % 2 != 0 {
        return Err(Error::EvalError(
            "let bindings must be name/value pairs".to_owned(),
        ));
    }

    let mut local = Environment::with_parent(env.clone());
    for pair in bindings.chunks_exact(2) {
        let name = expect_symbol("let", &pair[0])?;
        let value = eval(&pair[1], &mut local)?;
        local.bind(name.clone(), value);
    }
    eval_body(body, &mut local).map(protect)
}

fn thread_into(value: Value, step: &Value, at_end: bool) -> Value {
    match step {
        Value::Call(node) => {
            let mut positional = Vec::with_capacity(node.positional().len() + 1);
            if !at_end {
                positional.push(value.clone());
            }
            positional.extend(node.positional().iter().cloned());
            if at_end {
                positional.push(value);
            }
            let mut rewritten = CallNode::new(node.target().clone()).args(positional);
            for (name, arg) in node.named_args().iter() {
                rewritten = rewritten.named(name, arg.clone());
            }
            rewritten.into_value()
        }
        target => CallNode::new(target.clone()).arg(value).into_value(),
    }
}

/// `thread(x, f(a), g(b))` rewrites to `g(f(x, a), b)`. Steps that are not
/// call nodes are called with the threaded value alone.
pub(crate) fn eval_thread(
    args: &[Value],
    kwargs: &Keywords,
    _env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("thread", kwargs)?;
    let Some((first, steps)) = args.split_first() else {
        return Err(Error::arity_error(1, 0));
    };
    Ok(steps
        .iter()
        .fold(first.clone(), |acc, step| thread_into(acc, step, false)))
}

/// `thread_tail(x, f(a), g(b))` rewrites to `g(b, f(a, x))`
pub(crate) fn eval_thread_tail(
    args: &[Value],
    kwargs: &Keywords,
    _env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("thread_tail", kwargs)?;
    let Some((first, steps)) = args.split_first() else {
        return Err(Error::arity_error(1, 0));
    };
    Ok(steps
        .iter()
        .fold(first.clone(), |acc, step| thread_into(acc, step, true)))
}

/// `eval(expr)`: evaluates `expr`; the result is evaluated again by the
/// flattening step if it is itself evaluable
pub(crate) fn eval_eval(
    args: &[Value],
    kwargs: &Keywords,
    env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("eval", kwargs)?;
    match args {
        [expr] => eval(expr, env),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

/// `scope()`: the visible bindings as a map, sorted by name
pub(crate) fn eval_scope(
    args: &[Value],
    kwargs: &Keywords,
    env: &mut Environment,
) -> Result<Value, Error> {
    reject_keywords("scope", kwargs)?;
    if !args.is_empty() {
        return Err(Error::arity_error(0, args.len()));
    }
    Ok(Value::Map(env.get_all_bindings().into_iter().collect()))
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{call, nil, quote, sym, val};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test result variants for comprehensive testing
    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),           // Evaluation should succeed with this value
        SpecificError(&'static str), // Evaluation should fail with error containing this string
        AnyError,                    // Evaluation should fail (any error)
    }
    use TestResult::*;

    fn success<T: Into<Value>>(value: T) -> TestResult {
        EvalResult(val(value))
    }

    fn execute_test_case(expr: &Value, expected: &TestResult, env: &mut Environment, test_id: &str) {
        match (eval(expr, env), expected) {
            (Ok(actual), EvalResult(expected_val)) => {
                assert_eq!(&actual, expected_val, "{test_id}: wrong result for {expr}");
            }
            (Err(_), AnyError) => {}
            (Err(e), SpecificError(expected_text)) => {
                let error_msg = format!("{e}");
                assert!(
                    error_msg.contains(expected_text),
                    "{test_id}: error for {expr} should contain '{expected_text}', got '{error_msg}'"
                );
            }
            (Ok(actual), _) => panic!("{test_id}: expected error for {expr}, got {actual:?}"),
            (Err(e), EvalResult(_)) => panic!("{test_id}: unexpected error for {expr}: {e}"),
        }
    }

    /// Every case runs in its own builtin environment
    fn run_comprehensive_tests(test_cases: Vec<(Value, TestResult)>) {
        for (i, (expr, expected)) in test_cases.iter().enumerate() {
            let mut env = Environment::with_builtins();
            execute_test_case(expr, expected, &mut env, &format!("Test #{}", i + 1));
        }
    }

    /// Cases share one environment, in order
    fn run_tests_in_shared_environment(test_cases: Vec<(Value, TestResult)>) {
        let mut env = Environment::with_builtins();
        for (i, (expr, expected)) in test_cases.iter().enumerate() {
            execute_test_case(expr, expected, &mut env, &format!("Step #{}", i + 1));
        }
    }

    fn add_fn() -> Function {
        Function::from_typed::<_, (i64, i64)>("add", |a: i64, b: i64| a + b)
    }

    fn mul_fn() -> Function {
        Function::from_typed::<_, (i64, i64)>("mul", |a: i64, b: i64| a * b)
    }

    /// A plain function that counts its invocations
    fn counting_fn(name: &str, counter: &Arc<AtomicUsize>, result: Value) -> Function {
        let counter = Arc::clone(counter);
        Function::plain(name, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(result.clone())
        })
    }

    #[test]
    fn test_self_evaluation() {
        let literals = vec![
            nil(),
            val(42),
            val(true),
            val("spam"),
            val([1, 2, 3]),
            val(vec![sym("unbound"), call(sym("boom"), [val(1)])]),
            val(Keywords::from_iter([("a", val(1))])),
            val(add_fn()),
        ];
        let mut empty = Environment::new();
        let mut builtins = Environment::with_builtins();
        for v in literals {
            assert_eq!(eval(&v, &mut empty).unwrap(), v);
            assert_eq!(eval(&v, &mut builtins).unwrap(), v);
        }
    }

    #[test]
    fn test_symbol_resolution() {
        let mut env = Environment::new();
        env.define("x", val(40));
        assert_eq!(eval(&sym("x"), &mut env).unwrap(), val(40));
        assert_eq!(
            eval(&sym("y"), &mut env).unwrap_err(),
            crate::Error::UnboundName("y".into())
        );

        let mut child = Environment::with_parent(env.clone());
        child.define("y", val(2));
        assert_eq!(eval(&sym("x"), &mut child).unwrap(), val(40));
        assert_eq!(eval(&sym("y"), &mut child).unwrap(), val(2));
    }

    #[test]
    fn test_structural_recursion() {
        let mut env = Environment::new();
        env.define("add", add_fn().into());
        env.define("mul", mul_fn().into());
        env.define("x", val(4));

        // add(mul(x, 10), 2)
        let expr = call(sym("add"), [call(sym("mul"), [sym("x"), val(10)]), val(2)]);
        assert_eq!(eval(&expr, &mut env).unwrap(), val(42));

        // A call node in target position is evaluated like any other sub-value
        let pick = Function::plain("pick", |args, _| Ok(args[0].clone()));
        let expr = call(call(pick, [sym("mul")]), [val(6), val(7)]);
        assert_eq!(eval(&expr, &mut env).unwrap(), val(42));

        // Plain results are never flattened
        let node = call(sym("add"), [val(1), val(2)]);
        let identity = Function::plain("identity", |mut args, _| Ok(args.remove(0)));
        let expr = call(identity, [quote(node.clone())]);
        assert_eq!(eval(&expr, &mut env).unwrap(), node);
    }

    #[test]
    fn test_not_callable_targets() {
        run_comprehensive_tests(vec![
            (call(val(42), [val(1)]), SpecificError("Not callable")),
            (call(val("f"), Vec::<Value>::new()), SpecificError("Not callable")),
            (call(sym("undefined"), [val(1)]), SpecificError("Unbound name")),
        ]);
    }

    #[test]
    fn test_hello_world_scenario() {
        let upper = Function::from_typed::<_, (&str,)>("upper", |s: &str| s.to_uppercase());
        let lower = Function::from_typed::<_, (&str,)>("lower", |s: &str| s.to_lowercase());
        let join = Function::plain("join", |args, kwargs| {
            let sep = match kwargs.get("sep") {
                Some(Value::String(s)) => s.clone(),
                _ => " ".to_owned(),
            };
            let parts: Vec<String> = args
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect();
            Ok(val(parts.join(&sep)))
        });

        let expr = CallNode::new(join.clone())
            .arg(call(upper.clone(), [val("hello")]))
            .arg(call(lower.clone(), [val("WORLD")]))
            .into_value();
        let mut env = Environment::new();
        assert_eq!(eval(&expr, &mut env).unwrap(), val("HELLO world"));

        let expr = CallNode::new(join)
            .arg(call(upper, [val("hello")]))
            .arg(call(lower, [val("WORLD")]))
            .named("sep", val("::"))
            .into_value();
        assert_eq!(eval(&expr, &mut env).unwrap(), val("HELLO::world"));
    }

    #[test]
    fn test_evaluation_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = |tag: &'static str| {
            let log = Arc::clone(&log);
            Function::plain(tag, move |_, _| {
                log.lock().unwrap().push(tag);
                Ok(val(tag))
            })
        };
        let target = {
            let log = Arc::clone(&log);
            Function::plain("target", move |_, _| {
                log.lock().unwrap().push("target");
                Ok(Function::plain("f", |_, _| Ok(Value::Nil)).into())
            })
        };

        let expr = CallNode::new(call(target, Vec::<Value>::new()))
            .named("k", call(record("named"), Vec::<Value>::new()))
            .arg(call(record("first"), Vec::<Value>::new()))
            .arg(call(record("second"), Vec::<Value>::new()))
            .into_value();
        eval(&expr, &mut Environment::new()).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["target", "first", "second", "named"]
        );
    }

    #[test]
    fn test_macro_receives_raw_arguments() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let spy = {
            let seen = Arc::clone(&seen);
            Function::macro_fn("spy", move |args, kwargs, _env| {
                seen.lock().unwrap().extend(args.iter().cloned());
                seen.lock().unwrap().extend(kwargs.values().cloned());
                Ok(Value::Nil)
            })
        };

        // Would fail with NotCallable if it were ever evaluated
        let explosive = call(val(1), [val(2)]);
        let expr = CallNode::new(spy)
            .arg(explosive.clone())
            .arg(sym("unbound"))
            .named("k", call(sym("also_unbound"), [val(3)]))
            .into_value();

        assert_eq!(eval(&expr, &mut Environment::new()).unwrap(), Value::Nil);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![explosive, sym("unbound"), call(sym("also_unbound"), [val(3)])]
        );
    }

    #[test]
    fn test_two_way_if_skips_the_other_branch() {
        // Selects index truthiness(cond) from (else, then)
        let two_way_if = Function::macro_fn("If", |args, _, env| match args {
            [cond, then, otherwise] => {
                let branches = [otherwise, then];
                let chosen = eval(cond, env)?.is_truthy() as usize;
                Ok(branches[chosen].clone())
            }
            _ => Err(crate::Error::arity_error(3, args.len())),
        });

        let then_calls = Arc::new(AtomicUsize::new(0));
        let else_calls = Arc::new(AtomicUsize::new(0));
        let then_expr = call(counting_fn("yes", &then_calls, val("yes")), Vec::<Value>::new());
        let else_expr = call(counting_fn("no", &else_calls, val("no")), Vec::<Value>::new());

        let expr = call(two_way_if.clone(), [val(1), then_expr.clone(), else_expr.clone()]);
        let mut env = Environment::new();
        assert_eq!(eval(&expr, &mut env).unwrap(), val("yes"));
        assert_eq!(then_calls.load(Ordering::SeqCst), 1);
        assert_eq!(else_calls.load(Ordering::SeqCst), 0);

        let expr = call(two_way_if, [val(""), then_expr, else_expr]);
        assert_eq!(eval(&expr, &mut env).unwrap(), val("no"));
        assert_eq!(then_calls.load(Ordering::SeqCst), 1);
        assert_eq!(else_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_macro_flattening_is_one_level() {
        let add_two = call(add_fn(), [val(40), val(2)]);

        // Expansion to a call node: evaluated once
        let expand = {
            let add_two = add_two.clone();
            Function::macro_fn("expand", move |_, _, _| Ok(add_two.clone()))
        };
        let mut env = Environment::new();
        assert_eq!(eval(&call(expand, Vec::<Value>::new()), &mut env).unwrap(), val(42));

        // Expansion to a quoted call node: the quote is the one level
        let quoted = {
            let add_two = add_two.clone();
            Function::macro_fn("quoted", move |_, _, _| Ok(quote(add_two.clone())))
        };
        assert_eq!(
            eval(&call(quoted.clone(), Vec::<Value>::new()), &mut env).unwrap(),
            add_two
        );

        // Expansion to a macro call whose own expansion is quoted: the inner
        // macro is flattened by its own evaluation, still only one level each
        let outer = Function::macro_fn("outer", move |_, _, _| {
            Ok(call(quoted.clone(), Vec::<Value>::new()))
        });
        assert_eq!(
            eval(&call(outer, Vec::<Value>::new()), &mut env).unwrap(),
            add_two
        );

        // Non-evaluable expansions are returned as they are
        let literal = Function::macro_fn("literal", |_, _, _| Ok(val([1, 2])));
        assert_eq!(
            eval(&call(literal, Vec::<Value>::new()), &mut env).unwrap(),
            val([1, 2])
        );
    }

    #[test]
    fn test_macro_errors_propagate_unchanged() {
        let failing = Function::macro_fn("failing", |_, _, _| {
            Err(crate::Error::TypeError("bad form".into()))
        });
        let mut env = Environment::new();
        assert_eq!(
            eval(&call(failing, Vec::<Value>::new()), &mut env).unwrap_err(),
            crate::Error::TypeError("bad form".into())
        );

        // Errors raised while evaluating the expansion are not wrapped either
        let dangling = Function::macro_fn("dangling", |_, _, _| Ok(sym("nowhere")));
        assert_eq!(
            eval(&call(dangling, Vec::<Value>::new()), &mut env).unwrap_err(),
            crate::Error::UnboundName("nowhere".into())
        );
    }

    #[test]
    fn test_macros_can_define_bindings() {
        let mut env = Environment::new();
        env.register_macro("define", |args, _, env| match args {
            [Value::Symbol(name), expr] => {
                let value = eval(expr, env)?;
                env.set(name, value);
                Ok(Value::Nil)
            }
            _ => Err(crate::Error::EvalError("bad define".into())),
        });
        env.define("add", add_fn().into());

        let define = call(
            sym("define"),
            [sym("answer"), call(sym("add"), [val(40), val(2)])],
        );
        assert_eq!(eval(&define, &mut env).unwrap(), Value::Nil);
        assert_eq!(env.get("answer"), Some(val(42)));
    }

    #[test]
    fn test_builtin_if_and_or() {
        run_comprehensive_tests(vec![
            (call(sym("if"), [val(true), val(1), val(2)]), success(1)),
            (call(sym("if"), [val(0), val(1), val(2)]), success(2)),
            (call(sym("if"), [val(false), val(1)]), EvalResult(Value::Nil)),
            // Chained conditions
            (
                call(sym("if"), [val(false), val(1), val(true), val(2), val(3)]),
                success(2),
            ),
            (
                call(sym("if"), [val(false), val(1), val(false), val(2), val(3)]),
                success(3),
            ),
            (
                call(sym("if"), [val(true), call(sym("+"), [val(1), val(2)])]),
                success(3),
            ),
            // Untaken branch is never evaluated
            (
                call(sym("if"), [val(true), val("ok"), call(sym("missing"), [val(1)])]),
                success("ok"),
            ),
            (call(sym("if"), [val(true)]), AnyError),
            (call(sym("and"), Vec::<Value>::new()), success(true)),
            (call(sym("and"), [val(1), val("yes")]), success("yes")),
            (call(sym("and"), [val(1), val(0), sym("missing")]), success(0)),
            (call(sym("or"), Vec::<Value>::new()), EvalResult(Value::Nil)),
            (call(sym("or"), [val(0), val(""), val("yes")]), success("yes")),
            (call(sym("or"), [val(7), sym("missing")]), success(7)),
            (call(sym("or"), [val(0), sym("missing")]), SpecificError("Unbound name")),
        ]);
    }

    #[test]
    fn test_short_circuit_does_not_double_evaluate() {
        // A deciding value that is itself a call node is returned as data
        let node = call(sym("missing"), [val(1)]);
        let mut env = Environment::with_builtins();
        env.define("node", node.clone());
        let expr = call(sym("or"), [sym("node"), val(1)]);
        assert_eq!(eval(&expr, &mut env).unwrap(), node);
    }

    #[test]
    fn test_setq_lambda_and_let() {
        run_tests_in_shared_environment(vec![
            (call(sym("setq"), [sym("x"), val(10)]), success(10)),
            (
                call(sym("setq"), [sym("y"), val(1), sym("z"), sym("x")]),
                success(10),
            ),
            (call(sym("setq"), [val(1), val(2)]), SpecificError("requires a symbol")),
            (call(sym("setq"), [sym("x")]), AnyError),
            (call(sym("+"), [sym("x"), sym("y"), sym("z")]), success(21)),
        ]);

        let mut env = Environment::with_builtins();
        let plus = call(
            sym("lambda"),
            [val(vec![sym("a"), sym("b")]), call(sym("+"), [sym("a"), sym("b")])],
        );
        let f = eval(&plus, &mut env).unwrap();
        assert_eq!(f.type_name(), "function");
        env.define("plus", f);

        run_cases_in(
            &mut env,
            vec![
                (call(sym("plus"), [val(40), val(2)]), success(42)),
                (
                    CallNode::new(sym("plus"))
                        .arg(val(40))
                        .named("b", val(2))
                        .into_value(),
                    success(42),
                ),
                (call(sym("plus"), [val(1)]), SpecificError("ArityError")),
                (
                    CallNode::new(sym("plus"))
                        .args([val(1), val(2)])
                        .named("c", val(3))
                        .into_value(),
                    SpecificError("unexpected keyword"),
                ),
                (
                    call(sym("lambda"), [val(vec![sym("a"), sym("a")]), sym("a")]),
                    SpecificError("Duplicate parameter"),
                ),
                (
                    call(
                        sym("let"),
                        [
                            val(vec![sym("a"), val(2), sym("b"), call(sym("*"), [sym("a"), val(3)])]),
                            call(sym("plus"), [sym("a"), sym("b")]),
                        ],
                    ),
                    success(8),
                ),
            ],
        );
    }

    fn run_cases_in(env: &mut Environment, cases: Vec<(Value, TestResult)>) {
        for (i, (expr, expected)) in cases.iter().enumerate() {
            execute_test_case(expr, expected, env, &format!("Case #{}", i + 1));
        }
    }

    #[test]
    fn test_let_scopes_new_names_and_assigns_existing_ones() {
        let mut env = Environment::with_builtins();
        env.define("x", val(1));

        let expr = call(
            sym("let"),
            [
                val(vec![sym("y"), val(5)]),
                call(sym("setq"), [sym("x"), val(100)]),
                call(sym("setq"), [sym("w"), sym("y")]),
            ],
        );
        assert_eq!(eval(&expr, &mut env).unwrap(), val(5));
        assert_eq!(env.get("x"), Some(val(100)));
        assert!(!env.contains("y"));
        assert!(!env.contains("w"));
    }

    #[test]
    fn test_lambda_resolves_names_at_call_time() {
        let mut env = Environment::with_builtins();
        env.define("x", val(1));
        let get_x = eval(
            &call(sym("lambda"), [val(Vec::<Value>::new()), sym("x")]),
            &mut env,
        )
        .unwrap();
        env.define("x", val(2));
        assert_eq!(apply(&get_x, vec![], Keywords::new()).unwrap(), val(2));

        // A name bound only after the lambda was built
        let get_later = eval(
            &call(sym("lambda"), [val(Vec::<Value>::new()), sym("later")]),
            &mut env,
        )
        .unwrap();
        assert!(matches!(
            apply(&get_later, vec![], Keywords::new()),
            Err(crate::Error::UnboundName(_))
        ));
        eval(&call(sym("setq"), [sym("later"), val("bound")]), &mut env).unwrap();
        assert_eq!(apply(&get_later, vec![], Keywords::new()).unwrap(), val("bound"));
    }

    #[test]
    fn test_recursion_through_setq() {
        let mut env = Environment::with_builtins();
        // setq(fact, lambda([n], if(<(n, 2), 1, *(n, fact(-(n, 1))))))
        let body = call(
            sym("if"),
            [
                call(sym("<"), [sym("n"), val(2)]),
                val(1),
                call(
                    sym("*"),
                    [
                        sym("n"),
                        call(sym("fact"), [call(sym("-"), [sym("n"), val(1)])]),
                    ],
                ),
            ],
        );
        let define = call(
            sym("setq"),
            [sym("fact"), call(sym("lambda"), [val(vec![sym("n")]), body])],
        );
        eval(&define, &mut env).unwrap();
        assert_eq!(
            eval(&call(sym("fact"), [val(5)]), &mut env).unwrap(),
            val(120)
        );
        assert_eq!(
            eval(&call(sym("fact"), [val(1)]), &mut env).unwrap(),
            val(1)
        );
    }

    #[test]
    fn test_clones_share_their_scope() {
        let env = Environment::new();
        let mut alias = env.clone();
        assert!(env.same_scope(&alias));
        alias.define("shared", val(1));
        assert_eq!(env.get("shared"), Some(val(1)));

        let mut child = Environment::with_parent(env.clone());
        assert!(!child.same_scope(&env));
        child.set(&Symbol::new("shared"), val(2));
        child.set(&Symbol::new("local"), val(3));
        assert_eq!(env.get("shared"), Some(val(2)));
        assert!(!env.contains("local"));
        assert_eq!(child.get("local"), Some(val(3)));
        assert_eq!(format!("{env:?}"), "Environment { bindings: [\"shared\"], parent: None }");
    }

    #[test]
    fn test_lambda_optional_and_rest_parameters() {
        let mut env = Environment::with_builtins();
        // lambda([a, [b, *(2, 5)], &rest, more, &kwargs, opts], list(a, b, more, opts))
        let f = eval(
            &call(
                sym("lambda"),
                [
                    val(vec![
                        sym("a"),
                        val(vec![sym("b"), call(sym("*"), [val(2), val(5)])]),
                        sym("&rest"),
                        sym("more"),
                        sym("&kwargs"),
                        sym("opts"),
                    ]),
                    call(sym("list"), [sym("a"), sym("b"), sym("more"), sym("opts")]),
                ],
            ),
            &mut env,
        )
        .unwrap();
        env.define("f", f);

        let no_opts = || val(Keywords::new());
        run_cases_in(
            &mut env,
            vec![
                // The default was evaluated when the lambda was built
                (
                    call(sym("f"), [val(1)]),
                    EvalResult(val(vec![val(1), val(10), val(Vec::<Value>::new()), no_opts()])),
                ),
                (
                    call(sym("f"), [val(1), val(2), val(3), val(4)]),
                    EvalResult(val(vec![val(1), val(2), val([3, 4]), no_opts()])),
                ),
                (
                    CallNode::new(sym("f"))
                        .arg(val(1))
                        .named("b", val(7))
                        .named("verbose", val(true))
                        .into_value(),
                    EvalResult(val(vec![
                        val(1),
                        val(7),
                        val(Vec::<Value>::new()),
                        val(Keywords::from_iter([("verbose", val(true))])),
                    ])),
                ),
                (
                    CallNode::new(sym("f")).named("b", val(7)).into_value(),
                    SpecificError("ArityError"),
                ),
                (
                    CallNode::new(sym("f"))
                        .args([val(1), val(2)])
                        .named("b", val(3))
                        .into_value(),
                    SpecificError("multiple values"),
                ),
            ],
        );

        // Without &rest and &kwargs, extras are errors
        let g = eval(
            &call(
                sym("lambda"),
                [val(vec![sym("a"), val(vec![sym("b"), val(0)])]), call(sym("+"), [sym("a"), sym("b")])],
            ),
            &mut env,
        )
        .unwrap();
        env.define("g", g);
        run_cases_in(
            &mut env,
            vec![
                (call(sym("g"), [val(5)]), success(5)),
                (call(sym("g"), [val(5), val(1)]), success(6)),
                (call(sym("g"), [val(1), val(2), val(3)]), SpecificError("ArityError")),
                (
                    CallNode::new(sym("g")).arg(val(1)).named("c", val(2)).into_value(),
                    SpecificError("unexpected keyword"),
                ),
            ],
        );
    }

    #[test]
    fn test_malformed_parameter_lists() {
        let lambda = |params: Vec<Value>| call(sym("lambda"), [val(params), val(1)]);
        run_comprehensive_tests(vec![
            (
                lambda(vec![val(vec![sym("a"), val(1)]), sym("b")]),
                SpecificError("follows optional"),
            ),
            (lambda(vec![sym("&rest")]), SpecificError("must be followed by a symbol")),
            (
                lambda(vec![sym("&rest"), sym("a"), sym("&rest"), sym("b")]),
                SpecificError("misplaced"),
            ),
            (
                lambda(vec![sym("&kwargs"), sym("a"), sym("&rest"), sym("b")]),
                SpecificError("misplaced"),
            ),
            (
                lambda(vec![sym("&rest"), sym("a"), val(vec![sym("b"), val(1)])]),
                SpecificError("follows &rest"),
            ),
            (lambda(vec![val(vec![val(1), val(2)])]), SpecificError("[name, default]")),
            (lambda(vec![val(3)]), SpecificError("requires a symbol")),
            (
                lambda(vec![sym("a"), sym("&rest"), sym("a")]),
                SpecificError("Duplicate parameter"),
            ),
            (
                call(sym("lambda"), [sym("a"), val(1)]),
                SpecificError("parameters must be a list"),
            ),
        ]);
    }

    #[test]
    fn test_mac_builds_expansions_from_raw_arguments() {
        let mut env = Environment::with_builtins();
        // mac([c, a, b], node(if, c, b, a))
        let unless = eval(
            &call(
                sym("mac"),
                [
                    val(vec![sym("c"), sym("a"), sym("b")]),
                    call(sym("node"), [sym("if"), sym("c"), sym("b"), sym("a")]),
                ],
            ),
            &mut env,
        )
        .unwrap();
        assert_eq!(unless.type_name(), "macro");
        env.define("unless", unless);

        let calls = Arc::new(AtomicUsize::new(0));
        env.define("count", counting_fn("count", &calls, val("counted")).into());
        let counted = call(sym("count"), Vec::<Value>::new());

        assert_eq!(
            eval(&call(sym("unless"), [val(false), val("a"), counted.clone()]), &mut env).unwrap(),
            val("a")
        );
        // The untaken branch reached the expansion unevaluated
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            eval(&call(sym("unless"), [val(true), val("a"), counted]), &mut env).unwrap(),
            val("counted")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_defn_and_defmac() {
        let mut env = Environment::with_builtins();
        // defn(inc, [n, [by, 1]], +(n, by)) returns the function it bound
        let defined = eval(
            &call(
                sym("defn"),
                [
                    sym("inc"),
                    val(vec![sym("n"), val(vec![sym("by"), val(1)])]),
                    call(sym("+"), [sym("n"), sym("by")]),
                ],
            ),
            &mut env,
        )
        .unwrap();
        assert_eq!(Some(defined.clone()), env.get("inc"));
        let Value::Function(inc) = &defined else {
            panic!("defn should return a function");
        };
        assert_eq!(inc.name(), "inc");

        // defmac(unless, [c, a, b], node(if, c, b, a))
        eval(
            &call(
                sym("defmac"),
                [
                    sym("unless"),
                    val(vec![sym("c"), sym("a"), sym("b")]),
                    call(sym("node"), [sym("if"), sym("c"), sym("b"), sym("a")]),
                ],
            ),
            &mut env,
        )
        .unwrap();
        assert_eq!(env.get("unless").unwrap().type_name(), "macro");

        run_cases_in(
            &mut env,
            vec![
                (call(sym("inc"), [val(41)]), success(42)),
                (call(sym("inc"), [val(40), val(2)]), success(42)),
                (call(sym("unless"), [val(false), val("a"), val("b")]), success("a")),
                (
                    call(sym("unless"), [val(1), sym("missing"), call(sym("inc"), [val(0)])]),
                    success(1),
                ),
                (
                    call(sym("defn"), [val(1), val(Vec::<Value>::new()), val(1)]),
                    SpecificError("requires a symbol"),
                ),
            ],
        );
    }

    #[test]
    fn test_thread_quote_eval_and_scope() {
        let mut env = Environment::with_builtins();
        env.define("n", val(5));
        run_cases_in(
            &mut env,
            vec![
                // thread(n, -(1), *(10)) => *(-(n, 1), 10)
                (
                    call(
                        sym("thread"),
                        [
                            sym("n"),
                            call(sym("-"), [val(1)]),
                            call(sym("*"), [val(10)]),
                        ],
                    ),
                    success(40),
                ),
                // thread_tail(n, -(1)) => -(1, n)
                (
                    call(sym("thread_tail"), [sym("n"), call(sym("-"), [val(1)])]),
                    success(-4),
                ),
                (call(sym("thread"), [sym("n")]), success(5)),
                (call(sym("quote"), [sym("n")]), EvalResult(sym("n"))),
                (
                    call(sym("quote"), [call(sym("+"), [val(1), val(2)])]),
                    EvalResult(call(sym("+"), [val(1), val(2)])),
                ),
                // eval(quote(+(1, 2))) evaluates the quoted node
                (
                    call(
                        sym("eval"),
                        [call(sym("quote"), [call(sym("+"), [val(1), val(2)])])],
                    ),
                    success(3),
                ),
            ],
        );

        let mut small = Environment::new();
        small.define("b", val(2));
        small.define("a", val(1));
        small.register_macro("scope", eval_scope);
        let scope = eval(&call(sym("scope"), Vec::<Value>::new()), &mut small).unwrap();
        let Value::Map(bindings) = scope else {
            panic!("scope should return a map");
        };
        let names: Vec<&str> = bindings.keys().collect();
        assert_eq!(names, vec!["a", "b", "scope"]);
    }

    #[test]
    fn test_call_node_entry_points() {
        let node = CallNode::new(add_fn()).arg(sym("x")).arg(sym("y"));
        let kwargs: Keywords = [("x", val(40)), ("y", val(2))].into_iter().collect();
        assert_eq!(node.call(kwargs).unwrap(), val(42));
        assert!(matches!(
            node.call(Keywords::new()),
            Err(crate::Error::UnboundName(_))
        ));

        let mut env = Environment::new();
        env.define("x", val(1));
        env.define("y", val(1));
        assert_eq!(node.evaluate(&mut env).unwrap(), val(2));
    }

    #[test]
    fn test_evaluation_depth_limit() {
        let mut expr = val(0);
        let inc = Function::from_typed::<_, (i64,)>("inc", |n: i64| n + 1);
        for _ in 0..(MAX_EVAL_DEPTH + 10) {
            expr = call(inc.clone(), [expr]);
        }
        let err = eval(&expr, &mut Environment::new()).unwrap_err();
        assert!(err.to_string().contains("depth limit exceeded"));

        // The counter unwinds after the failure
        assert_eq!(
            eval(&call(inc, [val(1)]), &mut Environment::new()).unwrap(),
            val(2)
        );
    }

    #[test]
    fn test_arity_validation() {
        assert!(Arity::Exact(2).validate(2).is_ok());
        assert_eq!(Arity::Exact(2).validate(1), Err(crate::Error::arity_error(2, 1)));
        assert!(Arity::AtLeast(1).validate(5).is_ok());
        assert_eq!(Arity::AtLeast(1).validate(0), Err(crate::Error::arity_error(1, 0)));
        assert_eq!(Arity::Range(1, 2).validate(3), Err(crate::Error::arity_error(2, 3)));
        assert!(Arity::Any.validate(100).is_ok());
    }

    #[test]
    fn test_register_typed_operations() {
        fn safe_div(a: i64, b: i64) -> Result<i64, crate::Error> {
            if b == 0 {
                Err(crate::Error::EvalError("division by zero".into()))
            } else {
                Ok(a / b)
            }
        }
        fn sum(nums: NumIter<'_>) -> i64 {
            nums.sum()
        }

        let mut env = Environment::new();
        env.register_builtin_operation::<_, (i64, i64)>("div", safe_div);
        env.register_variadic_builtin_operation::<_, (NumIter<'static>,)>(
            "sum",
            Arity::AtLeast(1),
            sum,
        );

        run_cases_in(
            &mut env,
            vec![
                (call(sym("div"), [val(84), val(2)]), success(42)),
                (call(sym("div"), [val(1), val(0)]), SpecificError("division by zero")),
                (call(sym("sum"), [val(1), val(2), val(3)]), success(6)),
                (call(sym("sum"), Vec::<Value>::new()), SpecificError("ArityError")),
            ],
        );
    }
}
