//! Standard combinator library.
//!
//! Stack notation in the docs lists the top of the stack last:
//! `a b -- b a` means `b` was on top before and `a` is on top after.
//! Quoted programs are `List` values.
//!
//! Each function returns a clone of a shared instance, so `dup() == dup()`.

use crate::ast::{Keywords, Value};
use crate::combinator::{Combinator, Phrase, fold, positional_arguments};
use crate::evaluator::apply;
use crate::stack::Stack;
use crate::Error;
use std::sync::LazyLock;

macro_rules! library {
    ($($(#[$doc:meta])* $func:ident($name:literal) => $body:path;)*) => {
        $(
            $(#[$doc])*
            pub fn $func() -> Combinator {
                static INSTANCE: LazyLock<Combinator> =
                    LazyLock::new(|| Combinator::explicit($name, $body));
                INSTANCE.clone()
            }
        )*
    };
}

/// Pop `N` values, deepest first
fn pop_array<const N: usize>(stack: &Stack) -> Result<(Stack, [Value; N]), Error> {
    let (rest, values) = stack.pop_n(N)?;
    let values = <[Value; N]>::try_from(values).map_err(|values| Error::StackUnderflow {
        needed: N,
        available: values.len(),
    })?;
    Ok((rest, values))
}

fn quoted(name: &str, value: Value) -> Result<Vec<Value>, Error> {
    match value {
        Value::List(program) => Ok(program),
        other => Err(Error::NotIterable(format!(
            "{name} expected a quoted program, got {}",
            other.type_name()
        ))),
    }
}

fn count(name: &str, value: Value) -> Result<usize, Error> {
    match value {
        Value::Number(n) => usize::try_from(n)
            .map_err(|_| Error::TypeError(format!("{name} expected a non-negative count, got {n}"))),
        other => Err(Error::TypeError(format!(
            "{name} expected a count, got {}",
            other.type_name()
        ))),
    }
}

macro_rules! phrases {
    ($($(#[$doc:meta])* $func:ident($name:literal) => [$($item:expr),* $(,)?];)*) => {
        $(
            $(#[$doc])*
            pub fn $func() -> Combinator {
                static INSTANCE: LazyLock<Combinator> =
                    LazyLock::new(|| Phrase::new($name, [$(Value::from($item)),*]).into());
                INSTANCE.clone()
            }
        )*
    };
}

fn top_after(stack: Stack, program: &[Value]) -> Result<Value, Error> {
    fold(stack, program)?.peek().cloned()
}

//
// Stack shuffles
//

fn pop_top(stack: Stack) -> Result<Stack, Error> {
    stack.pop().map(|(rest, _)| rest)
}

fn dup_top(stack: Stack) -> Result<Stack, Error> {
    let top = stack.peek()?.clone();
    Ok(stack.push(top))
}

fn no_op(stack: Stack) -> Result<Stack, Error> {
    Ok(stack)
}

fn swap_top(stack: Stack) -> Result<Stack, Error> {
    let (rest, [a, b]) = pop_array(&stack)?;
    Ok(rest.push(b).push(a))
}

fn pop_under(stack: Stack) -> Result<Stack, Error> {
    let (rest, [_, b]) = pop_array(&stack)?;
    Ok(rest.push(b))
}

fn dup_under(stack: Stack) -> Result<Stack, Error> {
    let (rest, [a, b]) = pop_array(&stack)?;
    Ok(rest.push(a.clone()).push(a).push(b))
}

//
// Data
//

fn quote_n(stack: Stack) -> Result<Stack, Error> {
    let (rest, n) = stack.pop()?;
    let (rest, items) = rest.pop_n(count("quote", n)?)?;
    Ok(rest.push(Value::List(items)))
}

fn choose(stack: Stack) -> Result<Stack, Error> {
    let (rest, [b, t, f]) = pop_array(&stack)?;
    Ok(rest.push(if b.is_truthy() { t } else { f }))
}

fn call_function(stack: Stack) -> Result<Stack, Error> {
    let (rest, [args, func]) = pop_array(&stack)?;
    let (rest, args, kwargs) = match args {
        Value::Map(kwargs) => {
            let (rest, args) = rest.pop()?;
            (rest, positional_arguments("do", args)?, kwargs)
        }
        args => (rest, positional_arguments("do", args)?, Keywords::new()),
    };
    Ok(rest.push(apply(&func, args, kwargs)?))
}

fn cons_onto(stack: Stack) -> Result<Stack, Error> {
    let (rest, [p, q]) = pop_array(&stack)?;
    let mut items = vec![p];
    items.extend(quoted("cons", q)?);
    Ok(rest.push(Value::List(items)))
}

fn take_into(stack: Stack) -> Result<Stack, Error> {
    let (rest, [p, q]) = pop_array(&stack)?;
    let mut items = quoted("take", p)?;
    items.push(q);
    Ok(rest.push(Value::List(items)))
}

//
// Quotation
//

fn unquote(stack: Stack) -> Result<Stack, Error> {
    let (rest, p) = stack.pop()?;
    fold(rest, &quoted("i", p)?)
}

fn unquote_second(stack: Stack) -> Result<Stack, Error> {
    let (rest, [_, q]) = pop_array(&stack)?;
    fold(rest, &quoted("k", q)?)
}

fn unquote_keep(stack: Stack) -> Result<Stack, Error> {
    let p = quoted("x", stack.peek()?.clone())?;
    fold(stack, &p)
}

fn dip_one(stack: Stack) -> Result<Stack, Error> {
    let (rest, [x, p]) = pop_array(&stack)?;
    Ok(fold(rest, &quoted("dip", p)?)?.push(x))
}

fn dip_two(stack: Stack) -> Result<Stack, Error> {
    let (rest, [x, y, p]) = pop_array(&stack)?;
    Ok(fold(rest, &quoted("dipd", p)?)?.push(x).push(y))
}

fn dip_three(stack: Stack) -> Result<Stack, Error> {
    let (rest, [x, y, z, p]) = pop_array(&stack)?;
    Ok(fold(rest, &quoted("dipdd", p)?)?.push(x).push(y).push(z))
}

fn step_each(stack: Stack) -> Result<Stack, Error> {
    let (rest, [items, p]) = pop_array(&stack)?;
    let items = positional_arguments("step", items)?;
    let p = quoted("step", p)?;
    items
        .into_iter()
        .try_fold(rest, |stack, item| fold(stack.push(item), &p))
}

fn run_nullary(stack: Stack) -> Result<Stack, Error> {
    let (rest, p) = stack.pop()?;
    let top = top_after(rest.clone(), &quoted("nullary", p)?)?;
    Ok(rest.push(top))
}

fn run_cleave(stack: Stack) -> Result<Stack, Error> {
    let (rest, [x, p, q]) = pop_array(&stack)?;
    let first = top_after(rest.push(x.clone()), &quoted("cleave", p)?)?;
    let second = top_after(rest.push(x), &quoted("cleave", q)?)?;
    Ok(rest.push(first).push(second))
}

fn run_ifte(stack: Stack) -> Result<Stack, Error> {
    let (rest, [b, t, e]) = pop_array(&stack)?;
    let condition = top_after(rest.clone(), &quoted("ifte", b)?)?;
    let branch = if condition.is_truthy() { t } else { e };
    fold(rest, &quoted("ifte", branch)?)
}

fn run_times(stack: Stack) -> Result<Stack, Error> {
    let (rest, [n, p]) = pop_array(&stack)?;
    let n = count("times", n)?;
    let p = quoted("times", p)?;
    (0..n).try_fold(rest, |stack, _| fold(stack, &p))
}

fn run_infra(stack: Stack) -> Result<Stack, Error> {
    let (rest, [a, p]) = pop_array(&stack)?;
    // The first list element is the top of the inner stack
    let inner = match a {
        Value::Stack(inner) => inner,
        Value::List(items) => items.into_iter().rev().collect(),
        other => {
            return Err(Error::NotIterable(format!(
                "infra expected a list or stack, got {}",
                other.type_name()
            )));
        }
    };
    let result = fold(inner, &quoted("infra", p)?)?;
    Ok(rest.push(Value::Stack(result)))
}

fn run_subspace(stack: Stack) -> Result<Stack, Error> {
    let (rest, [a, p]) = pop_array(&stack)?;
    let inner = match a {
        Value::Stack(inner) => inner,
        Value::List(items) => Stack::from_values(items),
        other => {
            return Err(Error::NotIterable(format!(
                "subspace expected a list or stack, got {}",
                other.type_name()
            )));
        }
    };
    let result = fold(inner, &quoted("subspace", p)?)?;
    Ok(rest.push(Value::Stack(result)))
}

//
// Classic combinators
//

fn run_b(stack: Stack) -> Result<Stack, Error> {
    let (rest, [p, q]) = pop_array(&stack)?;
    let stack = fold(rest, &quoted("b", p)?)?;
    fold(stack, &quoted("b", q)?)
}

fn run_s(stack: Stack) -> Result<Stack, Error> {
    let (rest, [p, q, r]) = pop_array(&stack)?;
    let mut consed = vec![p.clone()];
    consed.extend(quoted("s", q)?);
    fold(rest.push(Value::List(consed)).push(p), &quoted("s", r)?)
}

fn run_t(stack: Stack) -> Result<Stack, Error> {
    let (rest, [p, q]) = pop_array(&stack)?;
    fold(rest.push(q), &quoted("t", p)?)
}

fn run_j(stack: Stack) -> Result<Stack, Error> {
    let (rest, [p, q, r, s]) = pop_array(&stack)?;
    let s = quoted("j", s)?;
    let stack = fold(rest.push(q).push(p), &s)?;
    fold(stack.push(r), &s)
}

/// `[a..] x -- [a.. x]` for a quoted pair
fn append_item(args: Vec<Value>, _kwargs: Keywords) -> Result<Value, Error> {
    let [items, item] = <[Value; 2]>::try_from(args)
        .map_err(|args| Error::arity_error(2, args.len()))?;
    let mut items = quoted("et", items)?;
    items.push(item);
    Ok(Value::List(items))
}

library! {
    /// `a --`
    pop("pop") => pop_top;
    /// `a -- a a`
    dup("dup") => dup_top;
    /// Leaves the stack unchanged
    nop("nop") => no_op;
    /// `a b -- b a`
    swap("swap") => swap_top;
    /// `a b -- b`
    popd("popd") => pop_under;
    /// `a b -- a a b`
    dupd("dupd") => dup_under;

    /// `x1 .. xn n -- [x1 .. xn]`
    quote("quote") => quote_n;
    /// `b t f -- t` if `b` is truthy, else `f`
    choice("choice") => choose;
    /// `args f -- result` or `args kwargs f -- result`.
    ///
    /// Calls a function or `Def` from the stack. A keyword map directly
    /// beneath the callable is passed as keyword arguments.
    r#do("do") => call_function;
    /// `p [q..] -- [p q..]`
    cons("cons") => cons_onto;
    /// `[p..] q -- [p.. q]`
    take("take") => take_into;

    /// `[p] -- ...`: folds `p`
    i("i") => unquote;
    /// `p [q] -- ...`: discards `p` and folds `q`
    k("k") => unquote_second;
    /// `[p] -- [p] ...`: folds `p`, keeping it
    x("x") => unquote_keep;
    /// `x [p] -- ... x`
    dip("dip") => dip_one;
    /// `x y [p] -- ... x y`
    dipd("dipd") => dip_two;
    /// `x y z [p] -- ... x y z`
    dipdd("dipdd") => dip_three;
    /// `[a..] [p] -- ...`: pushes each element and folds `p` after it
    step("step") => step_each;
    /// `[p] -- r`: pushes the top `p` leaves, restoring the rest
    nullary("nullary") => run_nullary;
    /// `x [p] [q] -- r s`: applies both programs to `x`
    cleave("cleave") => run_cleave;
    /// `[b] [t] [e] -- ...`
    ///
    /// Folds `b` on the current stack, then restores the stack and folds `t`
    /// if the result was truthy and `e` otherwise.
    ifte("ifte") => run_ifte;
    /// `n [p] -- ...`: folds `p` `n` times
    times("times") => run_times;
    /// `[a..] [p] -- stack`
    ///
    /// Folds `p` over a stack built from the list with its first element on
    /// top, pushing the resulting stack. Stacks are used as they are.
    infra("infra") => run_infra;
    /// `[a..] [p] -- stack`: like `infra` but the last element is on top
    subspace("subspace") => run_subspace;

    /// `[p] [q] -- ...`: folds `p`, then `q`
    b("b") => run_b;
    /// `p [q] [r] -- [p q..] p ...`: conses `p` onto `q`, then folds `r`
    /// over `p`
    s("s") => run_s;
    /// `[p] q -- q ...`: folds `p` over `q`
    t("t") => run_t;
    /// `p q r [s] -- q p ... r ...`: folds `s` over `q p`, then again after
    /// pushing `r`
    j("j") => run_j;
}

phrases! {
    /// `x y [q] -- y x ...`: swaps the two values beneath `[q]`, then folds it.
    /// The phrase `[swap] dip i`.
    c("c") => [vec![Value::from(swap())], dip(), i()];
    /// `x [q] -- x x ...`: duplicates the value beneath `[q]`, then folds it.
    /// The phrase `[dup] dip i`.
    w("w") => [vec![Value::from(dup())], dip(), i()];

    /// `a -- [a]`
    un("un") => [1, quote()];
    /// `a b -- [a b]`
    bi("bi") => [2, quote()];
    /// `a b c -- [a b c]`
    tri("tri") => [3, quote()];
    /// `[a..] x -- [a.. x]`
    et("et") => [bi(), Combinator::positional("append", append_item)];
}

/// Every library combinator, for binding by name
pub fn all() -> Vec<Combinator> {
    vec![
        pop(),
        dup(),
        nop(),
        swap(),
        popd(),
        dupd(),
        quote(),
        choice(),
        r#do(),
        cons(),
        take(),
        i(),
        k(),
        x(),
        dip(),
        dipd(),
        dipdd(),
        step(),
        nullary(),
        cleave(),
        ifte(),
        times(),
        infra(),
        subspace(),
        b(),
        s(),
        t(),
        j(),
        c(),
        w(),
        un(),
        bi(),
        tri(),
        et(),
    ]
}
