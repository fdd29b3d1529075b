//! Persistent stack threaded through combinator programs.
//!
//! A [`Stack`] is an immutable singly linked list of shared nodes. Pushing
//! and popping produce new stacks that share their tail with the original,
//! so a published stack never changes.

use crate::Error;
use crate::ast::Value;
use std::fmt;
use std::sync::Arc;

struct Node {
    value: Value,
    below: Option<Arc<Node>>,
    /// Number of elements from this node down
    depth: usize,
}

#[derive(Clone, Default)]
pub struct Stack {
    top: Option<Arc<Node>>,
}

impl Stack {
    pub fn new() -> Self {
        Stack { top: None }
    }

    /// Build a stack by pushing `values` in order; the last one ends on top
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        values
            .into_iter()
            .fold(Stack::new(), |stack, value| stack.push(value))
    }

    pub fn len(&self) -> usize {
        self.top.as_ref().map_or(0, |node| node.depth)
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }

    /// A new stack with `value` on top of this one
    pub fn push(&self, value: Value) -> Stack {
        let depth = self.len() + 1;
        Stack {
            top: Some(Arc::new(Node {
                value,
                below: self.top.clone(),
                depth,
            })),
        }
    }

    /// Push several values in order
    pub fn push_all<I>(&self, values: I) -> Stack
    where
        I: IntoIterator<Item = Value>,
    {
        values
            .into_iter()
            .fold(self.clone(), |stack, value| stack.push(value))
    }

    /// The rest of the stack and its top element
    pub fn pop(&self) -> Result<(Stack, Value), Error> {
        match &self.top {
            Some(node) => Ok((
                Stack {
                    top: node.below.clone(),
                },
                node.value.clone(),
            )),
            None => Err(Error::StackUnderflow {
                needed: 1,
                available: 0,
            }),
        }
    }

    /// The rest of the stack and its top `n` elements, deepest first
    pub fn pop_n(&self, n: usize) -> Result<(Stack, Vec<Value>), Error> {
        let available = self.len();
        if n > available {
            return Err(Error::StackUnderflow {
                needed: n,
                available,
            });
        }

        let mut values = Vec::with_capacity(n);
        let mut rest = self.top.clone();
        for _ in 0..n {
            // Length was checked above
            let Some(node) = rest else { break };
            values.push(node.value.clone());
            rest = node.below.clone();
        }
        values.reverse();
        Ok((Stack { top: rest }, values))
    }

    pub fn peek(&self) -> Result<&Value, Error> {
        self.top
            .as_deref()
            .map(|node| &node.value)
            .ok_or(Error::StackUnderflow {
                needed: 1,
                available: 0,
            })
    }

    /// The top `n` elements, deepest first
    pub fn peek_n(&self, n: usize) -> Result<Vec<Value>, Error> {
        self.pop_n(n).map(|(_, values)| values)
    }

    /// Iterate from the top of the stack down
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.top.as_deref(),
        }
    }

    /// Elements bottom first, the order they were pushed in
    pub fn to_vec(&self) -> Vec<Value> {
        let mut values: Vec<Value> = self.iter().cloned().collect();
        values.reverse();
        values
    }

    /// True if both stacks are the same allocation
    pub fn ptr_eq(&self, other: &Stack) -> bool {
        match (&self.top, &other.top) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

pub struct Iter<'a> {
    next: Option<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.below.as_deref();
        Some(&node.value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.next.map_or(0, |node| node.depth);
        (len, Some(len))
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl<'a> IntoIterator for &'a Stack {
    type Item = &'a Value;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<Value> for Stack {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Stack::from_values(iter)
    }
}

impl Drop for Stack {
    // Unlink iteratively so dropping a long stack cannot overflow
    fn drop(&mut self) {
        let mut next = self.top.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut owned) => next = owned.below.take(),
                Err(_) => break,
            }
        }
    }
}

impl PartialEq for Stack {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || (self.len() == other.len() && self.iter().eq(other.iter()))
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stack(")?;
        for (i, value) in self.to_vec().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.to_vec()).finish()
    }
}
