//! The machine's five cooperating stacks.
//!
//! Elements and values are JSON nodes, commands are reusable instruction
//! sequences, and the two breadcrumb stacks (paths and locators) always move in
//! lock-step so `MoveOut` can restore the cursor.

use std::fmt::{self, Write as _};
use std::rc::Rc;

use thiserror::Error;

use crate::instruction::Instruction;
use crate::value::JValue;

/// Pop or peek past the bottom of a stack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stack} stack underflow: depth {depth} requested, {len} available")]
pub struct StackUnderflow {
    pub stack: &'static str,
    pub depth: usize,
    pub len: usize,
}

/// One step of the cursor below its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    ObjectField(String),
    ArrayIndex(usize),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::ObjectField(name) => write!(f, ".{}", name),
            Locator::ArrayIndex(i) => write!(f, "[{}]", i),
        }
    }
}

// ---------------------------------------------------------------------------
// Stack<T>
// ---------------------------------------------------------------------------

/// A named LIFO stack. Depth 0 is the top.
#[derive(Debug, Clone)]
pub struct Stack<T> {
    name: &'static str,
    items: Vec<T>,
}

impl<T> Stack<T> {
    pub fn new(name: &'static str) -> Self {
        Stack {
            name,
            items: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Result<T, StackUnderflow> {
        let len = self.items.len();
        self.items.pop().ok_or(StackUnderflow {
            stack: self.name,
            depth: 0,
            len,
        })
    }

    #[inline]
    pub fn peek(&self) -> Result<&T, StackUnderflow> {
        self.peek_at(0)
    }

    /// Element `depth` positions below the top.
    pub fn peek_at(&self, depth: usize) -> Result<&T, StackUnderflow> {
        let len = self.items.len();
        if depth >= len {
            return Err(StackUnderflow {
                stack: self.name,
                depth,
                len,
            });
        }
        Ok(&self.items[len - 1 - depth])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// The top `n` items, top first. Fewer are returned when the stack is shallower.
    pub fn top_n(&self, n: usize) -> Vec<&T> {
        self.items.iter().rev().take(n).collect()
    }

    /// Bottom-to-top iteration.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn swap_top(&mut self) -> Result<(), StackUnderflow> {
        let len = self.items.len();
        if len < 2 {
            return Err(StackUnderflow {
                stack: self.name,
                depth: 1,
                len,
            });
        }
        self.items.swap(len - 1, len - 2);
        Ok(())
    }

    /// `[bottom, middle, top]` becomes `[middle, top, bottom]`.
    pub fn rotate_top3(&mut self) -> Result<(), StackUnderflow> {
        let len = self.items.len();
        if len < 3 {
            return Err(StackUnderflow {
                stack: self.name,
                depth: 2,
                len,
            });
        }
        self.items[len - 3..].rotate_left(1);
        Ok(())
    }
}

impl<T: Clone> Stack<T> {
    pub fn dup_top(&mut self) -> Result<(), StackUnderflow> {
        let top = self.peek()?.clone();
        self.items.push(top);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StackManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StackManager {
    pub elements: Stack<JValue>,
    pub values: Stack<JValue>,
    pub commands: Stack<Rc<[Instruction]>>,
    pub paths: Stack<String>,
    pub states: Stack<Locator>,
}

impl Default for StackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StackManager {
    pub fn new() -> Self {
        StackManager {
            elements: Stack::new("element"),
            values: Stack::new("value"),
            commands: Stack::new("command"),
            paths: Stack::new("path"),
            states: Stack::new("state"),
        }
    }

    pub fn clear_all(&mut self) {
        self.elements.clear();
        self.values.clear();
        self.commands.clear();
        self.paths.clear();
        self.states.clear();
    }

    /// Sizes of every stack plus the element and value contents, top first.
    pub fn debug_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "stacks: elements={} values={} commands={} paths={} states={}",
            self.elements.len(),
            self.values.len(),
            self.commands.len(),
            self.paths.len(),
            self.states.len()
        );
        for (depth, element) in self.elements.top_n(self.elements.len()).iter().enumerate() {
            let _ = writeln!(out, "  element[{}] = {}", depth, element);
        }
        for (depth, value) in self.values.top_n(self.values.len()).iter().enumerate() {
            let _ = writeln!(out, "  value[{}] = {}", depth, value);
        }
        out
    }
}
