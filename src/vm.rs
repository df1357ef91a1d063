//! Stack machine that executes compiled transformation programs.
//!
//! The machine owns one document and walks it with a cursor. The cursor is the
//! list of [`Locator`]s on the state breadcrumb stack, resolved from the root
//! whenever the current node is needed; the path breadcrumb stack keeps the
//! matching human-readable path for diagnostics. Writes go through
//! `Rc::make_mut`, so anything captured on the element stack is unaffected by
//! later edits to the document.
//!
//! Runaway programs are bounded twice: each `LoopUntil` level has its own
//! iteration ceiling and every executed instruction counts towards a global
//! operation ceiling (see [`MachineLimits`]).

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::instruction::{CompareOp, Instruction, LoopCondition, NodePredicate, ValueMapping};
use crate::stack::{Locator, StackManager, StackUnderflow};
use crate::value::JValue;

const ROOT_PATH: &str = "$";

/// Run-time errors
#[derive(Error, Debug, Clone)]
pub enum MachineError {
    #[error(transparent)]
    StackUnderflow(#[from] StackUnderflow),

    #[error("Navigation error: {0}")]
    Navigation(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Loop iteration limit of {limit} exceeded at loop level {level}")]
    LoopLimitExceeded { level: usize, limit: usize },

    #[error("Operation limit of {limit} exceeded, possible infinite loop")]
    OperationLimitExceeded { limit: usize },

    #[error("Array index {index} would pad an array of length {len} past the limit of {limit} new elements")]
    PaddingLimitExceeded {
        index: usize,
        len: usize,
        limit: usize,
    },

    /// A failure while dispatching one instruction, with the cursor path and a
    /// dump of the stacks at the time.
    #[error("{instruction} failed at {path}: {source}")]
    Instruction {
        instruction: String,
        path: String,
        stacks: String,
        #[source]
        source: Box<MachineError>,
    },
}

impl MachineError {
    /// The innermost error beneath any `Instruction` context layers.
    pub fn root_cause(&self) -> &MachineError {
        let mut err = self;
        while let MachineError::Instruction { source, .. } = err {
            err = source;
        }
        err
    }
}

/// Safety ceilings for one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineLimits {
    /// Iterations allowed per `LoopUntil` level.
    pub max_loop_iterations: usize,
    /// Instructions allowed across the whole run, loop bodies included.
    pub max_operations: usize,
    /// Placeholder elements one `MoveIntoIndex` may append to reach its index.
    pub max_array_padding: usize,
}

impl Default for MachineLimits {
    fn default() -> Self {
        MachineLimits {
            max_loop_iterations: 10_000,
            max_operations: 100_000,
            max_array_padding: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Cursor resolution
// ---------------------------------------------------------------------------

fn resolve<'a>(root: &'a JValue, trail: &[Locator]) -> Option<&'a JValue> {
    let mut node = root;
    for locator in trail {
        node = match locator {
            Locator::ObjectField(key) => node.get(key)?,
            Locator::ArrayIndex(i) => node.get_index(*i)?,
        };
    }
    Some(node)
}

fn resolve_mut<'a>(root: &'a mut JValue, trail: &[Locator]) -> Option<&'a mut JValue> {
    let mut node = root;
    for locator in trail {
        node = match locator {
            Locator::ObjectField(key) => node.as_object_mut()?.get_mut(key)?,
            Locator::ArrayIndex(i) => node.as_array_mut()?.get_mut(*i)?,
        };
    }
    Some(node)
}

fn detached() -> MachineError {
    MachineError::Navigation("cursor does not address a node".to_string())
}

fn requires(command: &str, expected: &str, found: &JValue) -> MachineError {
    MachineError::Navigation(format!(
        "{} requires the cursor to be {}, found {}",
        command,
        expected,
        found.type_name()
    ))
}

/// What a "move into field" command creates when the field is missing.
#[derive(Debug, Clone, Copy)]
enum Vivify {
    Object,
    /// Also replaces an existing non-array value.
    Array,
    /// `null` leaf, about to be overwritten.
    Placeholder,
}

impl Vivify {
    fn command(self) -> &'static str {
        match self {
            Vivify::Object => "MoveIntoObject",
            Vivify::Array => "MoveIntoArray",
            Vivify::Placeholder => "MoveIntoField",
        }
    }

    fn keeps(self, existing: &JValue) -> bool {
        match self {
            Vivify::Array => existing.is_array(),
            Vivify::Object | Vivify::Placeholder => true,
        }
    }

    fn fresh(self) -> JValue {
        match self {
            Vivify::Object => JValue::empty_object(),
            Vivify::Array => JValue::empty_array(),
            Vivify::Placeholder => JValue::Null,
        }
    }
}

fn number(value: &JValue) -> Result<i64, MachineError> {
    value.as_i64().ok_or(MachineError::TypeMismatch {
        expected: "number",
        found: value.type_name(),
    })
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

pub struct Machine {
    root: JValue,
    path: String,
    stacks: StackManager,
    loop_level: usize,
    loop_counters: HashMap<usize, usize>,
    total_operations: usize,
    limits: MachineLimits,
    trace: bool,
    /// Set once `Delete` removes the cursor's slot; cleared by any move back up.
    detached: bool,
}

impl Machine {
    pub fn new(document: JValue) -> Self {
        Machine {
            root: document,
            path: ROOT_PATH.to_string(),
            stacks: StackManager::new(),
            loop_level: 0,
            loop_counters: HashMap::new(),
            total_operations: 0,
            limits: MachineLimits::default(),
            trace: false,
            detached: false,
        }
    }

    /// Emit a `debug!` event before and a `trace!` event after every instruction.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_limits(mut self, limits: MachineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Run `instructions` in order and return the resulting document.
    ///
    /// Any failure aborts the run; the document keeps the edits made before it.
    pub fn execute(&mut self, instructions: &[Instruction]) -> Result<JValue, MachineError> {
        debug!(instructions = instructions.len(), trace = self.trace, "executing program");
        self.run_sequence(instructions)?;
        Ok(self.root.clone())
    }

    pub fn into_document(self) -> JValue {
        self.root
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn document(&self) -> &JValue {
        &self.root
    }

    pub fn current_path(&self) -> &str {
        &self.path
    }

    pub fn current_node(&self) -> Result<&JValue, MachineError> {
        if self.detached {
            return Err(detached());
        }
        resolve(&self.root, self.stacks.states.as_slice()).ok_or_else(detached)
    }

    pub fn value_stack_len(&self) -> usize {
        self.stacks.values.len()
    }

    pub fn element_stack_len(&self) -> usize {
        self.stacks.elements.len()
    }

    pub fn peek_value(&self, depth: usize) -> Result<&JValue, StackUnderflow> {
        self.stacks.values.peek_at(depth)
    }

    pub fn peek_element(&self, depth: usize) -> Result<&JValue, StackUnderflow> {
        self.stacks.elements.peek_at(depth)
    }

    pub fn loop_level(&self) -> usize {
        self.loop_level
    }

    pub fn total_operations(&self) -> usize {
        self.total_operations
    }

    pub fn limits(&self) -> MachineLimits {
        self.limits
    }

    pub fn stacks(&self) -> &StackManager {
        &self.stacks
    }

    /// Multi-line summary of cursor, counters and stacks.
    pub fn execution_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "path: {}", self.path);
        let _ = writeln!(
            out,
            "loop level: {}, operations: {}/{}",
            self.loop_level, self.total_operations, self.limits.max_operations
        );
        match self.current_node() {
            Ok(node) => {
                let _ = writeln!(out, "current: {}", node);
            }
            Err(_) => {
                let _ = writeln!(out, "current: <detached>");
            }
        }
        out.push_str(&self.stacks.debug_info());
        out
    }

    // ── Execution ────────────────────────────────────────────────────────

    fn run_sequence(&mut self, instructions: &[Instruction]) -> Result<(), MachineError> {
        for instruction in instructions {
            self.step(instruction)?;
        }
        Ok(())
    }

    fn step(&mut self, instruction: &Instruction) -> Result<(), MachineError> {
        if self.trace {
            debug!(instruction = %instruction, path = %self.path, "step");
        }

        if let Err(source) = self.dispatch(instruction) {
            return Err(MachineError::Instruction {
                instruction: instruction.to_string(),
                path: self.path.clone(),
                stacks: self.stacks.debug_info(),
                source: Box::new(source),
            });
        }

        if self.trace {
            trace!(
                instruction = instruction.name(),
                elements = self.stacks.elements.len(),
                values = self.stacks.values.len(),
                document = %self.root,
                "done"
            );
        }

        self.total_operations += 1;
        if self.total_operations > self.limits.max_operations {
            return Err(MachineError::OperationLimitExceeded {
                limit: self.limits.max_operations,
            });
        }
        Ok(())
    }

    fn dispatch(&mut self, instruction: &Instruction) -> Result<(), MachineError> {
        match instruction {
            // ── Navigation ───────────────────────────────────────────
            Instruction::MoveToRoot => self.move_to_root(),
            Instruction::MoveOut => self.move_out(),
            Instruction::MoveIntoObject(field) => self.enter_field(field, Vivify::Object)?,
            Instruction::MoveIntoArray(field) => self.enter_field(field, Vivify::Array)?,
            Instruction::MoveIntoField(field) => self.enter_field(field, Vivify::Placeholder)?,
            Instruction::MoveIntoIndex(operand) => {
                let index = operand.resolve(self)?;
                self.enter_index(&index)?;
            }

            // ── Element stack ────────────────────────────────────────
            Instruction::PushElement => {
                let node = self.current_node()?.clone();
                self.stacks.elements.push(node);
            }
            Instruction::PopElement => {
                let element = self.stacks.elements.pop()?;
                self.write_back(element)?;
            }
            Instruction::StoreElement(value) => self.write_back(value.clone())?,
            Instruction::DuplicateElement => self.stacks.elements.dup_top()?,
            Instruction::SwapElements => self.stacks.elements.swap_top()?,
            Instruction::RotateElements => self.stacks.elements.rotate_top3()?,
            Instruction::MapElement(table) => {
                let element = self.stacks.elements.pop()?;
                let mapped = map_value(table, element);
                self.stacks.elements.push(mapped);
            }

            // ── Value stack ──────────────────────────────────────────
            Instruction::StoreValue(operand) => {
                let value = operand.resolve(self)?;
                self.stacks.values.push(value);
            }
            Instruction::StoreSize => {
                let node = self.current_node()?;
                let size = node
                    .len()
                    .ok_or_else(|| requires("StoreSize", "an object or array", node))?;
                self.stacks.values.push(JValue::from(size));
            }
            Instruction::PopValue => {
                self.stacks.values.pop()?;
            }
            Instruction::Increment => {
                let n = self.pop_number()?;
                self.push_number(n.wrapping_add(1));
            }
            Instruction::Decrement => {
                let n = self.pop_number()?;
                self.push_number(n.wrapping_sub(1));
            }
            Instruction::Add => {
                let rhs = self.pop_number()?;
                let lhs = self.pop_number()?;
                self.push_number(lhs.wrapping_add(rhs));
            }
            Instruction::Subtract => {
                let rhs = self.pop_number()?;
                let lhs = self.pop_number()?;
                self.push_number(lhs.wrapping_sub(rhs));
            }
            Instruction::Negate => {
                let n = self.pop_number()?;
                self.push_number(n.wrapping_neg());
            }
            Instruction::Compare(op) => {
                let rhs = self.stacks.values.pop()?;
                let lhs = self.stacks.values.pop()?;
                let result = compare(*op, &lhs, &rhs)?;
                self.stacks.values.push(JValue::Bool(result));
            }
            Instruction::DuplicateValue => self.stacks.values.dup_top()?,
            Instruction::SwapValues => self.stacks.values.swap_top()?,
            Instruction::RotateValues => self.stacks.values.rotate_top3()?,
            Instruction::ElementToValue => {
                let element = self.stacks.elements.pop()?;
                self.stacks.values.push(element);
            }
            Instruction::ValueToElement => {
                let value = self.stacks.values.pop()?;
                self.stacks.elements.push(value);
            }

            // ── Control flow ─────────────────────────────────────────
            Instruction::PushCommand(body) => self.stacks.commands.push(body.clone()),
            Instruction::PopCommand => {
                let body = self.stacks.commands.peek()?.clone();
                self.run_sequence(&body)?;
            }
            Instruction::LoopUntil(condition) => self.loop_until(condition)?,
            Instruction::JumpIfTrue(inner) => {
                let value = self.stacks.values.pop()?;
                if value.truthiness() == Some(true) {
                    self.step(inner)?;
                }
            }
            Instruction::JumpIfFalse(inner) => {
                let value = self.stacks.values.pop()?;
                if value.truthiness() == Some(false) {
                    self.step(inner)?;
                }
            }
            Instruction::Reset => {
                self.move_to_root();
                self.stacks.clear_all();
                self.loop_level = 0;
                self.loop_counters.clear();
            }

            // ── Array operations ─────────────────────────────────────
            Instruction::MergeArrays | Instruction::ConcatArrays => {
                let second = self.stacks.elements.pop()?;
                let first = self.stacks.elements.pop()?;
                let joined = concat_arrays(&first, &second)?;
                self.stacks.elements.push(joined);
            }
            Instruction::FilterArray(predicate) => {
                let filtered = self.filter_current(predicate)?;
                self.write_back(filtered)?;
            }
            Instruction::MapArray(body) => {
                let mapped = self.map_current(body)?;
                self.write_back(mapped)?;
            }

            // ── Structure ────────────────────────────────────────────
            Instruction::CreateObject => self.write_back(JValue::empty_object())?,
            Instruction::CreateArray => self.write_back(JValue::empty_array())?,
            Instruction::Delete => self.delete_current()?,
            Instruction::MergeObjects => {
                let second = self.stacks.elements.pop()?;
                let first = self.stacks.elements.pop()?;
                let merged = merge_objects(&first, &second)?;
                self.stacks.elements.push(merged);
            }
        }
        Ok(())
    }

    // ── Navigation helpers ───────────────────────────────────────────────

    fn move_to_root(&mut self) {
        self.detached = false;
        self.path.clear();
        self.path.push_str(ROOT_PATH);
        self.stacks.paths.clear();
        self.stacks.states.clear();
    }

    fn move_out(&mut self) {
        if self.stacks.paths.is_empty() || self.stacks.states.is_empty() {
            return;
        }
        if let (Ok(path), Ok(_)) = (self.stacks.paths.pop(), self.stacks.states.pop()) {
            self.path = path;
            self.detached = false;
        }
    }

    fn descend(&mut self, locator: Locator) {
        let next = format!("{}{}", self.path, locator);
        let previous = std::mem::replace(&mut self.path, next);
        self.stacks.paths.push(previous);
        self.stacks.states.push(locator);
    }

    fn cursor_mut(&mut self) -> Result<&mut JValue, MachineError> {
        if self.detached {
            return Err(detached());
        }
        resolve_mut(&mut self.root, self.stacks.states.as_slice()).ok_or_else(detached)
    }

    fn enter_field(&mut self, field: &str, vivify: Vivify) -> Result<(), MachineError> {
        let node = self.cursor_mut()?;
        if !node.is_object() {
            return Err(requires(vivify.command(), "an object", node));
        }
        if let Some(map) = node.as_object_mut() {
            if !map.get(field).is_some_and(|existing| vivify.keeps(existing)) {
                map.insert(field.to_string(), vivify.fresh());
            }
        }
        self.descend(Locator::ObjectField(field.to_string()));
        Ok(())
    }

    fn enter_index(&mut self, index: &JValue) -> Result<(), MachineError> {
        let position = match index.as_index() {
            Some(position) => position,
            None if index.is_number() => {
                return Err(MachineError::Navigation(format!(
                    "array index {} is negative",
                    index
                )))
            }
            None => {
                return Err(MachineError::TypeMismatch {
                    expected: "number",
                    found: index.type_name(),
                })
            }
        };

        let limit = self.limits.max_array_padding;
        let node = self.cursor_mut()?;
        let found = node.type_name();
        let items = node.as_array_mut().ok_or_else(|| {
            MachineError::Navigation(format!(
                "MoveIntoIndex requires the cursor to be an array, found {}",
                found
            ))
        })?;
        let missing = position.saturating_add(1).saturating_sub(items.len());
        if missing > limit {
            return Err(MachineError::PaddingLimitExceeded {
                index: position,
                len: items.len(),
                limit,
            });
        }
        items.resize_with(items.len() + missing, JValue::empty_object);
        self.descend(Locator::ArrayIndex(position));
        Ok(())
    }

    /// Replace the node at the cursor, or the whole document at the root.
    fn write_back(&mut self, value: JValue) -> Result<(), MachineError> {
        if self.detached {
            return Err(detached());
        }
        let trail = self.stacks.states.as_slice();
        let Some((last, parents)) = trail.split_last() else {
            self.root = value;
            return Ok(());
        };
        let parent = resolve_mut(&mut self.root, parents).ok_or_else(detached)?;
        match last {
            Locator::ObjectField(key) => {
                let found = parent.type_name();
                let map = parent.as_object_mut().ok_or_else(|| {
                    MachineError::Navigation(format!(
                        "cannot write field {} into {}",
                        key, found
                    ))
                })?;
                map.insert(key.clone(), value);
            }
            Locator::ArrayIndex(i) => {
                let found = parent.type_name();
                let items = parent.as_array_mut().ok_or_else(|| {
                    MachineError::Navigation(format!("cannot write index {} into {}", i, found))
                })?;
                let len = items.len();
                let slot = items.get_mut(*i).ok_or_else(|| {
                    MachineError::Navigation(format!(
                        "index {} out of range for array of length {}",
                        i, len
                    ))
                })?;
                *slot = value;
            }
        }
        Ok(())
    }

    /// Remove the cursor's slot from its parent. The breadcrumb is kept, so a
    /// following `MoveOut` lands on the parent; until then the cursor is detached.
    fn delete_current(&mut self) -> Result<(), MachineError> {
        if self.detached {
            return Err(detached());
        }
        let trail = self.stacks.states.as_slice();
        let Some((last, parents)) = trail.split_last() else {
            return Err(MachineError::Navigation(
                "cannot delete the document root".to_string(),
            ));
        };
        let parent = resolve_mut(&mut self.root, parents).ok_or_else(detached)?;
        match last {
            Locator::ObjectField(key) => {
                if let Some(map) = parent.as_object_mut() {
                    map.shift_remove(key);
                }
            }
            Locator::ArrayIndex(i) => {
                if let Some(items) = parent.as_array_mut() {
                    if *i >= items.len() {
                        return Err(MachineError::Navigation(format!(
                            "index {} out of range for array of length {}",
                            i,
                            items.len()
                        )));
                    }
                    items.remove(*i);
                }
            }
        }
        self.detached = true;
        Ok(())
    }

    // ── Value helpers ────────────────────────────────────────────────────

    fn pop_number(&mut self) -> Result<i64, MachineError> {
        let value = self.stacks.values.pop()?;
        number(&value)
    }

    fn push_number(&mut self, n: i64) {
        self.stacks.values.push(JValue::from(n));
    }

    // ── Loops ────────────────────────────────────────────────────────────

    fn loop_until(&mut self, condition: &LoopCondition) -> Result<(), MachineError> {
        self.loop_level += 1;
        let level = self.loop_level;
        self.loop_counters.insert(level, 0);

        let result = self.run_loop(level, condition);

        let iterations = self.loop_counters.remove(&level).unwrap_or(0);
        self.loop_level = self.loop_level.saturating_sub(1);
        if !self.stacks.commands.is_empty() {
            let _ = self.stacks.commands.pop();
        }
        trace!(level, iterations, ok = result.is_ok(), "loop finished");
        result
    }

    fn run_loop(&mut self, level: usize, condition: &LoopCondition) -> Result<(), MachineError> {
        while !condition.is_met(self)? {
            let count = self.loop_counters.get(&level).copied().unwrap_or(0);
            if count >= self.limits.max_loop_iterations {
                return Err(MachineError::LoopLimitExceeded {
                    level,
                    limit: self.limits.max_loop_iterations,
                });
            }
            let body = self.stacks.commands.peek()?.clone();
            self.run_sequence(&body)?;
            self.loop_counters.insert(level, count + 1);
        }
        Ok(())
    }

    // ── Array operations ─────────────────────────────────────────────────

    fn filter_current(&self, predicate: &NodePredicate) -> Result<JValue, MachineError> {
        let node = self.current_node()?;
        let items = node
            .as_array()
            .ok_or_else(|| requires("FilterArray", "an array", node))?;
        let kept = items
            .iter()
            .filter(|item| predicate.test(item))
            .cloned()
            .collect();
        Ok(JValue::array(kept))
    }

    /// Run `body` on a fresh machine per element, each owning its element as root.
    fn map_current(&self, body: &[Instruction]) -> Result<JValue, MachineError> {
        let node = self.current_node()?;
        let items = node
            .as_array()
            .ok_or_else(|| requires("MapArray", "an array", node))?;

        let mut mapped = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            trace!(index, path = %self.path, "sub-machine");
            let mut sub = Machine::new(item.clone())
                .with_limits(self.limits)
                .with_trace(self.trace);
            sub.run_sequence(body)?;
            mapped.push(sub.into_document());
        }
        Ok(JValue::array(mapped))
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Text keys present in the table are replaced; everything else passes through.
fn map_value(table: &ValueMapping, element: JValue) -> JValue {
    match element.as_str().and_then(|key| table.get(key)) {
        Some(replacement) => replacement.clone(),
        None => element,
    }
}

fn compare(op: CompareOp, lhs: &JValue, rhs: &JValue) -> Result<bool, MachineError> {
    if !op.is_ordering() {
        return Ok(match op {
            CompareOp::Eq => lhs == rhs,
            _ => lhs != rhs,
        });
    }

    let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        (None, _) => {
            return Err(MachineError::TypeMismatch {
                expected: "number",
                found: lhs.type_name(),
            })
        }
        (_, None) => {
            return Err(MachineError::TypeMismatch {
                expected: "number",
                found: rhs.type_name(),
            })
        }
    };
    Ok(match op {
        CompareOp::Lt => a < b,
        CompareOp::Gt => a > b,
        CompareOp::Le => a <= b,
        _ => a >= b,
    })
}

fn concat_arrays(first: &JValue, second: &JValue) -> Result<JValue, MachineError> {
    let mismatch = |v: &JValue| MachineError::TypeMismatch {
        expected: "array",
        found: v.type_name(),
    };
    let a = first.as_array().ok_or_else(|| mismatch(first))?;
    let b = second.as_array().ok_or_else(|| mismatch(second))?;
    let mut joined = Vec::with_capacity(a.len() + b.len());
    joined.extend(a.iter().cloned());
    joined.extend(b.iter().cloned());
    Ok(JValue::array(joined))
}

fn merge_objects(first: &JValue, second: &JValue) -> Result<JValue, MachineError> {
    let mismatch = |v: &JValue| MachineError::TypeMismatch {
        expected: "object",
        found: v.type_name(),
    };
    let a = first.as_object().ok_or_else(|| mismatch(first))?;
    let b = second.as_object().ok_or_else(|| mismatch(second))?;
    let mut merged = a.clone();
    for (key, value) in b {
        merged.insert(key.clone(), value.clone());
    }
    Ok(JValue::object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{MachinePredicate, Operand};
    use crate::jvalue;
    use std::rc::Rc;

    fn run(doc: JValue, program: &[Instruction]) -> Result<JValue, MachineError> {
        Machine::new(doc).execute(program)
    }

    fn obj(field: &str) -> Instruction {
        Instruction::MoveIntoObject(field.to_string())
    }

    fn arr(field: &str) -> Instruction {
        Instruction::MoveIntoArray(field.to_string())
    }

    #[test]
    fn test_move_into_object_vivifies() {
        let result = run(
            jvalue!({}),
            &[obj("a"), obj("b"), Instruction::StoreElement(jvalue!(1))],
        )
        .unwrap();
        assert_eq!(result, jvalue!({"a": {"b": 1}}));
    }

    #[test]
    fn test_move_into_array_coerces_non_array() {
        let result = run(
            jvalue!({"list": "text", "keep": 1}),
            &[arr("list"), Instruction::move_into_index(1)],
        )
        .unwrap();
        assert_eq!(result, jvalue!({"list": [{}, {}], "keep": 1}));
    }

    #[test]
    fn test_move_into_field_places_null() {
        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[Instruction::MoveIntoField("x".to_string())])
            .unwrap();
        assert_eq!(machine.current_path(), "$.x");
        assert_eq!(machine.document(), &jvalue!({"x": null}));
    }

    #[test]
    fn test_navigation_requires_containers() {
        let err = run(jvalue!({"a": 1}), &[obj("a"), obj("b")]).unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::Navigation(_)));

        let err = run(jvalue!({"a": {}}), &[obj("a"), Instruction::move_into_index(0)])
            .unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::Navigation(_)));
    }

    #[test]
    fn test_negative_index_is_a_navigation_error() {
        let err = run(
            jvalue!({"a": [1]}),
            &[arr("a"), Instruction::MoveIntoIndex(Operand::Literal(jvalue!((-1))))],
        )
        .unwrap_err();
        match err.root_cause() {
            MachineError::Navigation(msg) => assert!(msg.contains("negative")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_text_index_is_a_type_mismatch() {
        let err = run(
            jvalue!({"a": [1]}),
            &[arr("a"), Instruction::MoveIntoIndex(Operand::Literal(jvalue!("0")))],
        )
        .unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_move_out_and_root() {
        let mut machine = Machine::new(jvalue!({"a": {"b": {}}}));
        machine.execute(&[obj("a"), obj("b")]).unwrap();
        assert_eq!(machine.current_path(), "$.a.b");

        machine.execute(&[Instruction::MoveOut]).unwrap();
        assert_eq!(machine.current_path(), "$.a");

        machine.execute(&[Instruction::MoveToRoot, Instruction::MoveOut]).unwrap();
        assert_eq!(machine.current_path(), "$");
        assert!(machine.stacks().paths.is_empty());
        assert!(machine.stacks().states.is_empty());
    }

    #[test]
    fn test_write_back_at_root_replaces_document() {
        let result = run(jvalue!({"a": 1}), &[Instruction::StoreElement(jvalue!([1, 2]))])
            .unwrap();
        assert_eq!(result, jvalue!([1, 2]));
    }

    #[test]
    fn test_captured_element_is_a_copy() {
        let result = run(
            jvalue!({"src": {"n": 1}}),
            &[
                obj("src"),
                Instruction::PushElement,
                Instruction::MoveIntoField("n".to_string()),
                Instruction::StoreElement(jvalue!(99)),
                Instruction::MoveToRoot,
                Instruction::MoveIntoField("copy".to_string()),
                Instruction::PopElement,
            ],
        )
        .unwrap();
        assert_eq!(result, jvalue!({"src": {"n": 99}, "copy": {"n": 1}}));
    }

    #[test]
    fn test_delete_field_keeps_key_order() {
        let mut machine = Machine::new(jvalue!({"a": 1, "b": 2, "c": 3}));
        machine
            .execute(&[obj("b"), Instruction::Delete, Instruction::MoveOut])
            .unwrap();
        assert_eq!(machine.document(), &jvalue!({"a": 1, "c": 3}));
        assert_eq!(machine.current_path(), "$");
    }

    #[test]
    fn test_delete_array_element_and_root() {
        let result = run(
            jvalue!({"xs": [1, 2, 3]}),
            &[arr("xs"), Instruction::move_into_index(0), Instruction::Delete],
        )
        .unwrap();
        assert_eq!(result, jvalue!({"xs": [2, 3]}));

        let err = run(jvalue!({}), &[Instruction::Delete]).unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::Navigation(_)));
    }

    #[test]
    fn test_cursor_after_array_delete_is_detached() {
        let mut machine = Machine::new(jvalue!({"xs": [1, 2, 3]}));
        let err = machine
            .execute(&[
                arr("xs"),
                Instruction::move_into_index(0),
                Instruction::Delete,
                Instruction::PushElement,
            ])
            .unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::Navigation(_)));
        assert!(machine.current_node().is_err());
        assert!(machine.execution_state().contains("current: <detached>"));
        assert_eq!(machine.element_stack_len(), 0);

        // The shifted sibling at the same index is never overwritten.
        let err = machine
            .execute(&[Instruction::StoreElement(jvalue!("x"))])
            .unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::Navigation(_)));
        assert!(machine.execute(&[Instruction::Delete]).is_err());
        assert_eq!(machine.document(), &jvalue!({"xs": [2, 3]}));

        machine
            .execute(&[Instruction::MoveOut, Instruction::PushElement])
            .unwrap();
        assert_eq!(machine.current_path(), "$.xs");
        assert_eq!(machine.peek_element(0).unwrap(), &jvalue!([2, 3]));
    }

    #[test]
    fn test_reset_reattaches_cursor() {
        let mut machine = Machine::new(jvalue!({"a": {"b": 1}}));
        machine
            .execute(&[
                obj("a"),
                obj("b"),
                Instruction::Delete,
                Instruction::Reset,
                Instruction::PushElement,
            ])
            .unwrap();
        assert_eq!(machine.peek_element(0).unwrap(), &jvalue!({"a": {}}));
    }

    #[test]
    fn test_index_padding_is_bounded() {
        let mut machine = Machine::new(jvalue!({"xs": [1]})).with_limits(MachineLimits {
            max_array_padding: 4,
            ..MachineLimits::default()
        });
        machine
            .execute(&[arr("xs"), Instruction::move_into_index(4), Instruction::MoveOut])
            .unwrap();
        assert_eq!(machine.document(), &jvalue!({"xs": [1, {}, {}, {}, {}]}));

        let err = machine
            .execute(&[Instruction::move_into_index(9)])
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            MachineError::PaddingLimitExceeded { index: 9, len: 5, limit: 4 }
        ));
        assert_eq!(machine.current_path(), "$.xs");
        assert_eq!(machine.document(), &jvalue!({"xs": [1, {}, {}, {}, {}]}));
    }

    #[test]
    fn test_element_shuffles() {
        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[
                Instruction::StoreValue(Operand::Literal(jvalue!("b"))),
                Instruction::ValueToElement,
                Instruction::store_value("m"),
                Instruction::ValueToElement,
                Instruction::store_value("t"),
                Instruction::ValueToElement,
                Instruction::RotateElements,
            ])
            .unwrap();
        assert_eq!(machine.peek_element(0).unwrap(), &jvalue!("b"));
        assert_eq!(machine.peek_element(1).unwrap(), &jvalue!("t"));
        assert_eq!(machine.peek_element(2).unwrap(), &jvalue!("m"));

        machine
            .execute(&[Instruction::SwapElements, Instruction::DuplicateElement])
            .unwrap();
        assert_eq!(machine.element_stack_len(), 4);
        assert_eq!(machine.peek_element(0).unwrap(), &jvalue!("t"));
        assert_eq!(machine.peek_element(1).unwrap(), &jvalue!("t"));

        machine.execute(&[Instruction::ElementToValue]).unwrap();
        assert_eq!(machine.peek_value(0).unwrap(), &jvalue!("t"));
    }

    #[test]
    fn test_map_element() {
        let mut table = ValueMapping::new();
        table.insert("a@x.com".to_string(), jvalue!("mapped"));
        table.insert("1".to_string(), jvalue!("one"));
        let table = Rc::new(table);

        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[
                Instruction::store_value("a@x.com"),
                Instruction::ValueToElement,
                Instruction::MapElement(table.clone()),
                Instruction::store_value("b@x.com"),
                Instruction::ValueToElement,
                Instruction::MapElement(table.clone()),
                Instruction::store_value(1),
                Instruction::ValueToElement,
                Instruction::MapElement(table),
            ])
            .unwrap();
        assert_eq!(machine.peek_element(2).unwrap(), &jvalue!("mapped"));
        assert_eq!(machine.peek_element(1).unwrap(), &jvalue!("b@x.com"));
        // only text keys are looked up
        assert_eq!(machine.peek_element(0).unwrap(), &jvalue!(1));
    }

    #[test]
    fn test_arithmetic_truncates() {
        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[
                Instruction::store_value(2.7),
                Instruction::Increment,
                Instruction::store_value(10),
                Instruction::Add,
                Instruction::store_value(4),
                Instruction::Subtract,
                Instruction::Negate,
                Instruction::Decrement,
            ])
            .unwrap();
        assert_eq!(machine.peek_value(0).unwrap(), &jvalue!((-10)));
        assert_eq!(machine.value_stack_len(), 1);

        let err = run(jvalue!({}), &[Instruction::store_value("x"), Instruction::Increment])
            .unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_compare() {
        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[
                Instruction::store_value(3),
                Instruction::store_value(1),
                Instruction::Compare(CompareOp::Ge),
                Instruction::store_value("a"),
                Instruction::store_value("a"),
                Instruction::Compare(CompareOp::Eq),
                Instruction::StoreValue(Operand::Literal(jvalue!([1]))),
                Instruction::StoreValue(Operand::Literal(jvalue!([2]))),
                Instruction::Compare(CompareOp::Ne),
            ])
            .unwrap();
        assert_eq!(machine.peek_value(0).unwrap(), &jvalue!(true));
        assert_eq!(machine.peek_value(1).unwrap(), &jvalue!(true));
        assert_eq!(machine.peek_value(2).unwrap(), &jvalue!(true));
    }

    #[test]
    fn test_ordering_compare_on_text_is_rejected() {
        let err = run(
            jvalue!({}),
            &[
                Instruction::store_value("a"),
                Instruction::store_value(1),
                Instruction::Compare(CompareOp::Lt),
            ],
        )
        .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            MachineError::TypeMismatch { expected: "number", found: "text" }
        ));
    }

    #[test]
    fn test_value_shuffles() {
        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[
                Instruction::store_value(1),
                Instruction::store_value(2),
                Instruction::store_value(3),
                Instruction::RotateValues,
                Instruction::SwapValues,
                Instruction::DuplicateValue,
            ])
            .unwrap();
        let values: Vec<JValue> = machine.stacks().values.iter().cloned().collect();
        assert_eq!(values, vec![jvalue!(2), jvalue!(1), jvalue!(3), jvalue!(3)]);
    }

    #[test]
    fn test_conditional_jumps() {
        let store = |v: i32| Box::new(Instruction::StoreElement(jvalue!(v)));

        let result = run(
            jvalue!({}),
            &[Instruction::store_value(0), Instruction::JumpIfFalse(store(1))],
        )
        .unwrap();
        assert_eq!(result, jvalue!(1));

        let result = run(
            jvalue!({}),
            &[Instruction::store_value(5), Instruction::JumpIfTrue(store(2))],
        )
        .unwrap();
        assert_eq!(result, jvalue!(2));

        // text has no truth value: neither jump fires
        let result = run(
            jvalue!({}),
            &[
                Instruction::store_value("yes"),
                Instruction::JumpIfTrue(store(3)),
                Instruction::store_value("no"),
                Instruction::JumpIfFalse(store(4)),
            ],
        )
        .unwrap();
        assert_eq!(result, jvalue!({}));

        let err = run(jvalue!({}), &[Instruction::JumpIfTrue(store(5))]).unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::StackUnderflow(_)));
    }

    #[test]
    fn test_pop_command_keeps_command() {
        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[
                Instruction::store_value(0),
                Instruction::push_command(vec![Instruction::Increment]),
                Instruction::PopCommand,
                Instruction::PopCommand,
            ])
            .unwrap();
        assert_eq!(machine.peek_value(0).unwrap(), &jvalue!(2));
        assert_eq!(machine.stacks().commands.len(), 1);

        let err = run(jvalue!({}), &[Instruction::PopCommand]).unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::StackUnderflow(_)));
    }

    #[test]
    fn test_counter_loop() {
        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[
                Instruction::store_value(5),
                Instruction::store_value(0),
                Instruction::push_command(vec![Instruction::Increment]),
                Instruction::LoopUntil(LoopCondition::CounterReached { counter: 0, bound: 1 }),
            ])
            .unwrap();
        assert_eq!(machine.peek_value(0).unwrap(), &jvalue!(5));
        assert!(machine.stacks().commands.is_empty());
        assert_eq!(machine.loop_level(), 0);
        // 4 setup instructions + 5 increments
        assert_eq!(machine.total_operations(), 9);
    }

    #[test]
    fn test_loop_already_satisfied_runs_zero_times() {
        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[
                Instruction::push_command(vec![Instruction::StoreElement(jvalue!("ran"))]),
                Instruction::LoopUntil(LoopCondition::Custom(MachinePredicate::new(|_| true))),
            ])
            .unwrap();
        assert_eq!(machine.document(), &jvalue!({}));
        assert!(machine.stacks().commands.is_empty());
    }

    #[test]
    fn test_loop_limit_cleans_up() {
        let mut machine = Machine::new(jvalue!({})).with_limits(MachineLimits {
            max_loop_iterations: 3,
            max_operations: 1_000,
            ..MachineLimits::default()
        });
        let err = machine
            .execute(&[
                Instruction::store_value(0),
                Instruction::push_command(vec![Instruction::Increment]),
                Instruction::LoopUntil(LoopCondition::Custom(MachinePredicate::new(|_| false))),
            ])
            .unwrap_err();

        assert!(matches!(
            err.root_cause(),
            MachineError::LoopLimitExceeded { level: 1, limit: 3 }
        ));
        assert_eq!(machine.peek_value(0).unwrap(), &jvalue!(3));
        assert_eq!(machine.loop_level(), 0);
        assert!(machine.stacks().commands.is_empty());
    }

    #[test]
    fn test_operation_limit() {
        let mut machine = Machine::new(jvalue!({})).with_limits(MachineLimits {
            max_loop_iterations: 1_000,
            max_operations: 50,
            ..MachineLimits::default()
        });
        let err = machine
            .execute(&[
                Instruction::store_value(0),
                Instruction::push_command(vec![Instruction::Increment]),
                Instruction::LoopUntil(LoopCondition::Custom(MachinePredicate::new(|_| false))),
            ])
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            MachineError::OperationLimitExceeded { limit: 50 }
        ));
    }

    #[test]
    fn test_merge_and_concat_arrays_are_the_same() {
        for op in [Instruction::MergeArrays, Instruction::ConcatArrays] {
            let mut machine = Machine::new(jvalue!({}));
            machine
                .execute(&[
                    Instruction::StoreValue(Operand::Literal(jvalue!([1, 2]))),
                    Instruction::ValueToElement,
                    Instruction::StoreValue(Operand::Literal(jvalue!([2, 3]))),
                    Instruction::ValueToElement,
                    op,
                ])
                .unwrap();
            assert_eq!(machine.peek_element(0).unwrap(), &jvalue!([1, 2, 2, 3]));
        }
    }

    #[test]
    fn test_merge_objects_second_wins() {
        let mut machine = Machine::new(jvalue!({}));
        machine
            .execute(&[
                Instruction::StoreValue(Operand::Literal(jvalue!({"a": 1, "b": 1}))),
                Instruction::ValueToElement,
                Instruction::StoreValue(Operand::Literal(jvalue!({"b": 2, "c": 2}))),
                Instruction::ValueToElement,
                Instruction::MergeObjects,
            ])
            .unwrap();
        assert_eq!(
            machine.peek_element(0).unwrap(),
            &jvalue!({"a": 1, "b": 2, "c": 2})
        );

        let err = run(
            jvalue!({}),
            &[
                Instruction::store_value(1),
                Instruction::ValueToElement,
                Instruction::PushElement,
                Instruction::MergeObjects,
            ],
        )
        .unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_filter_array() {
        let evens = NodePredicate::new(|v| v.as_i64().is_some_and(|n| n % 2 == 0));
        let result = run(
            jvalue!({"xs": [1, 2, 3, 4]}),
            &[arr("xs"), Instruction::FilterArray(evens)],
        )
        .unwrap();
        assert_eq!(result, jvalue!({"xs": [2, 4]}));
    }

    #[test]
    fn test_map_array_runs_each_element_in_isolation() {
        let body: Rc<[Instruction]> = vec![
            Instruction::MoveIntoField("seen".to_string()),
            Instruction::StoreElement(jvalue!(true)),
        ]
        .into();
        let result = run(
            jvalue!({"xs": [{"id": 1}, {"id": 2}]}),
            &[arr("xs"), Instruction::MapArray(body)],
        )
        .unwrap();
        assert_eq!(
            result,
            jvalue!({"xs": [{"id": 1, "seen": true}, {"id": 2, "seen": true}]})
        );

        let err = run(
            jvalue!({"xs": {}}),
            &[obj("xs"), Instruction::MapArray(Rc::from(Vec::<Instruction>::new()))],
        )
        .unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::Navigation(_)));
    }

    #[test]
    fn test_create_containers() {
        let result = run(
            jvalue!({"a": 1, "b": 2}),
            &[
                Instruction::MoveIntoField("a".to_string()),
                Instruction::CreateArray,
                Instruction::MoveOut,
                Instruction::MoveIntoField("b".to_string()),
                Instruction::CreateObject,
            ],
        )
        .unwrap();
        assert_eq!(result, jvalue!({"a": [], "b": {}}));
    }

    #[test]
    fn test_store_size() {
        let mut machine = Machine::new(jvalue!({"xs": [1, 2, 3]}));
        machine
            .execute(&[Instruction::StoreSize, arr("xs"), Instruction::StoreSize])
            .unwrap();
        assert_eq!(machine.peek_value(0).unwrap(), &jvalue!(3));
        assert_eq!(machine.peek_value(1).unwrap(), &jvalue!(1));

        let err = run(
            jvalue!({"n": 1}),
            &[Instruction::MoveIntoField("n".to_string()), Instruction::StoreSize],
        )
        .unwrap_err();
        assert!(matches!(err.root_cause(), MachineError::Navigation(_)));
    }

    #[test]
    fn test_reset() {
        let mut machine = Machine::new(jvalue!({"a": {}}));
        machine
            .execute(&[
                obj("a"),
                Instruction::store_value(1),
                Instruction::PushElement,
                Instruction::push_command(vec![]),
                Instruction::Reset,
            ])
            .unwrap();
        assert_eq!(machine.current_path(), "$");
        assert_eq!(machine.value_stack_len(), 0);
        assert_eq!(machine.element_stack_len(), 0);
        assert!(machine.stacks().commands.is_empty());
    }

    #[test]
    fn test_error_carries_instruction_and_path() {
        let mut machine = Machine::new(jvalue!({"a": {"b": "x"}}));
        let err = machine
            .execute(&[obj("a"), obj("b"), Instruction::StoreSize])
            .unwrap_err();
        match &err {
            MachineError::Instruction { instruction, path, .. } => {
                assert_eq!(instruction, "StoreSize");
                assert_eq!(path, "$.a.b");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().starts_with("StoreSize failed at $.a.b"));
        assert!(machine.execution_state().contains("path: $.a.b"));
    }

    #[test]
    fn test_limits_deserialize_with_defaults() {
        let limits: MachineLimits = serde_json::from_str(r#"{"max_operations": 10}"#).unwrap();
        assert_eq!(limits.max_operations, 10);
        assert_eq!(limits.max_loop_iterations, 10_000);
        assert_eq!(limits.max_array_padding, 10_000);
    }
}
