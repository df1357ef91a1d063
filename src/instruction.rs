//! Instruction set for the transformation machine.
//!
//! Every command is a variant carrying its own typed operands. Operands that
//! depend on machine state ([`Operand`]) are resolved immediately before the
//! instruction uses them, so the same compiled sequence can run any number of
//! times inside a loop body.

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use thiserror::Error;

use crate::value::{IndexMap, JValue};
use crate::vm::{Machine, MachineError};

/// Lookup table applied by `MapElement`: text key to replacement value.
pub type ValueMapping = IndexMap<String, JValue>;

// ---------------------------------------------------------------------------
// Operands
// ---------------------------------------------------------------------------

/// A value that is either known up front or read from the machine at use time.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(JValue),
    /// Field of the current node; `null` when absent or the node is not an object.
    FieldOf(String),
    /// Value-stack entry `n` positions below the top.
    StackDepth(usize),
    CurrentNode,
}

impl Operand {
    pub fn resolve(&self, machine: &Machine) -> Result<JValue, MachineError> {
        match self {
            Operand::Literal(v) => Ok(v.clone()),
            Operand::FieldOf(name) => Ok(machine
                .current_node()?
                .get(name)
                .cloned()
                .unwrap_or(JValue::Null)),
            Operand::StackDepth(depth) => Ok(machine.peek_value(*depth)?.clone()),
            Operand::CurrentNode => Ok(machine.current_node()?.clone()),
        }
    }
}

impl From<JValue> for Operand {
    fn from(v: JValue) -> Self {
        Operand::Literal(v)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => write!(f, "{}", v),
            Operand::FieldOf(name) => write!(f, "field {}", name),
            Operand::StackDepth(depth) => write!(f, "value[{}]", depth),
            Operand::CurrentNode => write!(f, "current"),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
        }
    }

    /// `==` and `!=` apply to any values.
    pub fn is_ordering(self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown comparison operator: {0}")]
pub struct UnknownCompareOp(pub String);

impl FromStr for CompareOp {
    type Err = UnknownCompareOp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            "<" => Ok(CompareOp::Lt),
            ">" => Ok(CompareOp::Gt),
            "<=" => Ok(CompareOp::Le),
            ">=" => Ok(CompareOp::Ge),
            other => Err(UnknownCompareOp(other.to_string())),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Boolean function of the whole machine state, used as a loop condition.
#[derive(Clone)]
pub struct MachinePredicate(Rc<dyn Fn(&Machine) -> bool>);

impl MachinePredicate {
    pub fn new(f: impl Fn(&Machine) -> bool + 'static) -> Self {
        MachinePredicate(Rc::new(f))
    }

    pub fn check(&self, machine: &Machine) -> bool {
        (self.0)(machine)
    }
}

impl fmt::Debug for MachinePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MachinePredicate(..)")
    }
}

impl PartialEq for MachinePredicate {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Boolean function of a single node, used by `FilterArray`.
#[derive(Clone)]
pub struct NodePredicate(Rc<dyn Fn(&JValue) -> bool>);

impl NodePredicate {
    pub fn new(f: impl Fn(&JValue) -> bool + 'static) -> Self {
        NodePredicate(Rc::new(f))
    }

    pub fn test(&self, node: &JValue) -> bool {
        (self.0)(node)
    }
}

impl fmt::Debug for NodePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NodePredicate(..)")
    }
}

impl PartialEq for NodePredicate {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// When a `LoopUntil` stops.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopCondition {
    /// Stop once the value at depth `counter` is at least the value at depth
    /// `bound`, or when the value stack is too shallow to hold both.
    CounterReached { counter: usize, bound: usize },
    Custom(MachinePredicate),
}

impl LoopCondition {
    pub fn is_met(&self, machine: &Machine) -> Result<bool, MachineError> {
        match self {
            LoopCondition::CounterReached { counter, bound } => {
                if machine.value_stack_len() <= (*counter).max(*bound) {
                    return Ok(true);
                }
                let current = number_at(machine, *counter)?;
                let limit = number_at(machine, *bound)?;
                Ok(current >= limit)
            }
            LoopCondition::Custom(predicate) => Ok(predicate.check(machine)),
        }
    }
}

fn number_at(machine: &Machine, depth: usize) -> Result<f64, MachineError> {
    let value = machine.peek_value(depth)?;
    value.as_f64().ok_or_else(|| MachineError::TypeMismatch {
        expected: "number",
        found: value.type_name(),
    })
}

impl fmt::Display for LoopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopCondition::CounterReached { counter, bound } => {
                write!(f, "value[{}] >= value[{}]", counter, bound)
            }
            LoopCondition::Custom(_) => write!(f, "custom"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instruction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    // ── Navigation ───────────────────────────────────────────────────────
    MoveToRoot,
    MoveOut,
    /// Descend into an object field, creating `{}` when absent.
    MoveIntoObject(String),
    /// Descend into an array field, replacing a missing or non-array value with `[]`.
    MoveIntoArray(String),
    /// Descend into an array element, padding with `{}` up to the index.
    MoveIntoIndex(Operand),
    /// Descend into a leaf field about to be overwritten, creating `null` when absent.
    MoveIntoField(String),

    // ── Element stack ────────────────────────────────────────────────────
    PushElement,
    PopElement,
    /// Write the given value at the cursor.
    StoreElement(JValue),
    DuplicateElement,
    SwapElements,
    RotateElements,
    MapElement(Rc<ValueMapping>),

    // ── Value stack ──────────────────────────────────────────────────────
    StoreValue(Operand),
    StoreSize,
    PopValue,
    Increment,
    Decrement,
    Compare(CompareOp),
    Add,
    Subtract,
    Negate,
    DuplicateValue,
    SwapValues,
    RotateValues,
    ElementToValue,
    ValueToElement,

    // ── Control flow ─────────────────────────────────────────────────────
    PushCommand(Rc<[Instruction]>),
    /// Run the command on top of the command stack without removing it.
    PopCommand,
    LoopUntil(LoopCondition),
    JumpIfTrue(Box<Instruction>),
    JumpIfFalse(Box<Instruction>),
    Reset,

    // ── Array operations ─────────────────────────────────────────────────
    MergeArrays,
    ConcatArrays,
    FilterArray(NodePredicate),
    MapArray(Rc<[Instruction]>),

    // ── Structure ────────────────────────────────────────────────────────
    CreateObject,
    CreateArray,
    Delete,
    MergeObjects,
}

impl Instruction {
    pub fn store_value(v: impl Into<JValue>) -> Self {
        Instruction::StoreValue(Operand::Literal(v.into()))
    }

    pub fn move_into_index(index: usize) -> Self {
        Instruction::MoveIntoIndex(Operand::Literal(JValue::from(index)))
    }

    pub fn push_command(body: Vec<Instruction>) -> Self {
        Instruction::PushCommand(body.into())
    }

    /// True for commands that replace the node at the cursor.
    pub fn writes_back(&self) -> bool {
        matches!(
            self,
            Instruction::PopElement
                | Instruction::StoreElement(_)
                | Instruction::CreateObject
                | Instruction::CreateArray
                | Instruction::Delete
                | Instruction::FilterArray(_)
                | Instruction::MapArray(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Instruction::MoveToRoot => "MoveToRoot",
            Instruction::MoveOut => "MoveOut",
            Instruction::MoveIntoObject(_) => "MoveIntoObject",
            Instruction::MoveIntoArray(_) => "MoveIntoArray",
            Instruction::MoveIntoIndex(_) => "MoveIntoIndex",
            Instruction::MoveIntoField(_) => "MoveIntoField",
            Instruction::PushElement => "PushElement",
            Instruction::PopElement => "PopElement",
            Instruction::StoreElement(_) => "StoreElement",
            Instruction::DuplicateElement => "DuplicateElement",
            Instruction::SwapElements => "SwapElements",
            Instruction::RotateElements => "RotateElements",
            Instruction::MapElement(_) => "MapElement",
            Instruction::StoreValue(_) => "StoreValue",
            Instruction::StoreSize => "StoreSize",
            Instruction::PopValue => "PopValue",
            Instruction::Increment => "Increment",
            Instruction::Decrement => "Decrement",
            Instruction::Compare(_) => "Compare",
            Instruction::Add => "Add",
            Instruction::Subtract => "Subtract",
            Instruction::Negate => "Negate",
            Instruction::DuplicateValue => "DuplicateValue",
            Instruction::SwapValues => "SwapValues",
            Instruction::RotateValues => "RotateValues",
            Instruction::ElementToValue => "ElementToValue",
            Instruction::ValueToElement => "ValueToElement",
            Instruction::PushCommand(_) => "PushCommand",
            Instruction::PopCommand => "PopCommand",
            Instruction::LoopUntil(_) => "LoopUntil",
            Instruction::JumpIfTrue(_) => "JumpIfTrue",
            Instruction::JumpIfFalse(_) => "JumpIfFalse",
            Instruction::Reset => "Reset",
            Instruction::MergeArrays => "MergeArrays",
            Instruction::ConcatArrays => "ConcatArrays",
            Instruction::FilterArray(_) => "FilterArray",
            Instruction::MapArray(_) => "MapArray",
            Instruction::CreateObject => "CreateObject",
            Instruction::CreateArray => "CreateArray",
            Instruction::Delete => "Delete",
            Instruction::MergeObjects => "MergeObjects",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            Instruction::MoveIntoObject(field)
            | Instruction::MoveIntoArray(field)
            | Instruction::MoveIntoField(field) => write!(f, "{}({})", name, field),
            Instruction::MoveIntoIndex(op) | Instruction::StoreValue(op) => {
                write!(f, "{}({})", name, op)
            }
            Instruction::StoreElement(v) => write!(f, "{}({})", name, v),
            Instruction::MapElement(table) => write!(f, "{}({} entries)", name, table.len()),
            Instruction::Compare(op) => write!(f, "{}({})", name, op),
            Instruction::PushCommand(body) | Instruction::MapArray(body) => {
                write!(f, "{}({} instructions)", name, body.len())
            }
            Instruction::LoopUntil(cond) => write!(f, "{}({})", name, cond),
            Instruction::JumpIfTrue(inner) | Instruction::JumpIfFalse(inner) => {
                write!(f, "{}({})", name, inner)
            }
            _ => f.write_str(name),
        }
    }
}
