//! Path-pair compiler: lowers a (source, target) path pair into a flat
//! instruction sequence for [`Machine`](crate::vm::Machine).
//!
//! One of three strategies is chosen from the shape of the two paths:
//!
//! - **Replication**: a single-valued source fanned out to every element of
//!   the target array.
//! - **Pattern move**: source array elements copied index-for-index into the
//!   target array, optionally starting after the length of an offset array.
//! - **Simple move**: one node copied from source to target.
//!
//! Every program starts with `Reset`, so a compiled sequence can be replayed
//! against any document.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;
use tracing::debug;

use crate::ast::PathComponent;
use crate::instruction::{CompareOp, Instruction, LoopCondition, Operand, ValueMapping};
use crate::jvalue;
use crate::parser::{parse, PathSyntaxError};
use crate::value::JValue;

/// Compile-time errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Path(#[from] PathSyntaxError),

    #[error("No array pattern in {side} path {path}")]
    MissingArrayPattern { side: &'static str, path: String },

    #[error("Unsupported component {component}: {reason}")]
    UnsupportedComponent {
        component: String,
        reason: &'static str,
    },
}

fn unsupported(component: &PathComponent, reason: &'static str) -> CompileError {
    CompileError::UnsupportedComponent {
        component: component.to_string(),
        reason,
    }
}

/// Code-generation strategy for a path pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Replication,
    PatternMove,
    SimpleMove,
}

impl Strategy {
    pub fn select(source: &[PathComponent], target: &[PathComponent]) -> Self {
        let source_pattern = source.iter().any(PathComponent::is_pattern);
        let target_pattern = target.iter().any(PathComponent::is_pattern);
        if !source_pattern && target_pattern {
            Strategy::Replication
        } else if source_pattern {
            Strategy::PatternMove
        } else {
            Strategy::SimpleMove
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Replication => "replication",
            Strategy::PatternMove => "pattern-move",
            Strategy::SimpleMove => "simple-move",
        })
    }
}

/// How the final hop of a walk treats a field component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leaf {
    /// `MoveIntoObject`, creating `{}` when missing.
    Object,
    /// `MoveIntoField`, creating a `null` placeholder when missing.
    Field,
}

/// A path split around its array pattern.
struct Split<'a> {
    before: &'a [PathComponent],
    array: &'a PathComponent,
    after: &'a [PathComponent],
}

impl<'a> Split<'a> {
    fn array_field(&self) -> &'a str {
        self.array.field().unwrap_or_default()
    }
}

/// Locate the single `[*]` / `[*+...]` component of a path.
///
/// Range, index-list, wildcard and recursive-descent components parse but have
/// no code generation yet.
fn split_at_array<'a>(
    components: &'a [PathComponent],
    side: &'static str,
    path: &str,
) -> Result<Split<'a>, CompileError> {
    let mut found = None;
    for (i, component) in components.iter().enumerate() {
        match component {
            PathComponent::Field(_) | PathComponent::ArrayIndex { .. } => {}
            PathComponent::ArrayAll(_) | PathComponent::ArrayAllOffset { .. } => {
                if found.is_some() {
                    return Err(unsupported(component, "only one array pattern per path"));
                }
                found = Some(i);
            }
            PathComponent::ArrayRange { .. } | PathComponent::ArrayValues { .. } => {
                return Err(unsupported(component, "array ranges and index lists are reserved"));
            }
            PathComponent::Wildcard | PathComponent::RecursiveDescent => {
                return Err(unsupported(component, "wildcards and recursive descent are reserved"));
            }
        }
    }

    let i = found.ok_or_else(|| CompileError::MissingArrayPattern {
        side,
        path: path.to_string(),
    })?;
    Ok(Split {
        before: &components[..i],
        array: &components[i],
        after: &components[i + 1..],
    })
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Compiler {
    instrs: Vec<Instruction>,
    mapping: Option<Rc<ValueMapping>>,
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            instrs: Vec::with_capacity(32),
            mapping: None,
        }
    }

    /// Remap every captured text value through `mapping`.
    pub fn with_mapping(mut self, mapping: ValueMapping) -> Self {
        self.mapping = Some(Rc::new(mapping));
        self
    }

    #[inline]
    fn emit(&mut self, instr: Instruction) {
        self.instrs.push(instr);
    }

    /// Compile the pair, consuming the compiler.
    pub fn compile(mut self, source: &str, target: &str) -> Result<Vec<Instruction>, CompileError> {
        let source_components = parse(source)?;
        let target_components = parse(target)?;
        let strategy = Strategy::select(&source_components, &target_components);

        self.emit(Instruction::Reset);
        match strategy {
            Strategy::Replication => {
                self.replication(&source_components, &target_components, target)?
            }
            Strategy::PatternMove => self.pattern_move(
                &source_components,
                &target_components,
                source,
                target,
            )?,
            Strategy::SimpleMove => self.simple_move(&source_components, &target_components)?,
        }

        debug!(
            source,
            target,
            %strategy,
            instructions = self.instrs.len(),
            mapped = self.mapping.is_some(),
            "compiled path pair"
        );
        Ok(self.instrs)
    }

    // ── Building blocks ──────────────────────────────────────────────────

    /// Emit the moves for one single-valued component; returns the hop count.
    fn hop(&mut self, component: &PathComponent, leaf: Leaf) -> Result<usize, CompileError> {
        match component {
            PathComponent::Field(name) => {
                self.emit(match leaf {
                    Leaf::Object => Instruction::MoveIntoObject(name.clone()),
                    Leaf::Field => Instruction::MoveIntoField(name.clone()),
                });
                Ok(1)
            }
            PathComponent::ArrayIndex { field, index } => {
                let entered = self.enter_array(field);
                self.emit(Instruction::MoveIntoIndex(Operand::Literal(JValue::from(*index))));
                Ok(entered + 1)
            }
            other => Err(unsupported(other, "expected a field or a literal index")),
        }
    }

    /// Walk `components`, treating the last one as `leaf`; returns the hop count.
    fn walk(&mut self, components: &[PathComponent], leaf: Leaf) -> Result<usize, CompileError> {
        let mut hops = 0;
        for (i, component) in components.iter().enumerate() {
            let kind = if i + 1 == components.len() { leaf } else { Leaf::Object };
            hops += self.hop(component, kind)?;
        }
        Ok(hops)
    }

    /// An empty field means the cursor already is the array.
    fn enter_array(&mut self, field: &str) -> usize {
        if field.is_empty() {
            0
        } else {
            self.emit(Instruction::MoveIntoArray(field.to_string()));
            1
        }
    }

    fn capture(&mut self) {
        self.emit(Instruction::PushElement);
        if let Some(mapping) = &self.mapping {
            let mapping = Rc::clone(mapping);
            self.emit(Instruction::MapElement(mapping));
        }
    }

    /// Navigate an offset path and push the length of the node it reaches.
    fn offset_size(&mut self, offset_path: &str) -> Result<(), CompileError> {
        let components = parse(offset_path)?;
        self.emit(Instruction::MoveToRoot);
        for component in &components {
            match component {
                PathComponent::ArrayAll(field) => {
                    self.enter_array(field);
                }
                other => {
                    self.hop(other, Leaf::Object)?;
                }
            }
        }
        self.emit(Instruction::StoreSize);
        Ok(())
    }

    // ── Strategies ───────────────────────────────────────────────────────

    fn simple_move(
        &mut self,
        source: &[PathComponent],
        target: &[PathComponent],
    ) -> Result<(), CompileError> {
        self.emit(Instruction::MoveToRoot);
        self.walk(source, Leaf::Object)?;
        self.capture();
        self.emit(Instruction::MoveOut);

        self.emit(Instruction::MoveToRoot);
        self.walk(target, Leaf::Field)?;
        self.emit(Instruction::PopElement);
        self.emit(Instruction::MoveOut);
        Ok(())
    }

    fn replication(
        &mut self,
        source: &[PathComponent],
        target: &[PathComponent],
        target_path: &str,
    ) -> Result<(), CompileError> {
        let split = split_at_array(target, "target", target_path)?;

        self.emit(Instruction::MoveToRoot);
        self.walk(source, Leaf::Object)?;
        self.capture();
        self.emit(Instruction::MoveToRoot);

        self.walk(split.before, Leaf::Object)?;
        self.enter_array(split.array_field());

        // guarantee at least one element to fan out into
        self.emit(Instruction::StoreSize);
        self.emit(Instruction::store_value(1));
        self.emit(Instruction::Compare(CompareOp::Ge));
        self.emit(Instruction::JumpIfFalse(Box::new(Instruction::StoreElement(
            jvalue!([{}]),
        ))));
        self.emit(Instruction::StoreSize);
        self.emit(Instruction::store_value(0));

        let mut body = Compiler::new();
        body.emit(Instruction::MoveIntoIndex(Operand::StackDepth(0)));
        let hops = body.walk(split.after, Leaf::Object)? + 1;
        body.emit(Instruction::DuplicateElement);
        body.emit(Instruction::PopElement);
        for _ in 0..hops {
            body.emit(Instruction::MoveOut);
        }
        body.emit(Instruction::Increment);

        self.emit_loop(body.instrs);
        Ok(())
    }

    fn pattern_move(
        &mut self,
        source: &[PathComponent],
        target: &[PathComponent],
        source_path: &str,
        target_path: &str,
    ) -> Result<(), CompileError> {
        let src = split_at_array(source, "source", source_path)?;
        let dst = split_at_array(target, "target", target_path)?;

        if matches!(src.array, PathComponent::ArrayAllOffset { .. }) {
            return Err(unsupported(src.array, "an offset only applies to the target array"));
        }

        // value stack: [offset, source length, counter]
        match dst.array {
            PathComponent::ArrayAllOffset { offset_path, .. } => self.offset_size(offset_path)?,
            _ => self.emit(Instruction::store_value(0)),
        }
        self.emit(Instruction::MoveToRoot);
        self.walk(src.before, Leaf::Object)?;
        self.enter_array(src.array_field());
        self.emit(Instruction::StoreSize);
        self.emit(Instruction::store_value(0));

        let mut body = Compiler {
            instrs: Vec::with_capacity(32),
            mapping: self.mapping.clone(),
        };
        body.emit(Instruction::MoveToRoot);
        body.walk(src.before, Leaf::Object)?;
        body.enter_array(src.array_field());
        body.emit(Instruction::MoveIntoIndex(Operand::StackDepth(0)));
        body.walk(src.after, Leaf::Field)?;
        body.capture();

        body.emit(Instruction::MoveToRoot);
        body.walk(dst.before, Leaf::Object)?;
        body.enter_array(dst.array_field());
        body.emit(Instruction::StoreValue(Operand::StackDepth(0)));
        body.emit(Instruction::StoreValue(Operand::StackDepth(3)));
        body.emit(Instruction::Add);
        body.emit(Instruction::MoveIntoIndex(Operand::StackDepth(0)));
        body.emit(Instruction::PopValue);
        body.walk(dst.after, Leaf::Field)?;
        body.emit(Instruction::PopElement);
        body.emit(Instruction::MoveOut);
        body.emit(Instruction::MoveOut);
        body.emit(Instruction::Increment);

        self.emit_loop(body.instrs);
        Ok(())
    }

    /// Loop `body` until the counter (value depth 0) reaches the bound (depth 1).
    fn emit_loop(&mut self, body: Vec<Instruction>) {
        self.emit(Instruction::push_command(body));
        self.emit(Instruction::LoopUntil(LoopCondition::CounterReached {
            counter: 0,
            bound: 1,
        }));
    }
}

/// Compile a (source, target) path pair, optionally remapping captured values.
pub fn compile(
    source: &str,
    target: &str,
    mapping: Option<&ValueMapping>,
) -> Result<Vec<Instruction>, CompileError> {
    let compiler = match mapping {
        Some(mapping) => Compiler::new().with_mapping(mapping.clone()),
        None => Compiler::new(),
    };
    compiler.compile(source, target)
}
