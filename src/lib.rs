// jsonpath-transform - Path-driven JSON restructuring on a stack machine
// Copyright (c) 2025 jsonpath-transform contributors
// Licensed under the MIT License

//! # jsonpath-transform
//!
//! Moves values around a JSON document by naming where they come from and where
//! they go. A (source, target) pair of path expressions is compiled into a
//! short instruction program, which a small stack machine then runs against the
//! document.
//!
//! ```
//! use jsonpath_transform::{jvalue, transform};
//!
//! let doc = jvalue!({"users": [{"email": "a"}, {"email": "b"}]});
//! let out = transform(doc, "$.users[*].email", "$.contacts[*].email", None).unwrap();
//! assert_eq!(out.get("contacts"), Some(&jvalue!([{"email": "a"}, {"email": "b"}])));
//! ```
//!
//! ## Architecture
//!
//! - `value` - JSON document model (`JValue`)
//! - `ast` - path components
//! - `parser` - path expression parser
//! - `compiler` - path pair to instruction program
//! - `instruction` - instruction set and operands
//! - `stack` - the machine's stacks and cursor locators
//! - `vm` - the machine
//!
//! ## Path syntax
//!
//! | syntax | meaning |
//! |---|---|
//! | `$`, `$.` | optional root prefix |
//! | `.name` | object field |
//! | `name[3]` | array element |
//! | `name[*]` | every element |
//! | `name[*+$.other]` | every element, written after the current length of `$.other` |
//! | `name[1:3]`, `name[1,3]`, `*`, `..` | parsed, not yet compiled |

use thiserror::Error;

pub mod ast;
pub mod compiler;
pub mod instruction;
pub mod parser;
pub mod stack;
pub mod value;
pub mod vm;

pub use ast::{render, PathComponent};
pub use compiler::{compile, CompileError, Compiler, Strategy};
pub use instruction::{
    CompareOp, Instruction, LoopCondition, MachinePredicate, NodePredicate, Operand,
    ValueMapping,
};
pub use parser::{parse, PathSyntaxError};
pub use stack::{Locator, Stack, StackManager, StackUnderflow};
pub use value::JValue;
pub use vm::{Machine, MachineError, MachineLimits};

/// Any failure from parsing, compiling or running a transformation.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Path error: {0}")]
    Path(#[from] PathSyntaxError),

    #[error("Compile error: {0}")]
    Compile(CompileError),

    #[error("Execution error: {0}")]
    Machine(#[from] MachineError),
}

/// Path syntax errors surface as `Error::Path` whichever stage found them.
impl From<CompileError> for Error {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Path(err) => Error::Path(err),
            other => Error::Compile(other),
        }
    }
}

/// Compile one path pair and run it against `document` with default limits.
pub fn transform(
    document: JValue,
    source: &str,
    target: &str,
    mapping: Option<&ValueMapping>,
) -> Result<JValue, Error> {
    let program = compile(source, target, mapping)?;
    let mut machine = Machine::new(document);
    machine.execute(&program)?;
    Ok(machine.into_document())
}
