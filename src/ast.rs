// Path component model
// A parsed path expression is a flat list of components, root first.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of a path expression.
///
/// `field` is the object key holding the array for the array variants. An empty
/// field (as in `$[0]`) means the array is the node reached so far.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathComponent {
    /// `.name`
    Field(String),
    /// `name[3]`
    ArrayIndex { field: String, index: i64 },
    /// `name[*]`
    ArrayAll(String),
    /// `name[*+$.other]`: every element, written after the current length of
    /// the array at `offset_path`. The offset path is kept unparsed.
    ArrayAllOffset { field: String, offset_path: String },
    /// `name[1:3]`
    ArrayRange { field: String, start: i64, end: i64 },
    /// `name[1,3,5]`
    ArrayValues { field: String, indices: Vec<i64> },
    /// `*`
    Wildcard,
    /// `..`
    RecursiveDescent,
}

impl PathComponent {
    /// True for components that can select more than one node.
    pub fn is_pattern(&self) -> bool {
        !matches!(self, PathComponent::Field(_) | PathComponent::ArrayIndex { .. })
    }

    /// True for bracketed multi-element selectors.
    pub fn is_array_pattern(&self) -> bool {
        matches!(
            self,
            PathComponent::ArrayAll(_)
                | PathComponent::ArrayAllOffset { .. }
                | PathComponent::ArrayRange { .. }
                | PathComponent::ArrayValues { .. }
        )
    }

    /// The object key this component addresses, if it has one.
    pub fn field(&self) -> Option<&str> {
        match self {
            PathComponent::Field(field)
            | PathComponent::ArrayAll(field)
            | PathComponent::ArrayIndex { field, .. }
            | PathComponent::ArrayAllOffset { field, .. }
            | PathComponent::ArrayRange { field, .. }
            | PathComponent::ArrayValues { field, .. } => Some(field),
            PathComponent::Wildcard | PathComponent::RecursiveDescent => None,
        }
    }

    fn starts_with_dot(&self) -> bool {
        match self {
            PathComponent::Field(_) | PathComponent::Wildcard | PathComponent::RecursiveDescent => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathComponent::Field(name) => write!(f, ".{}", name),
            PathComponent::ArrayIndex { field, index } => write!(f, "{}[{}]", field, index),
            PathComponent::ArrayAll(field) => write!(f, "{}[*]", field),
            PathComponent::ArrayAllOffset { field, offset_path } => {
                write!(f, "{}[*+{}]", field, offset_path)
            }
            PathComponent::ArrayRange { field, start, end } => {
                write!(f, "{}[{}:{}]", field, start, end)
            }
            PathComponent::ArrayValues { field, indices } => {
                write!(f, "{}[", field)?;
                for (i, index) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", index)?;
                }
                write!(f, "]")
            }
            PathComponent::Wildcard => write!(f, ".*"),
            PathComponent::RecursiveDescent => write!(f, ".."),
        }
    }
}

/// Re-join a component list into a canonical `$`-rooted path.
///
/// Parsing the result yields the same components again.
pub fn render(components: &[PathComponent]) -> String {
    let mut out = String::from("$");
    let mut after_descent = false;
    for component in components {
        if after_descent {
            // `..` already supplies the separator
            let text = component.to_string();
            out.push_str(text.strip_prefix('.').unwrap_or(&text));
        } else if component.starts_with_dot() {
            out.push_str(&component.to_string());
        } else {
            out.push('.');
            out.push_str(&component.to_string());
        }
        after_descent = matches!(component, PathComponent::RecursiveDescent);
    }
    out
}
