// Path expression parser
// Turns `$.store.book[0]` style text into a list of PathComponents.

use crate::ast::PathComponent;
use thiserror::Error;

/// Path syntax errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PathSyntaxError {
    #[error("Path expression is empty")]
    Empty,

    #[error("Invalid array notation: {0}")]
    InvalidArrayNotation(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(String),
}

/// Parse a path expression into its components.
///
/// A leading `$.` or `$` is optional. Dots inside brackets do not split, so an
/// offset pattern may carry a full path (`contacts[*+$.users]`).
///
/// ```
/// use jsonpath_transform::{parse, PathComponent};
///
/// let components = parse("$.store.book[0]").unwrap();
/// assert_eq!(
///     components,
///     vec![
///         PathComponent::Field("store".to_string()),
///         PathComponent::ArrayIndex { field: "book".to_string(), index: 0 },
///     ]
/// );
/// ```
pub fn parse(path: &str) -> Result<Vec<PathComponent>, PathSyntaxError> {
    if path.trim().is_empty() {
        return Err(PathSyntaxError::Empty);
    }

    let mut rest = path.strip_prefix('$').unwrap_or(path);
    let mut components = Vec::new();

    if let Some(after) = rest.strip_prefix("..") {
        components.push(PathComponent::RecursiveDescent);
        rest = after;
    } else if let Some(after) = rest.strip_prefix('.') {
        rest = after;
    }

    let mut segment_start = 0;
    let mut in_bracket = false;
    for (pos, ch) in rest.char_indices() {
        match ch {
            '[' => in_bracket = true,
            ']' => in_bracket = false,
            '.' if !in_bracket => {
                push_segment(&rest[segment_start..pos], &mut components)?;
                segment_start = pos + 1;
            }
            _ => {}
        }
    }
    push_segment(&rest[segment_start..], &mut components)?;

    Ok(components)
}

fn push_segment(
    segment: &str,
    components: &mut Vec<PathComponent>,
) -> Result<(), PathSyntaxError> {
    if segment.is_empty() {
        return Ok(());
    }
    components.push(parse_segment(segment)?);
    Ok(())
}

fn parse_segment(segment: &str) -> Result<PathComponent, PathSyntaxError> {
    if segment == "*" {
        return Ok(PathComponent::Wildcard);
    }

    let open = segment.find('[');
    let close = segment.rfind(']');
    match (open, close) {
        (None, None) => Ok(PathComponent::Field(segment.to_string())),
        (Some(open), Some(close)) if open < close && close == segment.len() - 1 => {
            let field = segment[..open].to_string();
            parse_array_pattern(field, &segment[open + 1..close], segment)
        }
        _ => Err(PathSyntaxError::InvalidArrayNotation(segment.to_string())),
    }
}

fn parse_array_pattern(
    field: String,
    pattern: &str,
    segment: &str,
) -> Result<PathComponent, PathSyntaxError> {
    let pattern = pattern.trim();

    if pattern == "*" {
        return Ok(PathComponent::ArrayAll(field));
    }

    if let Some(offset_path) = pattern.strip_prefix("*+") {
        // reject a malformed offset path now rather than at compile time
        parse(offset_path)?;
        return Ok(PathComponent::ArrayAllOffset {
            field,
            offset_path: offset_path.to_string(),
        });
    }

    if let Some((start, end)) = pattern.split_once(':') {
        let start = start.trim().parse::<i64>();
        let end = end.trim().parse::<i64>();
        return match (start, end) {
            (Ok(start), Ok(end)) => Ok(PathComponent::ArrayRange { field, start, end }),
            _ => Err(PathSyntaxError::InvalidRange(segment.to_string())),
        };
    }

    if pattern.contains(',') {
        let indices = pattern
            .split(',')
            .map(|part| parse_index(part.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(PathComponent::ArrayValues { field, indices });
    }

    let index = parse_index(pattern)?;
    Ok(PathComponent::ArrayIndex { field, index })
}

fn parse_index(text: &str) -> Result<i64, PathSyntaxError> {
    text.parse::<i64>()
        .map_err(|_| PathSyntaxError::InvalidNumber(text.to_string()))
}
