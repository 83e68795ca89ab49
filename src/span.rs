//! Source positions attached to syntax-tree nodes, diagnostics and faults.

use std::fmt;

/// A region of source text.
///
/// The compiler only needs `line` (it fills the chunk's line table); the other
/// fields are kept so diagnostics can point at the exact token the parser saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, column: usize) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }

    /// A span that only knows its line, as recovered from a chunk's line table.
    pub fn at_line(line: usize) -> Self {
        Self {
            line,
            ..Self::default()
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.column == 0 {
            write!(f, "line {}", self.line)
        } else {
            write!(f, "line {}, column {}", self.line, self.column)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_display() {
        assert_eq!(Span::at_line(7).to_string(), "line 7");
        assert_eq!(Span::new(0, 3, 2, 5).to_string(), "line 2, column 5");
    }
}
