//! `#Fields:` directive handling

use std::collections::HashMap;

const FIELDS_DIRECTIVE: &str = "#Fields:";

/// Column layout declared by the most recent `#Fields:` directive.
///
/// Names are stored lower-cased so lookups ignore case. A new mapping is
/// built for every directive; nothing carries over between files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMap {
    columns: HashMap<String, usize>,
    width: usize,
}

impl FieldMap {
    /// Parse a directive line. Returns `None` for any other line.
    pub fn from_directive(line: &str) -> Option<Self> {
        let rest = line.trim_start().strip_prefix(FIELDS_DIRECTIVE)?;

        let mut columns = HashMap::new();
        let mut width = 0;
        for (index, name) in rest.split_whitespace().enumerate() {
            // First declaration wins if a name is repeated
            columns.entry(name.to_ascii_lowercase()).or_insert(index);
            width = index + 1;
        }

        Some(Self { columns, width })
    }

    /// Number of columns a data line must have
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.get(&name.to_ascii_lowercase()).copied()
    }

    /// Token for `name`, with `-` and undeclared fields both reading as empty
    pub fn value<'a>(&self, tokens: &[&'a str], name: &str) -> &'a str {
        match self.index_of(name).and_then(|i| tokens.get(i).copied()) {
            Some("-") | None => "",
            Some(token) => token,
        }
    }
}

/// What a line starting with `#` turned out to be
#[derive(Debug)]
pub enum Directive {
    Fields(FieldMap),
    Comment,
}

/// Classify a line. Returns `None` for data lines.
pub fn classify(line: &str) -> Option<Directive> {
    if !line.starts_with('#') {
        return None;
    }
    Some(match FieldMap::from_directive(line) {
        Some(map) => Directive::Fields(map),
        None => Directive::Comment,
    })
}
