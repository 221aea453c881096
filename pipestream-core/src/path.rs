//! Typed addressing into nested JSON values
//!
//! A [`Path`] is a list of segments applied left to right. Looking up a path
//! that does not exist yields [`Lookup::NotFound`], which is distinct from a
//! path that exists and holds `null`.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Result of a path lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a Value),
    NotFound,
}

impl<'a> Lookup<'a> {
    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    #[must_use]
    pub const fn value(self) -> Option<&'a Value> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<PathSegment>);

impl Path {
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Append an array index, e.g. `items` + 2 = `items.2`
    #[must_use]
    pub fn with_index(mut self, index: usize) -> Self {
        self.0.push(PathSegment::Index(index));
        self
    }

    /// Resolve the path against `value`
    #[must_use]
    pub fn lookup<'a>(&self, value: &'a Value) -> Lookup<'a> {
        let mut current = value;
        for segment in &self.0 {
            let next = match (current, segment) {
                (Value::Object(map), PathSegment::Key(key)) => map.get(key),
                (Value::Object(map), PathSegment::Index(index)) => map.get(&index.to_string()),
                (Value::Array(items), PathSegment::Index(index)) => items.get(*index),
                _ => None,
            };
            match next {
                Some(next) => current = next,
                None => return Lookup::NotFound,
            }
        }
        Lookup::Found(current)
    }
}

impl FromStr for Path {
    type Err = Error;

    /// Parse a dotted path; integer segments become indexes
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        s.split('.')
            .map(|part| {
                if part.is_empty() {
                    return Err(Error::InvalidInput(format!("empty segment in path '{s}'")));
                }
                // Only canonical integers index; "007" or "+7" stay object keys
                Ok(match part.parse::<usize>() {
                    Ok(index) if index.to_string() == part => PathSegment::Index(index),
                    _ => PathSegment::Key(part.to_string()),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse() {
        let path: Path = "result.items.2.name".parse().unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("result".to_string()),
                PathSegment::Key("items".to_string()),
                PathSegment::Index(2),
                PathSegment::Key("name".to_string()),
            ]
        );
        assert_eq!(path.to_string(), "result.items.2.name");
        assert!("".parse::<Path>().unwrap().is_root());
        assert!("a..b".parse::<Path>().is_err());
    }

    #[test]
    fn test_lookup_found_and_not_found() {
        let value = json!({ "a": { "b": [10, 20, { "c": null }] } });

        let path: Path = "a.b.1".parse().unwrap();
        assert_eq!(path.lookup(&value), Lookup::Found(&json!(20)));

        let path: Path = "a.b.2.c".parse().unwrap();
        assert_eq!(path.lookup(&value), Lookup::Found(&Value::Null));

        let path: Path = "a.b.9".parse().unwrap();
        assert_eq!(path.lookup(&value), Lookup::NotFound);

        let path: Path = "a.x".parse().unwrap();
        assert!(!path.lookup(&value).is_found());
    }

    #[test]
    fn test_numeric_object_key() {
        let value = json!({ "0": "zero" });
        let path: Path = "0".parse().unwrap();
        assert_eq!(path.lookup(&value).value(), Some(&json!("zero")));
    }

    #[test]
    fn test_non_canonical_number_stays_key() {
        let value = json!({ "007": "bond", "7": "seven", "+1": "plus" });
        let path: Path = "007".parse().unwrap();
        assert_eq!(path.segments(), &[PathSegment::Key("007".to_string())]);
        assert_eq!(path.lookup(&value).value(), Some(&json!("bond")));

        let path: Path = "+1".parse().unwrap();
        assert_eq!(path.lookup(&value).value(), Some(&json!("plus")));

        let items = json!(["a", "b"]);
        assert_eq!("01".parse::<Path>().unwrap().lookup(&items), Lookup::NotFound);
        assert_eq!("7".parse::<Path>().unwrap().lookup(&value).value(), Some(&json!("seven")));
    }

    #[test]
    fn test_with_index() {
        let value = json!({ "items": ["x", "y"] });
        let path = "items".parse::<Path>().unwrap().with_index(1);
        assert_eq!(path.lookup(&value).value(), Some(&json!("y")));
        assert_eq!(Path::root().with_index(0).to_string(), "0");
    }
}
