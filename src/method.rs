//! Method descriptors and tables.
//!
//! A [`MethodTable`] is the ordered, zero-indexed list of callable method
//! descriptors for one side of a connection. Indices are assigned in
//! declaration order and stay stable for the life of a session; construction
//! fails with `too many methods` once the table would collide with the
//! reserved control codes.
//!
//! # Example
//!
//! ```
//! use sockwire::method::{Bin, MethodOptions, MethodTable, RateLimit};
//!
//! let table = MethodTable::builder()
//!     .method("hello")
//!     .method_with("login", MethodOptions::promise())
//!     .method_with(
//!         "save",
//!         MethodOptions::promise().rate_limit("1/s".parse::<RateLimit>().unwrap()),
//!     )
//!     .method_with("bye", MethodOptions::new().binary(vec![Bin::U8]))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(table.index_of("login"), Some(1));
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SockwireError};
use crate::protocol::MAX_METHODS;

/// Argument kinds for the fixed-schema binary fast path.
///
/// A method declaring a schema has its arguments written with the primitive
/// packet writers directly, with no per-value type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bin {
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 32-bit integer.
    I32,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Boolean.
    Bool,
    /// Nullable string.
    Str,
    /// Generic value (one self-describing encoding pass).
    Obj,
}

/// Per-method call-admission rate: at most `limit` calls per `frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum calls admitted within one window.
    pub limit: u32,
    /// Window duration.
    pub frame: Duration,
}

impl FromStr for RateLimit {
    type Err = SockwireError;

    /// Parse declarations like `"1/s"`, `"10/m"`, `"500/h"`.
    fn from_str(s: &str) -> Result<Self> {
        let (count, unit) = s
            .split_once('/')
            .ok_or_else(|| SockwireError::Protocol(format!("invalid rate limit: {s}")))?;
        let limit: u32 = count
            .trim()
            .parse()
            .map_err(|_| SockwireError::Protocol(format!("invalid rate limit: {s}")))?;
        let frame = match unit.trim() {
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            _ => return Err(SockwireError::Protocol(format!("invalid rate limit: {s}"))),
        };
        if limit == 0 {
            return Err(SockwireError::Protocol(format!("invalid rate limit: {s}")));
        }
        Ok(Self { limit, frame })
    }
}

/// Options attached to one method declaration.
#[derive(Debug, Clone, Default)]
pub struct MethodOptions {
    /// Whether the method returns a pending result that is resolved or
    /// rejected by the remote side.
    pub promise: bool,
    /// Whether a progress flag is kept true while a call is pending.
    pub progress: bool,
    /// Optional call-admission rate limit.
    pub rate_limit: Option<RateLimit>,
    /// Optional fixed binary schema for the argument list.
    pub binary: Option<Vec<Bin>>,
}

impl MethodOptions {
    /// Plain fire-and-forget method.
    pub fn new() -> Self {
        Self::default()
    }

    /// Promise-returning method.
    pub fn promise() -> Self {
        Self {
            promise: true,
            ..Self::default()
        }
    }

    /// Track a progress flag while calls are pending.
    pub fn progress(mut self) -> Self {
        self.progress = true;
        self
    }

    /// Attach a rate limit.
    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// Attach a fixed binary schema.
    pub fn binary(mut self, schema: Vec<Bin>) -> Self {
        self.binary = Some(schema);
        self
    }
}

/// One entry of a [`MethodTable`].
#[derive(Debug, Clone)]
pub struct MethodDesc {
    /// Method name.
    pub name: String,
    /// Declaration options.
    pub options: MethodOptions,
}

/// Ordered, immutable list of method descriptors for one side.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: Vec<MethodDesc>,
}

impl MethodTable {
    /// Start building a table.
    pub fn builder() -> MethodTableBuilder {
        MethodTableBuilder {
            methods: Vec::new(),
        }
    }

    /// An empty table (no callable methods).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the table has no methods.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Descriptor at the given index.
    pub fn get(&self, index: usize) -> Option<&MethodDesc> {
        self.methods.get(index)
    }

    /// Index of the method with the given name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    /// Iterate over descriptors in index order.
    pub fn iter(&self) -> impl Iterator<Item = &MethodDesc> {
        self.methods.iter()
    }
}

/// Builder assigning indices in declaration order.
#[derive(Debug)]
pub struct MethodTableBuilder {
    methods: Vec<MethodDesc>,
}

impl MethodTableBuilder {
    /// Declare a plain fire-and-forget method.
    pub fn method(self, name: &str) -> Self {
        self.method_with(name, MethodOptions::new())
    }

    /// Declare a method with options.
    pub fn method_with(mut self, name: &str, options: MethodOptions) -> Self {
        self.methods.push(MethodDesc {
            name: name.to_string(),
            options,
        });
        self
    }

    /// Finish the table.
    ///
    /// Fails with [`SockwireError::TooManyMethods`] when the index space
    /// would overlap the reserved control codes.
    pub fn build(self) -> Result<MethodTable> {
        if self.methods.len() > MAX_METHODS {
            return Err(SockwireError::TooManyMethods);
        }
        Ok(MethodTable {
            methods: self.methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_assignment_in_declaration_order() {
        let table = MethodTable::builder()
            .method("first")
            .method("second")
            .method_with("third", MethodOptions::promise())
            .build()
            .unwrap();

        assert_eq!(table.index_of("first"), Some(0));
        assert_eq!(table.index_of("second"), Some(1));
        assert_eq!(table.index_of("third"), Some(2));
        assert_eq!(table.index_of("missing"), None);
        assert!(table.get(2).unwrap().options.promise);
    }

    #[test]
    fn test_too_many_methods() {
        let mut builder = MethodTable::builder();
        for i in 0..=MAX_METHODS {
            builder = builder.method(&format!("foo{i}"));
        }
        let result = builder.build();
        assert!(matches!(result, Err(SockwireError::TooManyMethods)));
    }

    #[test]
    fn test_max_methods_exactly_fits() {
        let mut builder = MethodTable::builder();
        for i in 0..MAX_METHODS {
            builder = builder.method(&format!("foo{i}"));
        }
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_rate_limit_parsing() {
        let limit: RateLimit = "1/s".parse().unwrap();
        assert_eq!(limit.limit, 1);
        assert_eq!(limit.frame, Duration::from_secs(1));

        let limit: RateLimit = "10/m".parse().unwrap();
        assert_eq!(limit.limit, 10);
        assert_eq!(limit.frame, Duration::from_secs(60));

        let limit: RateLimit = "500/h".parse().unwrap();
        assert_eq!(limit.limit, 500);
        assert_eq!(limit.frame, Duration::from_secs(3600));
    }

    #[test]
    fn test_rate_limit_parse_errors() {
        assert!("".parse::<RateLimit>().is_err());
        assert!("1".parse::<RateLimit>().is_err());
        assert!("x/s".parse::<RateLimit>().is_err());
        assert!("1/day".parse::<RateLimit>().is_err());
        assert!("0/s".parse::<RateLimit>().is_err());
    }

    #[test]
    fn test_options_builder() {
        let options = MethodOptions::promise()
            .progress()
            .rate_limit("2/s".parse().unwrap())
            .binary(vec![Bin::U8, Bin::Str]);
        assert!(options.promise);
        assert!(options.progress);
        assert_eq!(options.rate_limit.unwrap().limit, 2);
        assert_eq!(options.binary.unwrap(), vec![Bin::U8, Bin::Str]);
    }
}
