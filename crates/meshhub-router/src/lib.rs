//! Request routing for the hub HTTP surface
//!
//! Matches `(method, path)` against an ordered table of path patterns.
//! Patterns are made of literal segments, `{name}` parameters matching
//! exactly one segment, and a trailing `*` matching the remainder.
//! The first pattern that matches the path wins; a matching path without a
//! handler for the method is reported separately from an unknown path.

pub mod pattern;
pub mod table;

pub use pattern::{PathPattern, PatternError, RouteParams};
pub use table::{RouteError, RouteMatch, RouteTable, RouteTableBuilder};
