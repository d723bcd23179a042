//! Query/update AST and its compilation to SQL (spec.md §4.2/§4.3).

pub mod model;
pub mod translator;
pub mod update;

pub use model::{FieldPredicate, FindOptions, Op, Projection, Query, QueryParseError, SortDirection};
pub use translator::{ColumnResolver, CompiledPredicate, NoColumns, SchemaColumnResolver, SqlDialect, Translator};
pub use update::{Update, UpdateParseError};
