//! kubecat expression layer: compiles mapping expressions once, infers the
//! shape of their output and assembles service registrations.

#![forbid(unsafe_code)]

pub mod builder;
pub mod composite;
pub mod evaluator;
pub mod field;
pub mod testing;

pub use builder::{BuildError, RegistrationBuilder};
pub use composite::{AliasParser, PropertyParser, RepositoryParser, TagParser, ToolParser};
pub use evaluator::{Evaluator, ExprError, JqEvaluator, Program};
pub use field::{classify, EvaluatedResult, ExcludeFilter, FieldParser};
