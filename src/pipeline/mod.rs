pub mod executor;
pub mod generator;
pub mod result_validator;

pub use executor::{ExecuteOptions, ExecutorError, ExecutorSettings, QueryExecutor};
pub use generator::{GeneratedQuery, GenerationError, GenerationMethod, QueryGenerator, SqlGenerator};
pub use result_validator::{ResultValidator, ResultVerdict, ValidationLevel};
