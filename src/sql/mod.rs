pub mod limit;
pub mod validator;

pub use limit::apply_row_limit;
pub use validator::{SqlValidator, SqlVerdict, StatementKind};
