use thiserror::Error;

use super::sexpr::Sexpr;
use crate::runtime::HostError;

/// A fatal compile-time error. The current form is abandoned; the compiler
/// itself stays usable for the next toplevel form.
#[derive(Error, Debug, Clone)]
pub enum CompileError {
    #[error("malformed lambda list: {form}: {message}")]
    LambdaList { form: String, message: String },

    #[error("odd number of arguments to setq: {form}")]
    OddSetq { form: String },

    #[error("unknown tag in go: {tag}")]
    UnknownGoTag { tag: String },

    #[error("return-from to unknown block: {name}")]
    UnknownBlock { name: String },

    #[error("malformed {operator}: {form}")]
    Malformed { operator: String, form: String },

    #[error("bad function designator: {form}")]
    BadFunction { form: String },

    #[error("improper list in call position: {form}")]
    ImproperForm { form: String },

    #[error("error while expanding {form}: {message}")]
    Expansion { form: String, message: String },

    #[error("compile-time evaluation failed: {0}")]
    Host(#[from] HostError),
}

pub type CompileResult<T> = Result<T, CompileError>;

impl CompileError {
    pub fn malformed(operator: &str, form: &Sexpr) -> Self {
        Self::Malformed {
            operator: operator.to_lowercase(),
            form: form.to_string(),
        }
    }

    pub fn lambda_list(form: &Sexpr, message: impl Into<String>) -> Self {
        Self::LambdaList {
            form: form.to_string(),
            message: message.into(),
        }
    }
}
