use crate::error::Error;

pub fn from_pom_error(e: pom::Error, input: &str) -> Error {
    Error::validation(format!("malformed selector {input:?}: {e}"))
}
