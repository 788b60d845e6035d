use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    /// The caller asked for something inconsistent or disallowed. Never retried.
    #[snafu(display("Invalid request: {message}"))]
    Validation { message: String },

    /// A well-formed name that does not exist.
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    /// Internal fault in routing or delivery. Routing state may be partially applied.
    #[snafu(display("Broker error: {message}"))]
    Broker {
        message: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from storage backend: {source}"))]
    Storage {
        #[snafu(source(false))]
        source: eyre::Report,
    },

    #[snafu(display("Broker is shutting down"))]
    ShuttingDown,
}

impl From<eyre::Report> for Error {
    fn from(source: eyre::Report) -> Self {
        Self::Storage { source }
    }
}

impl Error {
    pub fn internal(message: impl Into<String>, e: impl Into<eyre::Report>) -> Self {
        Self::Broker {
            message: message.into(),
            source: Some(e.into()),
        }
    }

    pub fn opaque(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn queue_not_found(queue: impl AsRef<str>) -> Self {
        Self::NotFound {
            resource: format!("queue {}", queue.as_ref()),
        }
    }

    pub fn exchange_not_found(exchange: impl AsRef<str>) -> Self {
        Self::NotFound {
            resource: format!("exchange {}", exchange.as_ref()),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
