//! Errors raised by the storage layer.

use std::fmt;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// The storage call that failed and the record it was working on.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Repository method name, e.g. `replace_tiles`.
    pub operation: Option<String>,
    /// Table-level entity, e.g. `gcn_event` or `followup_request`.
    pub entity: Option<String>,
    pub entity_id: Option<String>,
    pub details: Option<String>,
    /// Set for failures that may clear up on a second attempt.
    pub retryable: bool,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn with_entity_id(mut self, id: impl ToString) -> Self {
        self.entity_id = Some(id.to_string());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    fn is_empty(&self) -> bool {
        self.operation.is_none()
            && self.entity.is_none()
            && self.entity_id.is_none()
            && self.details.is_none()
    }
}

impl fmt::Display for ErrorContext {
    /// Renders as ` (in replace_tiles on localization#7: details)`, or
    /// nothing when no context was attached.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        f.write_str(" (")?;
        let mut sep = "";
        if let Some(op) = &self.operation {
            write!(f, "in {op}")?;
            sep = " ";
        }
        match (&self.entity, &self.entity_id) {
            (Some(entity), Some(id)) => write!(f, "{sep}on {entity}#{id}")?,
            (Some(entity), None) => write!(f, "{sep}on {entity}")?,
            (None, Some(id)) => write!(f, "{sep}on #{id}")?,
            (None, None) => {}
        }
        if let Some(details) = &self.details {
            write!(f, ": {details}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The database could not be reached or the pool was exhausted.
    #[error("connection failed: {message}{context}")]
    ConnectionError { message: String, context: ErrorContext },

    #[error("query failed: {message}{context}")]
    QueryError { message: String, context: ErrorContext },

    #[error("{message}{context}")]
    NotFound { message: String, context: ErrorContext },

    /// A unique key (event dateobs, notice ivorn, localization name) is taken.
    #[error("conflict: {message}{context}")]
    Conflict { message: String, context: ErrorContext },

    /// Input rejected before it reached storage, e.g. overlapping tiles.
    #[error("invalid data: {message}{context}")]
    ValidationError { message: String, context: ErrorContext },

    #[error("repository misconfigured: {message}{context}")]
    ConfigurationError { message: String, context: ErrorContext },

    #[error("internal repository error: {message}{context}")]
    InternalError { message: String, context: ErrorContext },
}

/// Generates `name(message)` and `name_with_context(message, context)`.
macro_rules! constructors {
    ($($variant:ident => $plain:ident, $with:ident);+ $(;)?) => {
        $(
            pub fn $plain(message: impl Into<String>) -> Self {
                Self::$variant { message: message.into(), context: ErrorContext::default() }
            }

            pub fn $with(message: impl Into<String>, context: ErrorContext) -> Self {
                Self::$variant { message: message.into(), context }
            }
        )+
    };
}

impl RepositoryError {
    constructors! {
        QueryError => query, query_with_context;
        NotFound => not_found, not_found_with_context;
        Conflict => conflict, conflict_with_context;
        ValidationError => validation, validation_with_context;
        ConfigurationError => configuration, configuration_with_context;
        InternalError => internal, internal_with_context;
    }

    /// Connection failures are always worth a retry.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::connection_with_context(message, ErrorContext::default())
    }

    pub fn connection_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::ConnectionError {
            message: message.into(),
            context: context.retryable(),
        }
    }

    /// Lock poisoning in the in-memory store.
    pub fn poisoned() -> Self {
        Self::internal("repository lock poisoned")
    }

    pub fn is_retryable(&self) -> bool {
        self.context().retryable
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::ConnectionError { context, .. }
            | Self::QueryError { context, .. }
            | Self::NotFound { context, .. }
            | Self::Conflict { context, .. }
            | Self::ValidationError { context, .. }
            | Self::ConfigurationError { context, .. }
            | Self::InternalError { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::ConnectionError { context, .. }
            | Self::QueryError { context, .. }
            | Self::NotFound { context, .. }
            | Self::Conflict { context, .. }
            | Self::ValidationError { context, .. }
            | Self::ConfigurationError { context, .. }
            | Self::InternalError { context, .. } => context,
        }
    }

    /// Tags the error with the repository method it escaped from, keeping
    /// an operation that was already recorded deeper down.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        let context = self.context_mut();
        if context.operation.is_none() {
            context.operation = Some(operation.into());
        }
        self
    }
}

#[cfg(feature = "postgres-repo")]
impl From<diesel::result::Error> for RepositoryError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match err {
            Error::NotFound => RepositoryError::not_found("record not found"),
            Error::DatabaseError(kind, info) => {
                let message = info.message().to_string();
                let mut context = ErrorContext::default();
                if let Some(table) = info.table_name() {
                    context = context.with_entity(table);
                }
                if let Some(constraint) = info.constraint_name() {
                    context = context.with_details(format!("constraint {constraint}"));
                }
                match kind {
                    DatabaseErrorKind::UniqueViolation => {
                        RepositoryError::conflict_with_context(message, context)
                    }
                    // The parent row (event, localization, request) is gone.
                    DatabaseErrorKind::ForeignKeyViolation => {
                        RepositoryError::not_found_with_context(message, context)
                    }
                    DatabaseErrorKind::SerializationFailure => {
                        RepositoryError::query_with_context(message, context.retryable())
                    }
                    DatabaseErrorKind::ClosedConnection => {
                        RepositoryError::connection_with_context(message, context)
                    }
                    _ => RepositoryError::query_with_context(message, context),
                }
            }
            Error::DeserializationError(e) => {
                RepositoryError::internal(format!("cannot decode row: {e}"))
            }
            Error::SerializationError(e) => {
                RepositoryError::internal(format!("cannot encode value: {e}"))
            }
            other => RepositoryError::query(other.to_string()),
        }
    }
}

#[cfg(feature = "postgres-repo")]
impl From<diesel::r2d2::PoolError> for RepositoryError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        RepositoryError::connection_with_context(
            err.to_string(),
            ErrorContext::default().with_details("pool checkout"),
        )
    }
}
