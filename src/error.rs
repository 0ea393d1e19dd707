use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    /// A conditional update in the lock manager lost a race to a conflicting
    /// holder. The engine is expected to retry within its busy-timeout.
    #[snafu(display("database is locked"))]
    Busy,

    /// A DynamoDB request failed for a reason other than a failed condition
    /// check (throttling, network, validation, ...).
    #[snafu(display("dynamodb request failed: {source}"))]
    Sdk {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A stored item was missing an attribute the protocol guarantees, or
    /// carried the wrong DynamoDB type for it.
    #[snafu(display("malformed item: {message}"))]
    InvalidItem { message: String },

    /// An operation's response violated an invariant the protocol assumes
    /// (e.g. an unlock transition with no recorded reader count).
    #[snafu(display("invariant violation: {message}"))]
    Corruption { message: String },
}

impl Error {
    pub fn sdk<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Sdk {
            source: Box::new(source),
        }
    }

    pub fn invalid_item(message: impl Into<String>) -> Self {
        Error::InvalidItem {
            message: message.into(),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption {
            message: message.into(),
        }
    }
}

/// Outcome of a conditional DynamoDB write, distinguishing a lost race
/// (`ConditionalCheckFailedException`) from every other failure so callers
/// can map the former to [`Error::Busy`] without misclassifying transient
/// SDK errors.
#[derive(Debug)]
pub enum Conditional<T> {
    Ok(T),
    ConditionFailed,
}

impl<T> Conditional<T> {
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Conditional::Ok(v) => Ok(v),
            Conditional::ConditionFailed => Err(Error::Busy),
        }
    }
}
