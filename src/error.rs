use std::fmt;

use mongodb::bson;

/// A type alias for convenience so we can fix the error to our own `RiverError` type.
pub type Result<T> = std::result::Result<T, RiverError>;

/// `RiverError` enumerates every error condition that can arise while running
/// the slurper, indexer or supervisor.
#[derive(Debug)]
pub enum RiverError {
    /// The river definition is missing a required field or has an invalid
    /// combination of settings. Fatal: the supervisor refuses to start.
    Configuration(String),
    /// Creating the target index failed for a reason other than
    /// "already exists" or the cluster being temporarily unavailable.
    Startup(String),
    /// The sink cluster was unreachable or not yet accepting writes. Treated
    /// as recoverable: indexing proceeds and the next bulk retries.
    ClusterNotReady(String),
    /// Authenticating against the admin database failed; the slurper falls
    /// back to a local credential.
    AdminAuthFailed(String),
    /// Authenticating with local credentials also failed. Fatal for the
    /// slurper that hit it.
    LocalAuthFailed(String),
    /// A transient error from the source driver (dropped connection, cursor
    /// reset, etc). The slurper logs it and restarts its outer loop.
    Driver(mongodb::error::Error),
    /// A single bulk item (one document) failed to apply on the sink side.
    /// The indexer logs it and moves on; that document is lost this round.
    BulkItemFailed {
        /// `_id` of the document the failed bulk item addressed, if known.
        id: Option<String>,
        /// The reason reported by the sink for this item.
        reason: String,
    },
    /// The bulk request failed at the transport level (no items were
    /// applied). The indexer retries the whole batch on the next loop turn.
    BulkTransportFailed(String),
    /// The `local.oplog.rs` collection could not be found. Fatal for the
    /// slurper.
    MissingOplog,
    /// A user-supplied transformation script raised an error while
    /// evaluating an event. The indexer logs it and keeps the event
    /// unchanged.
    Script(String),
    /// An error surfaced by the sink's HTTP transport.
    Sink(reqwest::Error),
    /// An error converting a value to BSON.
    Bson(bson::ser::Error),
    /// An error converting a BSON document into an expected shape (a
    /// missing or mistyped field).
    MissingField(String),
    /// An error (de)serializing JSON exchanged with the sink.
    Json(serde_json::Error),
    /// The worker was interrupted (shutdown requested). Not itself a
    /// failure; callers use this to short-circuit an outer loop cleanly.
    Interrupted,
}

impl RiverError {
    /// Whether this error should prevent the owning worker (or the whole
    /// river) from continuing at all, as opposed to self-healing by
    /// sleeping, reconnecting or retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RiverError::Configuration(_)
                | RiverError::Startup(_)
                | RiverError::LocalAuthFailed(_)
                | RiverError::MissingOplog
        )
    }
}

impl std::error::Error for RiverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RiverError::Driver(e) => Some(e),
            RiverError::Sink(e) => Some(e),
            RiverError::Bson(e) => Some(e),
            RiverError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for RiverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RiverError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            RiverError::Startup(msg) => write!(f, "startup error: {}", msg),
            RiverError::ClusterNotReady(msg) => write!(f, "cluster not ready: {}", msg),
            RiverError::AdminAuthFailed(msg) => write!(f, "admin auth failed: {}", msg),
            RiverError::LocalAuthFailed(msg) => write!(f, "local auth failed: {}", msg),
            RiverError::Driver(err) => write!(f, "driver error: {}", err),
            RiverError::BulkItemFailed { id, reason } => write!(
                f,
                "bulk item failed for {}: {}",
                id.as_deref().unwrap_or("<unknown>"),
                reason
            ),
            RiverError::BulkTransportFailed(msg) => write!(f, "bulk transport failed: {}", msg),
            RiverError::MissingOplog => write!(f, "local.oplog.rs collection not found"),
            RiverError::Script(msg) => write!(f, "script evaluation error: {}", msg),
            RiverError::Sink(err) => write!(f, "sink transport error: {}", err),
            RiverError::Bson(err) => write!(f, "bson error: {}", err),
            RiverError::MissingField(field) => write!(f, "missing or invalid field: {}", field),
            RiverError::Json(err) => write!(f, "json error: {}", err),
            RiverError::Interrupted => write!(f, "worker interrupted"),
        }
    }
}

impl From<mongodb::error::Error> for RiverError {
    fn from(original: mongodb::error::Error) -> RiverError {
        RiverError::Driver(original)
    }
}

impl From<reqwest::Error> for RiverError {
    fn from(original: reqwest::Error) -> RiverError {
        RiverError::Sink(original)
    }
}

impl From<bson::ser::Error> for RiverError {
    fn from(original: bson::ser::Error) -> RiverError {
        RiverError::Bson(original)
    }
}

impl From<serde_json::Error> for RiverError {
    fn from(original: serde_json::Error) -> RiverError {
        RiverError::Json(original)
    }
}
