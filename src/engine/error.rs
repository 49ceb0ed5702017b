use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Missing or malformed input. Detected before any record access.
    Validation(&'static str),
    /// Insufficient capability for the requested action. Detected before any mutation.
    Unauthorized(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Stay overlaps the named active booking.
    Conflict(Ulid),
    /// Profile still hosts listings.
    HasListings(Ulid),
    /// Listing still has active bookings.
    HasActiveBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation: {msg}"),
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::HasListings(id) => {
                write!(f, "cannot delete profile {id}: still hosts listings")
            }
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot delete listing {id}: has active bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
