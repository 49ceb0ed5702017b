//! The canonical access policy: one table mapping (entity, action) to the
//! required capability, evaluated against an explicit per-request context.
//! Ownership checks (owner/host/author/moderator) happen at the record, after
//! this gate passes.

use super::EngineError;

/// The acting principal, resolved by the wire layer from the connection's
/// login name. The reserved login `anonymous` is the unauthenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    Named(String),
}

impl Principal {
    pub fn name(&self) -> Option<&str> {
        match self {
            Principal::Anonymous => None,
            Principal::Named(name) => Some(name),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Principal::Named(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Profile,
    Listing,
    Booking,
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    List,
    Retrieve,
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn is_read(&self) -> bool {
        matches!(self, Action::List | Action::Retrieve)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Anyone, including the anonymous principal.
    Open,
    /// A named principal.
    Authenticated,
    /// A named principal, or anyone if the action is a read.
    AuthenticatedOrReadOnly,
}

/// Per-request context, passed explicitly into policy and checker functions.
#[derive(Debug)]
pub struct Request<'a> {
    pub principal: &'a Principal,
    pub entity: EntityKind,
    pub action: Action,
}

/// The action → required capability table.
pub fn required_capability(entity: EntityKind, action: Action) -> Capability {
    use Action::*;
    use Capability::*;
    use EntityKind::*;
    match (entity, action) {
        (Profile, List) => AuthenticatedOrReadOnly,
        (Profile, Create) => Open,
        (Profile, _) => Authenticated,
        (Listing, List | Retrieve) => Open,
        (Listing, _) => Authenticated,
        // Bookings are owner-scoped throughout; even listing them requires auth.
        (Booking, _) => Authenticated,
        (Review, List | Retrieve) => Open,
        (Review, _) => Authenticated,
    }
}

pub fn authorize(req: &Request<'_>) -> Result<(), EngineError> {
    let allowed = match required_capability(req.entity, req.action) {
        Capability::Open => true,
        Capability::Authenticated => req.principal.is_authenticated(),
        Capability::AuthenticatedOrReadOnly => {
            req.principal.is_authenticated() || req.action.is_read()
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::Unauthorized("authentication required"))
    }
}
