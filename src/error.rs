use crate::deal::Role;

/// Every way a transition can be rejected. Nothing is written when one of these
/// is returned.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EscrowError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("precondition failed: {0}")]
    State(#[from] StateError),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("description cannot be empty")]
    EmptyDescription,
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
    #[error("must specify a positive quantity")]
    NonPositiveQuantity,
    #[error("account does not exist: {0}")]
    UnknownAccount(String),
    #[error("buyer, seller and arbiter must be different accounts")]
    DuplicateParties,
    #[error("delivery term should be a positive number of days")]
    ZeroDays,
    #[error("invalid token contract or the buyer has no {symbol} balance at {contract}")]
    NoBalance { contract: String, symbol: String },
    #[error("memo must contain a valid deal id")]
    MissingMemo,
    #[error("memo is not a decimal deal id: {0:?}")]
    MalformedMemo(String),
    #[error("invalid amount or currency. expected {expected}, got {got}")]
    PriceMismatch { expected: String, got: String },
    #[error("extension must add a positive number of days")]
    ZeroExtension,
    #[error("delivery term overflow")]
    TermOverflow,
    #[error("expiry falls past the last representable instant")]
    ExpiryOutOfRange,
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("{signer} cannot act on behalf of {party}")]
    MissingAuthority { signer: String, party: String },
    #[error("only the {0} can perform this action")]
    RoleRequired(Role),
    #[error("deal can only be accepted by either seller or buyer")]
    NotAParty,
    #[error("a funded deal can only be canceled by the seller")]
    FundedCancel,
    #[error("the deal can only be funded by the buyer")]
    NotBuyer,
    #[error("only the custodian can run this action")]
    SystemOnly,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StateError {
    #[error("cannot find deal {0}")]
    NotFound(u64),
    #[error("deal id {0} is already in use")]
    IdCollision(u64),
    #[error("{0} has already accepted this deal")]
    AlreadyAccepted(Role),
    #[error("the deal is not accepted yet by both parties")]
    NotAccepted,
    #[error("the deal is already funded")]
    AlreadyFunded,
    #[error("the deal is not funded yet")]
    NotFunded,
    #[error("the deal is already marked as delivered")]
    AlreadyDelivered,
    #[error("the deal is not in arbitration")]
    NotInArbitration,
    #[error("the deal is in arbitration")]
    InArbitration,
    #[error("deal {0} changed since it was read")]
    Stale(u64),
}

impl EscrowError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }
}
