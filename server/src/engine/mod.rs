pub mod channel;
pub mod error;
pub mod guardian;
pub mod ids;
pub mod monitor;
pub mod negotiation;
pub mod notice;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod validation;

pub use error::{CommandError, NegotiationError};
