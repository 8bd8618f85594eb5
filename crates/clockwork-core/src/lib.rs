//! Core types for Clockwork: identifiers, the message model, parsed gadget
//! calls, and the gadget error taxonomy shared by every other crate.

pub mod call;
pub mod error;
pub mod ids;
pub mod message;

pub use call::{MarkerConfig, ParsedGadgetCall};
pub use error::{format_gadget_result, GadgetError};
pub use ids::{InvocationId, NodeId};
pub use message::{Content, ContentPart, MediaOutput, Message, Role, Usage};
