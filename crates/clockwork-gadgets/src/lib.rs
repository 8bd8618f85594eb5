//! Gadget capability surface: the trait gadgets implement, the schema
//! capability, the case-insensitive registry, and the approval model.

pub mod approval;
pub mod gadget;
pub mod registry;
pub mod schema;

pub use approval::{
    ApprovalConfig, ApprovalHandler, ApprovalMode, ApprovalResponse, HumanInputHandler,
};
pub use gadget::{AgentSettings, Gadget, GadgetContext, GadgetReply, SubagentOverrides};
pub use registry::{GadgetRegistry, RegistryError};
pub use schema::{FieldKind, FieldSpec, ObjectSchema, Schema, SchemaIssue};
