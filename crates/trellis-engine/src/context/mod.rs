//! Context profiles and budgeted context assembly.

pub mod assembler;
pub mod profile;

pub use assembler::ContextAssembler;
pub use profile::{
    resolve_profile, validate_profile, ContextProfile, ContextSpec, ProfileRegistry,
    RetrievalPolicy, SourceSpec, GLOBAL_PROFILE_ID,
};
