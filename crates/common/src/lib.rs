//! Common types, protocol definitions, and errors shared across the privacy service crates.

pub mod consent;
pub mod error;
pub mod profile;
pub mod protocol;

pub use consent::{
    ConsentAction, ConsentEvent, ConsentRecord, ConsentState, ConsentStats, ConsentView, Page,
};
pub use error::ServiceError;
pub use profile::{Profile, Role};
