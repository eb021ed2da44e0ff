//! Provider-independent model for vaultform: resource schemas, the state
//! handlers read and write, references between resources, and planning.

pub mod plan;
pub mod reference;
pub mod schema;
pub mod state;
