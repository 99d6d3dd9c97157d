pub mod error;
pub mod types;
pub mod value;

pub use error::{StoreError, Result};
pub use types::{LogicalId, PhysicalId};
pub use value::Value;
