pub mod error;
pub mod file;
pub mod value;

pub use error::{ErrorKind, Result, SyncError, codes};
pub use file::FileRef;
pub use value::{Relation, Value};
