//! Field-level mutations and the per-generation operation sets built from them.

mod field_op;
mod operation_set;

pub use field_op::FieldOperation;
pub use operation_set::OperationSet;
