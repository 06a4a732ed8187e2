pub mod aggregation;
pub mod card;
pub mod error;
pub mod ops;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use aggregation::{ExceptionType, display_name_source};
pub use card::{CardEntry, CardError, CardLimits, CardRecord, CardStore, CardWrite, MemoryCard};
pub use error::StorageError;
pub use ops::{Condition, OpKind, OpResult, Operand, ProviderOp, ProviderOpBuilder, Selection, Target};
pub use sqlite::SqliteProvider;
pub use traits::*;
