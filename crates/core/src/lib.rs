pub mod account;
pub mod data;
pub mod delta;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod reparent;

pub use account::{Account, AggregationMode, CardId};
pub use data::{columns, DataKind, DataRow, DataValues, EmailType, PhoneType};
pub use delta::{
    DataDelta, EditKind, FieldDeltaModel, RawContactDelta, RawContactSnapshot, RawContactState,
};
pub use error::CoreError;
pub use field_value::FieldValue;
pub use ids::*;
pub use reparent::reparent;
