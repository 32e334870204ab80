pub mod class;
pub mod dex_cache;
pub mod field;
pub mod iftable;
pub mod intern;
pub mod method;
pub mod monitor;
pub mod value;

pub use class::{Class, ClassRef, ClassStatus};
pub use dex_cache::DexCache;
pub use field::{Field, FieldRef};
pub use iftable::{IfTable, IfTableEntry};
pub use method::{EntryPoint, InvokeType, Method, MethodRef};
pub use value::JValue;
