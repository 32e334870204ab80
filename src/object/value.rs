use std::{fmt, sync::Arc};

use paste::paste;

use super::class::ClassRef;
use crate::dex::descriptor::PrimitiveType;

/// Value held in a static field slot.
#[derive(Clone)]
pub enum JValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(Arc<str>),
    Class(ClassRef),
    Null,
}

macro_rules! jvalue_accessors {
    ($(($variant:ident, $name:ident, $ty:ty)),* $(,)?) => {
        impl JValue {
            paste! {
                $(
                    pub fn [<as_ $name>](&self) -> Option<$ty> {
                        match self {
                            JValue::$variant(v) => Some(v.clone()),
                            _ => None,
                        }
                    }
                )*
            }
        }
    };
}

jvalue_accessors!(
    (Boolean, bool, bool),
    (Byte, byte, i8),
    (Char, char, u16),
    (Short, short, i16),
    (Int, int, i32),
    (Long, long, i64),
    (Float, float, f32),
    (Double, double, f64),
    (Str, str, Arc<str>),
    (Class, class, ClassRef),
);

impl JValue {
    /// Zero value for a field of the given type.
    pub fn default_for(primitive_type: PrimitiveType) -> JValue {
        match primitive_type {
            PrimitiveType::Boolean => JValue::Boolean(false),
            PrimitiveType::Byte => JValue::Byte(0),
            PrimitiveType::Char => JValue::Char(0),
            PrimitiveType::Short => JValue::Short(0),
            PrimitiveType::Int => JValue::Int(0),
            PrimitiveType::Long => JValue::Long(0),
            PrimitiveType::Float => JValue::Float(0.0),
            PrimitiveType::Double => JValue::Double(0.0),
            PrimitiveType::Not | PrimitiveType::Void => JValue::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JValue::Null)
    }
}

impl PartialEq for JValue {
    fn eq(&self, other: &JValue) -> bool {
        match (self, other) {
            (JValue::Boolean(a), JValue::Boolean(b)) => a == b,
            (JValue::Byte(a), JValue::Byte(b)) => a == b,
            (JValue::Char(a), JValue::Char(b)) => a == b,
            (JValue::Short(a), JValue::Short(b)) => a == b,
            (JValue::Int(a), JValue::Int(b)) => a == b,
            (JValue::Long(a), JValue::Long(b)) => a == b,
            (JValue::Float(a), JValue::Float(b)) => a.to_bits() == b.to_bits(),
            (JValue::Double(a), JValue::Double(b)) => a.to_bits() == b.to_bits(),
            (JValue::Str(a), JValue::Str(b)) => Arc::ptr_eq(a, b),
            (JValue::Class(a), JValue::Class(b)) => Arc::ptr_eq(a, b),
            (JValue::Null, JValue::Null) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for JValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JValue::Boolean(v) => write!(f, "{}", v),
            JValue::Byte(v) => write!(f, "{}", v),
            JValue::Char(v) => write!(f, "'\\u{:04x}'", v),
            JValue::Short(v) => write!(f, "{}", v),
            JValue::Int(v) => write!(f, "{}", v),
            JValue::Long(v) => write!(f, "{}L", v),
            JValue::Float(v) => write!(f, "{}f", v),
            JValue::Double(v) => write!(f, "{}d", v),
            JValue::Str(v) => write!(f, "{:?}", v),
            JValue::Class(c) => write!(f, "{}.class", c.pretty_descriptor()),
            JValue::Null => f.write_str("null"),
        }
    }
}
