//! Well-known classes the linker keeps direct handles to.

use crate::object::class::OBJECT_HEADER_SIZE;

macro_rules! class_roots {
    ($($name:ident => $descriptor:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ClassRoot {
            $($name),*
        }

        impl ClassRoot {
            pub const ALL: &'static [ClassRoot] = &[$(ClassRoot::$name),*];

            pub fn descriptor(&self) -> &'static str {
                match self {
                    $(ClassRoot::$name => $descriptor),*
                }
            }
        }
    };
}

class_roots! {
    JavaLangClass => "Ljava/lang/Class;",
    JavaLangObject => "Ljava/lang/Object;",
    ClassArrayClass => "[Ljava/lang/Class;",
    ObjectArrayClass => "[Ljava/lang/Object;",
    JavaLangString => "Ljava/lang/String;",
    JavaLangDexCache => "Ljava/lang/DexCache;",
    JavaLangRefReference => "Ljava/lang/ref/Reference;",
    JavaLangReflectArtField => "Ljava/lang/reflect/ArtField;",
    JavaLangReflectArtMethod => "Ljava/lang/reflect/ArtMethod;",
    JavaLangReflectProxy => "Ljava/lang/reflect/Proxy;",
    JavaLangStringArrayClass => "[Ljava/lang/String;",
    JavaLangReflectArtFieldArrayClass => "[Ljava/lang/reflect/ArtField;",
    JavaLangReflectArtMethodArrayClass => "[Ljava/lang/reflect/ArtMethod;",
    JavaLangClassLoader => "Ljava/lang/ClassLoader;",
    JavaLangThrowable => "Ljava/lang/Throwable;",
    JavaLangClassNotFoundException => "Ljava/lang/ClassNotFoundException;",
    JavaLangStackTraceElement => "Ljava/lang/StackTraceElement;",
    PrimitiveBoolean => "Z",
    PrimitiveByte => "B",
    PrimitiveChar => "C",
    PrimitiveDouble => "D",
    PrimitiveFloat => "F",
    PrimitiveInt => "I",
    PrimitiveLong => "J",
    PrimitiveShort => "S",
    PrimitiveVoid => "V",
    BooleanArrayClass => "[Z",
    ByteArrayClass => "[B",
    CharArrayClass => "[C",
    DoubleArrayClass => "[D",
    FloatArrayClass => "[F",
    IntArrayClass => "[I",
    LongArrayClass => "[J",
    ShortArrayClass => "[S",
    JavaLangStackTraceElementArrayClass => "[Ljava/lang/StackTraceElement;",
}

impl ClassRoot {
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn is_primitive(&self) -> bool {
        return self.descriptor().len() == 1;
    }

    pub fn is_array(&self) -> bool {
        return self.descriptor().starts_with('[');
    }
}

/// Instance sizes of the classes built by hand during bootstrap. The
/// definitions loaded later for these classes must produce the same layout.
pub const OBJECT_INSTANCE_SIZE: u32 = OBJECT_HEADER_SIZE;
pub const STRING_INSTANCE_SIZE: u32 = 24;
pub const DEX_CACHE_INSTANCE_SIZE: u32 = 40;
pub const ART_FIELD_INSTANCE_SIZE: u32 = 24;
pub const ART_METHOD_INSTANCE_SIZE: u32 = 40;

/// Classes whose storage is built before allocation works; `define_class`
/// reuses these instead of allocating.
pub const HAND_CRAFTED_CLASSES: &[ClassRoot] = &[
    ClassRoot::JavaLangObject,
    ClassRoot::JavaLangClass,
    ClassRoot::JavaLangString,
    ClassRoot::JavaLangDexCache,
    ClassRoot::JavaLangReflectArtField,
    ClassRoot::JavaLangReflectArtMethod,
];

/// Array classes built by hand during bootstrap; `create_array_class`
/// reuses these instead of allocating.
pub const HAND_CRAFTED_ARRAY_CLASSES: &[ClassRoot] = &[
    ClassRoot::ClassArrayClass,
    ClassRoot::ObjectArrayClass,
    ClassRoot::JavaLangStringArrayClass,
    ClassRoot::JavaLangReflectArtMethodArrayClass,
    ClassRoot::JavaLangReflectArtFieldArrayClass,
    ClassRoot::CharArrayClass,
    ClassRoot::IntArrayClass,
];
