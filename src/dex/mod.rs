pub mod builder;
pub mod descriptor;

use std::{collections::HashMap, fmt, io::Read, path::Path};

pub use builder::{ClassDefBuilder, DexFileBuilder, StaticValue};

pub const NO_INDEX_16: u16 = 0xFFFF;
pub const NO_INDEX: u32 = 0xFFFF_FFFF;

pub const DEX_MAGIC: &[u8; 4] = b"dex\n";

/// Failures raised while loading, linking, verifying, initializing or
/// resolving classes, and while locating compiled artifacts. Each variant
/// corresponds to a Java-level throwable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassLoadErr {
    ClassNotFound(String),
    NoClassDefFound(String),
    NoSuchMethod(String),
    NoSuchField(String),
    IncompatibleClassChange(String),
    IllegalAccess(String),
    ClassCircularity(String),
    Linkage(String),
    ClassFormat(String),
    Verify(String),
    OutOfMemory(String),
    ExceptionInInitializer(String),
    /// A throwable raised by managed code that is not a `java.lang.Error`.
    Exception { descriptor: String, message: String },
    ArtifactChecksumMismatch(String),
    ArtifactOpen(String),
}

impl ClassLoadErr {
    pub fn descriptor(&self) -> &str {
        match self {
            ClassLoadErr::ClassNotFound(_) => "Ljava/lang/ClassNotFoundException;",
            ClassLoadErr::NoClassDefFound(_) => "Ljava/lang/NoClassDefFoundError;",
            ClassLoadErr::NoSuchMethod(_) => "Ljava/lang/NoSuchMethodError;",
            ClassLoadErr::NoSuchField(_) => "Ljava/lang/NoSuchFieldError;",
            ClassLoadErr::IncompatibleClassChange(_) => "Ljava/lang/IncompatibleClassChangeError;",
            ClassLoadErr::IllegalAccess(_) => "Ljava/lang/IllegalAccessError;",
            ClassLoadErr::ClassCircularity(_) => "Ljava/lang/ClassCircularityError;",
            ClassLoadErr::Linkage(_) => "Ljava/lang/LinkageError;",
            ClassLoadErr::ClassFormat(_) => "Ljava/lang/ClassFormatError;",
            ClassLoadErr::Verify(_) => "Ljava/lang/VerifyError;",
            ClassLoadErr::OutOfMemory(_) => "Ljava/lang/OutOfMemoryError;",
            ClassLoadErr::ExceptionInInitializer(_) => "Ljava/lang/ExceptionInInitializerError;",
            ClassLoadErr::Exception { descriptor, .. } => descriptor,
            ClassLoadErr::ArtifactChecksumMismatch(_) | ClassLoadErr::ArtifactOpen(_) => {
                "Ljava/io/IOException;"
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ClassLoadErr::ClassNotFound(msg)
            | ClassLoadErr::NoClassDefFound(msg)
            | ClassLoadErr::NoSuchMethod(msg)
            | ClassLoadErr::NoSuchField(msg)
            | ClassLoadErr::IncompatibleClassChange(msg)
            | ClassLoadErr::IllegalAccess(msg)
            | ClassLoadErr::ClassCircularity(msg)
            | ClassLoadErr::Linkage(msg)
            | ClassLoadErr::ClassFormat(msg)
            | ClassLoadErr::Verify(msg)
            | ClassLoadErr::OutOfMemory(msg)
            | ClassLoadErr::ExceptionInInitializer(msg)
            | ClassLoadErr::ArtifactChecksumMismatch(msg)
            | ClassLoadErr::ArtifactOpen(msg) => msg,
            ClassLoadErr::Exception { message, .. } => message,
        }
    }

    /// Whether the throwable is a `java.lang.Error` subclass. Anything else
    /// escaping a class initializer gets wrapped.
    pub fn is_error(&self) -> bool {
        return !matches!(
            self,
            ClassLoadErr::ClassNotFound(_)
                | ClassLoadErr::Exception { .. }
                | ClassLoadErr::ArtifactChecksumMismatch(_)
                | ClassLoadErr::ArtifactOpen(_)
        );
    }
}

impl fmt::Display for ClassLoadErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            descriptor::pretty_descriptor(self.descriptor()),
            self.message()
        )
    }
}

impl std::error::Error for ClassLoadErr {}

#[derive(Debug, Clone)]
pub struct FieldId {
    pub class_idx: u16,
    pub type_idx: u16,
    pub name_idx: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtoId {
    pub return_type_idx: u16,
    pub parameters: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct MethodId {
    pub class_idx: u16,
    pub proto_idx: u16,
    pub name_idx: u32,
}

/// One encoded field or method inside a class definition.
#[derive(Debug, Clone, Copy)]
pub struct MemberDef {
    pub member_idx: u32,
    pub access_flags: u32,
    pub has_code: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ClassData {
    pub static_fields: Vec<MemberDef>,
    pub instance_fields: Vec<MemberDef>,
    pub direct_methods: Vec<MemberDef>,
    pub virtual_methods: Vec<MemberDef>,
}

impl ClassData {
    pub fn num_methods(&self) -> usize {
        return self.direct_methods.len() + self.virtual_methods.len();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncodedValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(u32),
    Type(u16),
    Null,
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub class_idx: u16,
    pub access_flags: u32,
    pub superclass_idx: u16,
    pub interfaces: Vec<u16>,
    pub class_data: Option<ClassData>,
    pub static_values: Vec<EncodedValue>,
}

/// Read-only view of one dex file: the string, type, proto, field and
/// method id tables plus class definitions.
pub struct DexFile {
    location: String,
    location_checksum: u32,
    strings: Vec<String>,
    type_ids: Vec<u32>,
    proto_ids: Vec<ProtoId>,
    field_ids: Vec<FieldId>,
    method_ids: Vec<MethodId>,
    class_defs: Vec<ClassDef>,
    class_def_index: HashMap<String, u16>,
}

impl fmt::Debug for DexFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DexFile")
            .field("location", &self.location)
            .field("location_checksum", &format_args!("0x{:08x}", self.location_checksum))
            .field("class_defs", &self.class_defs.len())
            .finish()
    }
}

impl DexFile {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        location: String,
        location_checksum: u32,
        strings: Vec<String>,
        type_ids: Vec<u32>,
        proto_ids: Vec<ProtoId>,
        field_ids: Vec<FieldId>,
        method_ids: Vec<MethodId>,
        class_defs: Vec<ClassDef>,
    ) -> DexFile {
        let mut dex_file = DexFile {
            location,
            location_checksum,
            strings,
            type_ids,
            proto_ids,
            field_ids,
            method_ids,
            class_defs,
            class_def_index: HashMap::new(),
        };
        let mut index = HashMap::with_capacity(dex_file.class_defs.len());
        for (idx, class_def) in dex_file.class_defs.iter().enumerate() {
            let descriptor = dex_file.type_descriptor(class_def.class_idx).to_string();
            index.insert(descriptor, idx as u16);
        }
        dex_file.class_def_index = index;
        return dex_file;
    }

    /// Reads the checksum stored in the header of the dex file at `path`.
    pub fn read_location_checksum(path: &Path) -> std::io::Result<u32> {
        let mut header = [0u8; 12];
        let mut file = std::fs::File::open(path)?;
        file.read_exact(&mut header)?;
        if &header[0..4] != DEX_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("'{}' is not a dex file", path.display()),
            ));
        }
        return Ok(u32::from_le_bytes([header[8], header[9], header[10], header[11]]));
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn location_checksum(&self) -> u32 {
        self.location_checksum
    }

    pub fn num_string_ids(&self) -> usize {
        self.strings.len()
    }

    pub fn num_type_ids(&self) -> usize {
        self.type_ids.len()
    }

    pub fn num_field_ids(&self) -> usize {
        self.field_ids.len()
    }

    pub fn num_method_ids(&self) -> usize {
        self.method_ids.len()
    }

    pub fn num_class_defs(&self) -> usize {
        self.class_defs.len()
    }

    pub fn string_data(&self, string_idx: u32) -> &str {
        &self.strings[string_idx as usize]
    }

    pub fn type_descriptor(&self, type_idx: u16) -> &str {
        return self.string_data(self.type_ids[type_idx as usize]);
    }

    pub fn field_id(&self, field_idx: u32) -> &FieldId {
        &self.field_ids[field_idx as usize]
    }

    pub fn method_id(&self, method_idx: u32) -> &MethodId {
        &self.method_ids[method_idx as usize]
    }

    pub fn proto_id(&self, proto_idx: u16) -> &ProtoId {
        &self.proto_ids[proto_idx as usize]
    }

    pub fn field_name(&self, field_idx: u32) -> &str {
        return self.string_data(self.field_id(field_idx).name_idx);
    }

    pub fn field_type_descriptor(&self, field_idx: u32) -> &str {
        return self.type_descriptor(self.field_id(field_idx).type_idx);
    }

    pub fn field_class_descriptor(&self, field_idx: u32) -> &str {
        return self.type_descriptor(self.field_id(field_idx).class_idx);
    }

    pub fn method_name(&self, method_idx: u32) -> &str {
        return self.string_data(self.method_id(method_idx).name_idx);
    }

    pub fn method_class_descriptor(&self, method_idx: u32) -> &str {
        return self.type_descriptor(self.method_id(method_idx).class_idx);
    }

    /// Signature in `(params)return` form, e.g. `(ILjava/lang/String;)V`.
    pub fn method_signature(&self, method_idx: u32) -> String {
        return self.proto_signature(self.method_id(method_idx).proto_idx);
    }

    pub fn proto_signature(&self, proto_idx: u16) -> String {
        let proto = self.proto_id(proto_idx);
        let mut signature = String::from("(");
        for param in proto.parameters.iter() {
            signature.push_str(self.type_descriptor(*param));
        }
        signature.push(')');
        signature.push_str(self.type_descriptor(proto.return_type_idx));
        return signature;
    }

    pub fn class_def(&self, class_def_idx: u16) -> &ClassDef {
        &self.class_defs[class_def_idx as usize]
    }

    pub fn class_defs(&self) -> &[ClassDef] {
        &self.class_defs
    }

    pub fn class_descriptor(&self, class_def: &ClassDef) -> &str {
        return self.type_descriptor(class_def.class_idx);
    }

    pub fn find_class_def(&self, descriptor: &str) -> Option<u16> {
        return self.class_def_index.get(descriptor).copied();
    }

    pub fn find_type_id(&self, descriptor: &str) -> Option<u16> {
        return self
            .type_ids
            .iter()
            .position(|string_idx| self.string_data(*string_idx) == descriptor)
            .map(|idx| idx as u16);
    }

    fn index_out_of_range(&self, kind: &str, idx: u32, len: usize) -> ClassLoadErr {
        return ClassLoadErr::ClassFormat(format!(
            "{} index {} out of range [0, {}) in {}",
            kind, idx, len, self.location
        ));
    }

    // The check_* helpers validate indices that come from call sites. The
    // id tables themselves are consistent once built.

    pub fn check_string_idx(&self, string_idx: u32) -> Result<(), ClassLoadErr> {
        if (string_idx as usize) < self.strings.len() {
            return Ok(());
        }
        return Err(self.index_out_of_range("string", string_idx, self.strings.len()));
    }

    pub fn check_type_idx(&self, type_idx: u16) -> Result<(), ClassLoadErr> {
        if (type_idx as usize) < self.type_ids.len() {
            return Ok(());
        }
        return Err(self.index_out_of_range("type", type_idx as u32, self.type_ids.len()));
    }

    pub fn check_field_idx(&self, field_idx: u32) -> Result<(), ClassLoadErr> {
        if self.field_ids.get(field_idx as usize).is_some() {
            return Ok(());
        }
        return Err(self.index_out_of_range("field", field_idx, self.field_ids.len()));
    }

    pub fn check_method_idx(&self, method_idx: u32) -> Result<(), ClassLoadErr> {
        if self.method_ids.get(method_idx as usize).is_some() {
            return Ok(());
        }
        return Err(self.index_out_of_range("method", method_idx, self.method_ids.len()));
    }
}
