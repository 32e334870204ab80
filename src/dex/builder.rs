use std::collections::HashMap;

use super::{
    descriptor, ClassData, ClassDef, DexFile, EncodedValue, FieldId, MemberDef, MethodId, ProtoId,
    NO_INDEX_16,
};
use crate::object::class::{ACC_ABSTRACT, ACC_NATIVE};

/// Initial value of a static field as written in source form.
#[derive(Debug, Clone, PartialEq)]
pub enum StaticValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Type(String),
    Null,
}

struct PendingMember {
    name: String,
    descriptor: String,
    access_flags: u32,
}

/// Describes one class definition to be added to a [`DexFileBuilder`].
pub struct ClassDefBuilder {
    descriptor: String,
    access_flags: u32,
    superclass: Option<String>,
    interfaces: Vec<String>,
    static_fields: Vec<PendingMember>,
    instance_fields: Vec<PendingMember>,
    direct_methods: Vec<PendingMember>,
    virtual_methods: Vec<PendingMember>,
    static_values: Vec<StaticValue>,
}

impl ClassDefBuilder {
    pub fn new(descriptor: &str, access_flags: u32) -> ClassDefBuilder {
        return ClassDefBuilder {
            descriptor: descriptor.to_string(),
            access_flags,
            superclass: None,
            interfaces: vec![],
            static_fields: vec![],
            instance_fields: vec![],
            direct_methods: vec![],
            virtual_methods: vec![],
            static_values: vec![],
        };
    }

    pub fn superclass(mut self, descriptor: &str) -> Self {
        self.superclass = Some(descriptor.to_string());
        self
    }

    pub fn interface(mut self, descriptor: &str) -> Self {
        self.interfaces.push(descriptor.to_string());
        self
    }

    pub fn static_field(mut self, name: &str, type_descriptor: &str, access_flags: u32) -> Self {
        self.static_fields.push(PendingMember {
            name: name.to_string(),
            descriptor: type_descriptor.to_string(),
            access_flags,
        });
        self
    }

    /// Initial values apply to static fields in declaration order.
    pub fn static_value(mut self, value: StaticValue) -> Self {
        self.static_values.push(value);
        self
    }

    pub fn instance_field(mut self, name: &str, type_descriptor: &str, access_flags: u32) -> Self {
        self.instance_fields.push(PendingMember {
            name: name.to_string(),
            descriptor: type_descriptor.to_string(),
            access_flags,
        });
        self
    }

    pub fn direct_method(mut self, name: &str, signature: &str, access_flags: u32) -> Self {
        self.direct_methods.push(PendingMember {
            name: name.to_string(),
            descriptor: signature.to_string(),
            access_flags,
        });
        self
    }

    pub fn virtual_method(mut self, name: &str, signature: &str, access_flags: u32) -> Self {
        self.virtual_methods.push(PendingMember {
            name: name.to_string(),
            descriptor: signature.to_string(),
            access_flags,
        });
        self
    }

    fn has_class_data(&self) -> bool {
        return !(self.static_fields.is_empty()
            && self.instance_fields.is_empty()
            && self.direct_methods.is_empty()
            && self.virtual_methods.is_empty());
    }
}

/// Assembles an in-memory [`DexFile`], interning strings, types, protos and
/// member ids as classes are added.
pub struct DexFileBuilder {
    location: String,
    location_checksum: u32,
    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    type_ids: Vec<u32>,
    type_index: HashMap<u32, u16>,
    proto_ids: Vec<ProtoId>,
    proto_index: HashMap<ProtoId, u16>,
    field_ids: Vec<FieldId>,
    field_index: HashMap<(u16, u32, u16), u32>,
    method_ids: Vec<MethodId>,
    method_index: HashMap<(u16, u32, u16), u32>,
    class_defs: Vec<ClassDef>,
}

impl DexFileBuilder {
    pub fn new(location: &str, location_checksum: u32) -> DexFileBuilder {
        return DexFileBuilder {
            location: location.to_string(),
            location_checksum,
            strings: vec![],
            string_index: HashMap::new(),
            type_ids: vec![],
            type_index: HashMap::new(),
            proto_ids: vec![],
            proto_index: HashMap::new(),
            field_ids: vec![],
            field_index: HashMap::new(),
            method_ids: vec![],
            method_index: HashMap::new(),
            class_defs: vec![],
        };
    }

    pub fn string_ref(&mut self, value: &str) -> u32 {
        if let Some(idx) = self.string_index.get(value) {
            return *idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.string_index.insert(value.to_string(), idx);
        return idx;
    }

    pub fn type_ref(&mut self, descriptor: &str) -> u16 {
        let string_idx = self.string_ref(descriptor);
        if let Some(idx) = self.type_index.get(&string_idx) {
            return *idx;
        }
        let idx = self.type_ids.len() as u16;
        self.type_ids.push(string_idx);
        self.type_index.insert(string_idx, idx);
        return idx;
    }

    fn proto_ref(&mut self, signature: &str) -> u16 {
        let (params, ret) = descriptor::parse_signature(signature)
            .unwrap_or_else(|| panic!("malformed method signature {}", signature));
        let proto = ProtoId {
            return_type_idx: self.type_ref(ret),
            parameters: params.into_iter().map(|p| self.type_ref(p)).collect(),
        };
        if let Some(idx) = self.proto_index.get(&proto) {
            return *idx;
        }
        let idx = self.proto_ids.len() as u16;
        self.proto_ids.push(proto.clone());
        self.proto_index.insert(proto, idx);
        return idx;
    }

    /// Field id for `class.name:type`, declared here or in another dex file.
    pub fn field_ref(&mut self, class: &str, name: &str, type_descriptor: &str) -> u32 {
        let class_idx = self.type_ref(class);
        let name_idx = self.string_ref(name);
        let type_idx = self.type_ref(type_descriptor);
        let key = (class_idx, name_idx, type_idx);
        if let Some(idx) = self.field_index.get(&key) {
            return *idx;
        }
        let idx = self.field_ids.len() as u32;
        self.field_ids.push(FieldId {
            class_idx,
            type_idx,
            name_idx,
        });
        self.field_index.insert(key, idx);
        return idx;
    }

    /// Method id for `class.name signature`, declared here or elsewhere.
    /// Panics on a malformed signature.
    pub fn method_ref(&mut self, class: &str, name: &str, signature: &str) -> u32 {
        let class_idx = self.type_ref(class);
        let name_idx = self.string_ref(name);
        let proto_idx = self.proto_ref(signature);
        let key = (class_idx, name_idx, proto_idx);
        if let Some(idx) = self.method_index.get(&key) {
            return *idx;
        }
        let idx = self.method_ids.len() as u32;
        self.method_ids.push(MethodId {
            class_idx,
            proto_idx,
            name_idx,
        });
        self.method_index.insert(key, idx);
        return idx;
    }

    fn encode(&mut self, value: &StaticValue) -> EncodedValue {
        match value {
            StaticValue::Boolean(v) => EncodedValue::Boolean(*v),
            StaticValue::Byte(v) => EncodedValue::Byte(*v),
            StaticValue::Short(v) => EncodedValue::Short(*v),
            StaticValue::Char(v) => EncodedValue::Char(*v),
            StaticValue::Int(v) => EncodedValue::Int(*v),
            StaticValue::Long(v) => EncodedValue::Long(*v),
            StaticValue::Float(v) => EncodedValue::Float(*v),
            StaticValue::Double(v) => EncodedValue::Double(*v),
            StaticValue::Str(v) => EncodedValue::String(self.string_ref(v)),
            StaticValue::Type(v) => EncodedValue::Type(self.type_ref(v)),
            StaticValue::Null => EncodedValue::Null,
        }
    }

    /// Adds a class definition and returns its class def index.
    pub fn add_class(&mut self, class: ClassDefBuilder) -> u16 {
        let class_idx = self.type_ref(&class.descriptor);
        let superclass_idx = match &class.superclass {
            Some(superclass) => self.type_ref(superclass),
            None => NO_INDEX_16,
        };
        let interfaces = class
            .interfaces
            .iter()
            .map(|interface| self.type_ref(interface))
            .collect();
        let class_data = if class.has_class_data() {
            let descriptor = class.descriptor.as_str();
            let mut data = ClassData::default();
            for member in class.static_fields.iter() {
                data.static_fields.push(self.field_def(descriptor, member));
            }
            for member in class.instance_fields.iter() {
                data.instance_fields.push(self.field_def(descriptor, member));
            }
            for member in class.direct_methods.iter() {
                data.direct_methods.push(self.method_def(descriptor, member));
            }
            for member in class.virtual_methods.iter() {
                data.virtual_methods.push(self.method_def(descriptor, member));
            }
            Some(data)
        } else {
            None
        };
        let static_values = class.static_values.iter().map(|v| self.encode(v)).collect();
        let idx = self.class_defs.len() as u16;
        self.class_defs.push(ClassDef {
            class_idx,
            access_flags: class.access_flags,
            superclass_idx,
            interfaces,
            class_data,
            static_values,
        });
        return idx;
    }

    fn field_def(&mut self, class: &str, member: &PendingMember) -> MemberDef {
        return MemberDef {
            member_idx: self.field_ref(class, &member.name, &member.descriptor),
            access_flags: member.access_flags,
            has_code: false,
        };
    }

    fn method_def(&mut self, class: &str, member: &PendingMember) -> MemberDef {
        return MemberDef {
            member_idx: self.method_ref(class, &member.name, &member.descriptor),
            access_flags: member.access_flags,
            has_code: member.access_flags & (ACC_ABSTRACT | ACC_NATIVE) == 0,
        };
    }

    pub fn build(self) -> DexFile {
        return DexFile::new(
            self.location,
            self.location_checksum,
            self.strings,
            self.type_ids,
            self.proto_ids,
            self.field_ids,
            self.method_ids,
            self.class_defs,
        );
    }
}
