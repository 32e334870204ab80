use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

use super::class::{Class, ClassRef, ACC_FINAL, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC, ACC_VOLATILE};
use crate::dex::descriptor::{self, PrimitiveType};

pub type FieldRef = Arc<Field>;

pub struct Field {
    declaring_class: Weak<Class>,
    dex_field_idx: u32,
    name: String,
    type_descriptor: String,
    access_flags: u32,
    offset: AtomicU32,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field({} @ {})", self.pretty_field(), self.offset())
    }
}

impl Field {
    pub fn new(
        declaring_class: &ClassRef,
        dex_field_idx: u32,
        name: &str,
        type_descriptor: &str,
        access_flags: u32,
    ) -> FieldRef {
        return Arc::new(Field {
            declaring_class: Arc::downgrade(declaring_class),
            dex_field_idx,
            name: name.to_string(),
            type_descriptor: type_descriptor.to_string(),
            access_flags,
            offset: AtomicU32::new(0),
        });
    }

    pub fn declaring_class(&self) -> Option<ClassRef> {
        self.declaring_class.upgrade()
    }

    pub fn dex_field_index(&self) -> u32 {
        self.dex_field_idx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_descriptor(&self) -> &str {
        &self.type_descriptor
    }

    pub fn access_flags(&self) -> u32 {
        self.access_flags
    }

    pub fn is_public(&self) -> bool {
        self.access_flags & ACC_PUBLIC != 0
    }

    pub fn is_private(&self) -> bool {
        self.access_flags & ACC_PRIVATE != 0
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_final(&self) -> bool {
        self.access_flags & ACC_FINAL != 0
    }

    pub fn is_volatile(&self) -> bool {
        self.access_flags & ACC_VOLATILE != 0
    }

    pub fn primitive_type(&self) -> PrimitiveType {
        PrimitiveType::from_descriptor(&self.type_descriptor)
    }

    pub fn is_primitive_type(&self) -> bool {
        self.primitive_type() != PrimitiveType::Not
    }

    pub fn offset(&self) -> u32 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn set_offset(&self, offset: u32) {
        self.offset.store(offset, Ordering::Release);
    }

    pub fn pretty_field(&self) -> String {
        let class = self
            .declaring_class()
            .map_or_else(String::new, |c| c.pretty_descriptor());
        return format!(
            "{} {}.{}",
            descriptor::pretty_descriptor(&self.type_descriptor),
            class,
            self.name
        );
    }
}
