//! Field packing: references first, then 64-bit primitives, then 32-bit
//! primitives, each group ordered by name.

use std::cmp::Ordering;

use super::ClassLinker;
use crate::{
    dex::{descriptor::PrimitiveType, ClassLoadErr},
    memory::HEAP_REFERENCE_SIZE,
    object::{
        class::{
            class_offset_bit, is_encodable_offset, CLASS_HEADER_SIZE, CLASS_WALK_SUPER,
            OBJECT_HEADER_SIZE,
        },
        ClassRef, FieldRef,
    },
};

pub struct FieldLayout {
    /// The fields in storage order; references lead.
    pub fields: Vec<FieldRef>,
    pub offsets: Vec<u32>,
    pub num_reference_fields: u32,
    /// First offset past the last field.
    pub size: u32,
}

fn group(primitive_type: PrimitiveType) -> u8 {
    return match primitive_type {
        PrimitiveType::Not => 0,
        t if t.is_64bit() => 1,
        _ => 2,
    };
}

fn compare_fields(f1: &FieldRef, f2: &FieldRef) -> Ordering {
    return group(f1.primitive_type())
        .cmp(&group(f2.primitive_type()))
        .then_with(|| f1.name().cmp(f2.name()));
}

/// Computes offsets for `fields` starting at `start`. The fields themselves
/// are not touched.
pub fn layout_fields(fields: &[FieldRef], start: u32) -> FieldLayout {
    let mut sorted: Vec<FieldRef> = fields.to_vec();
    sorted.sort_by(compare_fields);
    let mut remaining: std::collections::VecDeque<FieldRef> = sorted.into();

    let mut ordered = Vec::with_capacity(fields.len());
    let mut offsets = Vec::with_capacity(fields.len());
    let mut offset = start;
    let mut num_reference_fields = 0;
    while let Some(field) = remaining.front() {
        if field.primitive_type() != PrimitiveType::Not {
            break;
        }
        if let Some(field) = remaining.pop_front() {
            ordered.push(field);
            offsets.push(offset);
            offset += HEAP_REFERENCE_SIZE as u32;
            num_reference_fields += 1;
        }
    }

    if !remaining.is_empty() && offset % 8 != 0 {
        // Fill the gap before the 64-bit fields with a 32-bit field, or pad.
        let filler = remaining.iter().position(|f| !f.primitive_type().is_64bit());
        if let Some(field) = filler.and_then(|i| remaining.remove(i)) {
            ordered.push(field);
            offsets.push(offset);
        }
        offset += 4;
    }

    while let Some(field) = remaining.pop_front() {
        let size = if field.primitive_type().is_64bit() { 8 } else { 4 };
        ordered.push(field);
        offsets.push(offset);
        offset += size;
    }

    return FieldLayout {
        fields: ordered,
        offsets,
        num_reference_fields,
        size: offset,
    };
}

impl ClassLinker {
    pub(crate) fn link_instance_fields(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        let start = match klass.super_class() {
            Some(super_class) => super_class.object_size(),
            None => OBJECT_HEADER_SIZE,
        };
        let layout = layout_fields(&klass.ifields(), start);
        let mut num_reference_fields = layout.num_reference_fields;

        // The collector must not trace java.lang.ref.Reference.referent, so
        // it is left out of the reference count. All Reference fields are
        // references and "referent" sorts last among them.
        if klass.is_boot_class() && klass.descriptor() == "Ljava/lang/ref/Reference;" {
            let referent_last = layout
                .fields
                .last()
                .map_or(false, |f| f.name() == "referent");
            if num_reference_fields as usize != layout.fields.len() || !referent_last {
                return Err(ClassLoadErr::ClassFormat(format!(
                    "Unexpected instance fields in {}",
                    klass.pretty_descriptor()
                )));
            }
            num_reference_fields -= 1;
        }

        for (field, offset) in layout.fields.iter().zip(layout.offsets.iter()) {
            field.set_offset(*offset);
        }
        klass.set_ifields(layout.fields);
        klass.set_num_reference_instance_fields(num_reference_fields);
        klass.set_object_size(layout.size);
        return Ok(());
    }

    pub(crate) fn link_static_fields(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        let layout = layout_fields(&klass.sfields(), CLASS_HEADER_SIZE);
        if layout.size > klass.class_size() {
            return Err(ClassLoadErr::Linkage(format!(
                "Static fields of {} need {} bytes but the class has {}",
                klass.pretty_descriptor(),
                layout.size,
                klass.class_size()
            )));
        }
        for (field, offset) in layout.fields.iter().zip(layout.offsets.iter()) {
            field.set_offset(*offset);
        }
        klass.set_sfields(layout.fields);
        klass.set_num_reference_static_fields(layout.num_reference_fields);
        return Ok(());
    }

    pub(crate) fn create_reference_instance_offsets(&self, klass: &ClassRef) {
        let mut reference_offsets = 0;
        if let Some(super_class) = klass.super_class() {
            reference_offsets = super_class.reference_instance_offsets();
            // Once a superclass overflowed, every subclass walks the chain.
            if reference_offsets == CLASS_WALK_SUPER {
                klass.set_reference_instance_offsets(reference_offsets);
                return;
            }
        }
        let offsets = reference_offsets_of(
            &klass.ifields(),
            klass.num_reference_instance_fields(),
            reference_offsets,
        );
        klass.set_reference_instance_offsets(offsets);
    }

    pub(crate) fn create_reference_static_offsets(&self, klass: &ClassRef) {
        let offsets =
            reference_offsets_of(&klass.sfields(), klass.num_reference_static_fields(), 0);
        klass.set_reference_static_offsets(offsets);
    }
}

fn reference_offsets_of(fields: &[FieldRef], num_reference_fields: u32, mut offsets: u32) -> u32 {
    for field in fields.iter().take(num_reference_fields as usize) {
        let offset = field.offset();
        if is_encodable_offset(offset) {
            offsets |= class_offset_bit(offset);
        } else {
            return CLASS_WALK_SUPER;
        }
    }
    return offsets;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::layout_fields;
    use crate::{
        dex::{ClassDefBuilder, DexFileBuilder},
        linker::class_loader::ClassLoader,
        memory::Address,
        object::{
            class::{
                Class, ACC_PUBLIC, ACC_STATIC, CLASS_HEADER_SIZE, CLASS_WALK_SUPER,
                OBJECT_HEADER_SIZE,
            },
            ClassRef, Field, FieldRef,
        },
        test::boot_linker,
    };

    fn fields(klass: &ClassRef, specs: &[(&str, &str)]) -> Vec<FieldRef> {
        return specs
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| Field::new(klass, i as u32, name, ty, 0))
            .collect();
    }

    fn field_size(field: &FieldRef) -> u32 {
        return if field.primitive_type().is_64bit() { 8 } else { 4 };
    }

    #[test]
    fn groups_then_names() {
        let klass = Class::new("LA;", None, Address::null(), CLASS_HEADER_SIZE);
        let fs = fields(&klass, &[("z", "I"), ("big", "J"), ("b", "Ljava/lang/Object;"), ("c", "Z")]);
        let layout = layout_fields(&fs, OBJECT_HEADER_SIZE);
        let names: Vec<_> = layout.fields.iter().map(|f| f.name()).collect();
        // "c" fills the hole in front of the long.
        assert_eq!(names, vec!["b", "c", "big", "z"]);
        assert_eq!(layout.offsets, vec![8, 12, 16, 24]);
        assert_eq!(layout.num_reference_fields, 1);
        assert_eq!(layout.size, 28);

        let aligned = fields(&klass, &[("a", "[I"), ("b", "Ljava/lang/Object;"), ("big", "J")]);
        let layout = layout_fields(&aligned, OBJECT_HEADER_SIZE);
        assert_eq!(layout.offsets, vec![8, 12, 16]);
        assert_eq!(layout.size, 24);
    }

    #[test]
    fn padding_without_a_filler() {
        let klass = Class::new("LA;", None, Address::null(), CLASS_HEADER_SIZE);
        let fs = fields(&klass, &[("d", "D"), ("r", "Ljava/lang/String;")]);
        let layout = layout_fields(&fs, OBJECT_HEADER_SIZE);
        assert_eq!(layout.offsets, vec![8, 16]);
        assert_eq!(layout.size, 24);
        let empty = layout_fields(&[], 12);
        assert_eq!(empty.size, 12);
    }

    #[test]
    fn layout_is_stable_and_disjoint() {
        let klass = Class::new("LA;", None, Address::null(), CLASS_HEADER_SIZE);
        let fs = fields(
            &klass,
            &[
                ("q", "J"),
                ("p", "B"),
                ("o", "Ljava/lang/Object;"),
                ("n", "D"),
                ("m", "S"),
                ("l", "[J"),
                ("k", "F"),
                ("j", "C"),
            ],
        );
        let first = layout_fields(&fs, 12);
        let mut reversed = fs.clone();
        reversed.reverse();
        let second = layout_fields(&reversed, 12);
        let first_names: Vec<_> = first.fields.iter().map(|f| f.name()).collect();
        let second_names: Vec<_> = second.fields.iter().map(|f| f.name()).collect();
        assert_eq!(first_names, second_names);
        assert_eq!(first.offsets, second.offsets);

        let mut ranges: Vec<(u32, u32)> = first
            .fields
            .iter()
            .zip(first.offsets.iter())
            .map(|(f, o)| (*o, *o + field_size(f)))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        assert!(ranges.iter().all(|(begin, end)| *begin >= 12 && *end <= first.size));
        for (f, o) in first.fields.iter().zip(first.offsets.iter()) {
            if f.primitive_type().is_64bit() {
                assert_eq!(o % 8, 0, "{}", f.name());
            }
        }
    }

    #[test]
    fn linked_instance_fields_follow_the_superclass() {
        let linker = boot_linker();
        let mut builder = DexFileBuilder::new("/data/app/fields.dex", 21);
        builder.add_class(
            ClassDefBuilder::new("Lapp/Point;", ACC_PUBLIC)
                .superclass("Ljava/lang/Object;")
                .instance_field("x", "I", 0)
                .instance_field("label", "Ljava/lang/String;", 0)
                .instance_field("weight", "D", 0),
        );
        builder.add_class(
            ClassDefBuilder::new("Lapp/Point3;", ACC_PUBLIC)
                .superclass("Lapp/Point;")
                .instance_field("z", "I", 0)
                .instance_field("next", "Lapp/Point3;", 0)
                .static_field("ORIGIN", "Lapp/Point3;", ACC_STATIC)
                .static_field("count", "J", ACC_STATIC),
        );
        let loader = ClassLoader::new("app", None, vec![Arc::new(builder.build())]);
        let point = linker.find_class("Lapp/Point;", Some(&loader)).unwrap();
        let point3 = linker.find_class("Lapp/Point3;", Some(&loader)).unwrap();

        // label@8, x@12 fills the gap, weight@16
        assert_eq!(point.object_size(), 24);
        assert_eq!(point.num_reference_instance_fields(), 1);
        assert_eq!(point.reference_instance_offsets(), 0x8000_0000 >> 2);
        let x = point.find_declared_instance_field("x", "I").unwrap();
        assert_eq!(x.offset(), 12);

        let mut all_fields = point.ifields();
        all_fields.extend(point3.ifields());
        let mut ranges: Vec<(u32, u32)> = all_fields
            .iter()
            .map(|f| (f.offset(), f.offset() + if f.primitive_type().is_64bit() { 8 } else { 4 }))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
        assert!(ranges.iter().all(|(_, end)| *end <= point3.object_size()));

        // Bits cover the inherited references too.
        let bits = point3.reference_instance_offsets();
        assert_ne!(bits, CLASS_WALK_SUPER);
        let total_refs = point.num_reference_instance_fields() + point3.num_reference_instance_fields();
        assert_eq!(bits.count_ones(), total_refs);

        assert_eq!(point3.class_size(), CLASS_HEADER_SIZE + 4 + 4 + 8);
        assert_eq!(point3.num_reference_static_fields(), 1);
        // Static storage starts past the bitmap's reach.
        assert_eq!(point3.reference_static_offsets(), CLASS_WALK_SUPER);
        let count = point3.find_declared_static_field("count", "J").unwrap();
        assert_eq!(count.offset(), CLASS_HEADER_SIZE + 8);
    }

    #[test]
    fn wide_objects_walk_the_superclass_chain() {
        let linker = boot_linker();
        let mut wide = ClassDefBuilder::new("Lapp/Wide;", ACC_PUBLIC).superclass("Ljava/lang/Object;");
        for i in 0..40 {
            wide = wide.instance_field(&format!("f{:02}", i), "Ljava/lang/Object;", 0);
        }
        let mut builder = DexFileBuilder::new("/data/app/wide.dex", 22);
        builder.add_class(wide);
        builder.add_class(
            ClassDefBuilder::new("Lapp/Wider;", ACC_PUBLIC)
                .superclass("Lapp/Wide;")
                .instance_field("tail", "Ljava/lang/Object;", 0),
        );
        let loader = ClassLoader::new("app", None, vec![Arc::new(builder.build())]);
        let wide = linker.find_class("Lapp/Wide;", Some(&loader)).unwrap();
        let wider = linker.find_class("Lapp/Wider;", Some(&loader)).unwrap();
        assert_eq!(wide.num_reference_instance_fields(), 40);
        assert_eq!(wide.reference_instance_offsets(), CLASS_WALK_SUPER);
        assert_eq!(wider.reference_instance_offsets(), CLASS_WALK_SUPER);
    }

    #[test]
    fn referent_is_hidden_from_the_collector() {
        let linker = boot_linker();
        let reference = linker.find_system_class("Ljava/lang/ref/Reference;").unwrap();
        let names: Vec<_> = reference.ifields().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["pendingNext", "queue", "queueNext", "referent"]);
        assert_eq!(reference.num_reference_instance_fields(), 3);
        assert_eq!(reference.reference_instance_offsets().count_ones(), 3);
    }
}
