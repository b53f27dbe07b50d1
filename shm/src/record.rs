//! Typed record layout over shared memory ranges.
//!
//! A `RecordDescriptor` computes field offsets once, at construction time;
//! accessors then translate field reads/writes into little-endian loads and
//! stores against the underlying range. Scalar fields align to their own
//! size (up to 8); a record's alignment is the maximum of its fields'; its
//! size is the sum of the padded field sizes rounded up to the record
//! alignment. Two implementations that agree on field order and kinds agree
//! on the byte image.
//!
//! Every shared record begins with a hidden `_lock` field; shared objects
//! additionally carry `_size` and `_id`.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::error::MemoryError;
use crate::lock::Lock;
use crate::region::{MemoryRange, MemoryRegion};

/// Hidden lock field present on every shared record.
pub const LOCK_FIELD: &str = "_lock";
/// Hidden size field present on shared objects.
pub const SIZE_FIELD: &str = "_size";
/// Hidden id field present on shared objects.
pub const ID_FIELD: &str = "_id";

/// The kind of a record field.
#[derive(Debug, Clone)]
pub enum PropertyType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// An inline fixed-length byte run, alignment 1.
    Bytes(u32),
    /// A nested record laid out inline.
    Record(Arc<RecordDescriptor>),
}

impl PropertyType {
    /// Size of the field in bytes.
    pub fn size(&self) -> u32 {
        match self {
            PropertyType::U8 | PropertyType::I8 => 1,
            PropertyType::U16 | PropertyType::I16 => 2,
            PropertyType::U32 | PropertyType::I32 => 4,
            PropertyType::U64 | PropertyType::I64 => 8,
            PropertyType::Bytes(len) => *len,
            PropertyType::Record(desc) => desc.size(),
        }
    }

    /// Required alignment: scalars align to their own size up to 8.
    pub fn alignment(&self) -> u32 {
        match self {
            PropertyType::U8 | PropertyType::I8 => 1,
            PropertyType::U16 | PropertyType::I16 => 2,
            PropertyType::U32 | PropertyType::I32 => 4,
            PropertyType::U64 | PropertyType::I64 => 8,
            PropertyType::Bytes(_) => 1,
            PropertyType::Record(desc) => desc.alignment(),
        }
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

struct FieldInfo {
    ty: PropertyType,
    offset: u32,
}

/// Field layout for a record: names, kinds, computed offsets.
pub struct RecordDescriptor {
    fields: Vec<FieldInfo>,
    index: HashMap<String, usize>,
    alignment: u32,
    size: u32,
    shared: bool,
}

impl RecordDescriptor {
    /// A plain record with no hidden fields.
    pub fn new(fields: &[(&str, PropertyType)]) -> Arc<RecordDescriptor> {
        Self::build(&[], fields, false)
    }

    /// A shared record: a hidden `_lock` u32 precedes the declared fields.
    pub fn shared(fields: &[(&str, PropertyType)]) -> Arc<RecordDescriptor> {
        Self::build(&[(LOCK_FIELD, PropertyType::U32)], fields, true)
    }

    /// A shared object: `_lock`, `_size` and `_id` precede the declared
    /// fields.
    pub fn shared_object(fields: &[(&str, PropertyType)]) -> Arc<RecordDescriptor> {
        Self::build(
            &[
                (LOCK_FIELD, PropertyType::U32),
                (SIZE_FIELD, PropertyType::U32),
                (ID_FIELD, PropertyType::U32),
            ],
            fields,
            true,
        )
    }

    fn build(
        hidden: &[(&str, PropertyType)],
        declared: &[(&str, PropertyType)],
        shared: bool,
    ) -> Arc<RecordDescriptor> {
        let mut fields = Vec::with_capacity(hidden.len() + declared.len());
        let mut index = HashMap::with_capacity(hidden.len() + declared.len());
        let mut offset = 0u32;
        let mut alignment = 1u32;

        for (name, ty) in hidden.iter().chain(declared.iter()) {
            let field_align = ty.alignment();
            offset = align_up(offset, field_align);
            alignment = alignment.max(field_align);
            assert!(
                index
                    .insert(String::from(*name), fields.len())
                    .is_none(),
                "duplicate record field: {}",
                name
            );
            fields.push(FieldInfo {
                ty: ty.clone(),
                offset,
            });
            offset += ty.size();
        }

        Arc::new(RecordDescriptor {
            fields,
            index,
            alignment,
            size: align_up(offset.max(1), alignment),
            shared,
        })
    }

    /// Total record size in bytes, padding included.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Record alignment: the maximum field alignment.
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Byte offset of a field.
    pub fn offset_of(&self, name: &str) -> Result<u32, MemoryError> {
        self.field(name).map(|f| f.offset)
    }

    fn field(&self, name: &str) -> Result<&FieldInfo, MemoryError> {
        self.index
            .get(name)
            .map(|&i| &self.fields[i])
            .ok_or(MemoryError::UnknownField)
    }

    /// Load an accessor over an existing image at `offset` inside `range`.
    pub fn load(
        self: &Arc<Self>,
        range: &MemoryRange,
        offset: u32,
    ) -> Result<Record, MemoryError> {
        let view = range.sub_range(offset, self.size)?;
        Ok(Record {
            desc: self.clone(),
            range: view,
        })
    }

    /// Allocate a fresh, zero-filled image in `region` and return an
    /// accessor over the owned range. Shared records get their `_lock`
    /// initialised to the free state; shared objects also get `_size` and
    /// a freshly minted `_id`.
    pub fn alloc(
        self: &Arc<Self>,
        region: &Arc<MemoryRegion>,
    ) -> Result<Record, MemoryError> {
        let range = region.alloc(self.alignment, self.size)?;
        let record = Record {
            desc: self.clone(),
            range,
        };
        if self.shared {
            record.set_u32(LOCK_FIELD, 1)?;
        }
        if self.index.contains_key(SIZE_FIELD) {
            record.set_u32(SIZE_FIELD, self.size)?;
            let handle =
                crate::handle::ResourceHandle::mint_for_ptr(region, record.range.ptr());
            record.set_u32(ID_FIELD, handle.0)?;
        }
        Ok(record)
    }
}

impl core::fmt::Debug for RecordDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecordDescriptor")
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("fields", &self.fields.len())
            .finish()
    }
}

macro_rules! record_scalar {
    {$($variant:ident => $ty:ty : $get:ident / $set:ident / $read:ident / $write:ident;)*} => {$(
        /// Read a scalar field.
        pub fn $get(&self, name: &str) -> Result<$ty, MemoryError> {
            let field = self.desc.field(name)?;
            match field.ty {
                PropertyType::$variant => self.range.$read(field.offset),
                _ => Err(MemoryError::TypeMismatch),
            }
        }

        /// Write a scalar field.
        pub fn $set(&self, name: &str, value: $ty) -> Result<(), MemoryError> {
            let field = self.desc.field(name)?;
            match field.ty {
                PropertyType::$variant => self.range.$write(field.offset, value),
                _ => Err(MemoryError::TypeMismatch),
            }
        }
    )*};
}

/// A typed accessor over a record image in shared memory.
pub struct Record {
    desc: Arc<RecordDescriptor>,
    range: MemoryRange,
}

impl Record {
    /// The descriptor this accessor was built from.
    pub fn descriptor(&self) -> &Arc<RecordDescriptor> {
        &self.desc
    }

    /// The underlying range.
    pub fn range(&self) -> &MemoryRange {
        &self.range
    }

    /// Pointer of the record image inside its region.
    pub fn ptr(&self) -> u32 {
        self.range.ptr()
    }

    record_scalar! {
        U8  => u8  : get_u8  / set_u8  / read_u8  / write_u8;
        U16 => u16 : get_u16 / set_u16 / read_u16 / write_u16;
        U32 => u32 : get_u32 / set_u32 / read_u32 / write_u32;
        U64 => u64 : get_u64 / set_u64 / read_u64 / write_u64;
        I8  => i8  : get_i8  / set_i8  / read_i8  / write_i8;
        I16 => i16 : get_i16 / set_i16 / read_i16 / write_i16;
        I32 => i32 : get_i32 / set_i32 / read_i32 / write_i32;
        I64 => i64 : get_i64 / set_i64 / read_i64 / write_i64;
    }

    /// Borrow a `Bytes` field as a writable sub-range.
    pub fn bytes(&self, name: &str) -> Result<MemoryRange, MemoryError> {
        let field = self.desc.field(name)?;
        match field.ty {
            PropertyType::Bytes(len) => self.range.sub_range(field.offset, len),
            _ => Err(MemoryError::TypeMismatch),
        }
    }

    /// Access a nested record field.
    pub fn record(&self, name: &str) -> Result<Record, MemoryError> {
        let field = self.desc.field(name)?;
        match &field.ty {
            PropertyType::Record(desc) => desc.load(&self.range, field.offset),
            _ => Err(MemoryError::TypeMismatch),
        }
    }

    /// A handle over the record's hidden `_lock` field.
    pub fn lock(&self) -> Result<Lock, MemoryError> {
        let offset = self.desc.offset_of(LOCK_FIELD)?;
        Lock::new(self.range.sub_range(offset, 4)?)
    }

    /// The shared-object id minted at allocation.
    pub fn object_id(&self) -> Result<u32, MemoryError> {
        self.get_u32(ID_FIELD)
    }

    /// Release the record's owned range. Fails on accessors over borrowed
    /// images.
    pub fn free(self) -> Result<(), MemoryError> {
        let region = self.range.region().clone();
        region.free(self.range)
    }
}

impl core::fmt::Debug for Record {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Record")
            .field("ptr", &self.range.ptr())
            .field("size", &self.desc.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MemoryRegion;

    #[test]
    fn test_layout_padding_and_alignment() {
        let desc = RecordDescriptor::new(&[
            ("a", PropertyType::U8),
            ("b", PropertyType::U32),
            ("c", PropertyType::U8),
            ("d", PropertyType::U64),
        ]);
        assert_eq!(desc.alignment(), 8);
        assert_eq!(desc.offset_of("a").unwrap(), 0);
        assert_eq!(desc.offset_of("b").unwrap(), 4);
        assert_eq!(desc.offset_of("c").unwrap(), 8);
        assert_eq!(desc.offset_of("d").unwrap(), 16);
        assert_eq!(desc.size(), 24);
    }

    #[test]
    fn test_shared_record_has_lock_first() {
        let desc = RecordDescriptor::shared(&[("value", PropertyType::U64)]);
        assert_eq!(desc.offset_of(LOCK_FIELD).unwrap(), 0);
        assert_eq!(desc.offset_of("value").unwrap(), 8);
    }

    #[test]
    fn test_shared_object_header() {
        let desc = RecordDescriptor::shared_object(&[("value", PropertyType::U32)]);
        assert_eq!(desc.offset_of(LOCK_FIELD).unwrap(), 0);
        assert_eq!(desc.offset_of(SIZE_FIELD).unwrap(), 4);
        assert_eq!(desc.offset_of(ID_FIELD).unwrap(), 8);

        let region = MemoryRegion::new(4096).unwrap();
        let record = desc.alloc(&region).unwrap();
        assert_eq!(record.get_u32(SIZE_FIELD).unwrap(), desc.size());
        assert_ne!(record.object_id().unwrap(), 0);
        record.free().unwrap();
    }

    #[test]
    fn test_scalar_round_trip_and_type_check() {
        let region = MemoryRegion::new(4096).unwrap();
        let desc = RecordDescriptor::new(&[
            ("x", PropertyType::I32),
            ("y", PropertyType::U16),
        ]);
        let record = desc.alloc(&region).unwrap();
        record.set_i32("x", -5).unwrap();
        record.set_u16("y", 99).unwrap();
        assert_eq!(record.get_i32("x").unwrap(), -5);
        assert_eq!(record.get_u16("y").unwrap(), 99);
        assert_eq!(record.get_u32("x"), Err(MemoryError::TypeMismatch));
        assert_eq!(record.get_u32("missing"), Err(MemoryError::UnknownField));
        record.free().unwrap();
    }

    #[test]
    fn test_nested_record_accessor() {
        let inner = RecordDescriptor::new(&[("n", PropertyType::U32)]);
        let outer = RecordDescriptor::new(&[
            ("head", PropertyType::U8),
            ("inner", PropertyType::Record(inner)),
        ]);
        let region = MemoryRegion::new(4096).unwrap();
        let record = outer.alloc(&region).unwrap();
        let nested = record.record("inner").unwrap();
        nested.set_u32("n", 7).unwrap();
        assert_eq!(nested.get_u32("n").unwrap(), 7);
        // Nested field landed at the aligned offset.
        assert_eq!(outer.offset_of("inner").unwrap(), 4);
        record.free().unwrap();
    }

    #[test]
    fn test_lock_field_initialised_free() {
        let region = MemoryRegion::new(4096).unwrap();
        let desc = RecordDescriptor::shared(&[("v", PropertyType::U32)]);
        let record = desc.alloc(&region).unwrap();
        assert_eq!(record.get_u32(LOCK_FIELD).unwrap(), 1);
        let lock = record.lock().unwrap();
        lock.run_locked(|| {
            assert_eq!(record.get_u32(LOCK_FIELD).unwrap(), 0);
        });
        record.free().unwrap();
    }
}
