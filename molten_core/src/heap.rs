//! The object heap.
//!
//! Objects come in two forms: *structs*, whose layout is described by a
//! `Shape` (an ordered list of kind-typed fields), and *arrays* of a single
//! element kind. The heap is a flat arena indexed by `ObjRef`; there is no
//! collector here — reclamation policy belongs to the embedding runtime and
//! only the allocation and write-barrier hooks matter to the JIT.
//!
//! Every store of a reference into the heap passes through `write_barrier`,
//! which the JIT's materialization path must also call; tests use the
//! barrier counter to check that compiled code and interpretation touch the
//! heap identically.

use crate::error::VmError;
use crate::value::{ObjRef, Value, ValueKind};

// =============================================================================
// Shapes
// =============================================================================

/// Identifier of a shape in the program's shape table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u32);

/// The layout of a struct object: named, kind-typed fields in declaration
/// order. Field indices in jitcode and traces refer to this order.
#[derive(Debug, Clone)]
pub struct Shape {
    pub name: String,
    pub fields: Vec<(String, ValueKind)>,
}

impl Shape {
    pub fn new(name: impl Into<String>, fields: Vec<(String, ValueKind)>) -> Self {
        Shape {
            name: name.into(),
            fields,
        }
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn field_kind(&self, index: u16) -> Option<ValueKind> {
        self.fields.get(index as usize).map(|(_, k)| *k)
    }
}

// =============================================================================
// Heap Objects
// =============================================================================

/// A heap cell: either a shaped struct or a homogeneous array.
#[derive(Debug, Clone)]
pub enum HeapObject {
    Struct {
        shape: ShapeId,
        fields: Vec<Value>,
    },
    Array {
        kind: ValueKind,
        elems: Vec<Value>,
    },
}

// =============================================================================
// Heap
// =============================================================================

/// A flat object arena. Allocation is bump-style; individual objects are
/// never freed while the heap lives.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    barrier_hits: u64,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    /// Number of objects ever allocated.
    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// How many reference stores have passed through the write barrier.
    #[inline]
    pub fn barrier_hits(&self) -> u64 {
        self.barrier_hits
    }

    /// Allocate a struct of the given shape with zeroed fields.
    pub fn allocate_struct(&mut self, id: ShapeId, shape: &Shape) -> ObjRef {
        let fields = shape
            .fields
            .iter()
            .map(|(_, kind)| Value::zero_of(*kind))
            .collect();
        self.push(HeapObject::Struct { shape: id, fields })
    }

    /// Allocate an array of `len` zeroed elements.
    pub fn allocate_array(&mut self, kind: ValueKind, len: usize) -> ObjRef {
        let elems = vec![Value::zero_of(kind); len];
        self.push(HeapObject::Array { kind, elems })
    }

    fn push(&mut self, obj: HeapObject) -> ObjRef {
        let index = self.objects.len() as u32;
        self.objects.push(obj);
        ObjRef::new(index)
    }

    /// The write barrier. Called on every store of a reference into a heap
    /// location, by the interpreter and by the JIT's materialization path.
    #[inline]
    pub fn write_barrier(&mut self, _obj: ObjRef) {
        self.barrier_hits += 1;
    }

    fn object(&self, r: ObjRef) -> Result<&HeapObject, VmError> {
        if r.is_null() {
            return Err(VmError::NullReference);
        }
        self.objects
            .get(r.index() as usize)
            .ok_or(VmError::NullReference)
    }

    fn object_mut(&mut self, r: ObjRef) -> Result<&mut HeapObject, VmError> {
        if r.is_null() {
            return Err(VmError::NullReference);
        }
        self.objects
            .get_mut(r.index() as usize)
            .ok_or(VmError::NullReference)
    }

    /// The shape of a struct object.
    pub fn shape_of(&self, r: ObjRef) -> Result<ShapeId, VmError> {
        match self.object(r)? {
            HeapObject::Struct { shape, .. } => Ok(*shape),
            HeapObject::Array { .. } => Err(VmError::KindMismatch {
                expected: ValueKind::Ref,
                found: ValueKind::Ref,
            }),
        }
    }

    pub fn get_field(&self, r: ObjRef, field: u16) -> Result<Value, VmError> {
        match self.object(r)? {
            HeapObject::Struct { fields, .. } => fields
                .get(field as usize)
                .copied()
                .ok_or(VmError::NoSuchField { field }),
            HeapObject::Array { .. } => Err(VmError::NoSuchField { field }),
        }
    }

    pub fn set_field(&mut self, r: ObjRef, field: u16, value: Value) -> Result<(), VmError> {
        if matches!(value, Value::Ref(_)) {
            self.write_barrier(r);
        }
        match self.object_mut(r)? {
            HeapObject::Struct { fields, .. } => {
                let slot = fields
                    .get_mut(field as usize)
                    .ok_or(VmError::NoSuchField { field })?;
                *slot = value;
                Ok(())
            }
            HeapObject::Array { .. } => Err(VmError::NoSuchField { field }),
        }
    }

    pub fn array_len(&self, r: ObjRef) -> Result<i64, VmError> {
        match self.object(r)? {
            HeapObject::Array { elems, .. } => Ok(elems.len() as i64),
            HeapObject::Struct { .. } => Err(VmError::KindMismatch {
                expected: ValueKind::Ref,
                found: ValueKind::Ref,
            }),
        }
    }

    pub fn get_item(&self, r: ObjRef, index: i64) -> Result<Value, VmError> {
        match self.object(r)? {
            HeapObject::Array { elems, .. } => {
                if index < 0 || index as usize >= elems.len() {
                    return Err(VmError::IndexOutOfRange);
                }
                Ok(elems[index as usize])
            }
            HeapObject::Struct { .. } => Err(VmError::IndexOutOfRange),
        }
    }

    pub fn set_item(&mut self, r: ObjRef, index: i64, value: Value) -> Result<(), VmError> {
        if matches!(value, Value::Ref(_)) {
            self.write_barrier(r);
        }
        match self.object_mut(r)? {
            HeapObject::Array { elems, .. } => {
                if index < 0 || index as usize >= elems.len() {
                    return Err(VmError::IndexOutOfRange);
                }
                elems[index as usize] = value;
                Ok(())
            }
            HeapObject::Struct { .. } => Err(VmError::IndexOutOfRange),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn point_shape() -> Shape {
        Shape::new(
            "Point",
            vec![
                ("x".to_string(), ValueKind::Int),
                ("y".to_string(), ValueKind::Int),
            ],
        )
    }

    #[test]
    fn struct_fields_round_trip() {
        let shape = point_shape();
        let mut heap = Heap::new();
        let p = heap.allocate_struct(ShapeId(0), &shape);

        assert_eq!(heap.get_field(p, 0).unwrap(), Value::Int(0));
        heap.set_field(p, 1, Value::Int(9)).unwrap();
        assert_eq!(heap.get_field(p, 1).unwrap(), Value::Int(9));
        assert_eq!(heap.shape_of(p).unwrap(), ShapeId(0));
    }

    #[test]
    fn missing_field_errors() {
        let shape = point_shape();
        let mut heap = Heap::new();
        let p = heap.allocate_struct(ShapeId(0), &shape);

        assert_eq!(
            heap.get_field(p, 5),
            Err(VmError::NoSuchField { field: 5 })
        );
    }

    #[test]
    fn null_dereference_errors() {
        let heap = Heap::new();
        assert_eq!(heap.get_field(ObjRef::NULL, 0), Err(VmError::NullReference));
        assert_eq!(heap.array_len(ObjRef::NULL), Err(VmError::NullReference));
    }

    #[test]
    fn array_bounds() {
        let mut heap = Heap::new();
        let a = heap.allocate_array(ValueKind::Int, 3);

        assert_eq!(heap.array_len(a).unwrap(), 3);
        heap.set_item(a, 2, Value::Int(7)).unwrap();
        assert_eq!(heap.get_item(a, 2).unwrap(), Value::Int(7));
        assert_eq!(heap.get_item(a, 3), Err(VmError::IndexOutOfRange));
        assert_eq!(heap.get_item(a, -1), Err(VmError::IndexOutOfRange));
    }

    #[test]
    fn barrier_counts_ref_stores() {
        let shape = Shape::new("Node", vec![("next".to_string(), ValueKind::Ref)]);
        let mut heap = Heap::new();
        let a = heap.allocate_struct(ShapeId(0), &shape);
        let b = heap.allocate_struct(ShapeId(0), &shape);

        let before = heap.barrier_hits();
        heap.set_field(a, 0, Value::Ref(b)).unwrap();
        assert_eq!(heap.barrier_hits(), before + 1);

        // Storing an int is not a barrier hit.
        let arr = heap.allocate_array(ValueKind::Int, 1);
        heap.set_item(arr, 0, Value::Int(1)).unwrap();
        assert_eq!(heap.barrier_hits(), before + 1);
    }
}
