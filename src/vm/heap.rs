use std::collections::HashMap;
use std::fmt;

use super::error::{VarKind, VmError};
use super::ops::OpCode;
use super::value::Value;

/// Address of a heap object. Assigned from a strictly increasing counter,
/// so an address is never handed out twice.
pub type HeapAddr = u64;

// =============================================================================
// Heap Objects
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapObject {
    Array { elements: Vec<Value> },
    Struct { type_index: i64, fields: Vec<Value> },
}

impl HeapObject {
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Array { .. } => "array",
            HeapObject::Struct { .. } => "struct",
        }
    }

    /// Every value held by this object, for tracing.
    pub fn values(&self) -> &[Value] {
        match self {
            HeapObject::Array { elements } => elements,
            HeapObject::Struct { fields, .. } => fields,
        }
    }

    /// Child references reachable from this object.
    pub fn trace(&self) -> impl Iterator<Item = HeapAddr> + '_ {
        self.values().iter().filter_map(Value::as_addr)
    }

    pub fn array_get(&self, index: i64) -> Result<Value, VmError> {
        match self {
            HeapObject::Array { elements } => {
                let slot = checked_index(index, elements.len())?;
                Ok(elements[slot])
            }
            other => Err(wrong_kind(OpCode::LoadArr, "array", other)),
        }
    }

    pub fn array_set(&mut self, index: i64, value: Value) -> Result<(), VmError> {
        match self {
            HeapObject::Array { elements } => {
                let slot = checked_index(index, elements.len())?;
                elements[slot] = value;
                Ok(())
            }
            other => Err(wrong_kind(OpCode::StoreArr, "array", other)),
        }
    }

    pub fn field_get(&self, index: i64) -> Result<Value, VmError> {
        match self {
            HeapObject::Struct { fields, .. } => {
                let slot = field_index(index, fields.len())?;
                Ok(fields[slot])
            }
            other => Err(wrong_kind(OpCode::LoadField, "struct", other)),
        }
    }

    pub fn field_set(&mut self, index: i64, value: Value) -> Result<(), VmError> {
        match self {
            HeapObject::Struct { fields, .. } => {
                let slot = field_index(index, fields.len())?;
                fields[slot] = value;
                Ok(())
            }
            other => Err(wrong_kind(OpCode::StoreField, "struct", other)),
        }
    }
}

impl fmt::Display for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, values) = match self {
            HeapObject::Array { elements } => ("array".to_string(), elements),
            HeapObject::Struct { type_index, fields } => (format!("struct#{}", type_index), fields),
        };
        let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        write!(f, "{}[{}]", label, parts.join(", "))
    }
}

fn checked_index(index: i64, size: usize) -> Result<usize, VmError> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < size)
        .ok_or(VmError::ArrayOutOfBounds { index, size })
}

fn field_index(index: i64, size: usize) -> Result<usize, VmError> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < size)
        .ok_or(VmError::InvalidVariableIndex {
            kind: VarKind::Field,
            index,
            size,
        })
}

fn wrong_kind(op: OpCode, expected: &'static str, found: &HeapObject) -> VmError {
    VmError::TypeMismatch {
        op,
        expected,
        found: found.kind_name(),
    }
}

// =============================================================================
// Heap
// =============================================================================

/// Address-indexed object store. Objects live until `free` is called;
/// only the collector decides what is unreachable.
#[derive(Debug, Default)]
pub struct Heap {
    objects: HashMap<HeapAddr, HeapObject>,
    next_addr: HeapAddr,
    /// Allocations since the last collection, used to trigger GC.
    allocs_since_gc: usize,
    total_allocs: u64,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, object: HeapObject) -> HeapAddr {
        let addr = self.next_addr;
        self.next_addr += 1;
        self.allocs_since_gc += 1;
        self.total_allocs += 1;
        self.objects.insert(addr, object);
        addr
    }

    /// Allocate a zero-filled array.
    pub fn alloc_array(&mut self, size: usize) -> HeapAddr {
        self.insert(HeapObject::Array {
            elements: vec![Value::Int(0); size],
        })
    }

    /// Allocate a zero-filled struct.
    pub fn alloc_struct(&mut self, type_index: i64, field_count: usize) -> HeapAddr {
        self.insert(HeapObject::Struct {
            type_index,
            fields: vec![Value::Int(0); field_count],
        })
    }

    pub fn get(&self, addr: HeapAddr) -> Result<&HeapObject, VmError> {
        self.objects
            .get(&addr)
            .ok_or(VmError::InvalidHeapReference(addr))
    }

    pub fn get_mut(&mut self, addr: HeapAddr) -> Result<&mut HeapObject, VmError> {
        self.objects
            .get_mut(&addr)
            .ok_or(VmError::InvalidHeapReference(addr))
    }

    pub fn contains(&self, addr: HeapAddr) -> bool {
        self.objects.contains_key(&addr)
    }

    /// Remove an object unconditionally.
    pub fn free(&mut self, addr: HeapAddr) -> Option<HeapObject> {
        self.objects.remove(&addr)
    }

    pub fn addresses(&self) -> impl Iterator<Item = HeapAddr> + '_ {
        self.objects.keys().copied()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn allocs_since_gc(&self) -> usize {
        self.allocs_since_gc
    }

    pub fn total_allocs(&self) -> u64 {
        self.total_allocs
    }

    pub(crate) fn reset_alloc_counter(&mut self) {
        self.allocs_since_gc = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zero_filled() {
        let mut heap = Heap::new();
        let arr = heap.alloc_array(3);
        let st = heap.alloc_struct(7, 2);

        assert_eq!(
            heap.get(arr).unwrap(),
            &HeapObject::Array {
                elements: vec![Value::Int(0); 3]
            }
        );
        assert_eq!(heap.get(st).unwrap().field_get(1), Ok(Value::Int(0)));
        assert_eq!(heap.allocs_since_gc(), 2);
    }

    #[test]
    fn test_addresses_increase() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(1);
        heap.free(a);
        let b = heap.alloc_array(1);
        assert!(b > a);
    }

    #[test]
    fn test_freed_address_is_invalid() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(1);
        assert!(heap.free(a).is_some());
        assert_eq!(heap.get(a), Err(VmError::InvalidHeapReference(a)));
        assert_eq!(heap.get(999), Err(VmError::InvalidHeapReference(999)));
    }

    #[test]
    fn test_array_bounds() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(5);
        let obj = heap.get_mut(a).unwrap();
        obj.array_set(1, Value::Int(42)).unwrap();
        assert_eq!(obj.array_get(1), Ok(Value::Int(42)));
        assert_eq!(
            obj.array_get(5),
            Err(VmError::ArrayOutOfBounds { index: 5, size: 5 })
        );
        assert_eq!(
            obj.array_get(-1),
            Err(VmError::ArrayOutOfBounds { index: -1, size: 5 })
        );
    }

    #[test]
    fn test_kind_mismatch() {
        let mut heap = Heap::new();
        let st = heap.alloc_struct(0, 1);
        let err = heap.get(st).unwrap().array_get(0).unwrap_err();
        assert!(matches!(
            err,
            VmError::TypeMismatch {
                expected: "array",
                found: "struct",
                ..
            }
        ));
    }
}
