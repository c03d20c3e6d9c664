//! Object heap with mark-sweep collection

use rustc_hash::FxHashMap;
use tether_sdk::{NativeError, NativeResult, NativeValue, ObjRef, ObjectId, TemplateId};

/// Shape of a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    Plain,
    Array,
    Function,
}

#[derive(Debug)]
pub(crate) struct HeapObject {
    pub kind: ObjectKind,
    pub template: Option<TemplateId>,
    pub internal: ObjectId,
    pub properties: FxHashMap<String, NativeValue>,
    pub elements: Vec<NativeValue>,
    marked: bool,
}

impl HeapObject {
    pub fn new(kind: ObjectKind, template: Option<TemplateId>, internal: ObjectId) -> Self {
        Self {
            kind,
            template,
            internal,
            properties: FxHashMap::default(),
            elements: Vec::new(),
            marked: false,
        }
    }

    /// Value referring to this object
    pub fn value_for(&self, r: ObjRef) -> NativeValue {
        match self.kind {
            ObjectKind::Plain => NativeValue::Object(r),
            ObjectKind::Array => NativeValue::Array(r),
            ObjectKind::Function => NativeValue::Function(r),
        }
    }

    fn children(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.properties
            .values()
            .chain(self.elements.iter())
            .filter_map(NativeValue::object_ref)
    }
}

struct Cell {
    generation: u32,
    object: Option<HeapObject>,
}

/// Generational object storage
#[derive(Default)]
pub(crate) struct ObjectHeap {
    cells: Vec<Cell>,
    free: Vec<u32>,
}

impl ObjectHeap {
    pub fn allocate(&mut self, object: HeapObject) -> ObjRef {
        if let Some(index) = self.free.pop() {
            let cell = &mut self.cells[index as usize];
            cell.object = Some(object);
            return ObjRef::new(index, cell.generation);
        }
        let index = self.cells.len() as u32;
        self.cells.push(Cell {
            generation: 0,
            object: Some(object),
        });
        ObjRef::new(index, 0)
    }

    pub fn get(&self, r: ObjRef) -> NativeResult<&HeapObject> {
        match self.cells.get(r.index() as usize) {
            Some(Cell {
                generation,
                object: Some(object),
            }) if *generation == r.generation() => Ok(object),
            _ => Err(NativeError::Collected),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> NativeResult<&mut HeapObject> {
        match self.cells.get_mut(r.index() as usize) {
            Some(Cell {
                generation,
                object: Some(object),
            }) if *generation == r.generation() => Ok(object),
            _ => Err(NativeError::Collected),
        }
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        self.get(r).is_ok()
    }

    /// Mark everything reachable from `roots`
    pub fn mark(&mut self, roots: Vec<ObjRef>) {
        let mut worklist = roots;
        while let Some(r) = worklist.pop() {
            let Ok(object) = self.get_mut(r) else {
                continue;
            };
            if object.marked {
                continue;
            }
            object.marked = true;
            worklist.extend(object.children());
        }
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.get(r).map(|o| o.marked).unwrap_or(false)
    }

    /// Free unmarked objects and clear marks; returns the number freed
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (index, cell) in self.cells.iter_mut().enumerate() {
            let Some(object) = cell.object.as_mut() else {
                continue;
            };
            if object.marked {
                object.marked = false;
                continue;
            }
            cell.object = None;
            cell.generation = cell.generation.wrapping_add(1);
            self.free.push(index as u32);
            freed += 1;
        }
        freed
    }

    pub fn live_count(&self) -> usize {
        self.cells.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> HeapObject {
        HeapObject::new(ObjectKind::Plain, None, ObjectId::UNSET)
    }

    #[test]
    fn test_unreachable_objects_are_swept() {
        let mut heap = ObjectHeap::default();
        let root = heap.allocate(plain());
        let child = heap.allocate(plain());
        let garbage = heap.allocate(plain());
        heap.get_mut(root)
            .unwrap()
            .properties
            .insert("child".to_string(), NativeValue::Object(child));

        heap.mark(vec![root]);
        assert_eq!(heap.sweep(), 1);
        assert!(heap.contains(root));
        assert!(heap.contains(child));
        assert!(!heap.contains(garbage));
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_cycles_terminate() {
        let mut heap = ObjectHeap::default();
        let a = heap.allocate(plain());
        let b = heap.allocate(plain());
        heap.get_mut(a).unwrap().elements.push(NativeValue::Object(b));
        heap.get_mut(b).unwrap().elements.push(NativeValue::Object(a));

        heap.mark(vec![]);
        assert_eq!(heap.sweep(), 2);
    }

    #[test]
    fn test_reused_cell_rejects_old_ref() {
        let mut heap = ObjectHeap::default();
        let old = heap.allocate(plain());
        heap.mark(vec![]);
        heap.sweep();
        let new = heap.allocate(plain());
        assert_eq!(new.index(), old.index());
        assert!(heap.get(old).is_err());
        assert!(heap.get(new).is_ok());
    }
}
