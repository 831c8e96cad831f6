use std::fs::File;

use crate::{
    Access, EntityId, EntityKind, EntityTag, Memory, Object, ResourceId, RootProvider, Type,
    VmError, object::OBJECT_SIZE,
};

const DICT_ENTRY: u32 = 2 * OBJECT_SIZE;

impl Memory {
    fn composite(&self, ty: Type, id: EntityId, length: u32) -> Object {
        Object::composite(ty, self.bank(), id, 0, length)
    }

    pub fn new_string(&mut self, bytes: &[u8], roots: &dyn RootProvider) -> Result<Object, VmError> {
        let length = u32::try_from(bytes.len()).map_err(|_| VmError::LimitCheck)?;
        let id = self.allocate(length, EntityTag::new(EntityKind::String), roots)?;
        self.put(id, 0, bytes)?;
        Ok(self.composite(Type::String, id, length))
    }

    /// An array of `length` null objects.
    pub fn new_array(&mut self, length: u32, roots: &dyn RootProvider) -> Result<Object, VmError> {
        let size = length.checked_mul(OBJECT_SIZE).ok_or(VmError::LimitCheck)?;
        let id = self.allocate(size, EntityTag::new(EntityKind::Array), roots)?;
        Ok(self.composite(Type::Array, id, length))
    }

    /// An executable array holding `elements`.
    ///
    /// Composite elements are not visible to a collection triggered by this
    /// allocation unless `roots` reports them.
    pub fn new_proc(
        &mut self,
        elements: &[Object],
        roots: &dyn RootProvider,
    ) -> Result<Object, VmError> {
        let length = u32::try_from(elements.len()).map_err(|_| VmError::LimitCheck)?;
        let array = self.new_array(length, roots)?;
        for (index, element) in elements.iter().enumerate() {
            self.array_put(&array, index as u32, *element)?;
        }
        Ok(array.cvx())
    }

    /// A dictionary with room for `capacity` key/value pairs.
    pub fn new_dict(&mut self, capacity: u32, roots: &dyn RootProvider) -> Result<Object, VmError> {
        let size = capacity.checked_mul(DICT_ENTRY).ok_or(VmError::LimitCheck)?;
        let id = self.allocate(size, EntityTag::new(EntityKind::Dict), roots)?;
        Ok(self.composite(Type::Dict, id, capacity))
    }

    /// Take ownership of an open file. The handle is closed when the entity is
    /// freed or discarded by a restore.
    pub fn new_file(
        &mut self,
        file: File,
        writable: bool,
        roots: &dyn RootProvider,
    ) -> Result<Object, VmError> {
        let id = self.allocate(8, EntityTag::new(EntityKind::File), roots)?;
        let resource = self.resources.insert(file);
        self.put(id, 0, &resource.0.to_le_bytes())?;
        let obj = self.composite(Type::File, id, 1);
        Ok(if writable {
            obj
        } else {
            obj.restrict(Access::ReadOnly)
        })
    }

    fn expect_type(obj: &Object, ty: Type) -> Result<EntityId, VmError> {
        match obj.entity() {
            Some(id) if obj.ty() == ty => Ok(id),
            _ => Err(VmError::TypeCheck),
        }
    }

    pub fn string_bytes(&self, string: &Object) -> Result<&[u8], VmError> {
        let id = Self::expect_type(string, Type::String)?;
        if !string.rcheck() {
            return Err(VmError::InvalidAccess);
        }
        self.bytes_at(id, string.offset(), string.length())
    }

    pub fn array_get(&self, array: &Object, index: u32) -> Result<Object, VmError> {
        let id = Self::expect_type(array, Type::Array)?;
        // procedures stay runnable under executeonly
        if !array.rcheck() && !(array.is_executable() && array.access() == Access::ExecuteOnly) {
            return Err(VmError::InvalidAccess);
        }
        if index >= array.length() {
            return Err(VmError::RangeCheck);
        }
        self.read_object(id, array.offset() + index * OBJECT_SIZE)
    }

    pub fn array_put(&mut self, array: &Object, index: u32, value: Object) -> Result<(), VmError> {
        let id = Self::expect_type(array, Type::Array)?;
        if !array.wcheck() {
            return Err(VmError::InvalidAccess);
        }
        if index >= array.length() {
            return Err(VmError::RangeCheck);
        }
        self.write_object(id, array.offset() + index * OBJECT_SIZE, value)
    }

    /// Every element of an array, in order.
    pub fn array_elements(&self, array: &Object) -> Result<Vec<Object>, VmError> {
        (0..array.length())
            .map(|index| self.array_get(array, index))
            .collect()
    }

    pub fn dict_get(&self, dict: &Object, key: &Object) -> Result<Option<Object>, VmError> {
        let id = Self::expect_type(dict, Type::Dict)?;
        if !dict.rcheck() {
            return Err(VmError::InvalidAccess);
        }
        for slot in 0..dict.length() {
            let at = slot * DICT_ENTRY;
            let stored = self.read_object(id, at)?;
            if stored.ty() == Type::Null {
                return Ok(None);
            }
            if stored.same(key) {
                return self.read_object(id, at + OBJECT_SIZE).map(Some);
            }
        }
        Ok(None)
    }

    /// Insert or replace. Entries are packed from the front, so the first null
    /// key ends the search.
    pub fn dict_put(&mut self, dict: &Object, key: Object, value: Object) -> Result<(), VmError> {
        let id = Self::expect_type(dict, Type::Dict)?;
        if !dict.wcheck() {
            return Err(VmError::InvalidAccess);
        }
        if key.ty() == Type::Null {
            return Err(VmError::TypeCheck);
        }
        for slot in 0..dict.length() {
            let at = slot * DICT_ENTRY;
            let stored = self.read_object(id, at)?;
            if stored.ty() == Type::Null || stored.same(&key) {
                self.write_object(id, at, key)?;
                return self.write_object(id, at + OBJECT_SIZE, value);
            }
        }
        Err(VmError::LimitCheck)
    }

    pub fn dict_len(&self, dict: &Object) -> Result<u32, VmError> {
        let id = Self::expect_type(dict, Type::Dict)?;
        let mut len = 0;
        while len < dict.length() && self.read_object(id, len * DICT_ENTRY)?.ty() != Type::Null {
            len += 1;
        }
        Ok(len)
    }

    pub fn file_mut(&mut self, file: &Object) -> Result<&mut File, VmError> {
        let id = Self::expect_type(file, Type::File)?;
        let resource = self.resource_id(id)?;
        self.resources.get_mut(resource)
    }

    pub(crate) fn resource_id(&self, id: EntityId) -> Result<ResourceId, VmError> {
        let mut slot = [0u8; 4];
        self.get(id, 0, &mut slot)?;
        Ok(ResourceId(u32::from_le_bytes(slot)))
    }

    pub fn open_resources(&self) -> usize {
        self.resources.live()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};

    use super::*;
    use crate::{Bank, NoRoots, VmSettings};

    fn memory() -> Memory {
        Memory::new(Bank::Global, &VmSettings::default()).expect("memory")
    }

    #[test]
    fn strings_keep_their_bytes_and_bank() {
        let mut m = memory();
        let s = m.new_string(b"hello", &NoRoots).unwrap();
        assert_eq!(s.bank(), Bank::Global);
        assert_eq!(s.length(), 5);
        assert_eq!(m.string_bytes(&s).unwrap(), b"hello");
    }

    #[test]
    fn array_access_respects_bounds_and_access() {
        let mut m = memory();
        let arr = m.new_array(2, &NoRoots).unwrap();
        m.array_put(&arr, 1, Object::int(9)).unwrap();
        assert_eq!(m.array_get(&arr, 1).unwrap(), Object::int(9));
        assert_eq!(m.array_get(&arr, 2), Err(VmError::RangeCheck));

        let frozen = arr.restrict(Access::ReadOnly);
        assert_eq!(m.array_put(&frozen, 0, Object::NULL), Err(VmError::InvalidAccess));
        let hidden = arr.restrict(Access::None);
        assert_eq!(m.array_get(&hidden, 0), Err(VmError::InvalidAccess));
        assert_eq!(m.array_get(&Object::int(1), 0), Err(VmError::TypeCheck));
    }

    #[test]
    fn procs_are_executable_and_readable_when_execute_only() {
        let mut m = memory();
        let proc = m
            .new_proc(&[Object::int(1), Object::int(2)], &NoRoots)
            .unwrap()
            .restrict(Access::ExecuteOnly);
        assert!(proc.is_proc());
        assert_eq!(
            m.array_elements(&proc).unwrap(),
            vec![Object::int(1), Object::int(2)]
        );
    }

    #[test]
    fn dict_inserts_replaces_and_fills_up() {
        let mut m = memory();
        let dict = m.new_dict(2, &NoRoots).unwrap();
        let a = Object::int(1);
        let b = Object::int(2);
        m.dict_put(&dict, a, Object::boolean(true)).unwrap();
        m.dict_put(&dict, a, Object::boolean(false)).unwrap();
        m.dict_put(&dict, b, Object::real(0.5)).unwrap();
        assert_eq!(m.dict_len(&dict).unwrap(), 2);
        assert_eq!(m.dict_get(&dict, &a).unwrap(), Some(Object::boolean(false)));
        assert_eq!(m.dict_get(&dict, &Object::int(3)).unwrap(), None);
        assert_eq!(
            m.dict_put(&dict, Object::int(3), Object::NULL),
            Err(VmError::LimitCheck)
        );
    }

    #[test]
    fn freeing_a_file_entity_closes_the_handle() {
        let path = std::env::temp_dir().join(format!("psvm-file-{}", std::process::id()));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .expect("open temp file");
        let mut m = memory();
        let obj = m.new_file(file, true, &NoRoots).unwrap();
        {
            let handle = m.file_mut(&obj).unwrap();
            handle.write_all(b"ps").unwrap();
            handle.seek(SeekFrom::Start(0)).unwrap();
            let mut back = String::new();
            handle.read_to_string(&mut back).unwrap();
            assert_eq!(back, "ps");
        }
        assert_eq!(m.open_resources(), 1);

        m.free(obj.entity().unwrap()).unwrap();
        assert_eq!(m.open_resources(), 0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn restore_closes_files_opened_after_the_save() {
        let path = std::env::temp_dir().join(format!("psvm-file-restore-{}", std::process::id()));
        let file = std::fs::File::create(&path).expect("create temp file");
        let mut m = memory();
        let level = m.save().unwrap();
        m.new_file(file, true, &NoRoots).unwrap();
        assert_eq!(m.open_resources(), 1);
        m.restore(level).unwrap();
        assert_eq!(m.open_resources(), 0);
        let _ = std::fs::remove_file(path);
    }
}
