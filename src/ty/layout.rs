// Type layout resolves every type eagerly at construction and memoizes the result: instance
// sizes, field offsets, virtual-method tables, interface slot assignment and per-interface
// method tables. Resolution recurses across base types and value-type fields, guarded by an
// in-progress set (no value-type cycle can close in valid input; the guard only stops
// re-entry). All public queries serialize through one mutex: resolution performs mutual
// recursion across types, and a per-type lock would deadlock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::{CompileError, CompileResult};
use crate::core::instruction::IrType;
use crate::ty::{FieldId, MethodId, Primitive, TypeId, TypeSystem};

#[derive(Debug, Default)]
struct LayoutInner {
    resolved: HashSet<TypeId>,
    in_progress: HashSet<TypeId>,
    sizes: HashMap<TypeId, u32>,
    field_offsets: HashMap<FieldId, u32>,
    method_tables: HashMap<TypeId, Vec<MethodId>>,
    method_slots: HashMap<MethodId, usize>,
    interface_slots: HashMap<TypeId, u32>,
    interface_tables: HashMap<(TypeId, TypeId), Vec<MethodId>>,
    overridden: HashSet<MethodId>,
}

/// Memoized layout engine over a [`TypeSystem`].
#[derive(Debug)]
pub struct TypeLayout {
    ts: Arc<TypeSystem>,
    ptr_size: u32,
    ptr_align: u32,
    inner: Mutex<LayoutInner>,
}

impl TypeLayout {
    /// Resolve every type eagerly. `ptr_size` is 4 or 8.
    pub fn new(ts: Arc<TypeSystem>, ptr_size: u32, ptr_align: u32) -> CompileResult<TypeLayout> {
        let mut inner = LayoutInner::default();
        {
            let mut resolver = Resolver {
                ts: &ts,
                ptr_size,
                ptr_align,
                inner: &mut inner,
            };
            for ty in ts.all_types() {
                resolver.resolve(ty)?;
            }
        }
        Ok(TypeLayout {
            ts,
            ptr_size,
            ptr_align,
            inner: Mutex::new(inner),
        })
    }

    pub fn type_system(&self) -> &Arc<TypeSystem> {
        &self.ts
    }

    pub fn ptr_size(&self) -> u32 {
        self.ptr_size
    }

    pub fn ptr_align(&self) -> u32 {
        self.ptr_align
    }

    /// Instance size of a type in bytes.
    pub fn type_size(&self, ty: TypeId) -> u32 {
        let inner = self.inner.lock();
        inner.sizes.get(&ty).copied().unwrap_or(self.ptr_size)
    }

    /// Offset of a non-static field. Statics are linker symbols; 0 here.
    pub fn field_offset(&self, field: FieldId) -> u32 {
        if self.ts.field(field).is_static {
            return 0;
        }
        let inner = self.inner.lock();
        inner.field_offsets.get(&field).copied().unwrap_or(0)
    }

    /// Size in bytes of a field's stored value.
    pub fn field_size(&self, field: FieldId) -> u32 {
        let ty = self.ts.field(field).ty;
        self.value_size(ty)
    }

    /// Size a value of the given type occupies inside another object.
    pub fn value_size(&self, ty: TypeId) -> u32 {
        let def = self.ts.type_def(ty);
        if def.is_reference() {
            return self.ptr_size;
        }
        if let Some(p) = def.primitive() {
            return p.size(self.ptr_size);
        }
        self.type_size(ty)
    }

    /// Virtual-method table of a type, base slots first.
    pub fn method_table(&self, ty: TypeId) -> Vec<MethodId> {
        let inner = self.inner.lock();
        inner.method_tables.get(&ty).cloned().unwrap_or_default()
    }

    /// Slot of a method within its type's method table.
    pub fn method_slot(&self, method: MethodId) -> Option<usize> {
        let inner = self.inner.lock();
        inner.method_slots.get(&method).copied()
    }

    /// Dense slot index assigned to an interface type.
    pub fn interface_slot(&self, interface: TypeId) -> Option<u32> {
        let inner = self.inner.lock();
        inner.interface_slots.get(&interface).copied()
    }

    /// Method table a type exposes for one of its interfaces.
    pub fn interface_table(&self, ty: TypeId, interface: TypeId) -> Option<Vec<MethodId>> {
        let inner = self.inner.lock();
        inner.interface_tables.get(&(ty, interface)).cloned()
    }

    /// Whether some derived type overrides this method's slot.
    pub fn is_method_overridden(&self, method: MethodId) -> bool {
        let inner = self.inner.lock();
        inner.overridden.contains(&method)
    }

    /// Whether values of the type are kept in memory rather than registers:
    /// user value types, except a single-field wrapper around a reference.
    pub fn is_stored_on_stack(&self, ty: TypeId) -> bool {
        let mut def = self.ts.type_def(ty);
        while let Some(elem) = def.element {
            def = self.ts.type_def(elem);
        }
        if !def.is_user_value_type() {
            return false;
        }
        let instance_fields: Vec<_> = def
            .fields
            .iter()
            .filter(|f| !self.ts.field(**f).is_static)
            .collect();
        if instance_fields.len() == 1 {
            let field_ty = self.ts.field(*instance_fields[0]).ty;
            if self.ts.type_def(field_ty).is_reference() {
                return false;
            }
        }
        true
    }

    /// Whether values need multi-word moves: user value types larger than a
    /// pointer, or primitives larger than eight bytes.
    pub fn is_compound_type(&self, ty: TypeId) -> bool {
        let def = self.ts.type_def(ty);
        if let Some(p) = def.primitive() {
            return p.size(self.ptr_size) > 8;
        }
        def.is_user_value_type() && self.type_size(ty) > self.ptr_size
    }

    /// Managed IR type of a value of this type. Small integers widen to I32.
    pub fn ir_type(&self, ty: TypeId) -> IrType {
        let def = self.ts.type_def(ty);
        if let Some(p) = def.primitive() {
            return match p {
                Primitive::Bool
                | Primitive::Char
                | Primitive::I1
                | Primitive::U1
                | Primitive::I2
                | Primitive::U2
                | Primitive::I4
                | Primitive::U4 => IrType::I32,
                Primitive::I8 | Primitive::U8 => IrType::I64,
                Primitive::R4 => IrType::R4,
                Primitive::R8 => IrType::R8,
                Primitive::IPtr | Primitive::UPtr => IrType::Ptr,
            };
        }
        if def.is_reference() {
            return IrType::Ptr;
        }
        if self.is_stored_on_stack(ty) {
            IrType::Compound(self.type_size(ty))
        } else {
            IrType::Ptr
        }
    }
}

struct Resolver<'a> {
    ts: &'a TypeSystem,
    ptr_size: u32,
    ptr_align: u32,
    inner: &'a mut LayoutInner,
}

impl<'a> Resolver<'a> {
    fn resolve(&mut self, ty: TypeId) -> CompileResult<()> {
        if self.inner.resolved.contains(&ty) || self.inner.in_progress.contains(&ty) {
            return Ok(());
        }

        let def = self.ts.type_def(ty);

        // Module pseudo-types and ghost types carry no layout.
        if def.kind == crate::ty::TypeKind::Module {
            return Ok(());
        }
        if def.base.is_none() && !def.is_interface() && !def.is_object_root() {
            return Ok(());
        }
        // A modifier wrapper resolves its element instead.
        if let Some(elem) = def.element {
            return self.resolve(elem);
        }

        self.inner.in_progress.insert(ty);

        if let Some(base) = def.base {
            self.resolve(base)?;
        }
        for &iface in &def.interfaces {
            self.resolve(iface)?;
            let next = self.inner.interface_slots.len() as u32;
            self.inner.interface_slots.entry(iface).or_insert(next);
        }

        if def.is_interface() {
            // An interface's own table is its method list in declaration order.
            let table: Vec<MethodId> = def.methods.clone();
            for (slot, &m) in table.iter().enumerate() {
                self.inner.method_slots.insert(m, slot);
            }
            self.inner.method_tables.insert(ty, table);
            self.inner.sizes.insert(ty, self.ptr_size);
        } else {
            self.resolve_fields(ty)?;
            self.build_method_table(ty)?;
            self.build_interface_tables(ty)?;
        }

        self.inner.in_progress.remove(&ty);
        self.inner.resolved.insert(ty);
        Ok(())
    }

    fn align_up(value: u32, align: u32) -> u32 {
        debug_assert!(align > 0);
        value.div_ceil(align) * align
    }

    fn field_value_size(&mut self, field_ty: TypeId) -> CompileResult<u32> {
        let def = self.ts.type_def(field_ty);
        if def.is_reference() {
            return Ok(self.ptr_size);
        }
        if let Some(p) = def.primitive() {
            return Ok(p.size(self.ptr_size));
        }
        self.resolve(field_ty)?;
        Ok(self
            .inner
            .sizes
            .get(&field_ty)
            .copied()
            .unwrap_or(self.ptr_size))
    }

    fn resolve_fields(&mut self, ty: TypeId) -> CompileResult<()> {
        let def = self.ts.type_def(ty);

        if let Some(p) = def.primitive() {
            self.inner.sizes.insert(ty, p.size(self.ptr_size));
            return Ok(());
        }

        if def.is_explicit_layout {
            let mut size = 0u32;
            for &field in &def.fields.clone() {
                let fdef = self.ts.field(field);
                if fdef.is_static {
                    continue;
                }
                let offset = fdef.offset.ok_or_else(|| CompileError::TypeSystem {
                    item: format!("{}.{}", def.name, fdef.name),
                    reason: "explicit layout field without offset".to_string(),
                })?;
                let fsize = self.field_value_size(fdef.ty)?;
                self.inner.field_offsets.insert(field, offset);
                size = size.max(offset + fsize);
            }
            let def = self.ts.type_def(ty);
            if let Some(class_size) = def.class_size {
                if class_size != -1 {
                    size = class_size as u32;
                }
            }
            self.inner.sizes.insert(ty, size);
            return Ok(());
        }

        // Sequential layout: fields in declaration order, each placement
        // padded to the packing boundary.
        let packing = def.packing.unwrap_or(self.ptr_align);
        let mut size = if def.is_reference() {
            match def.base {
                Some(base) => self.inner.sizes.get(&base).copied().unwrap_or(0),
                None => 0,
            }
        } else {
            0
        };
        for &field in &def.fields.clone() {
            let fdef = self.ts.field(field);
            if fdef.is_static {
                continue;
            }
            let fsize = self.field_value_size(fdef.ty)?;
            self.inner.field_offsets.insert(field, size);
            size = Self::align_up(size + fsize, packing);
        }
        self.inner.sizes.insert(ty, size);
        Ok(())
    }

    fn build_method_table(&mut self, ty: TypeId) -> CompileResult<()> {
        let def = self.ts.type_def(ty);
        let mut table: Vec<MethodId> = match def.base {
            Some(base) => self
                .inner
                .method_tables
                .get(&base)
                .cloned()
                .unwrap_or_default(),
            None => Vec::new(),
        };

        for &m in &def.methods {
            let method = self.ts.method(m);
            if method.flags.is_virtual && method.flags.is_new_slot {
                self.inner.method_slots.insert(m, table.len());
                table.push(m);
            } else if method.flags.is_virtual {
                match self.find_override_slot(&table, m) {
                    Some(slot) => {
                        // The displaced occupant and every ancestor sharing
                        // the slot become overridden.
                        let mut occupant = Some(table[slot]);
                        while let Some(prev) = occupant {
                            if !self.inner.overridden.insert(prev) {
                                break;
                            }
                            occupant = self.base_method_at_slot(prev, slot);
                        }
                        table[slot] = m;
                        self.inner.method_slots.insert(m, slot);
                    }
                    None => {
                        self.inner.method_slots.insert(m, table.len());
                        table.push(m);
                    }
                }
            } else if (method.flags.is_static && method.flags.is_rt_special_name)
                || (!method.flags.is_internal && !method.flags.is_extern)
            {
                self.inner.method_slots.insert(m, table.len());
                table.push(m);
            }
        }

        self.inner.method_tables.insert(ty, table);
        Ok(())
    }

    fn base_method_at_slot(&self, method: MethodId, slot: usize) -> Option<MethodId> {
        let owner = self.ts.method(method).owner;
        let base = self.ts.type_def(owner).base?;
        let base_table = self.inner.method_tables.get(&base)?;
        let candidate = *base_table.get(slot)?;
        if candidate == method {
            None
        } else {
            Some(candidate)
        }
    }

    /// Find the base slot an override replaces: same name and signature.
    /// A generic method prefers a non-generic match.
    fn find_override_slot(&self, table: &[MethodId], method: MethodId) -> Option<usize> {
        let mdef = self.ts.method(method);
        let mut generic_match = None;
        for (slot, &candidate) in table.iter().enumerate() {
            let cdef = self.ts.method(candidate);
            if cdef.name != mdef.name || cdef.sig != mdef.sig {
                continue;
            }
            if mdef.flags.has_generic_params && cdef.flags.has_generic_params {
                generic_match.get_or_insert(slot);
                continue;
            }
            return Some(slot);
        }
        generic_match
    }

    fn build_interface_tables(&mut self, ty: TypeId) -> CompileResult<()> {
        // Interfaces implemented anywhere on the ancestor chain.
        let mut interfaces: Vec<TypeId> = Vec::new();
        let mut walk = Some(ty);
        while let Some(current) = walk {
            let def = self.ts.type_def(current);
            for &iface in &def.interfaces {
                if !interfaces.contains(&iface) {
                    interfaces.push(iface);
                }
            }
            walk = def.base;
        }

        for iface in interfaces {
            let iface_methods = self.ts.type_def(iface).methods.clone();
            let mut table: Vec<MethodId> = Vec::with_capacity(iface_methods.len());
            for &im in &iface_methods {
                let implementation = self
                    .find_explicit_impl(ty, im)
                    .or_else(|| self.find_implicit_impl(ty, im));
                match implementation {
                    Some(m) => table.push(m),
                    None => {
                        return Err(CompileError::TypeSystem {
                            item: format!(
                                "{}::{}",
                                self.ts.type_def(ty).name,
                                self.ts.method(im).name
                            ),
                            reason: "no implementation for interface method".to_string(),
                        })
                    }
                }
            }
            self.inner.interface_tables.insert((ty, iface), table);
        }
        Ok(())
    }

    /// Explicit interface overrides declared on the type's own methods.
    fn find_explicit_impl(&self, ty: TypeId, iface_method: MethodId) -> Option<MethodId> {
        for &m in &self.ts.type_def(ty).methods {
            if self.ts.method(m).overrides.contains(&iface_method) {
                return Some(m);
            }
        }
        None
    }

    /// Implicit match: same clean name and signature, walking the ancestor
    /// chain from the most derived type. Explicit-interface methods are
    /// skipped during this scan.
    fn find_implicit_impl(&self, ty: TypeId, iface_method: MethodId) -> Option<MethodId> {
        let target = self.ts.method(iface_method);
        let mut walk = Some(ty);
        while let Some(current) = walk {
            let def = self.ts.type_def(current);
            for &m in &def.methods {
                let mdef = self.ts.method(m);
                if mdef.is_explicit_interface_impl() {
                    continue;
                }
                if mdef.clean_name() == target.clean_name() && mdef.sig == target.sig {
                    return Some(m);
                }
            }
            walk = def.base;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::{MethodFlags, MethodSig, TypeSystemBuilder};

    fn layout(b: TypeSystemBuilder) -> TypeLayout {
        TypeLayout::new(Arc::new(b.build()), 4, 4).expect("layout")
    }

    #[test]
    fn sequential_layout_with_default_packing() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let i1 = b.primitive(Primitive::I1);
        let s = b.value_type("S");
        let a = b.field(s, "a", i4);
        let f_b = b.field(s, "b", i1);
        let c = b.field(s, "c", i4);
        let layout = layout(b);

        assert_eq!(layout.field_offset(a), 0);
        assert_eq!(layout.field_offset(f_b), 4);
        assert_eq!(layout.field_offset(c), 8);
        assert_eq!(layout.type_size(s), 12);
    }

    #[test]
    fn sequential_layout_with_packing_one() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let i1 = b.primitive(Primitive::I1);
        let s = b.value_type("S");
        b.set_packing(s, 1);
        let a = b.field(s, "a", i4);
        let f_b = b.field(s, "b", i1);
        let c = b.field(s, "c", i4);
        let layout = layout(b);

        assert_eq!(layout.field_offset(a), 0);
        assert_eq!(layout.field_offset(f_b), 4);
        assert_eq!(layout.field_offset(c), 5);
        assert_eq!(layout.type_size(s), 9);
    }

    #[test]
    fn explicit_layout_with_class_size() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let i1 = b.primitive(Primitive::I1);
        let e = b.value_type("E");
        b.set_explicit_layout(e, Some(16));
        let x = b.field_at(e, "x", i4, 0);
        let y = b.field_at(e, "y", i4, 0);
        let z = b.field_at(e, "z", i1, 8);
        let layout = layout(b);

        assert_eq!(layout.type_size(e), 16);
        assert_eq!(layout.field_offset(x), 0);
        assert_eq!(layout.field_offset(y), 0);
        assert_eq!(layout.field_offset(z), 8);
    }

    #[test]
    fn virtual_dispatch_slots() {
        let mut b = TypeSystemBuilder::new();
        let a = b.class("A");
        let sig = MethodSig::new(vec![], None);
        let virt = MethodFlags {
            is_virtual: true,
            is_new_slot: true,
            ..MethodFlags::default()
        };
        let a_m1 = b.method(a, "M1", virt, sig.clone(), None);
        let a_m2 = b.method(a, "M2", virt, sig.clone(), None);
        let bee = b.class_with_base("B", a);
        let b_m1 = b.method(
            bee,
            "M1",
            MethodFlags {
                is_virtual: true,
                ..MethodFlags::default()
            },
            sig.clone(),
            None,
        );
        let b_m3 = b.method(bee, "M3", virt, sig, None);
        let layout = layout(b);

        assert_eq!(layout.method_table(bee), vec![b_m1, a_m2, b_m3]);
        assert!(layout.is_method_overridden(a_m1));
        assert!(!layout.is_method_overridden(a_m2));
        assert_eq!(layout.method_slot(b_m1), Some(0));
        assert_eq!(layout.method_slot(b_m3), Some(2));
    }

    #[test]
    fn method_table_extends_base_table() {
        let mut b = TypeSystemBuilder::new();
        let a = b.class("A");
        let sig = MethodSig::new(vec![], None);
        let virt = MethodFlags {
            is_virtual: true,
            is_new_slot: true,
            ..MethodFlags::default()
        };
        b.method(a, "M1", virt, sig.clone(), None);
        let bee = b.class_with_base("B", a);
        b.method(bee, "M2", virt, sig, None);
        let layout = layout(b);

        let base_table = layout.method_table(a);
        let derived_table = layout.method_table(bee);
        assert!(derived_table.len() >= base_table.len());
        assert_eq!(&derived_table[..base_table.len()], &base_table[..]);
    }

    #[test]
    fn interface_table_implicit_and_explicit() {
        let mut b = TypeSystemBuilder::new();
        let iface = b.interface("ICounter");
        let sig = MethodSig::new(vec![], None);
        let i_count = b.method(iface, "Count", MethodFlags::default(), sig.clone(), None);
        let i_reset = b.method(iface, "Reset", MethodFlags::default(), sig.clone(), None);

        let cls = b.class("Counter");
        b.implement(cls, iface);
        let implicit = b.method(cls, "Count", MethodFlags::default(), sig.clone(), None);
        let explicit = b.method(cls, "ICounter.Reset", MethodFlags::default(), sig, None);
        b.add_override(explicit, i_reset);
        let layout = layout(b);

        assert_eq!(
            layout.interface_table(cls, iface),
            Some(vec![implicit, explicit])
        );
        assert_eq!(layout.interface_slot(iface), Some(0));
        let _ = i_count;
    }

    #[test]
    fn missing_interface_method_is_a_type_system_error() {
        let mut b = TypeSystemBuilder::new();
        let iface = b.interface("IThing");
        let sig = MethodSig::new(vec![], None);
        b.method(iface, "DoThing", MethodFlags::default(), sig, None);
        let cls = b.class("Thing");
        b.implement(cls, iface);
        let err = TypeLayout::new(Arc::new(b.build()), 4, 4).unwrap_err();
        assert!(matches!(err, CompileError::TypeSystem { .. }));
    }

    #[test]
    fn field_offsets_stay_inside_type_size() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let i2 = b.primitive(Primitive::I2);
        let s = b.value_type("Mixed");
        let fields = [
            b.field(s, "a", i2),
            b.field(s, "b", i4),
            b.field(s, "c", i2),
        ];
        let layout = layout(b);
        for f in fields {
            assert!(layout.field_offset(f) + layout.field_size(f) <= layout.type_size(s));
        }
    }

    #[test]
    fn stored_on_stack_and_compound() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let obj = b.object();
        let big = b.value_type("Big");
        b.field(big, "a", i4);
        b.field(big, "b", i4);
        let wrapper = b.value_type("RefWrapper");
        b.field(wrapper, "inner", obj);
        let layout = layout(b);

        assert!(layout.is_stored_on_stack(big));
        assert!(layout.is_compound_type(big));
        assert!(!layout.is_stored_on_stack(wrapper));
        assert!(!layout.is_compound_type(i4));
        assert!(!layout.is_stored_on_stack(i4));
    }
}
