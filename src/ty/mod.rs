// The consumed type-and-method graph. Metadata loading is an external collaborator; this
// module models what it produces: types with bases, interfaces, fields and methods, method
// signatures and flags, and CIL-style stack-machine bodies with optional protected regions.
// Ids are plain indices into the owning TypeSystem; the builder exists so tests and tools
// can synthesize inputs without a metadata reader.

pub mod layout;

pub use layout::TypeLayout;

/// Handle for a type in a [`TypeSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// Handle for a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

/// Handle for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId(pub u32);

/// Built-in primitive kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Bool,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    IPtr,
    UPtr,
}

impl Primitive {
    pub fn size(self, ptr_size: u32) -> u32 {
        match self {
            Primitive::Bool | Primitive::I1 | Primitive::U1 => 1,
            Primitive::Char | Primitive::I2 | Primitive::U2 => 2,
            Primitive::I4 | Primitive::U4 | Primitive::R4 => 4,
            Primitive::I8 | Primitive::U8 | Primitive::R8 => 8,
            Primitive::IPtr | Primitive::UPtr => ptr_size,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Bool => "System.Boolean",
            Primitive::Char => "System.Char",
            Primitive::I1 => "System.SByte",
            Primitive::U1 => "System.Byte",
            Primitive::I2 => "System.Int16",
            Primitive::U2 => "System.UInt16",
            Primitive::I4 => "System.Int32",
            Primitive::U4 => "System.UInt32",
            Primitive::I8 => "System.Int64",
            Primitive::U8 => "System.UInt64",
            Primitive::R4 => "System.Single",
            Primitive::R8 => "System.Double",
            Primitive::IPtr => "System.IntPtr",
            Primitive::UPtr => "System.UIntPtr",
        }
    }
}

/// Categorization of a type definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Primitive(Primitive),
    /// Reference type. `System.Object` is the rootmost class.
    Class,
    /// User value type.
    ValueType,
    Interface,
    /// Module pseudo-type holding global members.
    Module,
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
    pub base: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub fields: Vec<FieldId>,
    pub methods: Vec<MethodId>,
    pub is_explicit_layout: bool,
    /// Field packing boundary for sequential layout; `None` uses the native
    /// pointer alignment.
    pub packing: Option<u32>,
    /// Explicit class size; `None` or `-1` means unset.
    pub class_size: Option<i32>,
    /// Element type when this definition is a modifier wrapper.
    pub element: Option<TypeId>,
}

impl TypeDef {
    pub fn is_interface(&self) -> bool {
        self.kind == TypeKind::Interface
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, TypeKind::ValueType | TypeKind::Primitive(_))
    }

    pub fn is_user_value_type(&self) -> bool {
        self.kind == TypeKind::ValueType
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, TypeKind::Class | TypeKind::Interface)
    }

    pub fn primitive(&self) -> Option<Primitive> {
        match self.kind {
            TypeKind::Primitive(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_object_root(&self) -> bool {
        self.kind == TypeKind::Class && self.base.is_none() && self.name == "System.Object"
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub owner: TypeId,
    pub ty: TypeId,
    pub is_static: bool,
    /// Explicit offset for explicit-layout types.
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    pub params: Vec<TypeId>,
    pub ret: Option<TypeId>,
}

impl MethodSig {
    pub fn new(params: Vec<TypeId>, ret: Option<TypeId>) -> Self {
        Self { params, ret }
    }
}

/// Method attribute flags as the metadata loader reports them.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodFlags {
    pub is_virtual: bool,
    pub is_new_slot: bool,
    pub is_static: bool,
    pub is_internal: bool,
    pub is_extern: bool,
    /// RTSpecialName, i.e. a class constructor.
    pub is_rt_special_name: bool,
    pub has_generic_params: bool,
}

#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub owner: TypeId,
    pub sig: MethodSig,
    pub flags: MethodFlags,
    /// Explicit interface-method overrides declared on this method.
    pub overrides: Vec<MethodId>,
    pub body: Option<CilBody>,
}

impl MethodDef {
    /// Method name with any explicit-interface prefix stripped.
    pub fn clean_name(&self) -> &str {
        match self.name.rfind('.') {
            Some(idx) => &self.name[idx + 1..],
            None => &self.name,
        }
    }

    /// Whether the name carries an explicit-interface prefix.
    pub fn is_explicit_interface_impl(&self) -> bool {
        self.name.contains('.')
    }
}

/// Exception-handler kinds of a protected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Catch,
    Finally,
}

/// A try/handler range over body op indices.
#[derive(Debug, Clone)]
pub struct ProtectedRegion {
    pub kind: HandlerKind,
    pub try_start: usize,
    pub try_end: usize,
    pub handler_start: usize,
    pub handler_end: usize,
}

/// CIL-style stack-machine body of a method.
#[derive(Debug, Clone, Default)]
pub struct CilBody {
    pub locals: Vec<TypeId>,
    pub ops: Vec<CilOp>,
    pub protected: Vec<ProtectedRegion>,
}

/// The decoded CIL-style operation set. Branch targets are op indices.
#[derive(Debug, Clone)]
pub enum CilOp {
    Nop,
    LdArg(u16),
    LdLoc(u16),
    StLoc(u16),
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    LdNull,
    Dup,
    Pop,
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    Neg,
    Not,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    ConvI4,
    ConvI8,
    ConvR4,
    ConvR8,
    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,
    Br(usize),
    BrTrue(usize),
    BrFalse(usize),
    Beq(usize),
    Bne(usize),
    Blt(usize),
    Ble(usize),
    Bgt(usize),
    Bge(usize),
    BltUn(usize),
    BgeUn(usize),
    Switch(Vec<usize>),
    Call(MethodId),
    CallVirt(MethodId),
    NewObj(MethodId),
    LdFld(FieldId),
    StFld(FieldId),
    LdSFld(FieldId),
    StSFld(FieldId),
    Ret,
}

/// The full type-and-method graph consumed by the compiler.
#[derive(Debug, Default)]
pub struct TypeSystem {
    types: Vec<TypeDef>,
    methods: Vec<MethodDef>,
    fields: Vec<FieldDef>,
}

impl TypeSystem {
    pub fn all_types(&self) -> impl Iterator<Item = TypeId> {
        (0..self.types.len() as u32).map(TypeId)
    }

    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id.0 as usize]
    }

    pub fn method(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.0 as usize]
    }

    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0 as usize]
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Every method that carries a body, in definition order.
    pub fn methods_with_bodies(&self) -> impl Iterator<Item = MethodId> + '_ {
        (0..self.methods.len() as u32)
            .map(MethodId)
            .filter(|id| self.methods[id.0 as usize].body.is_some())
    }

    /// Linker symbol name for a method.
    pub fn method_symbol(&self, id: MethodId) -> String {
        let method = self.method(id);
        let owner = self.type_def(method.owner);
        format!("{}::{}", owner.name, method.name)
    }
}

/// Imperative builder used by tests and tooling to synthesize type systems.
#[derive(Debug, Default)]
pub struct TypeSystemBuilder {
    ts: TypeSystem,
    primitives: std::collections::HashMap<Primitive, TypeId>,
    object: Option<TypeId>,
}

impl TypeSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_type(&mut self, def: TypeDef) -> TypeId {
        let id = TypeId(self.ts.types.len() as u32);
        self.ts.types.push(def);
        id
    }

    /// The `System.Object` root, created on first use.
    pub fn object(&mut self) -> TypeId {
        if let Some(id) = self.object {
            return id;
        }
        let id = self.push_type(TypeDef {
            name: "System.Object".to_string(),
            kind: TypeKind::Class,
            base: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            is_explicit_layout: false,
            packing: None,
            class_size: None,
            element: None,
        });
        self.object = Some(id);
        id
    }

    pub fn primitive(&mut self, p: Primitive) -> TypeId {
        if let Some(id) = self.primitives.get(&p) {
            return *id;
        }
        let base = self.object();
        let id = self.push_type(TypeDef {
            name: p.name().to_string(),
            kind: TypeKind::Primitive(p),
            base: Some(base),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            is_explicit_layout: false,
            packing: None,
            class_size: None,
            element: None,
        });
        self.primitives.insert(p, id);
        id
    }

    pub fn class(&mut self, name: &str) -> TypeId {
        let base = self.object();
        self.push_type(TypeDef {
            name: name.to_string(),
            kind: TypeKind::Class,
            base: Some(base),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            is_explicit_layout: false,
            packing: None,
            class_size: None,
            element: None,
        })
    }

    pub fn class_with_base(&mut self, name: &str, base: TypeId) -> TypeId {
        self.push_type(TypeDef {
            name: name.to_string(),
            kind: TypeKind::Class,
            base: Some(base),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            is_explicit_layout: false,
            packing: None,
            class_size: None,
            element: None,
        })
    }

    pub fn value_type(&mut self, name: &str) -> TypeId {
        let base = self.object();
        self.push_type(TypeDef {
            name: name.to_string(),
            kind: TypeKind::ValueType,
            base: Some(base),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            is_explicit_layout: false,
            packing: None,
            class_size: None,
            element: None,
        })
    }

    pub fn interface(&mut self, name: &str) -> TypeId {
        self.push_type(TypeDef {
            name: name.to_string(),
            kind: TypeKind::Interface,
            base: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            is_explicit_layout: false,
            packing: None,
            class_size: None,
            element: None,
        })
    }

    pub fn set_explicit_layout(&mut self, ty: TypeId, class_size: Option<i32>) {
        let def = &mut self.ts.types[ty.0 as usize];
        def.is_explicit_layout = true;
        def.class_size = class_size;
    }

    pub fn set_packing(&mut self, ty: TypeId, packing: u32) {
        self.ts.types[ty.0 as usize].packing = Some(packing);
    }

    pub fn implement(&mut self, ty: TypeId, interface: TypeId) {
        self.ts.types[ty.0 as usize].interfaces.push(interface);
    }

    pub fn field(&mut self, owner: TypeId, name: &str, ty: TypeId) -> FieldId {
        self.field_full(owner, name, ty, false, None)
    }

    pub fn static_field(&mut self, owner: TypeId, name: &str, ty: TypeId) -> FieldId {
        self.field_full(owner, name, ty, true, None)
    }

    pub fn field_at(&mut self, owner: TypeId, name: &str, ty: TypeId, offset: u32) -> FieldId {
        self.field_full(owner, name, ty, false, Some(offset))
    }

    fn field_full(
        &mut self,
        owner: TypeId,
        name: &str,
        ty: TypeId,
        is_static: bool,
        offset: Option<u32>,
    ) -> FieldId {
        let id = FieldId(self.ts.fields.len() as u32);
        self.ts.fields.push(FieldDef {
            name: name.to_string(),
            owner,
            ty,
            is_static,
            offset,
        });
        self.ts.types[owner.0 as usize].fields.push(id);
        id
    }

    pub fn method(
        &mut self,
        owner: TypeId,
        name: &str,
        flags: MethodFlags,
        sig: MethodSig,
        body: Option<CilBody>,
    ) -> MethodId {
        let id = MethodId(self.ts.methods.len() as u32);
        self.ts.methods.push(MethodDef {
            name: name.to_string(),
            owner,
            sig,
            flags,
            overrides: Vec::new(),
            body,
        });
        self.ts.types[owner.0 as usize].methods.push(id);
        id
    }

    /// Shorthand for a non-virtual static method with a body.
    pub fn static_method(
        &mut self,
        owner: TypeId,
        name: &str,
        sig: MethodSig,
        body: CilBody,
    ) -> MethodId {
        self.method(
            owner,
            name,
            MethodFlags {
                is_static: true,
                ..MethodFlags::default()
            },
            sig,
            Some(body),
        )
    }

    pub fn add_override(&mut self, method: MethodId, target: MethodId) {
        self.ts.methods[method.0 as usize].overrides.push(target);
    }

    pub fn build(self) -> TypeSystem {
        self.ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_wires_owners_and_ids() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let cls = b.class("Widget");
        let f = b.field(cls, "count", i4);
        let ts = b.build();
        assert_eq!(ts.field(f).owner, cls);
        assert!(ts.type_def(cls).fields.contains(&f));
        assert_eq!(ts.type_def(i4).primitive(), Some(Primitive::I4));
    }

    #[test]
    fn clean_name_strips_interface_prefix() {
        let mut b = TypeSystemBuilder::new();
        let cls = b.class("Widget");
        let m = b.method(
            cls,
            "ICollection.Count",
            MethodFlags::default(),
            MethodSig::new(vec![], None),
            None,
        );
        let ts = b.build();
        assert_eq!(ts.method(m).clean_name(), "Count");
        assert!(ts.method(m).is_explicit_interface_impl());
    }

    #[test]
    fn object_root_is_created_once() {
        let mut b = TypeSystemBuilder::new();
        let o1 = b.object();
        let o2 = b.object();
        assert_eq!(o1, o2);
        let ts = b.build();
        assert!(ts.type_def(o1).is_object_root());
    }
}
