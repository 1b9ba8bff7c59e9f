//! Compile-time class and field layout
//!
//! Classes exist only to compute object sizes for the memory allocation
//! services. Declaration is two-phase: `declare` registers a stub by id,
//! `define` resolves its parent and fields later. Self-referential layouts
//! name their own id in a field; a size query on a chain that still
//! contains an undefined stub fails. Field types are referenced by id, so
//! no descriptor is ever mutated in place after definition.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayoutError {
    #[error("Class '{parent}' is sealed and can not be inherited")]
    SealedParent { parent: String },

    #[error("Can not get size of unresolved type '{name}'")]
    UnresolvedType { name: String },

    #[error("Class '{name}' is already defined")]
    AlreadyDefined { name: String },

    #[error("Class '{name}' appears in its own parent chain")]
    CircularParent { name: String },
}

/// Handle to a class descriptor inside a [`TypeRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(usize);

/// A named field referencing its type by id
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub ty: ClassId,
    pub name: String,
}

impl FieldDef {
    pub fn new(ty: ClassId, name: impl Into<String>) -> Self {
        Self {
            ty,
            name: name.into(),
        }
    }
}

#[derive(Debug)]
struct ClassDef {
    name: String,
    parent: Option<ClassId>,
    fields: Vec<FieldDef>,
    sealed: bool,
    value_type: bool,
    defined: bool,
}

/// Arena of class descriptors
///
/// The native word type is pre-registered; everything else is declared
/// and defined by the caller.
#[derive(Debug)]
pub struct TypeRegistry {
    classes: Vec<ClassDef>,
    word: ClassId,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            classes: Vec::new(),
            word: ClassId(0),
        };
        registry.word = registry.push(ClassDef {
            name: "WORD".to_string(),
            parent: None,
            fields: Vec::new(),
            sealed: true,
            value_type: true,
            defined: true,
        });
        registry
    }

    fn push(&mut self, class: ClassDef) -> ClassId {
        let id = ClassId(self.classes.len());
        self.classes.push(class);
        id
    }

    /// The built-in word-sized value type
    pub fn word(&self) -> ClassId {
        self.word
    }

    /// Register a class stub by name
    ///
    /// The stub stands in for a not-yet-known layout (notably the fields
    /// of self-referential structures). Size queries fail until the stub
    /// is defined.
    pub fn declare(&mut self, name: impl Into<String>) -> ClassId {
        self.push(ClassDef {
            name: name.into(),
            parent: None,
            fields: Vec::new(),
            sealed: false,
            value_type: false,
            defined: false,
        })
    }

    /// Resolve a previously declared stub
    ///
    /// Fails immediately when the named parent is sealed; the stub stays
    /// undefined in that case, nothing is partially constructed.
    pub fn define(
        &mut self,
        id: ClassId,
        parent: Option<ClassId>,
        fields: Vec<FieldDef>,
        sealed: bool,
    ) -> Result<(), LayoutError> {
        if self.classes[id.0].defined {
            return Err(LayoutError::AlreadyDefined {
                name: self.classes[id.0].name.clone(),
            });
        }
        if let Some(parent_id) = parent {
            let parent_def = &self.classes[parent_id.0];
            if parent_def.defined && parent_def.sealed {
                return Err(LayoutError::SealedParent {
                    parent: parent_def.name.clone(),
                });
            }
        }
        let class = &mut self.classes[id.0];
        class.parent = parent;
        class.fields = fields;
        class.sealed = sealed;
        class.defined = true;
        Ok(())
    }

    /// Declare and define a class in one step
    pub fn define_class(
        &mut self,
        name: impl Into<String>,
        parent: Option<ClassId>,
        fields: Vec<FieldDef>,
        sealed: bool,
    ) -> Result<ClassId, LayoutError> {
        let id = self.declare(name);
        self.define(id, parent, fields, sealed)?;
        Ok(id)
    }

    pub fn name(&self, id: ClassId) -> &str {
        &self.classes[id.0].name
    }

    /// Whether the class is a word-sized value type
    pub fn is_value_type(&self, id: ClassId) -> bool {
        self.classes[id.0].value_type
    }

    /// Whether a field of this type is stored inline (one word)
    pub fn field_is_value(&self, field: &FieldDef) -> bool {
        self.is_value_type(field.ty)
    }

    /// Whether a field of this type is a reference into the managed heap
    pub fn field_is_pointer(&self, field: &FieldDef) -> bool {
        !self.is_value_type(field.ty)
    }

    /// Size of the class in words: own field count plus the parent chain
    ///
    /// Fails when the chain reaches an undefined stub.
    pub fn size_of(&self, id: ClassId) -> Result<i64, LayoutError> {
        let mut result = 0i64;
        let mut current = Some(id);
        let mut hops = 0usize;
        while let Some(class_id) = current {
            let class = &self.classes[class_id.0];
            if !class.defined {
                return Err(LayoutError::UnresolvedType {
                    name: class.name.clone(),
                });
            }
            if hops > self.classes.len() {
                return Err(LayoutError::CircularParent {
                    name: class.name.clone(),
                });
            }
            if class.value_type {
                result += 1;
            } else {
                result += class.fields.len() as i64;
            }
            current = class.parent;
            hops += 1;
        }
        Ok(result)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
