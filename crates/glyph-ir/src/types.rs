//! IR Type System
//!
//! Target-neutral type references and record schemas.

use serde::Serialize;
use std::fmt;

use crate::expr::{ExprIR, LiteralValue, StmtIR};

/// Target-neutral type reference
///
/// Conversion from surface syntax never fails: anything the builder does not
/// recognize becomes [`TypeRef::Any`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum TypeRef {
    Int,
    Float,
    String,
    Bool,
    /// Dynamic / unresolved
    Any,
    /// `[T]`
    Array(Box<TypeRef>),
    /// `T?`
    Optional(Box<TypeRef>),
    /// Result of an async computation
    Future(Box<TypeRef>),
    /// `A | B`
    Union(Vec<TypeRef>),
    /// `Name<A, B>`
    Generic { name: String, args: Vec<TypeRef> },
    /// User-declared type
    Named(String),
    /// Injected dependency
    Provider(String),
    /// `(A, B) -> R`
    Function {
        params: Vec<TypeRef>,
        ret: Box<TypeRef>,
    },
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn array(inner: TypeRef) -> Self {
        TypeRef::Array(Box::new(inner))
    }

    /// Wraps in `Optional` unless already optional
    pub fn optional(self) -> Self {
        match self {
            TypeRef::Optional(_) => self,
            other => TypeRef::Optional(Box::new(other)),
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, TypeRef::Optional(_))
    }

    /// Strips one `Optional` layer, if any
    pub fn without_optional(&self) -> &TypeRef {
        match self {
            TypeRef::Optional(inner) => inner,
            other => other,
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            TypeRef::Int | TypeRef::Float | TypeRef::String | TypeRef::Bool
        )
    }

    /// Name carried by nominal kinds
    pub fn name(&self) -> Option<&str> {
        match self {
            TypeRef::Named(name) | TypeRef::Provider(name) => Some(name),
            TypeRef::Generic { name, .. } => Some(name),
            _ => None,
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[TypeRef], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Int => write!(f, "int"),
            TypeRef::Float => write!(f, "float"),
            TypeRef::String => write!(f, "str"),
            TypeRef::Bool => write!(f, "bool"),
            TypeRef::Any => write!(f, "any"),
            TypeRef::Array(inner) => write!(f, "[{}]", inner),
            TypeRef::Optional(inner) => write!(f, "{}?", inner),
            TypeRef::Future(inner) => write!(f, "Future<{}>", inner),
            TypeRef::Union(elements) => {
                if elements.is_empty() {
                    return write!(f, "never");
                }
                write_list(f, elements, " | ")
            }
            TypeRef::Generic { name, args } => {
                write!(f, "{}<", name)?;
                write_list(f, args, ", ")?;
                write!(f, ">")
            }
            TypeRef::Named(name) => write!(f, "{}", name),
            TypeRef::Provider(name) => write!(f, "provider {}", name),
            TypeRef::Function { params, ret } => {
                write!(f, "(")?;
                write_list(f, params, ", ")?;
                write!(f, ") -> {}", ret)
            }
        }
    }
}

/// Declarative annotation on a field: `@email`, `@minLen(2)`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub name: String,
    pub params: Vec<LiteralValue>,
}

/// A single field of a record, or a parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSchema {
    pub name: String,
    pub ty: TypeRef,
    /// `false` means the value may be absent
    pub required: bool,
    pub default: Option<ExprIR>,
    pub annotations: Vec<Annotation>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
            annotations: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, value: ExprIR) -> Self {
        self.default = Some(value);
        self
    }

    /// The type as seen by a reader of the record: absent fields are optional
    pub fn effective_type(&self) -> TypeRef {
        if self.required {
            self.ty.clone()
        } else {
            self.ty.clone().optional()
        }
    }
}

/// Method declared on a record type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodSchema {
    pub name: String,
    pub params: Vec<FieldSchema>,
    pub return_type: TypeRef,
    pub body: Vec<StmtIR>,
}

/// Named record type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    pub type_params: Vec<String>,
    pub traits: Vec<String>,
    pub methods: Vec<MethodSchema>,
}

impl TypeSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            type_params: Vec::new(),
            traits: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_display() {
        assert_eq!(TypeRef::Int.to_string(), "int");
        assert_eq!(TypeRef::array(TypeRef::String).to_string(), "[str]");
        assert_eq!(TypeRef::Int.optional().to_string(), "int?");
        assert_eq!(
            TypeRef::Union(vec![TypeRef::Int, TypeRef::named("User")]).to_string(),
            "int | User"
        );
        assert_eq!(
            TypeRef::Generic {
                name: "Page".to_string(),
                args: vec![TypeRef::named("User")],
            }
            .to_string(),
            "Page<User>"
        );
        assert_eq!(
            TypeRef::Function {
                params: vec![TypeRef::Int, TypeRef::Int],
                ret: Box::new(TypeRef::Bool),
            }
            .to_string(),
            "(int, int) -> bool"
        );
    }

    #[test]
    fn test_optional_never_double_wraps() {
        let once = TypeRef::Int.optional();
        let twice = once.clone().optional();
        assert_eq!(once, twice);
        assert_eq!(twice.without_optional(), &TypeRef::Int);
    }

    #[test]
    fn test_effective_type() {
        let age = FieldSchema::new("age", TypeRef::Int).optional();
        assert_eq!(age.effective_type(), TypeRef::Optional(Box::new(TypeRef::Int)));

        let nick = FieldSchema::new("nick", TypeRef::String.optional()).optional();
        assert_eq!(
            nick.effective_type(),
            TypeRef::Optional(Box::new(TypeRef::String))
        );

        let id = FieldSchema::new("id", TypeRef::Int);
        assert_eq!(id.effective_type(), TypeRef::Int);
    }

    #[test]
    fn test_type_schema_lookup() {
        let user = TypeSchema::new("User")
            .with_field(FieldSchema::new("id", TypeRef::Int))
            .with_field(FieldSchema::new("name", TypeRef::String));

        assert_eq!(user.field("name").map(|f| &f.ty), Some(&TypeRef::String));
        assert!(user.field("email").is_none());
    }
}
