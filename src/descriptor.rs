use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::MethodDescriptor;

use crate::error::ParseError;

/// Field type decoded from a JVM descriptor, kept in Java source spelling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct JavaType {
    pub(crate) dims: usize,
    pub(crate) base: BaseType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BaseType {
    Primitive(char),
    /// Dotted class name.
    Object(String),
}

/// Parameter and return types of a method descriptor. `ret` is `None` for `void`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MethodSignature {
    pub(crate) params: Vec<JavaType>,
    pub(crate) ret: Option<JavaType>,
}

impl JavaType {
    /// `int`, `java.lang.String[][]`.
    pub(crate) fn java_name(&self) -> String {
        let mut name = match &self.base {
            BaseType::Primitive(tag) => primitive_name(*tag).to_string(),
            BaseType::Object(class_name) => class_name.clone(),
        };
        for _ in 0..self.dims {
            name.push_str("[]");
        }
        name
    }

    /// Internal descriptor form, `[Ljava/lang/String;`.
    pub(crate) fn descriptor(&self) -> String {
        let mut descriptor = "[".repeat(self.dims);
        match &self.base {
            BaseType::Primitive(tag) => descriptor.push(*tag),
            BaseType::Object(class_name) => {
                descriptor.push('L');
                descriptor.push_str(&class_name.replace('.', "/"));
                descriptor.push(';');
            }
        }
        descriptor
    }

    pub(crate) fn class_name(&self) -> Option<&str> {
        match &self.base {
            BaseType::Object(class_name) => Some(class_name),
            BaseType::Primitive(_) => None,
        }
    }

    pub(crate) fn with_class_name(&self, class_name: &str) -> JavaType {
        match &self.base {
            BaseType::Object(_) => JavaType {
                dims: self.dims,
                base: BaseType::Object(class_name.to_string()),
            },
            BaseType::Primitive(_) => self.clone(),
        }
    }

    /// Local variable slots taken by a value of this type.
    pub(crate) fn slots(&self) -> u16 {
        match self.base {
            BaseType::Primitive('J' | 'D') if self.dims == 0 => 2,
            _ => 1,
        }
    }

    /// Primitive descriptor tag for non-array primitives.
    pub(crate) fn primitive(&self) -> Option<char> {
        match self.base {
            BaseType::Primitive(tag) if self.dims == 0 => Some(tag),
            _ => None,
        }
    }
}

impl MethodSignature {
    /// Comma separated parameter list in Java spelling, as mapping files write it.
    pub(crate) fn java_arguments(&self) -> String {
        self.params
            .iter()
            .map(JavaType::java_name)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(crate) fn java_return(&self) -> String {
        self.ret
            .as_ref()
            .map(JavaType::java_name)
            .unwrap_or_else(|| "void".to_string())
    }

    pub(crate) fn descriptor(&self) -> String {
        let mut descriptor = String::from("(");
        for param in &self.params {
            descriptor.push_str(&param.descriptor());
        }
        descriptor.push(')');
        match &self.ret {
            Some(ret) => descriptor.push_str(&ret.descriptor()),
            None => descriptor.push('V'),
        }
        descriptor
    }
}

/// Accepts both `/` and `.` as package separators inside object types.
pub(crate) fn parse_method_descriptor(desc: &str) -> Result<MethodSignature, ParseError> {
    let malformed = || ParseError::Descriptor(desc.to_string());
    let body = desc.strip_prefix('(').ok_or_else(malformed)?;
    let (mut params_part, ret_part) = body.split_once(')').ok_or_else(malformed)?;
    let mut params = Vec::new();
    while !params_part.is_empty() {
        let (param, rest) = parse_field_type(params_part).ok_or_else(malformed)?;
        params.push(param);
        params_part = rest;
    }
    let ret = if ret_part == "V" {
        None
    } else {
        let (ret, rest) = parse_field_type(ret_part).ok_or_else(malformed)?;
        if !rest.is_empty() {
            return Err(malformed());
        }
        Some(ret)
    };
    Ok(MethodSignature { params, ret })
}

fn parse_field_type(input: &str) -> Option<(JavaType, &str)> {
    let dims = input.bytes().take_while(|byte| *byte == b'[').count();
    let rest = &input[dims..];
    let tag = rest.chars().next()?;
    match tag {
        'L' => {
            let end = rest.find(';')?;
            let class_name = rest[1..end].replace('/', ".");
            if class_name.is_empty() {
                return None;
            }
            let base = BaseType::Object(class_name);
            Some((JavaType { dims, base }, &rest[end + 1..]))
        }
        'B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z' => {
            Some((JavaType { dims, base: BaseType::Primitive(tag) }, &rest[1..]))
        }
        _ => None,
    }
}

/// Number of declared parameters, validated by the descriptor grammar.
pub(crate) fn parameter_count(desc: &str) -> Result<usize> {
    let descriptor = MethodDescriptor::from_str(desc)
        .map_err(|err| anyhow::anyhow!("{err:?}"))
        .with_context(|| format!("failed to parse method descriptor {desc}"))?;
    Ok(descriptor.parameter_types().len())
}

/// `a.b.Outer$Inner` -> `Outer$Inner`.
pub(crate) fn simple_class_name(class_name: &str) -> &str {
    class_name
        .rsplit(['.', '/'])
        .next()
        .unwrap_or(class_name)
}

fn primitive_name(tag: char) -> &'static str {
    match tag {
        'B' => "byte",
        'C' => "char",
        'D' => "double",
        'F' => "float",
        'I' => "int",
        'J' => "long",
        'S' => "short",
        'Z' => "boolean",
        _ => "void",
    }
}
