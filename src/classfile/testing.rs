//! Hand-assembled class files for tests.

use super::pool::{Constant, ConstantPool};
use super::{ACC_ABSTRACT, ACC_NATIVE, ClassFile, MemberInfo, RawAttribute, put_u16, put_u32};

/// Body of a method under construction.
pub(crate) struct CodeSpec {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    /// `(start, end, handler, catch_type)`.
    pub(crate) exceptions: Vec<(u16, u16, u16, u16)>,
    /// Attribute name and payload, e.g. a StackMapTable.
    pub(crate) attributes: Vec<(String, Vec<u8>)>,
}

pub(crate) struct ClassBuilder {
    class: ClassFile,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str, super_name: &str) -> ClassBuilder {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class(name).expect("this class");
        let super_class = pool.add_class(super_name).expect("super class");
        ClassBuilder {
            class: ClassFile {
                minor_version: 0,
                major_version: 52,
                pool,
                access_flags: 0x0021,
                this_class,
                super_class,
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                attributes: Vec::new(),
            },
        }
    }

    pub(crate) fn access(&mut self, flags: u16) -> &mut Self {
        self.class.access_flags = flags;
        self
    }

    pub(crate) fn interface(&mut self, name: &str) -> &mut Self {
        let index = self.class.pool.add_class(name).expect("interface");
        self.class.interfaces.push(index);
        self
    }

    pub(crate) fn class_ref(&mut self, name: &str) -> u16 {
        self.class.pool.add_class(name).expect("class ref")
    }

    pub(crate) fn utf8(&mut self, value: &str) -> u16 {
        self.class.pool.add_utf8(value).expect("utf8")
    }

    pub(crate) fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.class
            .pool
            .add_method_ref(owner, name, descriptor)
            .expect("method ref")
    }

    pub(crate) fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let pool = &mut self.class.pool;
        let class_index = pool.add_class(owner).expect("field owner");
        let name_index = pool.add_utf8(name).expect("field name");
        let descriptor_index = pool.add_utf8(descriptor).expect("field descriptor");
        let name_and_type = pool
            .intern(Constant::NameAndType(name_index, descriptor_index))
            .expect("name and type");
        pool.intern(Constant::Fieldref(class_index, name_and_type))
            .expect("field ref")
    }

    pub(crate) fn long_constant(&mut self, value: u64) -> u16 {
        self.class
            .pool
            .intern(Constant::Long(value))
            .expect("long constant")
    }

    /// Add a method; native and abstract methods get no Code attribute.
    pub(crate) fn method(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> &mut Self {
        self.method_with(
            access,
            name,
            descriptor,
            CodeSpec {
                max_stack,
                max_locals,
                code,
                exceptions: Vec::new(),
                attributes: Vec::new(),
            },
        )
    }

    pub(crate) fn method_with(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        spec: CodeSpec,
    ) -> &mut Self {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut attributes = Vec::new();
        if access & (ACC_NATIVE | ACC_ABSTRACT) == 0 {
            let code_name = self.utf8("Code");
            let mut info = Vec::new();
            put_u16(&mut info, spec.max_stack);
            put_u16(&mut info, spec.max_locals);
            put_u32(&mut info, spec.code.len() as u32);
            info.extend_from_slice(&spec.code);
            put_u16(&mut info, spec.exceptions.len() as u16);
            for (start, end, handler, catch_type) in &spec.exceptions {
                put_u16(&mut info, *start);
                put_u16(&mut info, *end);
                put_u16(&mut info, *handler);
                put_u16(&mut info, *catch_type);
            }
            put_u16(&mut info, spec.attributes.len() as u16);
            for (attribute_name, payload) in &spec.attributes {
                let index = self.utf8(attribute_name);
                put_u16(&mut info, index);
                put_u32(&mut info, payload.len() as u32);
                info.extend_from_slice(payload);
            }
            attributes.push(RawAttribute {
                name_index: code_name,
                info,
            });
        }
        self.class.methods.push(MemberInfo {
            access_flags: access,
            name_index,
            descriptor_index,
            attributes,
        });
        self
    }

    /// Attach a runtime-visible annotation of the given internal type to the last method.
    pub(crate) fn annotate_last_method(&mut self, annotation: &str) -> &mut Self {
        let attribute_name = self.utf8("RuntimeVisibleAnnotations");
        let type_index = self.utf8(&format!("L{annotation};"));
        let mut info = Vec::new();
        put_u16(&mut info, 1);
        put_u16(&mut info, type_index);
        put_u16(&mut info, 0);
        if let Some(method) = self.class.methods.last_mut() {
            method.attributes.push(RawAttribute {
                name_index: attribute_name,
                info,
            });
        }
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        self.class.to_bytes()
    }
}
