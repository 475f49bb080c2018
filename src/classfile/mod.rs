//! Lossless class file model used by the rewrite stage.
//!
//! Only what instrumentation touches is decoded: the constant pool, method headers and
//! the Code attribute. Fields and every other attribute round-trip as opaque bytes.

pub(crate) mod code;
pub(crate) mod frames;
pub(crate) mod pool;
#[cfg(test)]
pub(crate) mod testing;

use crate::error::RewriteError;

use self::pool::{Constant, ConstantPool};

pub(crate) const MAGIC: u32 = 0xcafe_babe;

pub(crate) const ACC_PUBLIC: u16 = 0x0001;
pub(crate) const ACC_PROTECTED: u16 = 0x0004;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_NATIVE: u16 = 0x0100;
pub(crate) const ACC_INTERFACE: u16 = 0x0200;
pub(crate) const ACC_ABSTRACT: u16 = 0x0400;

/// Parsed class file.
#[derive(Clone, Debug)]
pub(crate) struct ClassFile {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) pool: ConstantPool,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<MemberInfo>,
    pub(crate) methods: Vec<MemberInfo>,
    pub(crate) attributes: Vec<RawAttribute>,
}

/// Field or method header with undecoded attributes.
#[derive(Clone, Debug)]
pub(crate) struct MemberInfo {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<RawAttribute>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawAttribute {
    pub(crate) name_index: u16,
    pub(crate) info: Vec<u8>,
}

impl ClassFile {
    pub(crate) fn parse(bytes: &[u8]) -> Result<ClassFile, RewriteError> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(RewriteError::BadMagic(magic));
        }
        let minor_version = reader.u16()?;
        let major_version = reader.u16()?;
        let pool = read_constant_pool(&mut reader)?;
        let access_flags = reader.u16()?;
        let this_class = reader.u16()?;
        let super_class = reader.u16()?;
        let interface_count = reader.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(reader.u16()?);
        }
        let fields = read_members(&mut reader)?;
        let methods = read_members(&mut reader)?;
        let attributes = read_attributes(&mut reader)?;
        if !reader.is_empty() {
            return Err(RewriteError::Truncated(reader.position()));
        }
        Ok(ClassFile {
            minor_version,
            major_version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, MAGIC);
        put_u16(&mut out, self.minor_version);
        put_u16(&mut out, self.major_version);
        write_constant_pool(&mut out, &self.pool);
        put_u16(&mut out, self.access_flags);
        put_u16(&mut out, self.this_class);
        put_u16(&mut out, self.super_class);
        put_u16(&mut out, self.interfaces.len() as u16);
        for interface in &self.interfaces {
            put_u16(&mut out, *interface);
        }
        write_members(&mut out, &self.fields);
        write_members(&mut out, &self.methods);
        write_attributes(&mut out, &self.attributes);
        out
    }

    /// Internal name of this class.
    pub(crate) fn name(&self) -> Result<String, RewriteError> {
        self.pool.class_name(self.this_class)
    }

    pub(crate) fn super_name(&self) -> Result<Option<String>, RewriteError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.pool.class_name(self.super_class).map(Some)
    }

    pub(crate) fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub(crate) fn member_name(&self, member: &MemberInfo) -> Result<String, RewriteError> {
        self.pool.utf8(member.name_index)
    }

    pub(crate) fn member_descriptor(&self, member: &MemberInfo) -> Result<String, RewriteError> {
        self.pool.utf8(member.descriptor_index)
    }

    /// Position of the method with this exact name and descriptor.
    pub(crate) fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods.iter().position(|method| {
            self.pool.utf8(method.name_index).is_ok_and(|value| value == name)
                && self
                    .pool
                    .utf8(method.descriptor_index)
                    .is_ok_and(|value| value == descriptor)
        })
    }

    pub(crate) fn attribute_name(&self, attribute: &RawAttribute) -> Result<String, RewriteError> {
        self.pool.utf8(attribute.name_index)
    }
}

fn read_constant_pool(reader: &mut ByteReader<'_>) -> Result<ConstantPool, RewriteError> {
    let count = reader.u16()? as usize;
    let mut entries = Vec::with_capacity(count);
    entries.push(Constant::Unusable);
    while entries.len() < count {
        let index = entries.len();
        let tag = reader.u8()?;
        let constant = match tag {
            1 => {
                let length = reader.u16()? as usize;
                Constant::Utf8(reader.bytes(length)?.to_vec())
            }
            3 => Constant::Integer(reader.u32()?),
            4 => Constant::Float(reader.u32()?),
            5 => Constant::Long(reader.u64()?),
            6 => Constant::Double(reader.u64()?),
            7 => Constant::Class(reader.u16()?),
            8 => Constant::String(reader.u16()?),
            9 => Constant::Fieldref(reader.u16()?, reader.u16()?),
            10 => Constant::Methodref(reader.u16()?, reader.u16()?),
            11 => Constant::InterfaceMethodref(reader.u16()?, reader.u16()?),
            12 => Constant::NameAndType(reader.u16()?, reader.u16()?),
            15 => Constant::MethodHandle(reader.u8()?, reader.u16()?),
            16 => Constant::MethodType(reader.u16()?),
            17 => Constant::Dynamic(reader.u16()?, reader.u16()?),
            18 => Constant::InvokeDynamic(reader.u16()?, reader.u16()?),
            19 => Constant::Module(reader.u16()?),
            20 => Constant::Package(reader.u16()?),
            _ => return Err(RewriteError::UnknownConstantTag { tag, index }),
        };
        let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
        entries.push(constant);
        if wide {
            entries.push(Constant::Unusable);
        }
    }
    if entries.len() != count {
        // a long or double in the last slot overran the declared count
        return Err(RewriteError::BadConstant(count as u16));
    }
    Ok(ConstantPool::from_entries(entries))
}

fn write_constant_pool(out: &mut Vec<u8>, pool: &ConstantPool) {
    put_u16(out, pool.count() as u16);
    let mut entries = pool.entries().iter().skip(1);
    while let Some(constant) = entries.next() {
        match constant {
            Constant::Unusable => {}
            Constant::Utf8(bytes) => {
                out.push(1);
                put_u16(out, bytes.len() as u16);
                out.extend_from_slice(bytes);
            }
            Constant::Integer(value) => {
                out.push(3);
                put_u32(out, *value);
            }
            Constant::Float(value) => {
                out.push(4);
                put_u32(out, *value);
            }
            Constant::Long(value) => {
                out.push(5);
                out.extend_from_slice(&value.to_be_bytes());
                entries.next();
            }
            Constant::Double(value) => {
                out.push(6);
                out.extend_from_slice(&value.to_be_bytes());
                entries.next();
            }
            Constant::Class(index) => put_tag_u16(out, 7, *index),
            Constant::String(index) => put_tag_u16(out, 8, *index),
            Constant::Fieldref(a, b) => put_tag_pair(out, 9, *a, *b),
            Constant::Methodref(a, b) => put_tag_pair(out, 10, *a, *b),
            Constant::InterfaceMethodref(a, b) => put_tag_pair(out, 11, *a, *b),
            Constant::NameAndType(a, b) => put_tag_pair(out, 12, *a, *b),
            Constant::MethodHandle(kind, index) => {
                out.push(15);
                out.push(*kind);
                put_u16(out, *index);
            }
            Constant::MethodType(index) => put_tag_u16(out, 16, *index),
            Constant::Dynamic(a, b) => put_tag_pair(out, 17, *a, *b),
            Constant::InvokeDynamic(a, b) => put_tag_pair(out, 18, *a, *b),
            Constant::Module(index) => put_tag_u16(out, 19, *index),
            Constant::Package(index) => put_tag_u16(out, 20, *index),
        }
    }
}

fn read_members(reader: &mut ByteReader<'_>) -> Result<Vec<MemberInfo>, RewriteError> {
    let count = reader.u16()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        members.push(MemberInfo {
            access_flags: reader.u16()?,
            name_index: reader.u16()?,
            descriptor_index: reader.u16()?,
            attributes: read_attributes(reader)?,
        });
    }
    Ok(members)
}

fn write_members(out: &mut Vec<u8>, members: &[MemberInfo]) {
    put_u16(out, members.len() as u16);
    for member in members {
        put_u16(out, member.access_flags);
        put_u16(out, member.name_index);
        put_u16(out, member.descriptor_index);
        write_attributes(out, &member.attributes);
    }
}

pub(crate) fn read_attributes(
    reader: &mut ByteReader<'_>,
) -> Result<Vec<RawAttribute>, RewriteError> {
    let count = reader.u16()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = reader.u16()?;
        let length = reader.u32()? as usize;
        attributes.push(RawAttribute {
            name_index,
            info: reader.bytes(length)?.to_vec(),
        });
    }
    Ok(attributes)
}

pub(crate) fn write_attributes(out: &mut Vec<u8>, attributes: &[RawAttribute]) {
    put_u16(out, attributes.len() as u16);
    for attribute in attributes {
        put_u16(out, attribute.name_index);
        put_u32(out, attribute.info.len() as u32);
        out.extend_from_slice(&attribute.info);
    }
}

/// Big-endian cursor over class file bytes.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> ByteReader<'a> {
        ByteReader { bytes, position: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.position >= self.bytes.len()
    }

    pub(crate) fn bytes(&mut self, length: usize) -> Result<&'a [u8], RewriteError> {
        let end = self
            .position
            .checked_add(length)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(RewriteError::Truncated(self.position))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, RewriteError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, RewriteError> {
        let slice = self.bytes(2)?;
        Ok(u16::from_be_bytes([slice[0], slice[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, RewriteError> {
        let slice = self.bytes(4)?;
        Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, RewriteError> {
        let high = self.u32()? as u64;
        let low = self.u32()? as u64;
        Ok((high << 32) | low)
    }
}

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_tag_u16(out: &mut Vec<u8>, tag: u8, value: u16) {
    out.push(tag);
    put_u16(out, value);
}

fn put_tag_pair(out: &mut Vec<u8>, tag: u8, first: u16, second: u16) {
    out.push(tag);
    put_u16(out, first);
    put_u16(out, second);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::testing::ClassBuilder;
    use crate::opcodes;

    #[test]
    fn round_trip_is_byte_identical() {
        let mut builder = ClassBuilder::new("com/example/Foo", "java/lang/Object");
        builder.long_constant(42);
        builder.method(ACC_PUBLIC, "run", "()V", 0, 1, vec![opcodes::RETURN]);
        let bytes = builder.build();

        let class = ClassFile::parse(&bytes).expect("parse class");

        assert_eq!(bytes, class.to_bytes());
        assert_eq!("com/example/Foo", class.name().expect("class name"));
        assert_eq!(Some("java/lang/Object".to_string()), class.super_name().expect("super"));
        assert_eq!(Some(0), class.find_method("run", "()V"));
        assert_eq!(None, class.find_method("run", "(I)V"));
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        assert!(matches!(
            ClassFile::parse(&[0, 0, 0, 0]),
            Err(RewriteError::BadMagic(0))
        ));
        let bytes = ClassBuilder::new("A", "java/lang/Object").build();
        assert!(matches!(
            ClassFile::parse(&bytes[..bytes.len() - 1]),
            Err(RewriteError::Truncated(_))
        ));
    }
}
