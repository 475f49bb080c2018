use crate::error::RewriteError;

/// Constant pool entry. Utf8 keeps its modified UTF-8 bytes so unknown strings are written
/// back untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Constant {
    /// Index 0 and the slot after a long or double.
    Unusable,
    Utf8(Vec<u8>),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref(u16, u16),
    Methodref(u16, u16),
    InterfaceMethodref(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
}

#[derive(Clone, Debug)]
pub(crate) struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    /// Empty pool holding only the unusable slot 0. Real pools come from parsed classes.
    #[cfg(test)]
    pub(crate) fn new() -> ConstantPool {
        ConstantPool {
            entries: vec![Constant::Unusable],
        }
    }

    pub(crate) fn from_entries(entries: Vec<Constant>) -> ConstantPool {
        ConstantPool { entries }
    }

    /// Value of the `constant_pool_count` field.
    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &[Constant] {
        &self.entries
    }

    pub(crate) fn get(&self, index: u16) -> Result<&Constant, RewriteError> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(RewriteError::BadConstant(index)),
            Some(constant) => Ok(constant),
        }
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<String, RewriteError> {
        match self.get(index)? {
            Constant::Utf8(bytes) => Ok(decode_modified_utf8(bytes)),
            _ => Err(RewriteError::BadConstant(index)),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<String, RewriteError> {
        match self.get(index)? {
            Constant::Class(name_index) => self.utf8(*name_index),
            _ => Err(RewriteError::BadConstant(index)),
        }
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> Result<u16, RewriteError> {
        self.intern(Constant::Utf8(encode_modified_utf8(value)))
    }

    pub(crate) fn add_class(&mut self, internal_name: &str) -> Result<u16, RewriteError> {
        let name_index = self.add_utf8(internal_name)?;
        self.intern(Constant::Class(name_index))
    }

    pub(crate) fn add_string(&mut self, value: &str) -> Result<u16, RewriteError> {
        let string_index = self.add_utf8(value)?;
        self.intern(Constant::String(string_index))
    }

    pub(crate) fn add_integer(&mut self, value: i32) -> Result<u16, RewriteError> {
        self.intern(Constant::Integer(value as u32))
    }

    pub(crate) fn add_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, RewriteError> {
        let class_index = self.add_class(owner)?;
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        let name_and_type = self.intern(Constant::NameAndType(name_index, descriptor_index))?;
        self.intern(Constant::Methodref(class_index, name_and_type))
    }

    /// Reuse an equal entry or append a new one.
    pub(crate) fn intern(&mut self, constant: Constant) -> Result<u16, RewriteError> {
        if let Some(index) = self.entries.iter().position(|entry| *entry == constant) {
            return u16::try_from(index).map_err(|_| RewriteError::ConstantPoolOverflow);
        }
        let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
        let index = self.entries.len();
        let needed = if wide { index + 2 } else { index + 1 };
        if needed > u16::MAX as usize {
            return Err(RewriteError::ConstantPoolOverflow);
        }
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index as u16)
    }
}

/// Decode the JVM's modified UTF-8. Unpaired surrogates become U+FFFD.
pub(crate) fn decode_modified_utf8(bytes: &[u8]) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let first = bytes[index] as u16;
        if first & 0x80 == 0 {
            units.push(first);
            index += 1;
        } else if first & 0xe0 == 0xc0 && index + 1 < bytes.len() {
            let second = bytes[index + 1] as u16;
            units.push(((first & 0x1f) << 6) | (second & 0x3f));
            index += 2;
        } else if first & 0xf0 == 0xe0 && index + 2 < bytes.len() {
            let second = bytes[index + 1] as u16;
            let third = bytes[index + 2] as u16;
            units.push(((first & 0x0f) << 12) | ((second & 0x3f) << 6) | (third & 0x3f));
            index += 3;
        } else {
            units.push(0xfffd);
            index += 1;
        }
    }
    String::from_utf16_lossy(&units)
}

pub(crate) fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => bytes.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                bytes.push(0xc0 | (unit >> 6) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                bytes.push(0xe0 | (unit >> 12) as u8);
                bytes.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    bytes
}
