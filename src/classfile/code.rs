use std::collections::BTreeMap;

use crate::error::RewriteError;
use crate::opcodes::{self, GOTO_W, JSR_W, LOOKUPSWITCH, TABLESWITCH};

use super::frames::{self, VerificationType};
use super::{
    ACC_STATIC, ByteReader, ClassFile, RawAttribute, put_u16, put_u32, read_attributes,
    write_attributes,
};

const MAX_CODE_LENGTH: usize = 65_535;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

/// Decoded `Code` attribute. Nested attributes stay raw.
#[derive(Clone, Debug)]
pub(crate) struct CodeAttribute {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<RawAttribute>,
}

impl CodeAttribute {
    pub(crate) fn parse(info: &[u8]) -> Result<CodeAttribute, RewriteError> {
        let mut reader = ByteReader::new(info);
        let max_stack = reader.u16()?;
        let max_locals = reader.u16()?;
        let code_length = reader.u32()? as usize;
        let code = reader.bytes(code_length)?.to_vec();
        let exception_count = reader.u16()?;
        let mut exception_table = Vec::with_capacity(exception_count as usize);
        for _ in 0..exception_count {
            exception_table.push(ExceptionEntry {
                start_pc: reader.u16()?,
                end_pc: reader.u16()?,
                handler_pc: reader.u16()?,
                catch_type: reader.u16()?,
            });
        }
        let attributes = read_attributes(&mut reader)?;
        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() + 32);
        put_u16(&mut out, self.max_stack);
        put_u16(&mut out, self.max_locals);
        put_u32(&mut out, self.code.len() as u32);
        out.extend_from_slice(&self.code);
        put_u16(&mut out, self.exception_table.len() as u16);
        for entry in &self.exception_table {
            put_u16(&mut out, entry.start_pc);
            put_u16(&mut out, entry.end_pc);
            put_u16(&mut out, entry.handler_pc);
            put_u16(&mut out, entry.catch_type);
        }
        write_attributes(&mut out, &self.attributes);
        out
    }

    /// Whether some exception handler protects the instruction at `offset`.
    pub(crate) fn is_covered(&self, offset: u32) -> bool {
        self.exception_table
            .iter()
            .any(|entry| entry.start_pc as u32 <= offset && offset < entry.end_pc as u32)
    }
}

/// Jump operands resolved to absolute offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Operand {
    None,
    Branch(u32),
    TableSwitch {
        default: u32,
        low: i32,
        targets: Vec<u32>,
    },
    LookupSwitch {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct Insn {
    pub(crate) offset: u32,
    pub(crate) opcode: u8,
    pub(crate) length: usize,
    pub(crate) operand: Operand,
}

pub(crate) fn decode(code: &[u8]) -> Result<Vec<Insn>, String> {
    let mut insns = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let length = opcodes::opcode_length(code, offset).map_err(|err| err.to_string())?;
        let operand = decode_operand(code, offset, opcode).map_err(|err| err.to_string())?;
        insns.push(Insn {
            offset: offset as u32,
            opcode,
            length,
            operand,
        });
        offset += length;
    }
    if offset != code.len() {
        return Err("last instruction runs past the end of the code".to_string());
    }
    Ok(insns)
}

fn decode_operand(code: &[u8], offset: usize, opcode: u8) -> anyhow::Result<Operand> {
    let operand = match opcode {
        _ if opcodes::is_short_branch(opcode) => {
            let relative = opcodes::read_i16(code, offset + 1)? as i32;
            Operand::Branch(absolute(code, offset, relative)?)
        }
        GOTO_W | JSR_W => {
            let relative = opcodes::read_i32(code, offset + 1)?;
            Operand::Branch(absolute(code, offset, relative)?)
        }
        TABLESWITCH => {
            let base = offset + 1 + opcodes::padding(offset);
            let default = absolute(code, offset, opcodes::read_i32(code, base)?)?;
            let low = opcodes::read_i32(code, base + 4)?;
            let high = opcodes::read_i32(code, base + 8)?;
            let count = (high as i64 - low as i64 + 1).max(0) as usize;
            let targets = (0..count)
                .map(|index| {
                    let relative = opcodes::read_i32(code, base + 12 + index * 4)?;
                    absolute(code, offset, relative)
                })
                .collect::<anyhow::Result<_>>()?;
            Operand::TableSwitch {
                default,
                low,
                targets,
            }
        }
        LOOKUPSWITCH => {
            let base = offset + 1 + opcodes::padding(offset);
            let default = absolute(code, offset, opcodes::read_i32(code, base)?)?;
            let npairs = opcodes::read_i32(code, base + 4)?.max(0) as usize;
            let pairs = (0..npairs)
                .map(|index| {
                    let entry = base + 8 + index * 8;
                    let key = opcodes::read_i32(code, entry)?;
                    let relative = opcodes::read_i32(code, entry + 4)?;
                    Ok((key, absolute(code, offset, relative)?))
                })
                .collect::<anyhow::Result<_>>()?;
            Operand::LookupSwitch { default, pairs }
        }
        _ => Operand::None,
    };
    Ok(operand)
}

fn absolute(code: &[u8], offset: usize, relative: i32) -> anyhow::Result<u32> {
    let target = offset as i64 + relative as i64;
    if target < 0 || target >= code.len() as i64 {
        anyhow::bail!("jump from {offset} to {target} leaves the method");
    }
    Ok(target as u32)
}

/// Bytecode to splice into one method. Snippets must be stack neutral and must not branch.
#[derive(Clone, Debug, Default)]
pub(crate) struct Patch {
    pub(crate) prologue: Vec<u8>,
    /// Keyed by the original offset of the instruction the snippet runs before.
    pub(crate) before: BTreeMap<u32, Vec<u8>>,
    pub(crate) extra_stack: u16,
    /// Local the prologue stores at slot `max_locals`.
    pub(crate) new_local: Option<VerificationType>,
}

/// Where each original instruction lands in the rewritten code.
struct Layout {
    /// Start of the inserted snippet, or of the instruction when nothing was inserted.
    block: Vec<u32>,
    /// The instruction itself.
    at: Vec<u32>,
    end: u32,
}

impl Layout {
    fn new(insns: &[Insn], code_length: usize, patch: &Patch) -> Layout {
        let mut block = vec![u32::MAX; code_length];
        let mut at = vec![u32::MAX; code_length];
        let mut position = patch.prologue.len();
        for insn in insns {
            block[insn.offset as usize] = position as u32;
            if let Some(snippet) = patch.before.get(&insn.offset) {
                position += snippet.len();
            }
            at[insn.offset as usize] = position as u32;
            position += relocated_length(insn, position);
        }
        Layout {
            block,
            at,
            end: position as u32,
        }
    }

    fn block(&self, offset: u32) -> Result<u32, String> {
        if offset as usize == self.block.len() {
            return Ok(self.end);
        }
        match self.block.get(offset as usize) {
            Some(position) if *position != u32::MAX => Ok(*position),
            _ => Err(format!("offset {offset} is not an instruction boundary")),
        }
    }

    fn at(&self, offset: u32) -> Result<u32, String> {
        match self.at.get(offset as usize) {
            Some(position) if *position != u32::MAX => Ok(*position),
            _ => Err(format!("offset {offset} is not an instruction boundary")),
        }
    }
}

fn relocated_length(insn: &Insn, position: usize) -> usize {
    match &insn.operand {
        Operand::TableSwitch { targets, .. } => {
            1 + opcodes::padding(position) + 12 + targets.len() * 4
        }
        Operand::LookupSwitch { pairs, .. } => 1 + opcodes::padding(position) + 8 + pairs.len() * 8,
        _ => insn.length,
    }
}

/// `com/example/Foo.bar(I)V`, for error messages.
pub(crate) fn method_label(class: &ClassFile, method_index: usize) -> String {
    let class_name = class.name().unwrap_or_else(|_| "?".to_string());
    match class.methods.get(method_index) {
        Some(method) => format!(
            "{class_name}.{}{}",
            class.member_name(method).unwrap_or_else(|_| "?".to_string()),
            class.member_descriptor(method).unwrap_or_default()
        ),
        None => format!("{class_name}#{method_index}"),
    }
}

/// Index of the Code attribute and its decoded form.
pub(crate) fn method_code(
    class: &ClassFile,
    method_index: usize,
) -> Result<Option<(usize, CodeAttribute)>, RewriteError> {
    let Some(method) = class.methods.get(method_index) else {
        return Ok(None);
    };
    for (index, attribute) in method.attributes.iter().enumerate() {
        if class.attribute_name(attribute)? == "Code" {
            return Ok(Some((index, CodeAttribute::parse(&attribute.info)?)));
        }
    }
    Ok(None)
}

/// Splice `patch` into a method body and fix every offset that refers into it.
pub(crate) fn apply_patch(
    class: &mut ClassFile,
    method_index: usize,
    patch: &Patch,
) -> Result<(), RewriteError> {
    let label = method_label(class, method_index);
    let bytecode_error = |msg: String| RewriteError::Bytecode {
        method: label.clone(),
        msg,
    };
    let Some((attribute_index, code)) = method_code(class, method_index)? else {
        return Err(bytecode_error("method has no Code attribute".to_string()));
    };
    let insns = decode(&code.code).map_err(bytecode_error)?;
    let layout = Layout::new(&insns, code.code.len(), patch);
    for offset in patch.before.keys() {
        layout.at(*offset).map_err(bytecode_error)?;
    }
    if layout.end as usize > MAX_CODE_LENGTH {
        return Err(RewriteError::CodeTooLarge(label.clone()));
    }

    let mut out = Vec::with_capacity(layout.end as usize);
    out.extend_from_slice(&patch.prologue);
    for insn in &insns {
        if let Some(snippet) = patch.before.get(&insn.offset) {
            out.extend_from_slice(snippet);
        }
        emit(&mut out, insn, &code.code, &layout, &label)?;
    }

    let mut exception_table = Vec::with_capacity(code.exception_table.len());
    for entry in &code.exception_table {
        exception_table.push(ExceptionEntry {
            start_pc: layout.block(entry.start_pc as u32).map_err(bytecode_error)? as u16,
            end_pc: layout.block(entry.end_pc as u32).map_err(bytecode_error)? as u16,
            handler_pc: layout.block(entry.handler_pc as u32).map_err(bytecode_error)? as u16,
            catch_type: entry.catch_type,
        });
    }

    let mut attributes = Vec::with_capacity(code.attributes.len());
    for attribute in &code.attributes {
        let info = match class.attribute_name(attribute)?.as_str() {
            "LineNumberTable" => remap_line_numbers(&attribute.info, &layout),
            "LocalVariableTable" | "LocalVariableTypeTable" => {
                remap_local_variables(&attribute.info, &layout)
            }
            "StackMapTable" => {
                let info = remap_frames(class, method_index, &attribute.info, &code, &layout, patch)
                    .map_err(|msg| RewriteError::StackMap {
                        method: label.clone(),
                        msg,
                    })?;
                Ok(info)
            }
            // type annotations carry offsets we do not track
            _ => continue,
        }
        .map_err(bytecode_error)?;
        attributes.push(RawAttribute {
            name_index: attribute.name_index,
            info,
        });
    }

    let extra_locals = patch.new_local.map_or(0, VerificationType::slots);
    let rewritten = CodeAttribute {
        max_stack: code.max_stack.saturating_add(patch.extra_stack),
        max_locals: code
            .max_locals
            .checked_add(extra_locals)
            .ok_or_else(|| bytecode_error("too many locals".to_string()))?,
        code: out,
        exception_table,
        attributes,
    };
    class.methods[method_index].attributes[attribute_index].info = rewritten.to_bytes();
    Ok(())
}

fn emit(
    out: &mut Vec<u8>,
    insn: &Insn,
    code: &[u8],
    layout: &Layout,
    label: &str,
) -> Result<(), RewriteError> {
    let position = out.len() as i64;
    let relative = |target: u32| -> Result<i32, RewriteError> {
        let destination = layout.block(target).map_err(|msg| RewriteError::Bytecode {
            method: label.to_string(),
            msg,
        })?;
        Ok((destination as i64 - position) as i32)
    };
    match &insn.operand {
        Operand::None => {
            let start = insn.offset as usize;
            out.extend_from_slice(&code[start..start + insn.length]);
        }
        Operand::Branch(target) => {
            let delta = relative(*target)?;
            out.push(insn.opcode);
            if matches!(insn.opcode, GOTO_W | JSR_W) {
                out.extend_from_slice(&delta.to_be_bytes());
            } else {
                let delta = i16::try_from(delta)
                    .map_err(|_| RewriteError::BranchOverflow(label.to_string()))?;
                out.extend_from_slice(&delta.to_be_bytes());
            }
        }
        Operand::TableSwitch {
            default,
            low,
            targets,
        } => {
            out.push(TABLESWITCH);
            out.resize(out.len() + opcodes::padding(position as usize), 0);
            out.extend_from_slice(&relative(*default)?.to_be_bytes());
            out.extend_from_slice(&low.to_be_bytes());
            let high = *low as i64 + targets.len() as i64 - 1;
            out.extend_from_slice(&(high as i32).to_be_bytes());
            for target in targets {
                out.extend_from_slice(&relative(*target)?.to_be_bytes());
            }
        }
        Operand::LookupSwitch { default, pairs } => {
            out.push(LOOKUPSWITCH);
            out.resize(out.len() + opcodes::padding(position as usize), 0);
            out.extend_from_slice(&relative(*default)?.to_be_bytes());
            out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
            for (key, target) in pairs {
                out.extend_from_slice(&key.to_be_bytes());
                out.extend_from_slice(&relative(*target)?.to_be_bytes());
            }
        }
    }
    Ok(())
}

fn remap_line_numbers(info: &[u8], layout: &Layout) -> Result<Vec<u8>, String> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16().map_err(|err| err.to_string())?;
    let mut out = Vec::with_capacity(info.len());
    put_u16(&mut out, count);
    for _ in 0..count {
        let start_pc = reader.u16().map_err(|err| err.to_string())?;
        let line = reader.u16().map_err(|err| err.to_string())?;
        put_u16(&mut out, layout.block(start_pc as u32)? as u16);
        put_u16(&mut out, line);
    }
    Ok(out)
}

fn remap_local_variables(info: &[u8], layout: &Layout) -> Result<Vec<u8>, String> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16().map_err(|err| err.to_string())?;
    let mut out = Vec::with_capacity(info.len());
    put_u16(&mut out, count);
    for _ in 0..count {
        let mut field = || reader.u16().map_err(|err| err.to_string());
        let start_pc = field()?;
        let length = field()?;
        let name_index = field()?;
        let descriptor_index = field()?;
        let index = field()?;
        let start = layout.block(start_pc as u32)?;
        let end = layout.block(start_pc as u32 + length as u32)?;
        put_u16(&mut out, start as u16);
        put_u16(&mut out, (end - start) as u16);
        put_u16(&mut out, name_index);
        put_u16(&mut out, descriptor_index);
        put_u16(&mut out, index);
    }
    Ok(out)
}

fn remap_frames(
    class: &mut ClassFile,
    method_index: usize,
    info: &[u8],
    code: &CodeAttribute,
    layout: &Layout,
    patch: &Patch,
) -> Result<Vec<u8>, String> {
    let method = &class.methods[method_index];
    let access = method.access_flags;
    let name = class.member_name(method).map_err(|err| err.to_string())?;
    let descriptor = class
        .member_descriptor(method)
        .map_err(|err| err.to_string())?;
    let this_is_object = class
        .name()
        .is_ok_and(|class_name| class_name == "java/lang/Object");
    let this_class = class.this_class;
    let initial = frames::initial_locals(
        &mut class.pool,
        this_class,
        access & ACC_STATIC != 0,
        name == "<init>",
        this_is_object,
        &descriptor,
    )
    .map_err(|err| err.to_string())?;

    let mut decoded = frames::decode_stack_map(info, &initial)?;
    let relocate = |ty: VerificationType| -> Result<VerificationType, String> {
        match ty {
            VerificationType::Uninitialized(offset) => {
                Ok(VerificationType::Uninitialized(layout.at(offset as u32)? as u16))
            }
            other => Ok(other),
        }
    };
    for frame in &mut decoded {
        frame.offset = layout.block(frame.offset)?;
        frame.locals = frame
            .locals
            .iter()
            .map(|ty| relocate(*ty))
            .collect::<Result<_, _>>()?;
        frame.stack = frame
            .stack
            .iter()
            .map(|ty| relocate(*ty))
            .collect::<Result<_, _>>()?;
        if let Some(new_local) = patch.new_local {
            frame.locals = frames::with_local(&frame.locals, code.max_locals, new_local)?;
        }
    }
    frames::encode_stack_map(&decoded)
}
