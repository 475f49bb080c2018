//! Entry and exit probes for catalogued methods.

use std::collections::BTreeMap;

use tracing::warn;

use crate::classfile::code::{self, CodeAttribute, Patch};
use crate::classfile::frames::VerificationType;
use crate::classfile::pool::ConstantPool;
use crate::classfile::{ACC_ABSTRACT, ACC_NATIVE, ACC_STATIC, ClassFile};
use crate::config::HookAbi;
use crate::descriptor::{
    BaseType, JavaType, parameter_count, parse_method_descriptor, simple_class_name,
};
use crate::error::RewriteError;
use crate::opcodes::{
    self, AASTORE, ALOAD, ANEWARRAY, ATHROW, DLOAD, DUP, FLOAD, ILOAD, INVOKESTATIC, LLOAD, LSTORE,
};

use super::{ClassPass, WeaveContext, invoke, load_constant, local_insn, push_int};

/// Calls the begin hook on entry and the end hook before every return. Uncaught `athrow`
/// sites get the throw hook.
pub(crate) struct MethodProbePass;

/// What the probes pass to the hooks.
enum Probe {
    /// Stable id plus the timestamp kept in a new long local.
    Id { id: i32, slot: u16 },
    /// `SimpleClass:method` and the captured parameter values.
    Capture {
        name: String,
        params: Vec<CapturedParam>,
    },
}

struct CapturedParam {
    slot: u16,
    ty: JavaType,
}

impl ClassPass for MethodProbePass {
    fn name(&self) -> &'static str {
        "method-probe"
    }

    fn apply(&self, class: &mut ClassFile, ctx: &WeaveContext<'_>) -> Result<bool, RewriteError> {
        if class.is_interface() {
            return Ok(false);
        }
        let class_name = class.name()?;
        let mut changed = false;
        for index in 0..class.methods.len() {
            let method = &class.methods[index];
            if method.access_flags & (ACC_ABSTRACT | ACC_NATIVE) != 0 {
                continue;
            }
            let access = method.access_flags;
            let name = class.member_name(method)?;
            let descriptor = class.member_descriptor(method)?;
            let Some(id) = ctx.catalog.id_of(&class_name, &name, &descriptor, access) else {
                continue;
            };
            let Some((_, code)) = code::method_code(class, index)? else {
                continue;
            };
            let origin = ctx.mapper.origin_full_method(&class_name, &name, &descriptor);
            let probe = match ctx.filter.captured_parameters(&origin) {
                Some(indexes) if !indexes.is_empty() => Probe::Capture {
                    name: capture_name(ctx, &class_name, &name, &descriptor),
                    params: captured_params(&descriptor, access & ACC_STATIC != 0, indexes)?,
                },
                _ => Probe::Id {
                    id: id as i32,
                    slot: code.max_locals,
                },
            };
            let patch = build_patch(&mut class.pool, &ctx.config.hooks, &probe, &code, &class_name)?;
            code::apply_patch(class, index, &patch)?;
            changed = true;
        }
        Ok(changed)
    }
}

/// `SimpleClass:method` with original names.
fn capture_name(ctx: &WeaveContext<'_>, class_name: &str, name: &str, descriptor: &str) -> String {
    let dotted = class_name.replace('/', ".");
    let original_class = ctx.mapper.original_class_name(&dotted, &dotted);
    let info = ctx.mapper.original_method_info(&dotted, name, descriptor);
    format!("{}:{}", simple_class_name(&original_class), info.name)
}

fn captured_params(
    descriptor: &str,
    is_static: bool,
    indexes: &[usize],
) -> Result<Vec<CapturedParam>, RewriteError> {
    let signature = parse_method_descriptor(descriptor)?;
    if let Ok(count) = parameter_count(descriptor) {
        for index in indexes.iter().filter(|&&index| index >= count) {
            warn!("captured parameter {index} is out of range for {descriptor}");
        }
    }
    let mut slot = if is_static { 0 } else { 1 };
    let mut captured = Vec::new();
    for (index, ty) in signature.params.into_iter().enumerate() {
        let width = ty.slots();
        if indexes.contains(&index) {
            captured.push(CapturedParam { slot, ty });
        }
        slot += width;
    }
    Ok(captured)
}

fn build_patch(
    pool: &mut ConstantPool,
    hooks: &HookAbi,
    probe: &Probe,
    code: &CodeAttribute,
    class_name: &str,
) -> Result<Patch, RewriteError> {
    let insns = code::decode(&code.code).map_err(|msg| RewriteError::Bytecode {
        method: class_name.to_string(),
        msg,
    })?;
    let begin = probe_call(pool, hooks, probe, Hook::Begin)?;
    let mut before = BTreeMap::new();
    let mut end = None;
    let mut throw = None;
    for insn in &insns {
        let (cached, hook) = if opcodes::is_return(insn.opcode) {
            (&mut end, Hook::End)
        } else if insn.opcode == ATHROW && !code.is_covered(insn.offset) {
            (&mut throw, Hook::Throw)
        } else {
            continue;
        };
        if cached.is_none() {
            *cached = Some(probe_call(pool, hooks, probe, hook)?);
        }
        if let Some(snippet) = cached {
            before.insert(insn.offset, snippet.clone());
        }
    }

    let patch = match probe {
        Probe::Id { slot, .. } => {
            let mut prologue = begin;
            local_insn(&mut prologue, LSTORE, *slot);
            Patch {
                prologue,
                before,
                // id plus the long timestamp on top of a return value
                extra_stack: 3,
                new_local: Some(VerificationType::Long),
            }
        }
        Probe::Capture { .. } => Patch {
            prologue: begin,
            before,
            // name, array, array copy, index and a wide value
            extra_stack: 6,
            new_local: None,
        },
    };
    Ok(patch)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Hook {
    Begin,
    End,
    Throw,
}

impl Hook {
    fn name(self, hooks: &HookAbi) -> &str {
        match self {
            Hook::Begin => &hooks.begin,
            Hook::End => &hooks.end,
            Hook::Throw => &hooks.throw,
        }
    }
}

/// Bytecode for one hook call. The id begin probe leaves its timestamp on the stack.
fn probe_call(
    pool: &mut ConstantPool,
    hooks: &HookAbi,
    probe: &Probe,
    hook: Hook,
) -> Result<Vec<u8>, RewriteError> {
    let mut out = Vec::new();
    let hook_name = hook.name(hooks);
    match probe {
        Probe::Id { id, slot } => {
            push_int(&mut out, pool, *id)?;
            let descriptor = if hook == Hook::Begin {
                HookAbi::BEGIN_DESC
            } else {
                local_insn(&mut out, LLOAD, *slot);
                HookAbi::END_DESC
            };
            let method_ref = pool.add_method_ref(&hooks.trace_class, hook_name, descriptor)?;
            invoke(&mut out, INVOKESTATIC, method_ref);
        }
        Probe::Capture { name, params } => {
            let name_index = pool.add_string(name)?;
            load_constant(&mut out, name_index);
            push_int(&mut out, pool, params.len() as i32)?;
            let object = pool.add_class("java/lang/Object")?;
            out.push(ANEWARRAY);
            out.extend_from_slice(&object.to_be_bytes());
            for (position, param) in params.iter().enumerate() {
                out.push(DUP);
                push_int(&mut out, pool, position as i32)?;
                local_insn(&mut out, load_opcode(&param.ty), param.slot);
                if let Some((owner, descriptor)) = boxing(&param.ty) {
                    let method_ref = pool.add_method_ref(owner, "valueOf", descriptor)?;
                    invoke(&mut out, INVOKESTATIC, method_ref);
                }
                out.push(AASTORE);
            }
            let method_ref =
                pool.add_method_ref(&hooks.trace_class, hook_name, HookAbi::CAPTURE_DESC)?;
            invoke(&mut out, INVOKESTATIC, method_ref);
        }
    }
    Ok(out)
}

fn load_opcode(ty: &JavaType) -> u8 {
    match ty.primitive() {
        Some('J') => LLOAD,
        Some('D') => DLOAD,
        Some('F') => FLOAD,
        Some(_) => ILOAD,
        None => ALOAD,
    }
}

fn boxing(ty: &JavaType) -> Option<(&'static str, &'static str)> {
    if ty.dims > 0 {
        return None;
    }
    let BaseType::Primitive(tag) = ty.base else {
        return None;
    };
    let boxed = match tag {
        'Z' => ("java/lang/Boolean", "(Z)Ljava/lang/Boolean;"),
        'C' => ("java/lang/Character", "(C)Ljava/lang/Character;"),
        'B' => ("java/lang/Byte", "(B)Ljava/lang/Byte;"),
        'S' => ("java/lang/Short", "(S)Ljava/lang/Short;"),
        'I' => ("java/lang/Integer", "(I)Ljava/lang/Integer;"),
        'F' => ("java/lang/Float", "(F)Ljava/lang/Float;"),
        'J' => ("java/lang/Long", "(J)Ljava/lang/Long;"),
        'D' => ("java/lang/Double", "(D)Ljava/lang/Double;"),
        _ => return None,
    };
    Some(boxed)
}
