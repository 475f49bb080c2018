//! Class rewriting: named passes over a decoded class file.

use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::classfile::ClassFile;
use crate::classfile::pool::ConstantPool;
use crate::config::WeaveConfig;
use crate::error::RewriteError;
use crate::filter::FilterConfig;
use crate::mapping::IdentityMapper;
use crate::opcodes::{BIPUSH, ICONST_0, LDC, LDC_W, SIPUSH, WIDE};

pub(crate) mod lifecycle;
pub(crate) mod output;
pub(crate) mod probe;

pub(crate) use lifecycle::LifecyclePass;
pub(crate) use probe::MethodProbePass;

/// Read-only state every pass sees. Decisions and ids are final by the time passes run.
pub(crate) struct WeaveContext<'a> {
    pub(crate) catalog: &'a Catalog,
    pub(crate) mapper: &'a IdentityMapper,
    pub(crate) filter: &'a FilterConfig,
    pub(crate) config: &'a WeaveConfig,
}

/// One transformation over a class. Returns whether the class changed.
pub(crate) trait ClassPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, class: &mut ClassFile, ctx: &WeaveContext<'_>) -> Result<bool, RewriteError>;
}

/// What happened to one class.
#[derive(Debug)]
pub(crate) enum Outcome {
    Rewritten(Vec<u8>),
    Unchanged,
    /// Rewrite failed; the original bytes go out untouched.
    PassedThrough,
}

pub(crate) struct Weaver<'a> {
    ctx: WeaveContext<'a>,
    passes: Vec<Box<dyn ClassPass>>,
}

impl<'a> Weaver<'a> {
    /// Probes first, then lifecycle hooks, so the hooks run before the entry probe.
    pub(crate) fn new(ctx: WeaveContext<'a>) -> Weaver<'a> {
        Weaver {
            ctx,
            passes: vec![Box::new(MethodProbePass), Box::new(LifecyclePass)],
        }
    }

    pub(crate) fn rewrite(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>, RewriteError> {
        let mut class = ClassFile::parse(bytes)?;
        let mut changed = false;
        for pass in &self.passes {
            if pass.apply(&mut class, &self.ctx)? {
                debug!(pass = pass.name(), class = %class.name()?, "pass changed class");
                changed = true;
            }
        }
        Ok(changed.then(|| class.to_bytes()))
    }

    /// Rewrite one class, falling back to the original bytes on any failure.
    pub(crate) fn rewrite_entry(&self, bytes: &[u8], origin: &str) -> Outcome {
        match self.rewrite(bytes) {
            Ok(Some(rewritten)) => Outcome::Rewritten(rewritten),
            Ok(None) => Outcome::Unchanged,
            Err(err) => {
                warn!("copying {origin} unchanged: {err}");
                Outcome::PassedThrough
            }
        }
    }
}

/// Shortest instruction that pushes `value`.
pub(crate) fn push_int(
    code: &mut Vec<u8>,
    pool: &mut ConstantPool,
    value: i32,
) -> Result<(), RewriteError> {
    match value {
        -1..=5 => code.push((ICONST_0 as i32 + value) as u8),
        -128..=127 => code.extend_from_slice(&[BIPUSH, value as i8 as u8]),
        -32768..=32767 => {
            code.push(SIPUSH);
            code.extend_from_slice(&(value as i16).to_be_bytes());
        }
        _ => {
            let index = pool.add_integer(value)?;
            load_constant(code, index);
        }
    }
    Ok(())
}

/// `ldc` or `ldc_w` depending on the pool index.
pub(crate) fn load_constant(code: &mut Vec<u8>, index: u16) {
    match u8::try_from(index) {
        Ok(short) => code.extend_from_slice(&[LDC, short]),
        Err(_) => {
            code.push(LDC_W);
            code.extend_from_slice(&index.to_be_bytes());
        }
    }
}

/// Load or store of a local, widened when the slot does not fit a byte.
pub(crate) fn local_insn(code: &mut Vec<u8>, opcode: u8, slot: u16) {
    match u8::try_from(slot) {
        Ok(short) => code.extend_from_slice(&[opcode, short]),
        Err(_) => {
            code.extend_from_slice(&[WIDE, opcode]);
            code.extend_from_slice(&slot.to_be_bytes());
        }
    }
}

pub(crate) fn invoke(code: &mut Vec<u8>, opcode: u8, method_ref: u16) {
    code.push(opcode);
    code.extend_from_slice(&method_ref.to_be_bytes());
}
