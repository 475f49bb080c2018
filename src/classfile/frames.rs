use crate::descriptor::{BaseType, JavaType, parse_method_descriptor};
use crate::error::RewriteError;

use super::pool::ConstantPool;
use super::{ByteReader, put_u16};

/// Verification type of a StackMapTable entry. Long and double take one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u16),
}

impl VerificationType {
    pub(crate) fn slots(self) -> u16 {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }
}

/// Frame with every local and stack entry spelled out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) offset: u32,
    pub(crate) locals: Vec<VerificationType>,
    pub(crate) stack: Vec<VerificationType>,
}

/// Locals the verifier assumes on method entry.
pub(crate) fn initial_locals(
    pool: &mut ConstantPool,
    this_class: u16,
    is_static: bool,
    is_constructor: bool,
    this_is_object: bool,
    descriptor: &str,
) -> Result<Vec<VerificationType>, RewriteError> {
    let signature = parse_method_descriptor(descriptor)?;
    let mut locals = Vec::with_capacity(signature.params.len() + 1);
    if !is_static {
        if is_constructor && !this_is_object {
            locals.push(VerificationType::UninitializedThis);
        } else {
            locals.push(VerificationType::Object(this_class));
        }
    }
    for param in &signature.params {
        locals.push(verification_type_of(pool, param)?);
    }
    Ok(locals)
}

fn verification_type_of(
    pool: &mut ConstantPool,
    ty: &JavaType,
) -> Result<VerificationType, RewriteError> {
    if ty.dims > 0 {
        let index = pool.add_class(&ty.descriptor())?;
        return Ok(VerificationType::Object(index));
    }
    let verification = match &ty.base {
        BaseType::Primitive('J') => VerificationType::Long,
        BaseType::Primitive('D') => VerificationType::Double,
        BaseType::Primitive('F') => VerificationType::Float,
        BaseType::Primitive(_) => VerificationType::Integer,
        BaseType::Object(class_name) => {
            VerificationType::Object(pool.add_class(&class_name.replace('.', "/"))?)
        }
    };
    Ok(verification)
}

/// Expand a StackMapTable payload into full frames with absolute offsets.
pub(crate) fn decode_stack_map(
    info: &[u8],
    initial: &[VerificationType],
) -> Result<Vec<Frame>, String> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16().map_err(|err| err.to_string())?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut locals = initial.to_vec();
    let mut previous: Option<u32> = None;
    for _ in 0..count {
        let frame_type = reader.u8().map_err(|err| err.to_string())?;
        let (delta, stack) = match frame_type {
            0..=63 => (frame_type as u16, Vec::new()),
            64..=127 => ((frame_type - 64) as u16, vec![read_type(&mut reader)?]),
            247 => {
                let delta = read_u16(&mut reader)?;
                (delta, vec![read_type(&mut reader)?])
            }
            248..=250 => {
                let delta = read_u16(&mut reader)?;
                let chop = (251 - frame_type) as usize;
                if chop > locals.len() {
                    return Err(format!("chop frame removes {chop} of {} locals", locals.len()));
                }
                locals.truncate(locals.len() - chop);
                (delta, Vec::new())
            }
            251 => (read_u16(&mut reader)?, Vec::new()),
            252..=254 => {
                let delta = read_u16(&mut reader)?;
                for _ in 0..(frame_type - 251) {
                    locals.push(read_type(&mut reader)?);
                }
                (delta, Vec::new())
            }
            255 => {
                let delta = read_u16(&mut reader)?;
                let local_count = read_u16(&mut reader)?;
                locals = (0..local_count)
                    .map(|_| read_type(&mut reader))
                    .collect::<Result<_, _>>()?;
                let stack_count = read_u16(&mut reader)?;
                let stack = (0..stack_count)
                    .map(|_| read_type(&mut reader))
                    .collect::<Result<_, _>>()?;
                (delta, stack)
            }
            _ => return Err(format!("reserved frame type {frame_type}")),
        };
        let offset = match previous {
            None => delta as u32,
            Some(previous) => previous + delta as u32 + 1,
        };
        previous = Some(offset);
        frames.push(Frame {
            offset,
            locals: locals.clone(),
            stack,
        });
    }
    if !reader.is_empty() {
        return Err("trailing bytes after stack map frames".to_string());
    }
    Ok(frames)
}

/// Encode frames as `full_frame` entries. Offsets must be strictly increasing.
pub(crate) fn encode_stack_map(frames: &[Frame]) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    put_u16(&mut out, frames.len() as u16);
    let mut previous: Option<u32> = None;
    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(previous) if frame.offset > previous => frame.offset - previous - 1,
            Some(previous) => {
                return Err(format!(
                    "frame offset {} does not follow {previous}",
                    frame.offset
                ));
            }
        };
        let delta = u16::try_from(delta).map_err(|_| format!("frame delta {delta} too large"))?;
        previous = Some(frame.offset);
        out.push(255);
        put_u16(&mut out, delta);
        put_u16(&mut out, frame.locals.len() as u16);
        for ty in &frame.locals {
            write_type(&mut out, *ty);
        }
        put_u16(&mut out, frame.stack.len() as u16);
        for ty in &frame.stack {
            write_type(&mut out, *ty);
        }
    }
    Ok(out)
}

/// Place `ty` at local `slot`, padding unused slots with `Top`.
pub(crate) fn with_local(
    locals: &[VerificationType],
    slot: u16,
    ty: VerificationType,
) -> Result<Vec<VerificationType>, String> {
    let mut result = locals.to_vec();
    let mut used: u16 = locals.iter().map(|local| local.slots()).sum();
    // Trailing tops may cover the slot we need; drop them before padding again.
    while used > slot && result.last() == Some(&VerificationType::Top) {
        result.pop();
        used -= 1;
    }
    if used > slot {
        return Err(format!("locals already use {used} slots, cannot place at {slot}"));
    }
    while used < slot {
        result.push(VerificationType::Top);
        used += 1;
    }
    result.push(ty);
    Ok(result)
}

fn read_u16(reader: &mut ByteReader<'_>) -> Result<u16, String> {
    reader.u16().map_err(|err| err.to_string())
}

fn read_type(reader: &mut ByteReader<'_>) -> Result<VerificationType, String> {
    let tag = reader.u8().map_err(|err| err.to_string())?;
    let ty = match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(read_u16(reader)?),
        8 => VerificationType::Uninitialized(read_u16(reader)?),
        _ => return Err(format!("unknown verification type tag {tag}")),
    };
    Ok(ty)
}

fn write_type(out: &mut Vec<u8>, ty: VerificationType) {
    match ty {
        VerificationType::Top => out.push(0),
        VerificationType::Integer => out.push(1),
        VerificationType::Float => out.push(2),
        VerificationType::Double => out.push(3),
        VerificationType::Long => out.push(4),
        VerificationType::Null => out.push(5),
        VerificationType::UninitializedThis => out.push(6),
        VerificationType::Object(index) => {
            out.push(7);
            put_u16(out, index);
        }
        VerificationType::Uninitialized(offset) => {
            out.push(8);
            put_u16(out, offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VerificationType::*;

    #[test]
    fn compressed_frames_expand_against_initial_locals() {
        // same_frame@3, append_frame(+int)@8, same_locals_1_stack_item(Null)@9,
        // chop_frame(1)@14
        let info = [0, 4, 3, 252, 0, 4, 1, 64 + 0, 5, 248, 0, 4];
        let frames = decode_stack_map(&info, &[Object(1)]).expect("decode");

        assert_eq!(4, frames.len());
        assert_eq!(3, frames[0].offset);
        assert_eq!(vec![Object(1), Integer], frames[1].locals);
        assert_eq!(8, frames[1].offset);
        assert_eq!(9, frames[2].offset);
        assert_eq!(vec![Null], frames[2].stack);
        assert_eq!(14, frames[3].offset);
        assert_eq!(vec![Object(1)], frames[3].locals);
    }

    #[test]
    fn full_frames_round_trip() {
        let frames = vec![
            Frame {
                offset: 2,
                locals: vec![Object(3), Long],
                stack: vec![Uninitialized(0)],
            },
            Frame {
                offset: 10,
                locals: vec![Object(3)],
                stack: Vec::new(),
            },
        ];
        let encoded = encode_stack_map(&frames).expect("encode");

        assert_eq!(frames, decode_stack_map(&encoded, &[]).expect("decode"));
    }

    #[test]
    fn rejects_unordered_frames() {
        let frame = Frame {
            offset: 4,
            locals: Vec::new(),
            stack: Vec::new(),
        };
        assert!(encode_stack_map(&[frame.clone(), frame]).is_err());
    }

    #[test]
    fn with_local_pads_to_slot() {
        let locals = vec![Object(1), Long];
        let extended = with_local(&locals, 5, Long).expect("place local");

        assert_eq!(vec![Object(1), Long, Top, Top, Long], extended);
        assert!(with_local(&locals, 2, Long).is_err());
    }

    #[test]
    fn initial_locals_follow_descriptor() {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class("a/B").expect("class");

        let locals = initial_locals(&mut pool, this_class, false, true, false, "(J[ILjava/lang/String;)V")
            .expect("locals");

        assert_eq!(UninitializedThis, locals[0]);
        assert_eq!(Long, locals[1]);
        assert!(matches!(locals[2], Object(_)));
        let Object(string_index) = locals[3] else {
            panic!("expected object");
        };
        assert_eq!("java/lang/String", pool.class_name(string_index).expect("name"));
    }
}
