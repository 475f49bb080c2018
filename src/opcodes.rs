use anyhow::{Context, Result};

pub(crate) const ICONST_0: u8 = 0x03;
pub(crate) const BIPUSH: u8 = 0x10;
pub(crate) const SIPUSH: u8 = 0x11;
pub(crate) const LDC: u8 = 0x12;
pub(crate) const LDC_W: u8 = 0x13;
pub(crate) const LDC2_W: u8 = 0x14;
pub(crate) const ILOAD: u8 = 0x15;
pub(crate) const LLOAD: u8 = 0x16;
pub(crate) const FLOAD: u8 = 0x17;
pub(crate) const DLOAD: u8 = 0x18;
pub(crate) const ALOAD: u8 = 0x19;
pub(crate) const ALOAD_0: u8 = 0x2a;
pub(crate) const ALOAD_1: u8 = 0x2b;
pub(crate) const SALOAD: u8 = 0x35;
pub(crate) const LSTORE: u8 = 0x37;
pub(crate) const AASTORE: u8 = 0x53;
pub(crate) const DUP: u8 = 0x59;
pub(crate) const GOTO: u8 = 0xa7;
pub(crate) const JSR: u8 = 0xa8;
pub(crate) const RET: u8 = 0xa9;
pub(crate) const TABLESWITCH: u8 = 0xaa;
pub(crate) const LOOKUPSWITCH: u8 = 0xab;
pub(crate) const IRETURN: u8 = 0xac;
pub(crate) const RETURN: u8 = 0xb1;
pub(crate) const GETSTATIC: u8 = 0xb2;
pub(crate) const PUTSTATIC: u8 = 0xb3;
pub(crate) const GETFIELD: u8 = 0xb4;
pub(crate) const PUTFIELD: u8 = 0xb5;
pub(crate) const INVOKEVIRTUAL: u8 = 0xb6;
pub(crate) const INVOKESPECIAL: u8 = 0xb7;
pub(crate) const INVOKESTATIC: u8 = 0xb8;
pub(crate) const INVOKEINTERFACE: u8 = 0xb9;
pub(crate) const INVOKEDYNAMIC: u8 = 0xba;
pub(crate) const NEW: u8 = 0xbb;
pub(crate) const ANEWARRAY: u8 = 0xbd;
pub(crate) const ATHROW: u8 = 0xbf;
pub(crate) const MONITORENTER: u8 = 0xc2;
pub(crate) const WIDE: u8 = 0xc4;
pub(crate) const IFNULL: u8 = 0xc6;
pub(crate) const IFNONNULL: u8 = 0xc7;
pub(crate) const GOTO_W: u8 = 0xc8;
pub(crate) const JSR_W: u8 = 0xc9;

pub(crate) fn is_return(opcode: u8) -> bool {
    (IRETURN..=RETURN).contains(&opcode)
}

pub(crate) fn is_invoke(opcode: u8) -> bool {
    (INVOKEVIRTUAL..=INVOKEDYNAMIC).contains(&opcode)
}

/// Conditional jumps, `goto` and `jsr` with a 16-bit relative offset.
pub(crate) fn is_short_branch(opcode: u8) -> bool {
    matches!(opcode, 0x99..=0xa6 | GOTO | JSR | IFNULL | IFNONNULL)
}

pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = *code.get(offset).context("bytecode offset out of bounds")?;
    let length = match opcode {
        0x00..=0x0f => 1,
        BIPUSH => 2,
        SIPUSH => 3,
        LDC => 2,
        LDC_W | LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x4e => 1,
        0x4f..=0x56 => 1,
        0x57..=0x5f => 1,
        0x60..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        0x99..=0xa6 => 3,
        GOTO | JSR => 3,
        RET => 2,
        TABLESWITCH => tableswitch_length(code, offset)?,
        LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb5 => 3,
        INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC => 3,
        INVOKEINTERFACE | INVOKEDYNAMIC => 5,
        NEW => 3,
        0xbc => 2,
        ANEWARRAY => 3,
        0xbe | ATHROW => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        WIDE => wide_length(code, offset)?,
        0xc5 => 4,
        IFNULL | IFNONNULL => 3,
        GOTO_W | JSR_W => 5,
        0xca => 1,
        0xfe | 0xff => 1,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == 0x84 { Ok(6) } else { Ok(4) }
}

/// Alignment bytes after a switch opcode so its operands start on a 4-byte boundary.
pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u32(code: &[u8], offset: usize) -> Result<u32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode u32 out of bounds")?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

pub(crate) fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    let value = read_u16(code, offset)?;
    Ok(i16::from_be_bytes(value.to_be_bytes()))
}

pub(crate) fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let value = read_u32(code, offset)?;
    Ok(i32::from_be_bytes(value.to_be_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_length_accounts_for_padding() {
        // tableswitch at offset 1 needs two padding bytes, one case
        let mut code = vec![0x00, TABLESWITCH, 0, 0];
        code.extend_from_slice(&8i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&12i32.to_be_bytes());

        assert_eq!(2, padding(1));
        assert_eq!(1 + 2 + 12 + 4, opcode_length(&code, 1).expect("length"));
    }

    #[test]
    fn wide_iinc_is_six_bytes() {
        let code = [WIDE, 0x84, 0x01, 0x00, 0x00, 0x01];
        assert_eq!(6, opcode_length(&code, 0).expect("length"));
        let code = [WIDE, ILOAD, 0x01, 0x00];
        assert_eq!(4, opcode_length(&code, 0).expect("length"));
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert!(opcode_length(&[0xcb], 0).is_err());
    }

    #[test]
    fn classifies_exit_and_call_opcodes() {
        assert!(is_return(IRETURN));
        assert!(is_return(RETURN));
        assert!(!is_return(ATHROW));
        assert!(is_invoke(INVOKEDYNAMIC));
        assert!(!is_invoke(NEW));
        assert!(is_short_branch(IFNONNULL));
        assert!(!is_short_branch(GOTO_W));
    }
}
