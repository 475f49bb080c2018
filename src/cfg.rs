use std::collections::BTreeSet;

use anyhow::{Context, Result};

use crate::ir::{ControlFlowGraph, EdgeKind, FlowEdge, Instruction};
use crate::opcodes::{self, opcode_length, padding, read_i16, read_i32};

/// Offsets `[start_offset, end_offset)` and the instructions between them.
struct BasicBlock {
    start_offset: u32,
    end_offset: u32,
    instructions: Vec<Instruction>,
}

/// Build a control flow graph from bytecode instructions.
pub(crate) fn build_cfg(
    code: &[u8],
    instructions: &[Instruction],
    handlers: &[u32],
) -> Result<ControlFlowGraph> {
    let mut leaders = BTreeSet::new();
    leaders.insert(0u32);
    for handler in handlers {
        leaders.insert(*handler);
    }
    for inst in instructions {
        if let Some(targets) = branch_targets(code, inst.offset as usize)? {
            for target in targets {
                leaders.insert(target);
            }
            let next = inst.offset + opcode_length(code, inst.offset as usize)? as u32;
            leaders.insert(next);
        }
        if is_exit_opcode(inst.opcode) {
            let next = inst.offset + opcode_length(code, inst.offset as usize)? as u32;
            leaders.insert(next);
        }
    }

    let mut leader_list: Vec<u32> = leaders.into_iter().collect();
    leader_list.retain(|offset| *offset < code.len() as u32);

    let mut blocks = Vec::new();
    for (index, start) in leader_list.iter().copied().enumerate() {
        let end = leader_list
            .get(index + 1)
            .copied()
            .unwrap_or(code.len() as u32);
        let block_instructions = instructions
            .iter()
            .filter(|inst| inst.offset >= start && inst.offset < end)
            .copied()
            .collect();
        blocks.push(BasicBlock {
            start_offset: start,
            end_offset: end,
            instructions: block_instructions,
        });
    }

    let mut edges = Vec::new();
    for block in &blocks {
        let Some(last_inst) = block.instructions.last() else {
            continue;
        };
        if let Some(targets) = branch_targets(code, last_inst.offset as usize)? {
            for target in targets {
                edges.push(FlowEdge {
                    from: last_inst.offset,
                    to: target,
                    kind: EdgeKind::Branch,
                });
            }
            if !is_unconditional_branch(last_inst.opcode) {
                if let Some(next) = next_block_start(&blocks, block.end_offset) {
                    edges.push(FlowEdge {
                        from: last_inst.offset,
                        to: next,
                        kind: EdgeKind::FallThrough,
                    });
                }
            }
        } else if !is_exit_opcode(last_inst.opcode) {
            if let Some(next) = next_block_start(&blocks, block.end_offset) {
                edges.push(FlowEdge {
                    from: last_inst.offset,
                    to: next,
                    kind: EdgeKind::FallThrough,
                });
            }
        }
    }

    Ok(ControlFlowGraph { edges })
}

impl ControlFlowGraph {
    /// Branches jumping to or before their own instruction, the loop signal used by the
    /// risk classifier.
    pub(crate) fn back_edge_count(&self) -> usize {
        self.edges
            .iter()
            .filter(|edge| edge.kind == EdgeKind::Branch && edge.to <= edge.from)
            .count()
    }
}

fn next_block_start(blocks: &[BasicBlock], offset: u32) -> Option<u32> {
    blocks
        .iter()
        .find(|block| block.start_offset == offset)
        .map(|block| block.start_offset)
}

fn is_exit_opcode(opcode: u8) -> bool {
    opcodes::is_return(opcode) || opcode == opcodes::ATHROW
}

fn is_unconditional_branch(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::GOTO | opcodes::JSR | opcodes::GOTO_W | opcodes::JSR_W
    )
}

fn branch_targets(code: &[u8], offset: usize) -> Result<Option<Vec<u32>>> {
    let opcode = *code.get(offset).context("bytecode offset out of bounds")?;
    let targets = match opcode {
        op if opcodes::is_short_branch(op) => {
            let branch = read_i16(code, offset + 1)?;
            vec![relative_target(offset, branch as i32)?]
        }
        opcodes::GOTO_W | opcodes::JSR_W => {
            let branch = read_i32(code, offset + 1)?;
            vec![relative_target(offset, branch)?]
        }
        opcodes::TABLESWITCH => tableswitch_targets(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_targets(code, offset)?,
        _ => return Ok(None),
    };
    Ok(Some(targets))
}

fn tableswitch_targets(code: &[u8], offset: usize) -> Result<Vec<u32>> {
    let base = offset + 1 + padding(offset);
    let default = read_i32(code, base)?;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    let mut targets = vec![relative_target(offset, default)?];
    let mut idx = base + 12;
    for _ in 0..count {
        targets.push(relative_target(offset, read_i32(code, idx)?)?);
        idx += 4;
    }
    Ok(targets)
}

fn lookupswitch_targets(code: &[u8], offset: usize) -> Result<Vec<u32>> {
    let base = offset + 1 + padding(offset);
    let default = read_i32(code, base)?;
    let npairs = read_i32(code, base + 4)?;
    let mut targets = vec![relative_target(offset, default)?];
    let mut idx = base + 8;
    for _ in 0..npairs {
        targets.push(relative_target(offset, read_i32(code, idx + 4)?)?);
        idx += 8;
    }
    Ok(targets)
}

fn relative_target(offset: usize, delta: i32) -> Result<u32> {
    let target = offset as i64 + delta as i64;
    u32::try_from(target).with_context(|| format!("branch target {target} out of range"))
}
