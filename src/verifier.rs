//! Structural verification of loaded programs.
//!
//! Runs exactly once per load, after any relocations have been applied.
//! Only the structural safety rules are checked here; the verifier makes no
//! attempt to prove anything about the values a program computes.

use crate::ebpf::{self, Insn};
use crate::error::{Error, Result};
use crate::vm::Vm;

fn reject(message: String) -> Error {
    Error::VerifierRejected(message)
}

/// Check the loaded program and return the function-entry bitmap: one flag
/// per instruction, set for every local-call target.
pub(crate) fn check(vm: &Vm) -> Result<Vec<bool>> {
    let count = vm.insn_count();
    if count == 0 {
        return Err(reject("no instructions to execute".into()));
    }

    // First pass: find the second records of lddw pairs. They are not
    // instructions in their own right and may not be branch targets.
    let mut lddw_tail = vec![false; count];
    let mut pc = 0;
    while pc < count {
        let insn = vm.fetch_insn(pc);
        if insn.is_lddw() {
            if pc + 1 >= count {
                return Err(reject(format!("incomplete lddw at pc {}", pc)));
            }
            lddw_tail[pc + 1] = true;
            pc += 2;
        } else {
            pc += 1;
        }
    }

    if vm.fetch_insn(count - 1).opcode != ebpf::EXIT {
        return Err(reject("program does not end with exit".into()));
    }

    let mut entries = vec![false; count];
    let mut pc = 0;
    while pc < count {
        let insn = vm.fetch_insn(pc);
        check_registers(&insn, pc)?;
        match insn.opcode {
            ebpf::LDDW => {
                let pair = vm.fetch_insn(pc + 1);
                if pair.opcode != 0 || pair.dst != 0 || pair.src != 0 || pair.offset != 0 {
                    return Err(reject(format!(
                        "lddw at pc {} is followed by a malformed second record",
                        pc
                    )));
                }
                pc += 2;
                continue;
            }
            ebpf::CALL => check_call(vm, &insn, pc, count, &mut entries)?,
            ebpf::LE | ebpf::BE => {
                if !matches!(insn.imm, 16 | 32 | 64) {
                    return Err(reject(format!("invalid endian immediate at pc {}", pc)));
                }
            }
            _ if insn.class() == ebpf::CLS_JMP || insn.class() == ebpf::CLS_JMP32 => {
                if insn.opcode != ebpf::EXIT {
                    check_jump_target(&insn, pc, count, &lddw_tail)?;
                }
            }
            _ => {}
        }
        if !opcode_known(insn.opcode) {
            return Err(reject(format!(
                "unknown opcode {:#04x} at pc {}",
                insn.opcode, pc
            )));
        }
        pc += 1;
    }

    Ok(entries)
}

fn check_registers(insn: &Insn, pc: usize) -> Result<()> {
    if insn.src > 10 {
        return Err(reject(format!("invalid source register at pc {}", pc)));
    }
    // R10 is the read-only frame pointer: stores may address through it,
    // nothing may write it.
    let store = insn.class() == ebpf::CLS_ST || insn.class() == ebpf::CLS_STX;
    if insn.dst > 9 && !(store && insn.dst == ebpf::FRAME_POINTER_REG) {
        return Err(reject(format!("invalid destination register at pc {}", pc)));
    }
    Ok(())
}

fn check_jump_target(insn: &Insn, pc: usize, count: usize, lddw_tail: &[bool]) -> Result<()> {
    let target = pc as i64 + i64::from(insn.offset) + 1;
    if target < 0 || target >= count as i64 {
        return Err(reject(format!("jump out of bounds at pc {}", pc)));
    }
    if lddw_tail[target as usize] {
        return Err(reject(format!(
            "jump to the middle of an lddw at pc {}",
            pc
        )));
    }
    Ok(())
}

fn check_call(
    vm: &Vm,
    insn: &Insn,
    pc: usize,
    count: usize,
    entries: &mut [bool],
) -> Result<()> {
    match insn.src {
        0 => {
            let index = insn.imm as u32;
            let valid = match &vm.ctx.external {
                Some(external) => (external.validator)(index, external.cookie),
                None => insn.imm >= 0 && vm.ctx.helpers.contains_key(&index),
            };
            if !valid {
                return Err(reject(format!(
                    "invalid helper function index {} at pc {}",
                    insn.imm, pc
                )));
            }
        }
        1 => {
            let target = pc as i64 + i64::from(insn.imm) + 1;
            if target < 0 || target >= count as i64 {
                return Err(reject(format!("call out of bounds at pc {}", pc)));
            }
            entries[target as usize] = true;
        }
        _ => {
            return Err(reject(format!("invalid call source at pc {}", pc)));
        }
    }
    Ok(())
}

fn opcode_known(opcode: u8) -> bool {
    use crate::ebpf::*;
    matches!(
        opcode,
        ADD_IMM
            | ADD_REG
            | SUB_IMM
            | SUB_REG
            | MUL_IMM
            | MUL_REG
            | DIV_IMM
            | DIV_REG
            | OR_IMM
            | OR_REG
            | AND_IMM
            | AND_REG
            | LSH_IMM
            | LSH_REG
            | RSH_IMM
            | RSH_REG
            | NEG
            | MOD_IMM
            | MOD_REG
            | XOR_IMM
            | XOR_REG
            | MOV_IMM
            | MOV_REG
            | ARSH_IMM
            | ARSH_REG
            | LE
            | BE
            | ADD64_IMM
            | ADD64_REG
            | SUB64_IMM
            | SUB64_REG
            | MUL64_IMM
            | MUL64_REG
            | DIV64_IMM
            | DIV64_REG
            | OR64_IMM
            | OR64_REG
            | AND64_IMM
            | AND64_REG
            | LSH64_IMM
            | LSH64_REG
            | RSH64_IMM
            | RSH64_REG
            | NEG64
            | MOD64_IMM
            | MOD64_REG
            | XOR64_IMM
            | XOR64_REG
            | MOV64_IMM
            | MOV64_REG
            | ARSH64_IMM
            | ARSH64_REG
            | LDDW
            | LDXW
            | LDXH
            | LDXB
            | LDXDW
            | STW
            | STH
            | STB
            | STDW
            | STXW
            | STXH
            | STXB
            | STXDW
            | JA
            | JEQ_IMM
            | JEQ_REG
            | JGT_IMM
            | JGT_REG
            | JGE_IMM
            | JGE_REG
            | JSET_IMM
            | JSET_REG
            | JNE_IMM
            | JNE_REG
            | JSGT_IMM
            | JSGT_REG
            | JSGE_IMM
            | JSGE_REG
            | CALL
            | EXIT
            | JLT_IMM
            | JLT_REG
            | JLE_IMM
            | JLE_REG
            | JSLT_IMM
            | JSLT_REG
            | JSLE_IMM
            | JSLE_REG
            | JEQ32_IMM
            | JEQ32_REG
            | JGT32_IMM
            | JGT32_REG
            | JGE32_IMM
            | JGE32_REG
            | JSET32_IMM
            | JSET32_REG
            | JNE32_IMM
            | JNE32_REG
            | JSGT32_IMM
            | JSGT32_REG
            | JSGE32_IMM
            | JSGE32_REG
            | JLT32_IMM
            | JLT32_REG
            | JLE32_IMM
            | JLE32_REG
            | JSLT32_IMM
            | JSLT32_REG
            | JSLE32_IMM
            | JSLE32_REG
    )
}
