//! Translation of verified programs to x86-64 machine code.
//!
//! The translator walks the instruction stream once, emitting native code
//! into a caller-supplied buffer and recording branch and data-load fixups,
//! then resolves every fixup in a single linear post-pass. Virtual
//! registers live in fixed host registers chosen so that the virtual
//! volatile/non-volatile classes line up with the host ABI (System V on
//! Unix-like hosts, Microsoft x64 on Windows). RCX is reserved for
//! variable-count shifts and R12 is never used.

mod emit;
pub(crate) mod memory;

use crate::ebpf;
use crate::error::{Error, Result};
use crate::vm::Vm;
use crate::{MAX_INSNS, STACK_SIZE};

use emit::OperandSize::{S16, S32, S64, S8};
use emit::*;

const REGISTER_MAP_SIZE: usize = ebpf::REGISTER_COUNT;

#[cfg(windows)]
const REGISTER_MAP: [u8; REGISTER_MAP_SIZE] =
    [RAX, R10, RDX, R8, R9, R14, R15, RDI, RSI, RBX, RBP];
#[cfg(windows)]
const RCX_ALT: u8 = R10;
#[cfg(windows)]
const NONVOLATILE: [u8; 7] = [RBP, RBX, RDI, RSI, R13, R14, R15];
#[cfg(windows)]
const PARAMETER: [u8; 4] = [RCX, RDX, R8, R9];

#[cfg(not(windows))]
const REGISTER_MAP: [u8; REGISTER_MAP_SIZE] =
    [RAX, RDI, RSI, RDX, R9, R8, RBX, R13, R14, R15, RBP];
#[cfg(not(windows))]
const RCX_ALT: u8 = R9;
#[cfg(not(windows))]
const NONVOLATILE: [u8; 5] = [RBP, RBX, R13, R14, R15];
#[cfg(not(windows))]
const PARAMETER: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Translate the loaded program into `buffer` and return the exact number
/// of bytes of machine code written.
pub(crate) fn translate(vm: &Vm, buffer: &mut [u8]) -> Result<usize> {
    JitCompiler::new().translate(vm, buffer)
}

/// Translate the loaded program and install it in an executable mapping.
pub(crate) fn compile(vm: &Vm) -> Result<memory::ExecutableMemory> {
    if !vm.is_loaded() {
        return Err(Error::NotLoaded);
    }
    // Generous per-instruction estimate; translation reports the exact
    // size it used.
    let mut buffer = vec![0u8; 512 + 96 * vm.insn_count()];
    let size = translate(vm, &mut buffer)?;
    memory::ExecutableMemory::new(&buffer[..size])
}

/// One translation. Owns the virtual-to-host register map so tests can
/// compile with a rotated assignment.
struct JitCompiler {
    register_map: [u8; REGISTER_MAP_SIZE],
}

impl JitCompiler {
    fn new() -> JitCompiler {
        JitCompiler {
            register_map: REGISTER_MAP,
        }
    }

    /// Rotate the register mapping. Only used to stress the code
    /// generator in tests.
    #[cfg(test)]
    fn with_register_offset(offset: usize) -> JitCompiler {
        let mut map = [0u8; REGISTER_MAP_SIZE];
        for (i, slot) in map.iter_mut().enumerate() {
            *slot = REGISTER_MAP[(i + offset) % REGISTER_MAP_SIZE];
        }
        JitCompiler { register_map: map }
    }

    /// The host register holding the given virtual register.
    fn map(&self, r: u8) -> u8 {
        self.register_map[r as usize % REGISTER_MAP_SIZE]
    }

    fn translate(&self, vm: &Vm, buffer: &mut [u8]) -> Result<usize> {
        if !vm.is_loaded() {
            return Err(Error::NotLoaded);
        }
        let mut state = JitState::new(buffer, vm.insn_count());
        self.translate_program(vm, &mut state)?;
        if state.jumps.len() > MAX_INSNS {
            return Err(Error::TranslatorFault(
                "excessive number of jump targets".into(),
            ));
        }
        if state.overflowed() {
            return Err(Error::TranslatorFault("target buffer too small".into()));
        }
        resolve_patchable_relatives(&mut state)?;
        log::debug!(
            "translated {} instructions into {} bytes",
            vm.insn_count(),
            state.offset
        );
        Ok(state.offset)
    }

    fn translate_program(&self, vm: &Vm, state: &mut JitState<'_>) -> Result<()> {
        self.emit_prologue(state);

        let count = vm.insn_count();
        let mut i = 0;
        while i < count {
            let insn = vm.fetch_insn(i);
            state.pc_locs[i] = state.offset;

            let dst = self.map(insn.dst);
            let src = self.map(insn.src);
            let target = Target::Insn((i as i64 + i64::from(insn.offset) + 1) as usize);

            if i == 0 || vm.is_function_entry(i) {
                // Function entries realign the stack; EXIT undoes this.
                emit_alu64_imm32(state, 0x81, 5, RSP, 8);
            }

            match insn.opcode {
                ebpf::ADD_IMM => emit_alu32_imm32(state, 0x81, 0, dst, insn.imm),
                ebpf::ADD_REG => emit_alu32(state, 0x01, src, dst),
                ebpf::SUB_IMM => emit_alu32_imm32(state, 0x81, 5, dst, insn.imm),
                ebpf::SUB_REG => emit_alu32(state, 0x29, src, dst),
                ebpf::MUL_IMM
                | ebpf::MUL_REG
                | ebpf::DIV_IMM
                | ebpf::DIV_REG
                | ebpf::MOD_IMM
                | ebpf::MOD_REG => muldivmod(state, insn.opcode, src, dst, insn.imm),
                ebpf::OR_IMM => emit_alu32_imm32(state, 0x81, 1, dst, insn.imm),
                ebpf::OR_REG => emit_alu32(state, 0x09, src, dst),
                ebpf::AND_IMM => emit_alu32_imm32(state, 0x81, 4, dst, insn.imm),
                ebpf::AND_REG => emit_alu32(state, 0x21, src, dst),
                ebpf::LSH_IMM => emit_alu32_imm8(state, 0xc1, 4, dst, insn.imm as i8),
                ebpf::LSH_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu32(state, 0xd3, 4, dst);
                }
                ebpf::RSH_IMM => emit_alu32_imm8(state, 0xc1, 5, dst, insn.imm as i8),
                ebpf::RSH_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu32(state, 0xd3, 5, dst);
                }
                ebpf::NEG => emit_alu32(state, 0xf7, 3, dst),
                ebpf::XOR_IMM => emit_alu32_imm32(state, 0x81, 6, dst, insn.imm),
                ebpf::XOR_REG => emit_alu32(state, 0x31, src, dst),
                ebpf::MOV_IMM => emit_alu32_imm32(state, 0xc7, 0, dst, insn.imm),
                ebpf::MOV_REG => emit_mov32(state, src, dst),
                ebpf::ARSH_IMM => emit_alu32_imm8(state, 0xc1, 7, dst, insn.imm as i8),
                ebpf::ARSH_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu32(state, 0xd3, 7, dst);
                }

                // On a little-endian host "to little endian" emits nothing.
                ebpf::LE => {}
                ebpf::BE => match insn.imm {
                    16 => {
                        // rol dst16, 8 then mask.
                        state.emit1(0x66);
                        emit_alu32_imm8(state, 0xc1, 0, dst, 8);
                        emit_alu32_imm32(state, 0x81, 4, dst, 0xffff);
                    }
                    _ => {
                        // bswap
                        emit_basic_rex(state, u8::from(insn.imm == 64), 0, dst);
                        state.emit1(0x0f);
                        state.emit1(0xc8 | (dst & 7));
                    }
                },

                ebpf::ADD64_IMM => emit_alu64_imm32(state, 0x81, 0, dst, insn.imm),
                ebpf::ADD64_REG => emit_alu64(state, 0x01, src, dst),
                ebpf::SUB64_IMM => emit_alu64_imm32(state, 0x81, 5, dst, insn.imm),
                ebpf::SUB64_REG => emit_alu64(state, 0x29, src, dst),
                ebpf::MUL64_IMM
                | ebpf::MUL64_REG
                | ebpf::DIV64_IMM
                | ebpf::DIV64_REG
                | ebpf::MOD64_IMM
                | ebpf::MOD64_REG => muldivmod(state, insn.opcode, src, dst, insn.imm),
                ebpf::OR64_IMM => emit_alu64_imm32(state, 0x81, 1, dst, insn.imm),
                ebpf::OR64_REG => emit_alu64(state, 0x09, src, dst),
                ebpf::AND64_IMM => emit_alu64_imm32(state, 0x81, 4, dst, insn.imm),
                ebpf::AND64_REG => emit_alu64(state, 0x21, src, dst),
                ebpf::LSH64_IMM => emit_alu64_imm8(state, 0xc1, 4, dst, insn.imm as i8),
                ebpf::LSH64_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu64(state, 0xd3, 4, dst);
                }
                ebpf::RSH64_IMM => emit_alu64_imm8(state, 0xc1, 5, dst, insn.imm as i8),
                ebpf::RSH64_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu64(state, 0xd3, 5, dst);
                }
                ebpf::NEG64 => emit_alu64(state, 0xf7, 3, dst),
                ebpf::XOR64_IMM => emit_alu64_imm32(state, 0x81, 6, dst, insn.imm),
                ebpf::XOR64_REG => emit_alu64(state, 0x31, src, dst),
                ebpf::MOV64_IMM => emit_load_imm(state, dst, i64::from(insn.imm)),
                ebpf::MOV64_REG => emit_mov(state, src, dst),
                ebpf::ARSH64_IMM => emit_alu64_imm8(state, 0xc1, 7, dst, insn.imm as i8),
                ebpf::ARSH64_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu64(state, 0xd3, 7, dst);
                }

                ebpf::JA => emit_jmp(state, target),
                ebpf::JEQ_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x84, target);
                }
                ebpf::JEQ_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x84, target);
                }
                ebpf::JGT_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x87, target);
                }
                ebpf::JGT_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x87, target);
                }
                ebpf::JGE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x83, target);
                }
                ebpf::JGE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x83, target);
                }
                ebpf::JLT_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x82, target);
                }
                ebpf::JLT_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x82, target);
                }
                ebpf::JLE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x86, target);
                }
                ebpf::JLE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x86, target);
                }
                ebpf::JSET_IMM => {
                    emit_alu64_imm32(state, 0xf7, 0, dst, insn.imm);
                    emit_jcc(state, 0x85, target);
                }
                ebpf::JSET_REG => {
                    emit_alu64(state, 0x85, src, dst);
                    emit_jcc(state, 0x85, target);
                }
                ebpf::JNE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x85, target);
                }
                ebpf::JNE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x85, target);
                }
                ebpf::JSGT_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8f, target);
                }
                ebpf::JSGT_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x8f, target);
                }
                ebpf::JSGE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8d, target);
                }
                ebpf::JSGE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x8d, target);
                }
                ebpf::JSLT_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8c, target);
                }
                ebpf::JSLT_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x8c, target);
                }
                ebpf::JSLE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8e, target);
                }
                ebpf::JSLE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x8e, target);
                }

                ebpf::JEQ32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x84, target);
                }
                ebpf::JEQ32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x84, target);
                }
                ebpf::JGT32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x87, target);
                }
                ebpf::JGT32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x87, target);
                }
                ebpf::JGE32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x83, target);
                }
                ebpf::JGE32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x83, target);
                }
                ebpf::JLT32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x82, target);
                }
                ebpf::JLT32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x82, target);
                }
                ebpf::JLE32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x86, target);
                }
                ebpf::JLE32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x86, target);
                }
                ebpf::JSET32_IMM => {
                    emit_alu32_imm32(state, 0xf7, 0, dst, insn.imm);
                    emit_jcc(state, 0x85, target);
                }
                ebpf::JSET32_REG => {
                    emit_alu32(state, 0x85, src, dst);
                    emit_jcc(state, 0x85, target);
                }
                ebpf::JNE32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x85, target);
                }
                ebpf::JNE32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x85, target);
                }
                ebpf::JSGT32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8f, target);
                }
                ebpf::JSGT32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x8f, target);
                }
                ebpf::JSGE32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8d, target);
                }
                ebpf::JSGE32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x8d, target);
                }
                ebpf::JSLT32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8c, target);
                }
                ebpf::JSLT32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x8c, target);
                }
                ebpf::JSLE32_IMM => {
                    emit_cmp32_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8e, target);
                }
                ebpf::JSLE32_REG => {
                    emit_cmp32(state, src, dst);
                    emit_jcc(state, 0x8e, target);
                }

                ebpf::CALL if insn.src == 0 => {
                    self.emit_external_call(state, insn.imm);
                    if vm.unwind_index == Some(insn.imm as u32) {
                        emit_cmp_imm32(state, self.map(0), 0);
                        emit_jcc(state, 0x84, Target::Exit);
                    }
                }
                ebpf::CALL if insn.src == 1 => {
                    let call_target = (i as i64 + i64::from(insn.imm) + 1) as usize;
                    self.emit_local_call(state, call_target);
                }
                ebpf::EXIT => {
                    // Undo the per-function-entry alignment adjustment.
                    emit_alu64_imm32(state, 0x81, 0, RSP, 8);
                    state.emit1(0xc3);
                }

                ebpf::LDXW => emit_load(state, S32, src, dst, i32::from(insn.offset)),
                ebpf::LDXH => emit_load(state, S16, src, dst, i32::from(insn.offset)),
                ebpf::LDXB => emit_load(state, S8, src, dst, i32::from(insn.offset)),
                ebpf::LDXDW => emit_load(state, S64, src, dst, i32::from(insn.offset)),

                ebpf::STW => emit_store_imm32(state, S32, dst, i32::from(insn.offset), insn.imm),
                ebpf::STH => emit_store_imm32(state, S16, dst, i32::from(insn.offset), insn.imm),
                ebpf::STB => emit_store_imm32(state, S8, dst, i32::from(insn.offset), insn.imm),
                ebpf::STDW => emit_store_imm32(state, S64, dst, i32::from(insn.offset), insn.imm),

                ebpf::STXW => emit_store(state, S32, src, dst, i32::from(insn.offset)),
                ebpf::STXH => emit_store(state, S16, src, dst, i32::from(insn.offset)),
                ebpf::STXB => emit_store(state, S8, src, dst, i32::from(insn.offset)),
                ebpf::STXDW => emit_store(state, S64, src, dst, i32::from(insn.offset)),

                ebpf::LDDW => {
                    let pair = vm.fetch_insn(i + 1);
                    let imm =
                        u64::from(insn.imm as u32) | (u64::from(pair.imm as u32) << 32);
                    emit_load_imm(state, dst, imm as i64);
                    i += 2;
                    continue;
                }

                opcode => {
                    return Err(Error::TranslatorFault(format!(
                        "unknown instruction at pc {}: opcode {:#04x}",
                        i, opcode
                    )));
                }
            }
            i += 1;
        }

        self.emit_epilogue(state, vm);
        Ok(())
    }

    fn emit_prologue(&self, state: &mut JitState<'_>) {
        for r in NONVOLATILE {
            emit_push(state, r);
        }

        // An even number of pushes leaves the stack 8 bytes away from a
        // 16-byte boundary.
        if NONVOLATILE.len() % 2 == 0 {
            emit_alu64_imm32(state, 0x81, 5, RSP, 8);
        }

        // The native arguments (mem, mem_len) become R1 and R2. With the
        // default map both already live in the right host registers.
        if self.map(1) != PARAMETER[0] {
            emit_mov(state, PARAMETER[0], self.map(1));
        }
        if self.map(2) != PARAMETER[1] {
            emit_mov(state, PARAMETER[1], self.map(2));
        }

        // R10 is the frame pointer at the high end of the stack.
        emit_mov(state, RSP, self.map(10));
        emit_alu64_imm32(state, 0x81, 5, RSP, STACK_SIZE as i32);

        #[cfg(windows)]
        emit_alu64_imm32(state, 0x81, 5, RSP, 32);

        // Call over the following jump so the program gets a landing pad
        // for its final exit, making it look like a leaf function from
        // the outside.
        state.emit1(0xe8);
        state.emit4(5);
        emit_jmp(state, Target::Exit);
    }

    fn emit_epilogue(&self, state: &mut JitState<'_>, vm: &Vm) {
        state.exit_loc = state.offset;

        if self.map(0) != RAX {
            emit_mov(state, self.map(0), RAX);
        }

        // Deallocate stack space by restoring RSP from R10.
        emit_mov(state, self.map(10), RSP);

        if NONVOLATILE.len() % 2 == 0 {
            emit_alu64_imm32(state, 0x81, 0, RSP, 8);
        }

        for r in NONVOLATILE.iter().rev() {
            emit_pop(state, *r);
        }

        state.emit1(0xc3);

        state.retpoline_loc = emit_retpoline(state);

        let (dispatcher, cookie) = vm.dispatcher();
        state.dispatcher_loc = state.offset;
        state.emit8(dispatcher as usize as u64);
        state.cookie_loc = state.offset;
        state.emit8(cookie as u64);
    }

    /// Call the dispatcher slot with (R1..R5, index, cookie), routing the
    /// indirect call through the retpoline. The result lands in the
    /// register mapped to R0.
    fn emit_external_call(&self, state: &mut JitState<'_>, index: i32) {
        // RCX is reserved for shifts, so the virtual register that should
        // occupy it for the call lives in RCX_ALT until now.
        emit_mov(state, RCX_ALT, RCX);

        #[cfg(not(windows))]
        {
            // mov r9d, index: the sixth System V argument.
            emit_alu32_imm32(state, 0xc7, 0, R9, index);
            // The cookie is the seventh argument and goes on the stack,
            // padded to keep the call site 16-byte aligned.
            emit_alu64_imm32(state, 0x81, 5, RSP, 16);
            emit_slot_load(state, RAX, Target::Cookie);
            emit_store(state, S64, RAX, RSP, 0);
            emit_slot_load(state, RAX, Target::Dispatcher);
            emit_near_call(state, Target::Retpoline);
            emit_alu64_imm32(state, 0x81, 0, RSP, 16);
        }

        #[cfg(windows)]
        {
            // Home space plus the three stack arguments (R5, index,
            // cookie), rounded up to keep the call site 16-byte aligned.
            emit_alu64_imm32(state, 0x81, 5, RSP, 0x40);
            emit_store(state, S64, self.map(5), RSP, 0x20);
            emit_store_imm32(state, S32, RSP, 0x28, index);
            emit_slot_load(state, RAX, Target::Cookie);
            emit_store(state, S64, RAX, RSP, 0x30);
            emit_slot_load(state, RAX, Target::Dispatcher);
            emit_near_call(state, Target::Retpoline);
            emit_alu64_imm32(state, 0x81, 0, RSP, 0x40);
        }

        if self.map(0) != RAX {
            emit_mov(state, RAX, self.map(0));
        }
    }

    /// A direct near call to another instruction, with R6..R9 saved and
    /// restored around it. Pushing four registers keeps the stack 16-byte
    /// aligned through the call.
    fn emit_local_call(&self, state: &mut JitState<'_>, target_pc: usize) {
        emit_push(state, self.map(6));
        emit_push(state, self.map(7));
        emit_push(state, self.map(8));
        emit_push(state, self.map(9));
        #[cfg(windows)]
        emit_alu64_imm32(state, 0x81, 5, RSP, 32);
        emit_near_call(state, Target::Insn(target_pc));
        #[cfg(windows)]
        emit_alu64_imm32(state, 0x81, 0, RSP, 32);
        emit_pop(state, self.map(9));
        emit_pop(state, self.map(8));
        emit_pop(state, self.map(7));
        emit_pop(state, self.map(6));
    }
}

/// Multiplication, division, and modulo, with the defined divisor-zero
/// semantics: division and multiplication by a zero immediate yield 0,
/// modulo yields the dividend; a runtime zero divisor is replaced by 1 and
/// the result corrected afterwards from the saved flags.
fn muldivmod(state: &mut JitState<'_>, opcode: u8, src: u8, dst: u8, imm: i32) {
    let mul = (opcode & ebpf::ALU_OP_MASK) == (ebpf::MUL_IMM & ebpf::ALU_OP_MASK);
    let div = (opcode & ebpf::ALU_OP_MASK) == (ebpf::DIV_IMM & ebpf::ALU_OP_MASK);
    let modulo = (opcode & ebpf::ALU_OP_MASK) == (ebpf::MOD_IMM & ebpf::ALU_OP_MASK);
    let is64 = (opcode & ebpf::CLS_MASK) == ebpf::CLS_ALU64;
    let reg = (opcode & ebpf::SRC_REG) != 0;

    // Short circuit the literal-zero divisor without touching RAX or RDX.
    if !reg && imm == 0 {
        if div || mul {
            emit_alu32(state, 0x31, dst, dst);
        } else if is64 {
            // The dividend is already in place.
        } else {
            // The 32-bit result is the zero-extended low dividend.
            emit_mov32(state, dst, dst);
        }
        return;
    }

    if dst != RAX {
        emit_push(state, RAX);
    }
    if dst != RDX {
        emit_push(state, RDX);
    }

    if reg {
        emit_mov(state, src, RCX);
    } else {
        emit_load_imm(state, RCX, i64::from(imm));
    }

    emit_mov(state, dst, RAX);

    if div || modulo {
        // Test the divisor and keep the verdict in the saved flags while
        // a 1 stands in for a zero divisor.
        if is64 {
            emit_alu64(state, 0x85, RCX, RCX);
        } else {
            emit_alu32(state, 0x85, RCX, RCX);
        }

        if modulo {
            emit_push(state, RAX);
        }

        state.emit1(0x9c); // pushfq

        emit_load_imm(state, RDX, 1);
        state.emit1(0x48);
        state.emit1(0x0f);
        state.emit1(0x44);
        state.emit1(0xca); // cmove rcx, rdx

        emit_alu32(state, 0x31, RDX, RDX); // xor edx, edx
    }

    if is64 {
        emit_rex(state, 1, 0, 0, 0);
    }

    // mul (/4) or div (/6) by RCX.
    emit_alu32(state, 0xf7, if mul { 4 } else { 6 }, RCX);

    if div || modulo {
        state.emit1(0x9d); // popfq

        if div {
            // The quotient of a zero divisor is zero.
            emit_load_imm(state, RCX, 0);
            state.emit1(0x48);
            state.emit1(0x0f);
            state.emit1(0x44);
            state.emit1(0xc1); // cmove rax, rcx
        } else {
            // The remainder of a zero divisor is the saved dividend.
            emit_pop(state, RCX);
            state.emit1(0x48);
            state.emit1(0x0f);
            state.emit1(0x44);
            state.emit1(0xd1); // cmove rdx, rcx
            if !is64 {
                // The 64-bit conditional move may have resurrected high
                // dividend bits; a 32-bit operation must not keep them.
                emit_mov32(state, RDX, RDX);
            }
        }
    }

    if dst != RDX {
        if modulo {
            emit_mov(state, RDX, dst);
        }
        emit_pop(state, RDX);
    }
    if dst != RAX {
        if div || mul {
            emit_mov(state, RAX, dst);
        }
        emit_pop(state, RAX);
    }
}

fn resolve_patchable_relatives(state: &mut JitState<'_>) -> Result<()> {
    let jumps = core::mem::take(&mut state.jumps);
    let loads = core::mem::take(&mut state.loads);
    for fixup in jumps.iter().chain(loads.iter()) {
        let target_loc = match fixup.target {
            Target::Insn(pc) => state.pc_locs.get(pc).copied().ok_or_else(|| {
                Error::TranslatorFault(format!("unresolvable branch target pc {}", pc))
            })?,
            Target::Exit => state.exit_loc,
            Target::Retpoline => state.retpoline_loc,
            Target::Dispatcher => state.dispatcher_loc,
            Target::Cookie => state.cookie_loc,
            Target::ByteOffset(offset) => offset,
        };
        // The displacement is always the last 4 bytes of its instruction.
        let rel = target_loc as i64 - (fixup.site as i64 + 4);
        state.patch4(fixup.site, rel as i32 as u32);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::Insn;

    fn assemble(insns: &[Insn]) -> Vec<u8> {
        insns.iter().flat_map(|insn| insn.write()).collect()
    }

    fn sample_vm() -> Vm {
        let mut vm = Vm::new();
        vm.load(&assemble(&[
            Insn {
                opcode: ebpf::MOV64_IMM,
                dst: 0,
                imm: 7,
                ..Default::default()
            },
            Insn {
                opcode: ebpf::ADD64_IMM,
                dst: 0,
                imm: 3,
                ..Default::default()
            },
            Insn {
                opcode: ebpf::EXIT,
                ..Default::default()
            },
        ]))
        .unwrap();
        vm
    }

    #[test]
    fn translation_is_deterministic() {
        let vm = sample_vm();
        let mut first = vec![0u8; 4096];
        let mut second = vec![0u8; 4096];
        let n = translate(&vm, &mut first).unwrap();
        let m = translate(&vm, &mut second).unwrap();
        assert_eq!(first[..n], second[..m]);
    }

    #[test]
    fn rotated_register_map_still_translates() {
        let vm = sample_vm();
        for offset in 0..REGISTER_MAP_SIZE {
            let compiler = JitCompiler::with_register_offset(offset);
            let mut first = vec![0u8; 4096];
            let mut second = vec![0u8; 4096];
            let n = compiler.translate(&vm, &mut first).unwrap();
            let m = compiler.translate(&vm, &mut second).unwrap();
            assert_eq!(first[..n], second[..m]);
        }
    }

    #[test]
    fn small_buffer_is_rejected() {
        let vm = sample_vm();
        let mut buffer = vec![0u8; 16];
        match translate(&vm, &mut buffer) {
            Err(Error::TranslatorFault(message)) => {
                assert!(message.contains("too small"), "{}", message);
            }
            other => panic!("expected a translator fault, got {:?}", other.map(|_| ())),
        }
    }
}
