//! Verifier rejections.

mod common;

use bpfvm::ebpf::{self, Insn};
use bpfvm::{Error, Vm};
use common::*;

fn verify(insns: &[Insn]) -> Result<(), Error> {
    init_logging();
    let mut vm = Vm::new();
    vm.load(&asm(insns)).map(|_| ())
}

fn rejected_with(insns: &[Insn], needle: &str) {
    match verify(insns) {
        Err(Error::VerifierRejected(message)) => {
            assert!(message.contains(needle), "{:?} does not mention {:?}", message, needle);
        }
        other => panic!("expected rejection mentioning {:?}, got {:?}", needle, other),
    }
}

#[test]
fn empty_program() {
    rejected_with(&[], "no instructions");
}

#[test]
fn missing_exit() {
    rejected_with(&[mov64_imm(0, 0)], "does not end with exit");
}

#[test]
fn write_to_the_frame_pointer() {
    rejected_with(&[mov64_imm(10, 0), exit()], "destination register");
}

#[test]
fn stores_may_address_through_the_frame_pointer() {
    assert!(verify(&[insn(ebpf::STB, 10, 0, -1, 0), exit()]).is_ok());
    assert!(verify(&[insn(ebpf::STXDW, 10, 1, -8, 0), exit()]).is_ok());
}

#[test]
fn source_register_out_of_range() {
    rejected_with(&[insn(ebpf::ADD64_REG, 0, 12, 0, 0), exit()], "source register");
}

#[test]
fn jump_out_of_bounds() {
    rejected_with(&[insn(ebpf::JA, 0, 0, 10, 0), exit()], "out of bounds");
    rejected_with(&[insn(ebpf::JA, 0, 0, -3, 0), exit()], "out of bounds");
}

#[test]
fn jump_into_an_lddw_pair() {
    let pair = lddw(1, 0x1_0000_0001);
    rejected_with(
        &[insn(ebpf::JA, 0, 0, 1, 0), pair[0], pair[1], exit()],
        "middle of an lddw",
    );
}

#[test]
fn lddw_needs_its_second_record() {
    rejected_with(&[insn(ebpf::LDDW, 0, 0, 0, 1)], "incomplete lddw");
}

#[test]
fn lddw_second_record_must_be_empty() {
    let pair = lddw(1, 1);
    let mut tail = pair[1];
    tail.dst = 1;
    rejected_with(&[pair[0], tail, exit()], "malformed second record");
}

#[test]
fn unknown_opcode() {
    rejected_with(&[insn(0x8f, 0, 0, 0, 0), exit()], "unknown opcode");
}

#[test]
fn unregistered_helper_call() {
    rejected_with(&[call_helper(3), exit()], "helper function index");
}

#[test]
fn registered_helper_call_is_accepted() {
    init_logging();
    let mut vm = Vm::new();
    vm.register_helper(3, "gather_bytes", gather_bytes).unwrap();
    vm.load(&asm(&[call_helper(3), exit()])).unwrap();
}

#[test]
fn local_call_out_of_bounds() {
    rejected_with(&[call_local(7), exit()], "call out of bounds");
}

#[test]
fn invalid_call_source() {
    rejected_with(&[insn(ebpf::CALL, 0, 2, 0, 0), exit()], "call source");
}

#[test]
fn invalid_endian_immediate() {
    rejected_with(&[insn(ebpf::BE, 0, 0, 0, 24), exit()], "endian immediate");
}

#[test]
fn dispatcher_validator_gates_call_immediates() {
    extern "C" fn dispatch(
        _r1: u64,
        _r2: u64,
        _r3: u64,
        _r4: u64,
        _r5: u64,
        _index: u32,
        _cookie: *mut core::ffi::c_void,
    ) -> u64 {
        0
    }
    fn validate(index: u32, _cookie: *mut core::ffi::c_void) -> bool {
        index < 8
    }

    init_logging();
    let mut vm = Vm::new();
    vm.register_external_dispatcher(dispatch, validate, core::ptr::null_mut())
        .unwrap();
    // No helper is registered at 7, but the validator accepts it.
    vm.load(&asm(&[call_helper(7), exit()])).unwrap();
    vm.unload();
    assert!(matches!(
        vm.load(&asm(&[call_helper(9), exit()])),
        Err(Error::VerifierRejected(_))
    ));
}

#[test]
fn program_length_must_be_a_multiple_of_8() {
    init_logging();
    let mut vm = Vm::new();
    let mut code = asm(&[exit()]);
    code.push(0);
    assert!(matches!(vm.load(&code), Err(Error::VerifierRejected(_))));
}
