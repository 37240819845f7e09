//! The virtual machine context and its public operations.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;

use crate::ebpf::{self, Insn};
use crate::error::{Error, Result};
use crate::{interp, jit, loader, verifier};
use crate::{MAX_HELPERS, MAX_INSNS};

/// A helper function callable from inside a program via `call` with src 0.
pub type Helper = fn(u64, u64, u64, u64, u64) -> u64;

/// A function that dispatches external calls to helpers.
///
/// Receives R1 through R5, the helper index from the call's immediate, and
/// the cookie supplied at registration. Generated code calls this directly,
/// so it must use the C ABI.
pub type Dispatcher = extern "C" fn(u64, u64, u64, u64, u64, u32, *mut c_void) -> u64;

/// Decides during verification whether a helper index is valid for an
/// installed [`Dispatcher`].
pub type Validator = fn(u32, *mut c_void) -> bool;

/// A compiled program. Takes the memory pointer and length, returns R0.
pub type JitFn = unsafe extern "C" fn(*mut u8, usize) -> u64;

pub(crate) struct HelperEntry {
    pub name: String,
    pub func: Helper,
}

pub(crate) struct ExternalDispatcher {
    pub dispatcher: Dispatcher,
    pub validator: Validator,
    pub cookie: *mut c_void,
}

/// Helper dispatch state shared with generated code.
///
/// Boxed by [`Vm`] so its address survives moves of the `Vm` value; the JIT
/// stores a pointer to it in the translated buffer.
pub(crate) struct DispatchContext {
    pub helpers: HashMap<u32, HelperEntry>,
    pub external: Option<ExternalDispatcher>,
}

/// The default dispatcher used when no external dispatcher is registered:
/// index the helper table and call through.
pub(crate) extern "C" fn dispatch_by_index(
    r1: u64,
    r2: u64,
    r3: u64,
    r4: u64,
    r5: u64,
    index: u32,
    cookie: *mut c_void,
) -> u64 {
    // The cookie is the address of the VM's DispatchContext; the verifier
    // has already established that the index is registered.
    let ctx = unsafe { &*(cookie as *const DispatchContext) };
    match ctx.helpers.get(&index) {
        Some(entry) => (entry.func)(r1, r2, r3, r4, r5),
        None => 0,
    }
}

/// A virtual machine for 64-bit eBPF programs.
///
/// A `Vm` is created empty, configured (helpers, callbacks, flags), loaded
/// with a program, and then executed, compiled, or translated. Loading a
/// second program requires an explicit [`unload`](Vm::unload) in between;
/// registered helpers and callbacks survive the unload.
pub struct Vm {
    /// Instruction records, stored XORed with `pointer_secret`.
    insns: Vec<u64>,
    /// Marks instructions that are the entry point of some function.
    function_entries: Vec<bool>,
    pub(crate) ctx: Box<DispatchContext>,
    pub(crate) unwind_index: Option<u32>,
    pub(crate) data_relocation: Option<Box<dyn Fn(&[u8], &str, u64, u64) -> u64>>,
    pub(crate) bounds_check: Option<Box<dyn Fn(u64, u64) -> bool>>,
    pub(crate) bounds_check_enabled: bool,
    error_print: Option<Box<dyn Fn(&str)>>,
    registers: *mut u64,
    pointer_secret: u64,
    jit: Option<jit::memory::ExecutableMemory>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Create a new, empty VM. Bounds checking starts enabled.
    pub fn new() -> Vm {
        Vm {
            insns: Vec::new(),
            function_entries: Vec::new(),
            ctx: Box::new(DispatchContext {
                helpers: HashMap::new(),
                external: None,
            }),
            unwind_index: None,
            data_relocation: None,
            bounds_check: None,
            bounds_check_enabled: true,
            error_print: None,
            registers: ptr::null_mut(),
            pointer_secret: 0,
            jit: None,
        }
    }

    /// Enable or disable bounds checking of program loads and stores.
    ///
    /// Returns the previous setting. Disabling removes the only memory
    /// policing the interpreter performs; it is an explicit opt-out for
    /// callers that trust their programs.
    pub fn set_bounds_check(&mut self, enable: bool) -> bool {
        let previous = self.bounds_check_enabled;
        self.bounds_check_enabled = enable;
        previous
    }

    /// Register a bounds-check callback consulted for every load and store
    /// outside the program's private stack.
    pub fn set_bounds_check_fn<F>(&mut self, check: F)
    where
        F: Fn(u64, u64) -> bool + 'static,
    {
        self.bounds_check = Some(Box::new(check));
    }

    /// Set a hook that receives the formatted message of every error
    /// produced by the top-level operations, in addition to the returned
    /// `Err`.
    pub fn set_error_print<F>(&mut self, print: F)
    where
        F: Fn(&str) + 'static,
    {
        self.error_print = Some(Box::new(print));
    }

    /// Register a helper function at the given index.
    ///
    /// The immediate of a `call` instruction with src 0 selects the helper
    /// by this index; object-file relocations select it by this name.
    /// Fails if the index is out of range or already taken.
    pub fn register_helper(&mut self, index: u32, name: &str, helper: Helper) -> Result<()> {
        if index >= MAX_HELPERS {
            return Err(Error::InvalidRegistration(format!(
                "helper index {} exceeds the maximum of {}",
                index,
                MAX_HELPERS - 1
            )));
        }
        if self.ctx.helpers.contains_key(&index) {
            return Err(Error::InvalidRegistration(format!(
                "helper index {} is already registered",
                index
            )));
        }
        self.ctx.helpers.insert(
            index,
            HelperEntry {
                name: name.to_owned(),
                func: helper,
            },
        );
        Ok(())
    }

    /// Register an external dispatcher that replaces index-based helper
    /// dispatch, together with the validator the verifier will consult for
    /// call immediates. At most one dispatcher can be installed.
    ///
    /// The cookie is passed through to both callbacks unchanged.
    pub fn register_external_dispatcher(
        &mut self,
        dispatcher: Dispatcher,
        validator: Validator,
        cookie: *mut c_void,
    ) -> Result<()> {
        if self.ctx.external.is_some() {
            return Err(Error::InvalidRegistration(
                "an external dispatcher is already registered".into(),
            ));
        }
        self.ctx.external = Some(ExternalDispatcher {
            dispatcher,
            validator,
            cookie,
        });
        Ok(())
    }

    /// Look up a registered helper by name.
    pub fn helper_by_name(&self, name: &str) -> Option<u32> {
        self.ctx
            .helpers
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(&index, _)| index)
    }

    /// Apply unwind-on-zero semantics to the helper at the given index:
    /// when that helper returns 0, execution ends immediately with the
    /// current R0. Fails if an unwind index is already set.
    pub fn set_unwind_index(&mut self, index: u32) -> Result<()> {
        if self.unwind_index.is_some() {
            return Err(Error::InvalidRegistration(
                "an unwind helper index is already set".into(),
            ));
        }
        self.unwind_index = Some(index);
        Ok(())
    }

    /// Set the secret used to obfuscate instruction records at rest.
    ///
    /// Fails once a program has been loaded; the secret must stay fixed
    /// for the lifetime of the loaded program.
    pub fn set_pointer_secret(&mut self, secret: u64) -> Result<()> {
        if !self.insns.is_empty() {
            return Err(Error::InvalidRegistration(
                "the pointer secret cannot change after a program is loaded".into(),
            ));
        }
        self.pointer_secret = secret;
        Ok(())
    }

    /// Override the storage used for the register file during
    /// interpretation. Must point at space for at least
    /// [`REGISTER_COUNT`](crate::ebpf::REGISTER_COUNT) `u64` values.
    ///
    /// # Safety
    ///
    /// The pointer must stay valid, and not be aliased by another
    /// execution, for as long as it is installed.
    pub unsafe fn set_registers(&mut self, registers: *mut u64) {
        self.registers = registers;
    }

    /// Get the register storage previously installed with
    /// [`set_registers`](Vm::set_registers), or null.
    pub fn registers(&self) -> *mut u64 {
        self.registers
    }

    /// Register the callback that resolves 64-bit data relocations when an
    /// object image is loaded. It receives the referenced data section,
    /// the symbol name, and the symbol's offset and size, and returns the
    /// 64-bit value to patch into the `lddw` pair.
    pub fn set_data_relocation<F>(&mut self, relocate: F)
    where
        F: Fn(&[u8], &str, u64, u64) -> u64 + 'static,
    {
        self.data_relocation = Some(Box::new(relocate));
    }

    /// Load a program from raw instruction bytes and verify it.
    ///
    /// Fails if a program is already loaded; call [`unload`](Vm::unload)
    /// first.
    pub fn load(&mut self, code: &[u8]) -> Result<()> {
        let result = self.load_inner(code);
        self.report(result)
    }

    pub(crate) fn load_inner(&mut self, code: &[u8]) -> Result<()> {
        if !self.insns.is_empty() {
            return Err(Error::AlreadyLoaded);
        }
        if code.len() % ebpf::INSN_SIZE != 0 {
            return Err(Error::VerifierRejected(
                "program length must be a multiple of 8".into(),
            ));
        }
        let count = code.len() / ebpf::INSN_SIZE;
        if count > MAX_INSNS {
            return Err(Error::VerifierRejected(format!(
                "too many instructions (max {})",
                MAX_INSNS
            )));
        }
        self.insns.reserve(count);
        for record in code.chunks_exact(ebpf::INSN_SIZE) {
            let raw = u64::from_le_bytes(record.try_into().unwrap());
            self.insns.push(raw ^ self.pointer_secret);
        }
        match verifier::check(self) {
            Ok(entries) => {
                self.function_entries = entries;
                Ok(())
            }
            Err(e) => {
                self.insns.clear();
                Err(e)
            }
        }
    }

    /// Discard the loaded program so that another can be loaded.
    ///
    /// Registered helpers and callbacks are unaffected.
    pub fn unload(&mut self) {
        self.insns.clear();
        self.function_entries.clear();
        self.jit = None;
    }

    /// Load a program from a relocatable object image, using the symbol at
    /// offset 0 of `.text` as the main function.
    pub fn load_object(&mut self, image: &[u8]) -> Result<()> {
        let result = loader::load_object(self, image, None);
        self.report(result)
    }

    /// Load a program from a relocatable object image, using the function
    /// symbol with the given name as the main function.
    pub fn load_object_with_main(&mut self, image: &[u8], main: &str) -> Result<()> {
        let result = loader::load_object(self, image, Some(main));
        self.report(result)
    }

    /// Execute the loaded program in the interpreter.
    ///
    /// The program sees the address of `mem` in R1 and its length in R2.
    /// Returns the program's R0.
    pub fn execute(&self, mem: &mut [u8]) -> Result<u64> {
        let result = interp::execute(self, mem);
        self.report(result)
    }

    /// Translate the loaded program to x86-64 machine code in `buffer`.
    ///
    /// Returns the exact number of bytes written. The output is position
    /// independent but refers to this VM's dispatch state, so it must not
    /// outlive the VM.
    pub fn translate(&self, buffer: &mut [u8]) -> Result<usize> {
        let result = jit::translate(self, buffer);
        self.report(result)
    }

    /// Compile the loaded program to native code held in an executable
    /// mapping owned by this VM.
    ///
    /// The returned function stays valid until the VM is unloaded or
    /// dropped. Calling it is `unsafe`: generated code is exactly as safe
    /// as the verified program and the registered helpers.
    pub fn compile(&mut self) -> Result<JitFn> {
        let result = if cfg!(target_arch = "x86_64") {
            jit::compile(self)
        } else {
            Err(Error::TranslatorFault(
                "compiled programs can only run on x86-64 hosts".into(),
            ))
        };
        let result = match result {
            Ok(memory) => {
                self.jit = Some(memory);
                let jit = self.jit.as_ref().unwrap();
                Ok(unsafe { core::mem::transmute::<*const u8, JitFn>(jit.as_ptr()) })
            }
            Err(e) => Err(e),
        };
        self.report(result)
    }

    /// Number of loaded instruction records.
    pub fn insn_count(&self) -> usize {
        self.insns.len()
    }

    /// Return true if a program is loaded.
    pub fn is_loaded(&self) -> bool {
        !self.insns.is_empty()
    }

    /// Fetch the instruction at `pc`, undoing the at-rest obfuscation.
    pub(crate) fn fetch_insn(&self, pc: usize) -> Insn {
        let raw = self.insns[pc] ^ self.pointer_secret;
        Insn::parse(raw.to_le_bytes())
    }

    pub(crate) fn is_function_entry(&self, pc: usize) -> bool {
        self.function_entries.get(pc).copied().unwrap_or(false)
    }

    /// The dispatcher and cookie an external call goes through: the
    /// registered pair, or the default table-indexing dispatcher with this
    /// VM's dispatch context.
    pub(crate) fn dispatcher(&self) -> (Dispatcher, *mut c_void) {
        match &self.ctx.external {
            Some(external) => (external.dispatcher, external.cookie),
            None => (
                dispatch_by_index,
                &*self.ctx as *const DispatchContext as *mut c_void,
            ),
        }
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let (Err(e), Some(print)) = (&result, &self.error_print) {
            print(&e.to_string());
        }
        result
    }
}
