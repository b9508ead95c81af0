//! Method metadata consumed by the frame layer
//!
//! Only the parts frames need are modelled: code position conversion,
//! signatures, per-bci interpreter oop maps, invoke sites and the
//! profiling data area.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use hashbrown::HashMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::runtime::stack::{Address, Word, WORD_SIZE};

/// Largest bytecode index; a bcx at or below it is an index, above it an address
pub const MAX_METHOD_CODE_SIZE: Word = 65535;

/// Whether `bcx` holds a bytecode index rather than a bytecode address
#[inline]
pub fn is_bci(bcx: Word) -> bool {
    bcx <= MAX_METHOD_CODE_SIZE
}

/// Java value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
    Object,
    Array,
    Void,
}

impl BasicType {
    /// Stack slots taken by a value of this type
    pub fn size(self) -> usize {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void => 0,
            _ => 1,
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }
}

/// Signature errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Malformed signature '{0}'")]
    Malformed(String),
}

/// Parsed method descriptor, e.g. `(ILjava/lang/String;J)V`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    params: SmallVec<[BasicType; 8]>,
    ret: BasicType,
}

impl Signature {
    pub fn new(
        params: &[BasicType],
        ret: BasicType,
    ) -> Self {
        Self {
            params: params.iter().copied().collect(),
            ret,
        }
    }

    /// Parse a JVM method descriptor
    pub fn parse(descriptor: &str) -> Result<Self, SignatureError> {
        let malformed = || SignatureError::Malformed(descriptor.to_string());
        let body = descriptor.strip_prefix('(').ok_or_else(malformed)?;
        let (params_text, ret_text) = body.split_once(')').ok_or_else(malformed)?;

        let mut params = SmallVec::new();
        let mut rest = params_text;
        while !rest.is_empty() {
            let (ty, tail) = parse_field_type(rest).ok_or_else(malformed)?;
            if ty == BasicType::Void {
                return Err(malformed());
            }
            params.push(ty);
            rest = tail;
        }

        let (ret, tail) = parse_field_type(ret_text).ok_or_else(malformed)?;
        if !tail.is_empty() {
            return Err(malformed());
        }
        Ok(Self { params, ret })
    }

    pub fn params(&self) -> &[BasicType] {
        &self.params
    }

    pub fn return_type(&self) -> BasicType {
        self.ret
    }

    /// Argument slots, excluding any receiver
    pub fn size(&self) -> usize {
        self.params.iter().map(|ty| ty.size()).sum()
    }
}

fn parse_field_type(text: &str) -> Option<(BasicType, &str)> {
    let mut chars = text.chars();
    let ty = match chars.next()? {
        'Z' => BasicType::Boolean,
        'C' => BasicType::Char,
        'F' => BasicType::Float,
        'D' => BasicType::Double,
        'B' => BasicType::Byte,
        'S' => BasicType::Short,
        'I' => BasicType::Int,
        'J' => BasicType::Long,
        'V' => BasicType::Void,
        'L' => {
            let end = text.find(';')?;
            return Some((BasicType::Object, &text[end + 1..]));
        }
        '[' => {
            let (elem, tail) = parse_field_type(&text[1..])?;
            if elem == BasicType::Void {
                return None;
            }
            return Some((BasicType::Array, tail));
        }
        _ => return None,
    };
    Some((ty, chars.as_str()))
}

impl fmt::Display for Signature {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?} -> {:?}", self.params.as_slice(), self.ret)
    }
}

/// Liveness of one local or expression stack slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Value,
    Oop,
    Dead,
}

/// Live-slot classification of an interpreted activation at one bci
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpreterOopMap {
    locals: SmallVec<[SlotKind; 8]>,
    stack: SmallVec<[SlotKind; 8]>,
}

impl InterpreterOopMap {
    /// `stack[0]` is the deepest expression stack entry
    pub fn new(
        locals: &[SlotKind],
        stack: &[SlotKind],
    ) -> Self {
        Self {
            locals: locals.iter().copied().collect(),
            stack: stack.iter().copied().collect(),
        }
    }

    /// Local indices holding references
    pub fn oop_locals(&self) -> impl Iterator<Item = usize> + '_ {
        oop_indices(&self.locals)
    }

    /// Expression stack indices holding references, counted from the deepest entry
    pub fn oop_stack(&self) -> impl Iterator<Item = usize> + '_ {
        oop_indices(&self.stack)
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }
}

fn oop_indices(kinds: &[SlotKind]) -> impl Iterator<Item = usize> + '_ {
    kinds
        .iter()
        .enumerate()
        .filter(|(_, kind)| **kind == SlotKind::Oop)
        .map(|(i, _)| i)
}

/// An invoke bytecode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeSite {
    pub signature: Signature,
    pub has_receiver: bool,
    /// Bytecode length of the invoke instruction
    pub length: u8,
}

impl InvokeSite {
    /// Argument slots including the receiver
    pub fn args_size(&self) -> usize {
        self.signature.size() + usize::from(self.has_receiver)
    }
}

/// Profiling data area of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodData {
    pub base: Address,
    pub size: usize,
}

impl MethodData {
    pub fn di_to_dp(
        &self,
        di: usize,
    ) -> Address {
        self.base + di
    }

    pub fn dp_to_di(
        &self,
        dp: Address,
    ) -> Option<usize> {
        dp.checked_sub(self.base).filter(|di| *di <= self.size)
    }
}

/// Method metadata
#[derive(Debug, Clone)]
pub struct Method {
    id: Word,
    name: String,
    code_base: Address,
    code_size: usize,
    max_locals: usize,
    max_stack: usize,
    signature: Signature,
    is_static: bool,
    is_native: bool,
    constants: Word,
    method_data: Option<MethodData>,
    oop_maps: BTreeMap<u32, InterpreterOopMap>,
    invokes: BTreeMap<u32, InvokeSite>,
}

impl Method {
    /// Start a method whose frames hold `id` in their method slot
    pub fn builder(
        id: Word,
        name: impl Into<String>,
        signature: Signature,
    ) -> MethodBuilder {
        MethodBuilder {
            method: Method {
                id,
                name: name.into(),
                code_base: 0,
                code_size: 0,
                max_locals: 0,
                max_stack: 0,
                signature,
                is_static: false,
                is_native: false,
                constants: 0,
                method_data: None,
                oop_maps: BTreeMap::new(),
                invokes: BTreeMap::new(),
            },
        }
    }

    pub fn id(&self) -> Word {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code_base(&self) -> Address {
        self.code_base
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn max_locals(&self) -> usize {
        self.max_locals
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn is_native(&self) -> bool {
        self.is_native
    }

    pub fn constants(&self) -> Word {
        self.constants
    }

    pub fn method_data(&self) -> Option<&MethodData> {
        self.method_data.as_ref()
    }

    pub fn result_type(&self) -> BasicType {
        self.signature.return_type()
    }

    /// Parameter slots including the receiver
    pub fn size_of_parameters(&self) -> usize {
        self.signature.size() + usize::from(!self.is_static)
    }

    pub fn bcp_from(
        &self,
        bci: u32,
    ) -> Address {
        self.code_base + bci as usize
    }

    pub fn bci_from(
        &self,
        bcp: Address,
    ) -> Option<u32> {
        let bci = bcp.checked_sub(self.code_base)?;
        (bci < self.code_size.max(1)).then_some(bci as u32)
    }

    /// Bytecode index named by `bcx`, if it is a valid position in this method
    pub fn validate_bci_from_bcx(
        &self,
        bcx: Word,
    ) -> Option<u32> {
        let bci = if is_bci(bcx) {
            bcx as u32
        } else {
            self.bci_from(bcx)?
        };
        let valid = if self.is_native {
            bci == 0
        } else {
            (bci as usize) < self.code_size
        };
        valid.then_some(bci)
    }

    /// Invoke instruction at `bci`, if there is one
    pub fn invoke_at(
        &self,
        bci: u32,
    ) -> Option<&InvokeSite> {
        self.invokes.get(&bci)
    }

    /// Interpreter oop map for `bci`.
    ///
    /// Native methods hold only their parameters as locals, so their map
    /// comes straight from the signature.
    pub fn mask_for(
        &self,
        bci: u32,
    ) -> Option<Cow<'_, InterpreterOopMap>> {
        if self.is_native {
            let mut locals: SmallVec<[SlotKind; 8]> = SmallVec::new();
            if !self.is_static {
                locals.push(SlotKind::Oop);
            }
            for ty in self.signature.params() {
                locals.push(if ty.is_reference() {
                    SlotKind::Oop
                } else {
                    SlotKind::Value
                });
                if ty.size() == 2 {
                    locals.push(SlotKind::Value);
                }
            }
            return Some(Cow::Owned(InterpreterOopMap::new(&locals, &[])));
        }
        self.oop_maps.get(&bci).map(Cow::Borrowed)
    }
}

/// Builder for [`Method`]
#[derive(Debug)]
pub struct MethodBuilder {
    method: Method,
}

impl MethodBuilder {
    pub fn code(
        mut self,
        base: Address,
        size: usize,
    ) -> Self {
        self.method.code_base = base;
        self.method.code_size = size;
        self
    }

    pub fn max_locals(
        mut self,
        max_locals: usize,
    ) -> Self {
        self.method.max_locals = max_locals;
        self
    }

    pub fn max_stack(
        mut self,
        max_stack: usize,
    ) -> Self {
        self.method.max_stack = max_stack;
        self
    }

    pub fn is_static(mut self) -> Self {
        self.method.is_static = true;
        self
    }

    pub fn is_native(mut self) -> Self {
        self.method.is_native = true;
        self
    }

    pub fn constants(
        mut self,
        constants: Word,
    ) -> Self {
        self.method.constants = constants;
        self
    }

    pub fn method_data(
        mut self,
        data: MethodData,
    ) -> Self {
        self.method.method_data = Some(data);
        self
    }

    pub fn oop_map(
        mut self,
        bci: u32,
        map: InterpreterOopMap,
    ) -> Self {
        self.method.oop_maps.insert(bci, map);
        self
    }

    pub fn invoke(
        mut self,
        bci: u32,
        site: InvokeSite,
    ) -> Self {
        self.method.invokes.insert(bci, site);
        self
    }

    pub fn build(self) -> Method {
        let mut method = self.method;
        method.max_locals = method.max_locals.max(method.size_of_parameters());
        method
    }
}

/// Resolves the method word stored in an interpreter frame
pub trait MethodResolver: Send + Sync {
    fn resolve(
        &self,
        method: Word,
    ) -> Option<&Method>;

    fn is_valid_method(
        &self,
        method: Word,
    ) -> bool {
        self.resolve(method).is_some()
    }
}

/// Method table keyed by method word
#[derive(Debug, Default)]
pub struct MethodTable {
    methods: HashMap<Word, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method, replacing any with the same id
    pub fn insert(
        &mut self,
        method: Method,
    ) {
        debug_assert!(method.id() % WORD_SIZE == 0, "method ids are aligned words");
        self.methods.insert(method.id(), method);
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl MethodResolver for MethodTable {
    fn resolve(
        &self,
        method: Word,
    ) -> Option<&Method> {
        self.methods.get(&method)
    }
}

#[cfg(test)]
mod tests;
