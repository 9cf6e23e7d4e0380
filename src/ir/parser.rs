//! Textual IR parser.
//!
//! Works directly on the byte buffer with a cursor. Operands and block
//! references are collected as named placeholders and patched once the whole
//! function has been read, so uses may precede definitions in layout order.

use super::{
    Attr, BinOp, BlockId, CastOp, CmpPred, ConstId, ConstOrigin, Function, InstId, InstKind,
    Module, Type, ValueId,
};
use crate::core::ParseError;
use hashbrown::HashMap;

const UNRESOLVED_VALUE: ValueId = ValueId(u32::MAX);
const UNRESOLVED_BLOCK: BlockId = BlockId(u32::MAX);

pub fn parse_module(text: &str) -> Result<Module, ParseError> {
    Parser::new(text).parse()
}

type PResult<T> = Result<T, ParseError>;

struct Parser<'a> {
    src: &'a str,
    text: &'a [u8],
    pos: usize,
    module: Module,

    string_resolves: Vec<StringResolve<'a>>,

    // Per-function maps
    blocks: HashMap<&'a str, BlockId>,
    values: HashMap<&'a str, ValueId>,
    block_resolves: Vec<Resolve<'a>>,
    value_resolves: Vec<Resolve<'a>>,
}

/// Operand slot waiting for a name to be bound.
#[derive(Debug)]
struct Resolve<'a> {
    name: &'a str,
    inst: InstId,
    slot: usize,
    at: usize,
}

#[derive(Debug)]
struct StringResolve<'a> {
    name: &'a str,
    func: usize,
    inst: InstId,
    at: usize,
}

/// Instruction read from text, operands still by name.
struct PendingInst<'a> {
    kind: InstKind,
    ty: Type,
    values: Vec<&'a str>,
    blocks: Vec<&'a str>,
    string: Option<&'a str>,
}

/// Call target as written: `@name` or a pointer value `%p`.
enum Callee<'a> {
    Direct(&'a str),
    Indirect(&'a str),
}

fn call_inst<'a>(callee: Callee<'a>, args: Vec<&'a str>, ty: Type) -> PendingInst<'a> {
    let v = UNRESOLVED_VALUE;
    match callee {
        Callee::Direct(name) => {
            let kind = InstKind::Call { callee: name.to_string(), args: vec![v; args.len()] };
            PendingInst::new(kind, ty).with_values(args)
        }
        Callee::Indirect(pointer) => {
            let kind = InstKind::CallIndirect { callee: v, args: vec![v; args.len()] };
            let mut values = Vec::with_capacity(args.len() + 1);
            values.push(pointer);
            values.extend(args);
            PendingInst::new(kind, ty).with_values(values)
        }
    }
}

impl<'a> PendingInst<'a> {
    fn new(kind: InstKind, ty: Type) -> Self {
        Self { kind, ty, values: Vec::new(), blocks: Vec::new(), string: None }
    }

    fn with_values(mut self, values: Vec<&'a str>) -> Self {
        self.values = values;
        self
    }

    fn with_blocks(mut self, blocks: Vec<&'a str>) -> Self {
        self.blocks = blocks;
        self
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            text: src.as_bytes(),
            pos: 0,
            module: Module::new("module"),
            string_resolves: Vec::new(),
            blocks: HashMap::new(),
            values: HashMap::new(),
            block_resolves: Vec::new(),
            value_resolves: Vec::new(),
        }
    }

    fn parse(mut self) -> PResult<Module> {
        self.skip_whitespace(true);

        while !self.is_eof() {
            let at = self.pos;
            let keyword = self.read_identifier()?;
            match keyword {
                "module" => {
                    let name = self.read_quoted()?;
                    self.module.name = String::from_utf8_lossy(&name).into_owned();
                }
                "global" => self.parse_global()?,
                "string" => self.parse_string()?,
                "declare" => self.parse_declaration()?,
                "define" => self.parse_definition()?,
                other => {
                    return Err(self.error_at(at, format!("unexpected top-level item '{other}'")))
                }
            }
            self.skip_whitespace(true);
        }

        self.resolve_strings()?;
        Ok(self.module)
    }

    // ----- cursor -----

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn advance(&mut self) {
        if self.pos < self.text.len() {
            self.pos += 1;
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current() {
            if ch == b';' {
                // Skip comment line
                while let Some(ch) = self.current() {
                    if ch == b'\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_ascii_whitespace() {
                if ch == b'\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: u8) -> bool {
        self.skip_whitespace(true);
        if self.current() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: u8) -> PResult<()> {
        if !self.try_read(ch) {
            return Err(self.error(format!(
                "expected '{}' but found {}",
                ch as char,
                self.describe_current()
            )));
        }
        Ok(())
    }

    /// Consume `keyword` if it is the next word.
    fn try_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace(true);
        let saved = self.pos;
        match self.read_identifier() {
            Ok(word) if word == keyword => true,
            _ => {
                self.pos = saved;
                false
            }
        }
    }

    fn describe_current(&self) -> String {
        match self.current() {
            Some(ch) => format!("'{}'", ch as char),
            None => "end of input".to_string(),
        }
    }

    fn read_identifier(&mut self) -> PResult<&'a str> {
        self.skip_whitespace(true);
        let start = self.pos;
        while let Some(ch) = self.current() {
            if is_ident_byte(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error(format!(
                "expected identifier but found {}",
                self.describe_current()
            )));
        }
        Ok(&self.src[start..self.pos])
    }

    fn read_sigil_name(&mut self, sigil: u8) -> PResult<&'a str> {
        self.expect(sigil)?;
        let start = self.pos;
        while let Some(ch) = self.current() {
            if is_ident_byte(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error(format!("expected name after '{}'", sigil as char)));
        }
        Ok(&self.src[start..self.pos])
    }

    fn read_value_name(&mut self) -> PResult<&'a str> {
        self.read_sigil_name(b'%')
    }

    fn read_block_name(&mut self) -> PResult<&'a str> {
        self.read_sigil_name(b'^')
    }

    fn read_global_name(&mut self) -> PResult<&'a str> {
        self.read_sigil_name(b'@')
    }

    fn read_type(&mut self) -> PResult<Type> {
        let at = self.pos;
        let word = self.read_identifier()?;
        Type::parse(word).ok_or_else(|| self.error_at(at, format!("unknown type '{word}'")))
    }

    fn read_i64(&mut self) -> PResult<i64> {
        self.skip_whitespace(true);
        let at = self.pos;
        let negative = self.current() == Some(b'-');
        if negative {
            self.advance();
        }
        let magnitude = self.read_u64()?;
        let value = if negative {
            0i64.wrapping_sub(magnitude as i64)
        } else {
            magnitude as i64
        };
        if !negative && magnitude > i64::MAX as u64 && !self.src[at..self.pos].starts_with("0x") {
            return Err(self.error_at(at, "integer literal out of range".to_string()));
        }
        Ok(value)
    }

    fn read_u64(&mut self) -> PResult<u64> {
        self.skip_whitespace(true);
        let start = self.pos;
        let is_hex = self.text[self.pos..].starts_with(b"0x") || self.text[self.pos..].starts_with(b"0X");
        if is_hex {
            self.pos += 2;
        }
        let digits = self.pos;
        while let Some(ch) = self.current() {
            if (is_hex && ch.is_ascii_hexdigit()) || (!is_hex && ch.is_ascii_digit()) {
                self.advance();
            } else {
                break;
            }
        }
        if digits == self.pos {
            return Err(self.error_at(start, "expected number".to_string()));
        }
        let number = &self.src[digits..self.pos];
        let parsed = if is_hex {
            u64::from_str_radix(number, 16)
        } else {
            number.parse()
        };
        parsed.map_err(|e| self.error_at(start, format!("failed to parse number: {e}")))
    }

    /// Read a `"..."` literal with `\XX`, `\\` and `\"` escapes.
    fn read_quoted(&mut self) -> PResult<Vec<u8>> {
        self.expect(b'"')?;
        let mut bytes = Vec::new();
        loop {
            match self.current() {
                None | Some(b'\n') => return Err(self.error("unterminated string".to_string())),
                Some(b'"') => {
                    self.advance();
                    return Ok(bytes);
                }
                Some(b'\\') => {
                    self.advance();
                    match self.current() {
                        Some(b'\\') => {
                            bytes.push(b'\\');
                            self.advance();
                        }
                        Some(b'"') => {
                            bytes.push(b'"');
                            self.advance();
                        }
                        _ => {
                            let hex = self
                                .src
                                .get(self.pos..self.pos + 2)
                                .and_then(|h| u8::from_str_radix(h, 16).ok())
                                .ok_or_else(|| self.error("invalid escape sequence".to_string()))?;
                            bytes.push(hex);
                            self.pos += 2;
                        }
                    }
                }
                Some(ch) => {
                    bytes.push(ch);
                    self.advance();
                }
            }
        }
    }

    fn error(&self, message: String) -> ParseError {
        self.error_at(self.pos, message)
    }

    fn error_at(&self, at: usize, message: String) -> ParseError {
        let at = at.min(self.text.len());
        let before = &self.text[..at];
        let line = before.iter().filter(|b| **b == b'\n').count() + 1;
        let line_start = before.iter().rposition(|b| *b == b'\n').map(|p| p + 1).unwrap_or(0);
        ParseError { line, column: at - line_start + 1, message }
    }

    // ----- module items -----

    fn parse_global(&mut self) -> PResult<()> {
        let at = self.pos;
        let name = self.read_global_name()?;
        self.expect(b':')?;
        let ty = self.read_type()?;
        self.expect(b'=')?;
        let init = self.read_i64()?;
        if self.module.global(name).is_some() {
            return Err(self.error_at(at, format!("duplicate global '@{name}'")));
        }
        self.module.ensure_global(name, ty, init);
        Ok(())
    }

    fn parse_string(&mut self) -> PResult<()> {
        let at = self.pos;
        let name = self.read_global_name()?;
        self.expect(b'=')?;
        let bytes = self.read_quoted()?;
        if self.module.constants.find(name).is_some() {
            return Err(self.error_at(at, format!("duplicate string '@{name}'")));
        }
        let mut origin = ConstOrigin::Source;
        let mut key = None;
        loop {
            self.skip_whitespace(false);
            if self.try_keyword("generated") {
                origin = ConstOrigin::Generated;
            } else if self.try_keyword("encrypted") {
                key = Some(self.read_u64()?);
            } else {
                break;
            }
        }
        let id = self.module.constants.push(name, bytes, origin);
        if let Some(entry) = self.module.constants.get_mut(id) {
            entry.key = key;
        }
        Ok(())
    }

    fn check_new_function(&self, at: usize, name: &str) -> PResult<()> {
        if self.module.function(name).is_some() {
            return Err(self.error_at(at, format!("duplicate function '@{name}'")));
        }
        Ok(())
    }

    fn read_return_and_attrs(&mut self) -> PResult<(Type, Vec<Attr>)> {
        self.expect(b'-')?;
        self.expect(b'>')?;
        let ret = self.read_type()?;
        let mut attrs = Vec::new();
        while self.try_read(b'#') {
            let at = self.pos;
            let word = self.read_identifier()?;
            let attr = Attr::parse(word)
                .ok_or_else(|| self.error_at(at, format!("unknown attribute '{word}'")))?;
            attrs.push(attr);
        }
        Ok((ret, attrs))
    }

    fn parse_declaration(&mut self) -> PResult<()> {
        let at = self.pos;
        let name = self.read_global_name()?;
        self.check_new_function(at, name)?;
        self.expect(b'(')?;
        let mut params = Vec::new();
        while !self.try_read(b')') {
            params.push(self.read_type()?);
            if !self.try_read(b',') && self.current() != Some(b')') {
                return Err(self.error("expected ',' or ')' in parameter list".to_string()));
            }
        }
        let (ret, attrs) = self.read_return_and_attrs()?;
        let mut func = Function::declare(name, &params, ret);
        for attr in attrs {
            func.add_attr(attr);
        }
        self.module.functions.push(func);
        Ok(())
    }

    fn parse_definition(&mut self) -> PResult<()> {
        let at = self.pos;
        let name = self.read_global_name()?;
        self.check_new_function(at, name)?;

        // Reset per-function state
        self.blocks.clear();
        self.values.clear();
        self.block_resolves.clear();
        self.value_resolves.clear();

        self.expect(b'(')?;
        let mut params: Vec<(&'a str, Type)> = Vec::new();
        while !self.try_read(b')') {
            let pat = self.pos;
            let pname = self.read_value_name()?;
            self.expect(b':')?;
            let ty = self.read_type()?;
            if params.iter().any(|(n, _)| *n == pname) {
                return Err(self.error_at(pat, format!("duplicate parameter '%{pname}'")));
            }
            params.push((pname, ty));
            if !self.try_read(b',') && self.current() != Some(b')') {
                return Err(self.error("expected ',' or ')' in parameter list".to_string()));
            }
        }
        let (ret, attrs) = self.read_return_and_attrs()?;

        let mut func = Function::new(name, &params, ret);
        for attr in attrs {
            func.add_attr(attr);
        }
        for (idx, (pname, _)) in params.iter().enumerate() {
            self.values.insert(*pname, func.params[idx]);
        }

        self.expect(b'{')?;
        let mut current: Option<BlockId> = None;
        loop {
            self.skip_whitespace(true);
            if self.try_read(b'}') {
                break;
            }
            if self.is_eof() {
                return Err(self.error("unexpected end of input inside function body".to_string()));
            }
            if let Some(label) = self.peek_label() {
                let lat = self.pos;
                self.read_identifier()?;
                self.expect(b':')?;
                if self.blocks.contains_key(label) {
                    return Err(self.error_at(lat, format!("duplicate block '{label}'")));
                }
                let block = func.add_block(label);
                self.blocks.insert(label, block);
                current = Some(block);
                continue;
            }
            let block = current
                .ok_or_else(|| self.error("instruction outside of a block".to_string()))?;
            self.parse_instruction(&mut func, block)?;
        }

        self.resolve_function_references(&mut func)?;
        self.module.functions.push(func);
        Ok(())
    }

    /// Name of a `label:` at the cursor, without consuming it.
    fn peek_label(&mut self) -> Option<&'a str> {
        let saved = self.pos;
        let label = self.read_identifier().ok();
        let has_colon = label.is_some() && self.current() == Some(b':');
        self.pos = saved;
        if has_colon {
            label
        } else {
            None
        }
    }

    // ----- instructions -----

    fn parse_instruction(&mut self, func: &mut Function, block: BlockId) -> PResult<()> {
        self.skip_whitespace(true);
        let at = self.pos;

        let (result, pending) = if self.current() == Some(b'%') {
            let name = self.read_value_name()?;
            self.expect(b'=')?;
            let op = self.read_identifier()?;
            (Some(name), self.parse_value_inst(op, at)?)
        } else {
            let op = self.read_identifier()?;
            (None, self.parse_effect_inst(op, at)?)
        };

        if pending.kind.is_phi() && func.block_insts(block).len() > func.phi_count(block) {
            return Err(self.error_at(at, "phi must be at the beginning of a block".to_string()));
        }

        let ty = match result {
            Some(_) if pending.ty == Type::Void => {
                return Err(self.error_at(at, "void instruction cannot define a value".to_string()))
            }
            Some(_) => pending.ty,
            None => Type::Void,
        };
        if result.is_none() && pending.ty != Type::Void {
            return Err(self.error_at(at, "instruction result must be named".to_string()));
        }
        if let Some(name) = result {
            if self.values.contains_key(name) {
                return Err(self.error_at(at, format!("redefinition of '%{name}'")));
            }
        }

        let inst = func.create_inst(pending.kind, ty, result.unwrap_or(""));
        func.append_inst(block, inst);
        if let (Some(name), Some(value)) = (result, func.result(inst)) {
            self.values.insert(name, value);
        }

        for (slot, name) in pending.values.into_iter().enumerate() {
            self.value_resolves.push(Resolve { name, inst, slot, at });
        }
        for (slot, name) in pending.blocks.into_iter().enumerate() {
            self.block_resolves.push(Resolve { name, inst, slot, at });
        }
        if let Some(name) = pending.string {
            self.string_resolves.push(StringResolve {
                name,
                func: self.module.functions.len(),
                inst,
                at,
            });
        }
        Ok(())
    }

    fn read_value_list(&mut self, count: usize) -> PResult<Vec<&'a str>> {
        let mut names = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 {
                self.expect(b',')?;
            }
            names.push(self.read_value_name()?);
        }
        Ok(names)
    }

    fn read_call_args(&mut self) -> PResult<(Callee<'a>, Vec<&'a str>)> {
        self.skip_whitespace(true);
        let callee = if self.current() == Some(b'%') {
            Callee::Indirect(self.read_value_name()?)
        } else {
            Callee::Direct(self.read_global_name()?)
        };
        self.expect(b'(')?;
        let mut args = Vec::new();
        while !self.try_read(b')') {
            args.push(self.read_value_name()?);
            if !self.try_read(b',') && self.current() != Some(b')') {
                return Err(self.error("expected ',' or ')' in argument list".to_string()));
            }
        }
        Ok((callee, args))
    }

    fn parse_value_inst(&mut self, op: &'a str, at: usize) -> PResult<PendingInst<'a>> {
        let v = UNRESOLVED_VALUE;
        let b = UNRESOLVED_BLOCK;

        if let Some(bin) = BinOp::parse(op) {
            let ty = self.read_type()?;
            let names = self.read_value_list(2)?;
            return Ok(PendingInst::new(InstKind::Binary { op: bin, lhs: v, rhs: v }, ty)
                .with_values(names));
        }
        if let Some(cast) = CastOp::parse(op) {
            let ty = self.read_type()?;
            let names = self.read_value_list(1)?;
            return Ok(PendingInst::new(InstKind::Cast { op: cast, value: v }, ty).with_values(names));
        }

        match op {
            "const" => {
                let ty = self.read_type()?;
                let value = self.read_i64()?;
                Ok(PendingInst::new(InstKind::Const { value }, ty))
            }
            "icmp" => {
                let pat = self.pos;
                let word = self.read_identifier()?;
                let pred = CmpPred::parse(word)
                    .ok_or_else(|| self.error_at(pat, format!("unknown predicate '{word}'")))?;
                let names = self.read_value_list(2)?;
                Ok(PendingInst::new(InstKind::Icmp { pred, lhs: v, rhs: v }, Type::I1)
                    .with_values(names))
            }
            "select" => {
                let ty = self.read_type()?;
                let names = self.read_value_list(3)?;
                Ok(PendingInst::new(InstKind::Select { cond: v, on_true: v, on_false: v }, ty)
                    .with_values(names))
            }
            "alloca" => {
                let elem = self.read_type()?;
                self.skip_whitespace(false);
                let count = if self.current() == Some(b',') {
                    self.advance();
                    let n = self.read_u64()?;
                    u32::try_from(n).map_err(|_| self.error("alloca count too large".to_string()))?
                } else {
                    1
                };
                Ok(PendingInst::new(InstKind::Alloca { elem, count }, Type::Ptr))
            }
            "load" => {
                let volatile = self.try_keyword("volatile");
                let ty = self.read_type()?;
                let names = self.read_value_list(1)?;
                Ok(PendingInst::new(InstKind::Load { ptr: v, volatile }, ty).with_values(names))
            }
            "gep" => {
                let names = self.read_value_list(2)?;
                Ok(PendingInst::new(InstKind::Gep { base: v, offset: v }, Type::Ptr)
                    .with_values(names))
            }
            "str" => {
                let name = self.read_global_name()?;
                let mut pending =
                    PendingInst::new(InstKind::StrRef { constant: ConstId(u32::MAX) }, Type::Ptr);
                pending.string = Some(name);
                Ok(pending)
            }
            "global" => {
                let name = self.read_global_name()?;
                Ok(PendingInst::new(InstKind::GlobalAddr { global: name.to_string() }, Type::Ptr))
            }
            "blockaddr" => {
                let name = self.read_block_name()?;
                Ok(PendingInst::new(InstKind::BlockAddr { block: b }, Type::Ptr)
                    .with_blocks(vec![name]))
            }
            "call" => {
                let ty = self.read_type()?;
                let (callee, args) = self.read_call_args()?;
                Ok(call_inst(callee, args, ty))
            }
            "phi" => {
                let ty = self.read_type()?;
                let mut blocks = Vec::new();
                let mut values = Vec::new();
                loop {
                    self.expect(b'[')?;
                    blocks.push(self.read_block_name()?);
                    self.expect(b',')?;
                    values.push(self.read_value_name()?);
                    self.expect(b']')?;
                    self.skip_whitespace(false);
                    if self.current() != Some(b',') {
                        break;
                    }
                    self.advance();
                }
                let kind = InstKind::Phi { incoming: vec![(b, v); values.len()] };
                Ok(PendingInst::new(kind, ty).with_values(values).with_blocks(blocks))
            }
            other => Err(self.error_at(at, format!("unknown instruction '{other}'"))),
        }
    }

    fn parse_effect_inst(&mut self, op: &'a str, at: usize) -> PResult<PendingInst<'a>> {
        let v = UNRESOLVED_VALUE;
        let b = UNRESOLVED_BLOCK;
        match op {
            "store" => {
                let volatile = self.try_keyword("volatile");
                let names = self.read_value_list(2)?;
                Ok(PendingInst::new(InstKind::Store { value: v, ptr: v, volatile }, Type::Void)
                    .with_values(names))
            }
            "call" => {
                let (callee, args) = self.read_call_args()?;
                Ok(call_inst(callee, args, Type::Void))
            }
            "br" => {
                let target = self.read_block_name()?;
                Ok(PendingInst::new(InstKind::Br { target: b }, Type::Void).with_blocks(vec![target]))
            }
            "condbr" => {
                let cond = self.read_value_name()?;
                self.expect(b',')?;
                let then_dest = self.read_block_name()?;
                self.expect(b',')?;
                let else_dest = self.read_block_name()?;
                Ok(PendingInst::new(
                    InstKind::CondBr { cond: v, then_dest: b, else_dest: b },
                    Type::Void,
                )
                .with_values(vec![cond])
                .with_blocks(vec![then_dest, else_dest]))
            }
            "switch" => {
                let value = self.read_value_name()?;
                self.expect(b',')?;
                let mut blocks = vec![self.read_block_name()?];
                let mut cases = Vec::new();
                self.expect(b'[')?;
                while !self.try_read(b']') {
                    let case = self.read_i64()?;
                    self.expect(b':')?;
                    blocks.push(self.read_block_name()?);
                    cases.push((case, b));
                    if !self.try_read(b',') && self.current() != Some(b']') {
                        return Err(self.error("expected ',' or ']' in switch cases".to_string()));
                    }
                }
                Ok(PendingInst::new(InstKind::Switch { value: v, default: b, cases }, Type::Void)
                    .with_values(vec![value])
                    .with_blocks(blocks))
            }
            "indirectbr" => {
                let addr = self.read_value_name()?;
                self.expect(b',')?;
                self.expect(b'[')?;
                let mut blocks = Vec::new();
                while !self.try_read(b']') {
                    blocks.push(self.read_block_name()?);
                    if !self.try_read(b',') && self.current() != Some(b']') {
                        return Err(self.error("expected ',' or ']' in destination list".to_string()));
                    }
                }
                Ok(PendingInst::new(
                    InstKind::IndirectBr { addr: v, dests: vec![b; blocks.len()] },
                    Type::Void,
                )
                .with_values(vec![addr])
                .with_blocks(blocks))
            }
            "ret" => {
                self.skip_whitespace(false);
                if self.current() == Some(b'%') {
                    let value = self.read_value_name()?;
                    Ok(PendingInst::new(InstKind::Ret { value: Some(v) }, Type::Void)
                        .with_values(vec![value]))
                } else {
                    Ok(PendingInst::new(InstKind::Ret { value: None }, Type::Void))
                }
            }
            "unreachable" => Ok(PendingInst::new(InstKind::Unreachable, Type::Void)),
            other => Err(self.error_at(at, format!("unknown instruction '{other}'"))),
        }
    }

    // ----- resolution -----

    fn resolve_function_references(&mut self, func: &mut Function) -> PResult<()> {
        for r in &self.value_resolves {
            let id = *self
                .values
                .get(r.name)
                .ok_or_else(|| self.error_at(r.at, format!("undefined value '%{}'", r.name)))?;
            if let Some(op) = func.inst_mut(r.inst).kind.operands_mut().into_iter().nth(r.slot) {
                *op = id;
            }
        }
        for r in &self.block_resolves {
            let id = *self
                .blocks
                .get(r.name)
                .ok_or_else(|| self.error_at(r.at, format!("undefined block '^{}'", r.name)))?;
            if let Some(slot) = func.inst_mut(r.inst).kind.block_refs_mut().into_iter().nth(r.slot) {
                *slot = id;
            }
        }
        Ok(())
    }

    fn resolve_strings(&mut self) -> PResult<()> {
        for r in &self.string_resolves {
            let id = self
                .module
                .constants
                .find(r.name)
                .ok_or_else(|| self.error_at(r.at, format!("undefined string '@{}'", r.name)))?;
            let inst = self.module.functions[r.func].inst_mut(r.inst);
            inst.kind = InstKind::StrRef { constant: id };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_function() {
        let module = parse_module(
            "define @add(%a: i32, %b: i32) -> i32 {\nentry:\n  %s = add i32 %a, %b\n  ret %s\n}\n",
        )
        .unwrap();
        let func = module.function("add").unwrap();
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.block_count(), 1);
        let entry = func.entry().unwrap();
        assert_eq!(func.block_insts(entry).len(), 2);
        assert!(func.terminator(entry).is_some());
    }

    #[test]
    fn test_forward_references_resolve() {
        let module = parse_module(
            r#"
define @loop(%n: i32) -> i32 {
entry:
  %zero = const i32 0
  br ^head
head:
  %i = phi i32 [^entry, %zero], [^body, %next]
  %done = icmp sge %i, %n
  condbr %done, ^exit, ^body
body:
  %one = const i32 1
  %next = add i32 %i, %one
  br ^head
exit:
  ret %i
}
"#,
        )
        .unwrap();
        let func = module.function("loop").unwrap();
        let head = func.block_by_name("head").unwrap();
        let phi = func.block_insts(head)[0];
        match &func.inst(phi).kind {
            InstKind::Phi { incoming } => {
                assert_eq!(incoming.len(), 2);
                assert_eq!(func.block_name(incoming[1].0), "body");
                assert_eq!(func.value_name(incoming[1].1), "next");
            }
            other => panic!("expected phi, got {other:?}"),
        }
    }

    #[test]
    fn test_strings_and_markers() {
        let module = parse_module(
            "string @.a = \"hi\\0A\"\nstring @.b = \"x\" generated\nstring @.c = \"\\01\" encrypted 0x2a\n",
        )
        .unwrap();
        let a = module.constants.get(ConstId(0)).unwrap();
        assert_eq!(a.bytes, b"hi\n");
        let b = module.constants.get(ConstId(1)).unwrap();
        assert_eq!(b.origin, ConstOrigin::Generated);
        let c = module.constants.get(ConstId(2)).unwrap();
        assert_eq!(c.key, Some(42));
    }

    #[test]
    fn test_error_reports_position() {
        let err = parse_module("define @f() -> i32 {\nentry:\n  %x = frob i32 %y\n}\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("frob"));
    }

    #[test]
    fn test_undefined_value_is_error() {
        let err = parse_module("define @f() -> i32 {\nentry:\n  ret %nope\n}\n").unwrap_err();
        assert!(err.message.contains("undefined value"));
    }

    #[test]
    fn test_phi_after_body_rejected() {
        let err = parse_module(
            "define @f(%a: i32) -> i32 {\nentry:\n  br ^b\nb:\n  %c = const i32 1\n  %p = phi i32 [^entry, %a]\n  ret %p\n}\n",
        )
        .unwrap_err();
        assert!(err.message.contains("phi"));
    }
}
