use std::fmt;

use crate::cpuid::{CpuSnapshot, RegisterName, VendorMask};
use crate::error::Error;
use crate::feature;

/// Whole-register sentinel for `bit_lo`/`bit_hi`.
pub const WHOLE_REGISTER: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A parsed flag reference such as `CPUID.(EAX=07H,ECX=0):EBX.BMI1[bit 3]`.
pub struct FlagSpec {
    pub selector_eax: u32,
    pub selector_ecx: u32,
    pub register: RegisterName,
    pub name: String,
    pub bit_lo: u32,
    pub bit_hi: u32,
}

impl Default for FlagSpec {
    fn default() -> FlagSpec {
        FlagSpec {
            selector_eax: 0,
            selector_ecx: 0,
            register: RegisterName::EAX,
            name: String::new(),
            bit_lo: WHOLE_REGISTER,
            bit_hi: WHOLE_REGISTER,
        }
    }
}

impl fmt::Display for FlagSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CPUID.(EAX={:X}H,ECX={:X}H):{}",
            self.selector_eax,
            self.selector_ecx,
            self.register.as_str().to_ascii_uppercase()
        )?;
        if !self.name.is_empty() {
            write!(f, ".{}", self.name)?;
        }
        if self.bit_lo != WHOLE_REGISTER {
            if self.bit_lo == self.bit_hi {
                write!(f, "[bit {}]", self.bit_lo)?;
            } else {
                write!(f, "[bits {}:{}]", self.bit_hi, self.bit_lo)?;
            }
        }
        Ok(())
    }
}

struct Cursor<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Cursor<'a> {
        Cursor {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn fail(&self, reason: &'static str) -> Error {
        Error::ParseFlag {
            spec: self.text.to_string(),
            reason,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.bytes.len()
    }

    fn eat(&mut self, chr: u8) -> bool {
        self.skip_whitespace();
        if self.peek() == Some(chr) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume `keyword` case-insensitively if it is next.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace();
        let end = self.pos + keyword.len();
        if end > self.bytes.len() {
            return false;
        }
        if self.text[self.pos..end].eq_ignore_ascii_case(keyword) {
            self.pos = end;
            true
        } else {
            false
        }
    }

    /// Hex number with optional `0x` prefix and optional `H` suffix.
    fn hex_number(&mut self) -> Option<u32> {
        self.skip_whitespace();
        let mark = self.pos;
        if self.text[self.pos..].starts_with("0x") || self.text[self.pos..].starts_with("0X") {
            self.pos += 2;
        }
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_hexdigit() {
            self.pos += 1;
        }
        if self.pos == start {
            self.pos = mark;
            return None;
        }
        match u32::from_str_radix(&self.text[start..self.pos], 16) {
            Ok(value) => {
                if self.peek() == Some(b'H') || self.peek() == Some(b'h') {
                    self.pos += 1;
                }
                Some(value)
            }
            Err(_) => {
                self.pos = mark;
                None
            }
        }
    }

    fn dec_number(&mut self) -> Option<u32> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        self.text[start..self.pos].parse().ok()
    }

    /// Take characters up to (not including) any of `stops`.
    fn take_until(&mut self, stops: &[u8]) -> &'a str {
        let start = self.pos;
        while self.pos < self.bytes.len() && !stops.contains(&self.bytes[self.pos]) {
            self.pos += 1;
        }
        &self.text[start..self.pos]
    }
}

/// Parse one textual flag specification. Whitespace is insignificant,
/// registers and names are case-insensitive, selector parentheses and
/// `H`/`0x` markers are optional, and a missing `ECX=` means subleaf 0.
pub fn parse_flag_spec(input: &str) -> Result<FlagSpec, Error> {
    let mut cursor = Cursor::new(input);
    let mut spec = FlagSpec::default();

    if !cursor.eat_keyword("CPUID") {
        return Err(cursor.fail("expected CPUID prefix"));
    }
    if !cursor.eat(b'.') {
        return Err(cursor.fail("expected '.' after CPUID"));
    }

    parse_selector(&mut cursor, &mut spec)?;

    if !cursor.eat(b':') && !cursor.eat(b'.') {
        return Err(cursor.fail("expected ':' or '.' before register"));
    }

    spec.register = parse_register(&mut cursor)?;

    if cursor.eat(b'.') {
        let name = cursor.take_until(&[b'[', b'(']);
        spec.name = name.trim().to_ascii_lowercase();
    }

    if cursor.eat(b'[') {
        parse_bracket(&mut cursor, &mut spec)?;
        if !cursor.eat(b']') {
            return Err(cursor.fail("unterminated '['"));
        }
    } else if cursor.eat(b'(') {
        if !cursor.eat_keyword("bit") {
            return Err(cursor.fail("expected 'bit' in parenthesized position"));
        }
        let bit = cursor
            .dec_number()
            .ok_or_else(|| cursor.fail("expected bit number"))?;
        spec.bit_lo = bit;
        spec.bit_hi = bit;
        if !cursor.eat(b')') {
            return Err(cursor.fail("unterminated '('"));
        }
    }

    if !cursor.at_end() {
        return Err(cursor.fail("trailing characters"));
    }
    Ok(spec)
}

fn parse_selector(cursor: &mut Cursor, spec: &mut FlagSpec) -> Result<(), Error> {
    if cursor.eat(b'(') {
        if !cursor.eat_keyword("EAX") || !cursor.eat(b'=') {
            return Err(cursor.fail("expected EAX= in selector"));
        }
        spec.selector_eax = cursor
            .hex_number()
            .ok_or_else(|| cursor.fail("expected leaf number"))?;
        if cursor.eat(b',') {
            if !cursor.eat_keyword("ECX") || !cursor.eat(b'=') {
                return Err(cursor.fail("expected ECX= in selector"));
            }
            spec.selector_ecx = cursor
                .hex_number()
                .ok_or_else(|| cursor.fail("expected subleaf number"))?;
        }
        if !cursor.eat(b')') {
            return Err(cursor.fail("unterminated selector"));
        }
        return Ok(());
    }

    if cursor.eat_keyword("EAX=") {
        spec.selector_eax = cursor
            .hex_number()
            .ok_or_else(|| cursor.fail("expected leaf number"))?;
        return Ok(());
    }

    spec.selector_eax = cursor
        .hex_number()
        .ok_or_else(|| cursor.fail("expected leaf number"))?;

    // A `.N` between leaf and register is a subleaf, as in `0x7.0:EBX`.
    // Register names never parse as a full hex number followed by a
    // separator, so a failed probe here rolls back cleanly.
    let mark = cursor.pos;
    if cursor.eat(b'.') {
        if let Some(subleaf) = cursor.hex_number() {
            if cursor.peek() == Some(b'.') || cursor.peek() == Some(b':') {
                spec.selector_ecx = subleaf;
                return Ok(());
            }
        }
        cursor.pos = mark;
    }
    Ok(())
}

fn parse_register(cursor: &mut Cursor) -> Result<RegisterName, Error> {
    for (keyword, register) in &[
        ("EAX", RegisterName::EAX),
        ("EBX", RegisterName::EBX),
        ("ECX", RegisterName::ECX),
        ("EDX", RegisterName::EDX),
    ] {
        if cursor.eat_keyword(keyword) {
            return Ok(*register);
        }
    }
    Err(cursor.fail("expected register name"))
}

fn parse_bracket(cursor: &mut Cursor, spec: &mut FlagSpec) -> Result<(), Error> {
    cursor.skip_whitespace();

    if cursor.eat_keyword("bits") || cursor.eat_keyword("bit") {
        let first = cursor
            .dec_number()
            .ok_or_else(|| cursor.fail("expected bit number"))?;
        if cursor.eat(b':') || cursor.eat(b'-') {
            let second = cursor
                .dec_number()
                .ok_or_else(|| cursor.fail("expected closing bit number"))?;
            spec.bit_lo = first.min(second);
            spec.bit_hi = first.max(second);
        } else {
            spec.bit_lo = first;
            spec.bit_hi = first;
        }
        return Ok(());
    }

    if let Some(first) = cursor.dec_number() {
        if cursor.eat(b':') || cursor.eat(b'-') {
            let second = cursor
                .dec_number()
                .ok_or_else(|| cursor.fail("expected closing bit number"))?;
            spec.bit_lo = first.min(second);
            spec.bit_hi = first.max(second);
        } else {
            spec.bit_lo = first;
            spec.bit_hi = first;
        }
        return Ok(());
    }

    // A bare name selects the whole register: `[SSE4.2]`.
    let name = cursor.take_until(&[b']']);
    if name.trim().is_empty() {
        return Err(cursor.fail("empty bit selection"));
    }
    spec.name = name.trim().to_ascii_lowercase();
    Ok(())
}

/// Resolve a flag spec against one snapshot. Explicit bit positions read
/// the register directly; a named whole-register spec goes through the
/// catalogue (an unknown mnemonic is an error unless `lenient`). Returns
/// `None` when the snapshot never observed the selected leaf/subleaf.
pub fn evaluate(
    snapshot: &CpuSnapshot,
    spec: &FlagSpec,
    lenient: bool,
) -> Result<Option<u32>, Error> {
    let regs = match snapshot.get_subleaf(spec.selector_eax, spec.selector_ecx) {
        Some(regs) => regs,
        None => return Ok(None),
    };
    let register = regs.register(spec.register);

    if spec.bit_lo != WHOLE_REGISTER {
        let width = spec.bit_hi - spec.bit_lo + 1;
        let mask = if width >= 32 {
            u32::MAX
        } else {
            ((1u32 << width) - 1) << spec.bit_lo
        };
        return Ok(Some((register & mask) >> spec.bit_lo));
    }

    if spec.name.is_empty() {
        return Ok(Some(register));
    }

    let vendor = if lenient {
        VendorMask::all()
    } else {
        snapshot.vendor
    };
    match feature::find(
        spec.selector_eax,
        spec.selector_ecx,
        spec.register,
        vendor,
        &spec.name,
    ) {
        Some(found) => Ok(Some(found.bits.extract(register))),
        None if lenient => Ok(Some(register)),
        None => Err(Error::CatalogueMiss(spec.name.clone())),
    }
}
