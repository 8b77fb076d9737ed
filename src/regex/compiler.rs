// File: src/regex/compiler.rs
//
// Regular expression compiler: lowers ES2020/ES2025 pattern syntax (with
// Annex B fallbacks, named groups, lookaround, Unicode property escapes)
// to the bytecode defined in regex/mod.rs.

use crate::errors::JsError;
use crate::regex::{flags, unicode, ByteBuffer, CharacterClass, ReOp, RegexBytecode};
use std::collections::{HashMap, HashSet};

const DIGIT_RANGES: &[(u32, u32)] = &[(0x30, 0x39)];
const WORD_RANGES: &[(u32, u32)] = &[(0x30, 0x39), (0x41, 0x5A), (0x5F, 0x5F), (0x61, 0x7A)];
const SPACE_RANGES: &[(u32, u32)] = &[
    (0x9, 0xD),
    (0x20, 0x20),
    (0xA0, 0xA0),
    (0x1680, 0x1680),
    (0x2000, 0x200A),
    (0x2028, 0x2029),
    (0x202F, 0x202F),
    (0x205F, 0x205F),
    (0x3000, 0x3000),
    (0xFEFF, 0xFEFF),
];

/// Compile a pattern and flag string into regex bytecode
pub fn compile(pattern: &str, flag_str: &str) -> Result<RegexBytecode, JsError> {
    let mut flag_bits = parse_flags(flag_str)?;

    let chars: Vec<char> = pattern.chars().collect();
    let prescan = prescan(&chars)?;
    if !prescan.named.is_empty() {
        flag_bits |= flags::NAMED_GROUPS;
    }

    let mut compiler = Compiler {
        chars,
        pos: 0,
        flags: flag_bits,
        next_capture: 1,
        total_captures: prescan.total_captures,
        named: prescan.named,
        group_names: vec![None; prescan.total_captures as usize + 1],
        next_register: 0,
    };
    for (name, index) in &compiler.named {
        compiler.group_names[*index as usize] = Some(name.clone());
    }

    let mut buf = ByteBuffer::new();
    buf.push_op(ReOp::SaveStart);
    buf.push_u8(0);
    let body = compiler.compile_disjunction()?;
    if compiler.pos < compiler.chars.len() {
        return Err(JsError::regex_syntax("unmatched ')' in pattern"));
    }
    buf.push_bytes(body.as_slice());
    buf.push_op(ReOp::SaveEnd);
    buf.push_u8(0);
    buf.push_op(ReOp::Match);

    let group_names = if compiler.group_names.iter().any(|n| n.is_some()) {
        Some(compiler.group_names)
    } else {
        None
    };

    Ok(RegexBytecode {
        instructions: buf.into_vec(),
        flags: flag_bits,
        capture_count: prescan.total_captures + 1,
        group_names,
    })
}

fn parse_flags(flag_str: &str) -> Result<u32, JsError> {
    let mut bits = 0u32;
    for c in flag_str.chars() {
        let bit = match c {
            'g' => flags::GLOBAL,
            'i' => flags::IGNORE_CASE,
            'm' => flags::MULTILINE,
            's' => flags::DOT_ALL,
            'u' => flags::UNICODE,
            'y' => flags::STICKY,
            'd' => flags::INDICES,
            'v' => flags::UNICODE_SETS,
            _ => return Err(JsError::regex_syntax(format!("invalid regex flag '{}'", c))),
        };
        if bits & bit != 0 {
            return Err(JsError::regex_syntax(format!("duplicate regex flag '{}'", c)));
        }
        bits |= bit;
    }
    if bits & flags::UNICODE != 0 && bits & flags::UNICODE_SETS != 0 {
        return Err(JsError::regex_syntax("regex flags 'u' and 'v' are mutually exclusive"));
    }
    Ok(bits)
}

struct Prescan {
    total_captures: u32,
    /// name -> first capture index
    named: HashMap<String, u32>,
}

/// Frame of the duplicate-name tracker: one seen-set per alternative of the
/// disjunction at this nesting level
struct AltFrame {
    alt_sets: Vec<HashSet<String>>,
}

impl AltFrame {
    fn new() -> Self {
        Self { alt_sets: vec![HashSet::new()] }
    }

    fn current(&mut self) -> &mut HashSet<String> {
        self.alt_sets.last_mut().unwrap()
    }
}

/// Walk the pattern once: count capturing groups and collect named-group
/// indices. Duplicate names are admitted only across different alternatives
/// of the same disjunction (ES2025).
fn prescan(chars: &[char]) -> Result<Prescan, JsError> {
    let mut total = 0u32;
    let mut named: HashMap<String, u32> = HashMap::new();
    let mut frames = vec![AltFrame::new()];
    let mut pos = 0usize;

    while pos < chars.len() {
        match chars[pos] {
            '\\' => pos += 2,
            '[' => {
                pos += 1;
                while pos < chars.len() && chars[pos] != ']' {
                    if chars[pos] == '\\' {
                        pos += 1;
                    }
                    pos += 1;
                }
                pos += 1;
            }
            '|' => {
                frames.last_mut().unwrap().alt_sets.push(HashSet::new());
                pos += 1;
            }
            ')' => {
                if frames.len() > 1 {
                    let frame = frames.pop().unwrap();
                    let union: HashSet<String> =
                        frame.alt_sets.into_iter().flatten().collect();
                    let parent = frames.last_mut().unwrap().current();
                    for name in union {
                        if !parent.insert(name.clone()) {
                            return Err(JsError::regex_syntax(format!(
                                "duplicate capture group name '{}'",
                                name
                            )));
                        }
                    }
                }
                pos += 1;
            }
            '(' => {
                pos += 1;
                frames.push(AltFrame::new());
                if pos < chars.len() && chars[pos] == '?' {
                    match chars.get(pos + 1) {
                        Some(':') | Some('=') | Some('!') | Some('>') => {}
                        Some('<') if matches!(chars.get(pos + 2), Some('=') | Some('!')) => {}
                        Some('<') => {
                            // Named capturing group
                            let mut name = String::new();
                            let mut scan = pos + 2;
                            while scan < chars.len() && chars[scan] != '>' {
                                name.push(chars[scan]);
                                scan += 1;
                            }
                            if scan >= chars.len() || name.is_empty() {
                                return Err(JsError::regex_syntax(
                                    "malformed named capture group",
                                ));
                            }
                            total += 1;
                            let frame = frames.last_mut().unwrap();
                            if !frame.current().insert(name.clone()) {
                                return Err(JsError::regex_syntax(format!(
                                    "duplicate capture group name '{}'",
                                    name
                                )));
                            }
                            named.entry(name).or_insert(total);
                        }
                        _ => total += 1,
                    }
                } else {
                    total += 1;
                }
            }
            _ => pos += 1,
        }
    }

    Ok(Prescan { total_captures: total, named })
}

struct Compiler {
    chars: Vec<char>,
    pos: usize,
    flags: u32,
    next_capture: u32,
    total_captures: u32,
    named: HashMap<String, u32>,
    group_names: Vec<Option<String>>,
    /// Next free SET_CHAR_POS/CHECK_ADVANCE register; nested quantifier
    /// loops must not share one
    next_register: u8,
}

/// What the quantifier pass needs to know about the previous atom
struct AtomInfo {
    can_repeat: bool,
    /// Range of capture indices allocated inside the atom, for SAVE_RESET
    captures: Option<(u32, u32)>,
}

impl Compiler {
    fn is_unicode(&self) -> bool {
        self.flags & (flags::UNICODE | flags::UNICODE_SETS) != 0
    }

    fn ignore_case(&self) -> bool {
        self.flags & flags::IGNORE_CASE != 0
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Disjunction: alternatives assembled right to left so each `|` becomes
    /// a SPLIT_NEXT_FIRST over the first branch and a GOTO past the rest
    fn compile_disjunction(&mut self) -> Result<ByteBuffer, JsError> {
        let mut alts = vec![self.compile_alternative()?];
        while self.eat('|') {
            alts.push(self.compile_alternative()?);
        }

        let mut result = alts.pop().unwrap();
        while let Some(alt) = alts.pop() {
            let mut assembled = ByteBuffer::new();
            assembled.push_op(ReOp::SplitNextFirst);
            assembled.push_i32(alt.len() as i32 + 5);
            assembled.push_bytes(alt.as_slice());
            assembled.push_op(ReOp::Goto);
            assembled.push_i32(result.len() as i32);
            assembled.push_bytes(result.as_slice());
            result = assembled;
        }
        Ok(result)
    }

    fn compile_alternative(&mut self) -> Result<ByteBuffer, JsError> {
        let mut buf = ByteBuffer::new();
        while let Some(c) = self.peek() {
            if c == '|' || c == ')' {
                break;
            }
            let (atom, info) = self.compile_atom()?;
            self.apply_quantifier(&mut buf, atom, info)?;
        }
        Ok(buf)
    }

    fn compile_atom(&mut self) -> Result<(ByteBuffer, AtomInfo), JsError> {
        let mut buf = ByteBuffer::new();
        let c = self.bump().expect("caller checked for input");
        let mut info = AtomInfo { can_repeat: true, captures: None };

        match c {
            '^' => {
                buf.push_op(if self.flags & flags::MULTILINE != 0 {
                    ReOp::LineStartM
                } else {
                    ReOp::LineStart
                });
                info.can_repeat = false;
            }
            '$' => {
                buf.push_op(if self.flags & flags::MULTILINE != 0 {
                    ReOp::LineEndM
                } else {
                    ReOp::LineEnd
                });
                info.can_repeat = false;
            }
            '.' => {
                buf.push_op(if self.flags & flags::DOT_ALL != 0 { ReOp::Any } else { ReOp::Dot });
            }
            '(' => return self.compile_group(),
            '[' => {
                let class = self.parse_class()?;
                emit_class(&mut buf, &class, self.ignore_case());
            }
            '\\' => {
                let can_repeat = self.compile_escape(&mut buf)?;
                info.can_repeat = can_repeat;
            }
            '*' | '+' | '?' => {
                return Err(JsError::regex_syntax(format!("nothing to repeat before '{}'", c)));
            }
            '{' | '}' | ']' if self.is_unicode() => {
                return Err(JsError::regex_syntax(format!("lone '{}' in unicode pattern", c)));
            }
            _ => emit_literal(&mut buf, c as u32, self.ignore_case()),
        }

        Ok((buf, info))
    }

    fn compile_group(&mut self) -> Result<(ByteBuffer, AtomInfo), JsError> {
        let mut buf = ByteBuffer::new();
        let mut info = AtomInfo { can_repeat: true, captures: None };

        if self.eat('?') {
            match self.peek() {
                Some(':') => {
                    self.bump();
                    let first = self.next_capture;
                    let body = self.compile_disjunction()?;
                    self.expect_group_close()?;
                    buf.push_bytes(body.as_slice());
                    if self.next_capture > first {
                        info.captures = Some((first, self.next_capture - 1));
                    }
                }
                Some('=') => {
                    self.bump();
                    self.compile_lookaround(&mut buf, ReOp::Lookahead, ReOp::LookaheadMatch)?;
                    info.can_repeat = !self.is_unicode();
                }
                Some('!') => {
                    self.bump();
                    self.compile_lookaround(
                        &mut buf,
                        ReOp::NegativeLookahead,
                        ReOp::NegativeLookaheadMatch,
                    )?;
                    info.can_repeat = !self.is_unicode();
                }
                Some('<') if matches!(self.peek_at(1), Some('=') | Some('!')) => {
                    self.bump();
                    let negative = self.bump() == Some('!');
                    if negative {
                        self.compile_lookaround(
                            &mut buf,
                            ReOp::NegativeLookbehind,
                            ReOp::NegativeLookbehindMatch,
                        )?;
                    } else {
                        self.compile_lookaround(&mut buf, ReOp::Lookbehind, ReOp::LookbehindMatch)?;
                    }
                    info.can_repeat = false;
                }
                Some('<') => {
                    self.bump();
                    let mut name = String::new();
                    while let Some(c) = self.peek() {
                        if c == '>' {
                            break;
                        }
                        name.push(c);
                        self.bump();
                    }
                    if !self.eat('>') {
                        return Err(JsError::regex_syntax("malformed named capture group"));
                    }
                    // Positional index was consumed by the pre-scan; the name
                    // maps every occurrence to its first index so duplicate
                    // alternatives share one capture slot
                    self.next_capture += 1;
                    let index = *self
                        .named
                        .get(&name)
                        .ok_or_else(|| JsError::regex_syntax("malformed named capture group"))?;
                    self.compile_capture(&mut buf, index)?;
                    info.captures = Some((index, (self.next_capture - 1).max(index)));
                }
                Some('>') => {
                    return Err(JsError::regex_syntax("atomic groups are not supported"));
                }
                _ => return Err(JsError::regex_syntax("invalid group syntax")),
            }
        } else {
            let index = self.next_capture;
            self.next_capture += 1;
            let first = index;
            self.compile_capture(&mut buf, index)?;
            info.captures = Some((first, self.next_capture - 1));
        }

        Ok((buf, info))
    }

    fn compile_capture(&mut self, buf: &mut ByteBuffer, index: u32) -> Result<(), JsError> {
        if index > 255 {
            return Err(JsError::regex_syntax("too many capture groups"));
        }
        buf.push_op(ReOp::SaveStart);
        buf.push_u8(index as u8);
        let body = self.compile_disjunction()?;
        self.expect_group_close()?;
        buf.push_bytes(body.as_slice());
        buf.push_op(ReOp::SaveEnd);
        buf.push_u8(index as u8);
        Ok(())
    }

    fn compile_lookaround(
        &mut self,
        buf: &mut ByteBuffer,
        open: ReOp,
        close: ReOp,
    ) -> Result<(), JsError> {
        let body = self.compile_disjunction()?;
        self.expect_group_close()?;
        buf.push_op(open);
        buf.push_u32(body.len() as u32 + 1);
        buf.push_bytes(body.as_slice());
        buf.push_op(close);
        Ok(())
    }

    fn expect_group_close(&mut self) -> Result<(), JsError> {
        if !self.eat(')') {
            return Err(JsError::regex_syntax("missing ')' in pattern"));
        }
        Ok(())
    }

    // === Quantifiers ===

    fn apply_quantifier(
        &mut self,
        out: &mut ByteBuffer,
        atom: ByteBuffer,
        info: AtomInfo,
    ) -> Result<(), JsError> {
        let quantifier = match self.peek() {
            Some('*') => {
                self.bump();
                Some((0u32, None))
            }
            Some('+') => {
                self.bump();
                Some((1, None))
            }
            Some('?') => {
                self.bump();
                Some((0, Some(1)))
            }
            Some('{') => match self.try_parse_braced_quantifier()? {
                Some(bounds) => Some(bounds),
                None => None,
            },
            _ => None,
        };

        let Some((min, max)) = quantifier else {
            out.push_bytes(atom.as_slice());
            return Ok(());
        };

        if !info.can_repeat {
            return Err(JsError::regex_syntax("nothing to repeat"));
        }
        if let Some(max) = max {
            if max < min {
                return Err(JsError::regex_syntax("numbers out of order in {} quantifier"));
            }
        }

        let greedy = !self.eat('?');
        let needs_guard = atom_can_match_empty(atom.as_slice());

        // Stale captures from a previous iteration must not leak
        if let Some((first, last)) = info.captures {
            out.push_op(ReOp::SaveReset);
            out.push_u8(first as u8);
            out.push_u8(last as u8);
        }

        let guard_register = if needs_guard {
            let reg = self.next_register;
            self.next_register = self.next_register.wrapping_add(1);
            reg
        } else {
            0
        };

        match max {
            None => {
                for _ in 0..min {
                    out.push_bytes(atom.as_slice());
                }
                emit_star_loop(out, &atom, greedy, needs_guard, guard_register);
            }
            Some(max) => {
                for _ in 0..min {
                    out.push_bytes(atom.as_slice());
                }
                // Optional copies, assembled right to left so each split can
                // bail out past everything that follows
                let mut tail = ByteBuffer::new();
                for _ in 0..(max - min) {
                    let mut next = ByteBuffer::new();
                    next.push_op(if greedy {
                        ReOp::SplitNextFirst
                    } else {
                        ReOp::SplitGotoFirst
                    });
                    next.push_i32((atom.len() + tail.len()) as i32);
                    next.push_bytes(atom.as_slice());
                    next.push_bytes(tail.as_slice());
                    tail = next;
                }
                out.push_bytes(tail.as_slice());
            }
        }
        Ok(())
    }

    /// Parse `{n}`, `{n,}` or `{n,m}` after the opening brace has been seen.
    /// In non-unicode mode a malformed form decays to a literal `{` (Annex B)
    /// and None is returned with the position unchanged.
    fn try_parse_braced_quantifier(&mut self) -> Result<Option<(u32, Option<u32>)>, JsError> {
        let start = self.pos;
        self.bump(); // {

        let min = self.parse_decimal();
        let result = match (min, self.peek()) {
            (Some(min), Some('}')) => {
                self.bump();
                Some((min, Some(min)))
            }
            (Some(min), Some(',')) => {
                self.bump();
                if self.eat('}') {
                    Some((min, None))
                } else {
                    match (self.parse_decimal(), self.peek()) {
                        (Some(max), Some('}')) => {
                            self.bump();
                            Some((min, Some(max)))
                        }
                        _ => None,
                    }
                }
            }
            _ => None,
        };

        if result.is_none() {
            if self.is_unicode() {
                return Err(JsError::regex_syntax("malformed {} quantifier"));
            }
            self.pos = start;
        }
        Ok(result)
    }

    fn parse_decimal(&mut self) -> Option<u32> {
        let mut value: u32 = 0;
        let mut any = false;
        while let Some(c) = self.peek() {
            if let Some(d) = c.to_digit(10) {
                value = value.saturating_mul(10).saturating_add(d);
                any = true;
                self.bump();
            } else {
                break;
            }
        }
        if any {
            Some(value)
        } else {
            None
        }
    }

    // === Escapes ===

    /// Compile a `\` escape outside a character class. Returns whether the
    /// resulting atom may be quantified.
    fn compile_escape(&mut self, buf: &mut ByteBuffer) -> Result<bool, JsError> {
        let c = match self.bump() {
            Some(c) => c,
            None => return Err(JsError::regex_syntax("pattern may not end with '\\'")),
        };

        match c {
            'd' => emit_ranges(buf, DIGIT_RANGES, false, self.ignore_case()),
            'D' => emit_ranges(buf, DIGIT_RANGES, true, self.ignore_case()),
            'w' => emit_ranges(buf, WORD_RANGES, false, self.ignore_case()),
            'W' => emit_ranges(buf, WORD_RANGES, true, self.ignore_case()),
            's' => buf.push_op(ReOp::Space),
            'S' => buf.push_op(ReOp::NotSpace),
            'b' => {
                buf.push_op(if self.ignore_case() && self.is_unicode() {
                    ReOp::WordBoundaryI
                } else {
                    ReOp::WordBoundary
                });
                return Ok(false);
            }
            'B' => {
                buf.push_op(if self.ignore_case() && self.is_unicode() {
                    ReOp::NotWordBoundaryI
                } else {
                    ReOp::NotWordBoundary
                });
                return Ok(false);
            }
            'k' => {
                if self.peek() == Some('<') {
                    self.bump();
                    let mut name = String::new();
                    while let Some(c) = self.peek() {
                        if c == '>' {
                            break;
                        }
                        name.push(c);
                        self.bump();
                    }
                    if !self.eat('>') {
                        return Err(JsError::regex_syntax("malformed \\k<name> backreference"));
                    }
                    match self.named.get(&name) {
                        Some(&index) => emit_backreference(buf, index, self.ignore_case())?,
                        None => {
                            return Err(JsError::regex_syntax(format!(
                                "unknown capture group name '{}'",
                                name
                            )))
                        }
                    }
                } else if self.is_unicode() || !self.named.is_empty() {
                    return Err(JsError::regex_syntax("malformed \\k<name> backreference"));
                } else {
                    emit_literal(buf, 'k' as u32, self.ignore_case());
                }
            }
            '1'..='9' => {
                let start = self.pos - 1;
                let mut num = c.to_digit(10).unwrap();
                while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
                    num = num.saturating_mul(10).saturating_add(d);
                    self.bump();
                }
                if num <= self.total_captures {
                    emit_backreference(buf, num, self.ignore_case())?;
                } else if self.is_unicode() {
                    return Err(JsError::regex_syntax(format!("invalid backreference \\{}", num)));
                } else {
                    // Legacy octal fallback (Annex B); \8 and \9 are
                    // identity escapes
                    self.pos = start;
                    if matches!(self.peek(), Some('8') | Some('9')) {
                        let d = self.bump().unwrap();
                        emit_literal(buf, d as u32, self.ignore_case());
                    } else {
                        let cp = self.parse_legacy_octal();
                        emit_literal(buf, cp, self.ignore_case());
                    }
                }
            }
            '0' => {
                if self.is_unicode() {
                    if self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                        return Err(JsError::regex_syntax("invalid \\0 escape in unicode mode"));
                    }
                    emit_literal(buf, 0, self.ignore_case());
                } else {
                    self.pos -= 1;
                    let cp = self.parse_legacy_octal();
                    emit_literal(buf, cp, self.ignore_case());
                }
            }
            'p' | 'P' => {
                if self.is_unicode() {
                    let class = self.parse_property_class(c == 'P')?;
                    emit_class(buf, &class, self.ignore_case());
                } else {
                    emit_literal(buf, c as u32, self.ignore_case());
                }
            }
            'x' => match self.parse_fixed_hex(2) {
                Some(cp) => emit_literal(buf, cp, self.ignore_case()),
                None if self.is_unicode() => {
                    return Err(JsError::regex_syntax("invalid \\x escape"))
                }
                None => emit_literal(buf, 'x' as u32, self.ignore_case()),
            },
            'u' => match self.parse_unicode_escape()? {
                Some(cp) => emit_literal(buf, cp, self.ignore_case()),
                None => emit_literal(buf, 'u' as u32, self.ignore_case()),
            },
            'c' => match self.peek() {
                Some(l) if l.is_ascii_alphabetic() => {
                    self.bump();
                    emit_literal(buf, (l as u32) % 32, self.ignore_case());
                }
                _ if self.is_unicode() => {
                    return Err(JsError::regex_syntax("invalid \\c escape"));
                }
                _ => {
                    // Annex B: a bare `\c` is a literal backslash, `c` rescans
                    emit_literal(buf, '\\' as u32, self.ignore_case());
                }
            },
            'n' => emit_literal(buf, '\n' as u32, self.ignore_case()),
            'r' => emit_literal(buf, '\r' as u32, self.ignore_case()),
            't' => emit_literal(buf, '\t' as u32, self.ignore_case()),
            'v' => emit_literal(buf, 0x0B, self.ignore_case()),
            'f' => emit_literal(buf, 0x0C, self.ignore_case()),
            '^' | '$' | '\\' | '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|'
            | '/' => emit_literal(buf, c as u32, self.ignore_case()),
            _ => {
                if self.is_unicode() {
                    return Err(JsError::regex_syntax(format!("invalid escape '\\{}'", c)));
                }
                // Annex B identity escape
                emit_literal(buf, c as u32, self.ignore_case());
            }
        }
        Ok(true)
    }

    fn parse_legacy_octal(&mut self) -> u32 {
        let mut value = 0u32;
        let mut digits = 0;
        while digits < 3 {
            match self.peek().and_then(|c| c.to_digit(8)) {
                Some(d) if value * 8 + d <= 0o377 => {
                    value = value * 8 + d;
                    digits += 1;
                    self.bump();
                }
                _ => break,
            }
        }
        value
    }

    fn parse_fixed_hex(&mut self, len: usize) -> Option<u32> {
        let start = self.pos;
        let mut value = 0u32;
        for _ in 0..len {
            match self.peek().and_then(|c| c.to_digit(16)) {
                Some(d) => {
                    value = value * 16 + d;
                    self.bump();
                }
                None => {
                    self.pos = start;
                    return None;
                }
            }
        }
        Some(value)
    }

    /// `\uHHHH` always; `\u{H...}` only in unicode mode. None means the
    /// escape decayed to an identity escape (non-unicode Annex B).
    fn parse_unicode_escape(&mut self) -> Result<Option<u32>, JsError> {
        if self.peek() == Some('{') && self.is_unicode() {
            self.bump();
            let mut value = 0u32;
            let mut any = false;
            while let Some(d) = self.peek().and_then(|c| c.to_digit(16)) {
                value = value.saturating_mul(16).saturating_add(d);
                any = true;
                self.bump();
            }
            if !any || !self.eat('}') || value > 0x10FFFF {
                return Err(JsError::regex_syntax("invalid \\u{...} escape"));
            }
            return Ok(Some(value));
        }
        match self.parse_fixed_hex(4) {
            Some(cp) => Ok(Some(cp)),
            None if self.is_unicode() => Err(JsError::regex_syntax("invalid \\u escape")),
            None => Ok(None),
        }
    }

    fn parse_property_class(&mut self, negated: bool) -> Result<CharacterClass, JsError> {
        if !self.eat('{') {
            return Err(JsError::regex_syntax("expected '{' after \\p"));
        }
        let mut name = String::new();
        let mut value: Option<String> = None;
        while let Some(c) = self.peek() {
            if c == '}' {
                break;
            }
            if c == '=' {
                self.bump();
                let mut v = String::new();
                while let Some(c2) = self.peek() {
                    if c2 == '}' {
                        break;
                    }
                    v.push(c2);
                    self.bump();
                }
                value = Some(v);
                break;
            }
            name.push(c);
            self.bump();
        }
        if !self.eat('}') {
            return Err(JsError::regex_syntax("unterminated \\p{...} escape"));
        }

        let ranges = unicode::property_ranges(&name, value.as_deref()).ok_or_else(|| {
            JsError::regex_syntax(format!("unknown Unicode property '{}'", name))
        })?;
        let mut class = CharacterClass::from_ranges(&ranges);
        class.inverted = negated;
        Ok(class)
    }

    // === Character classes ===

    /// Parse `[...]` after the opening bracket has been consumed
    fn parse_class(&mut self) -> Result<CharacterClass, JsError> {
        let mut class = CharacterClass::new();
        class.inverted = self.eat('^');

        loop {
            let c = match self.peek() {
                None => return Err(JsError::regex_syntax("unterminated character class")),
                Some(']') => {
                    self.bump();
                    break;
                }
                Some(c) => c,
            };
            self.bump();

            let left = if c == '\\' { self.parse_class_escape()? } else { ClassAtom::Char(c as u32) };

            // `a-b` range, unless `-` is the final char before `]`
            if self.peek() == Some('-') && self.peek_at(1) != Some(']') && self.peek_at(1).is_some()
            {
                self.bump(); // -
                let rc = self.bump().ok_or_else(|| {
                    JsError::regex_syntax("unterminated character class")
                })?;
                let right =
                    if rc == '\\' { self.parse_class_escape()? } else { ClassAtom::Char(rc as u32) };

                match (left, right) {
                    (ClassAtom::Char(lo), ClassAtom::Char(hi)) => {
                        if lo > hi {
                            return Err(JsError::regex_syntax(
                                "range out of order in character class",
                            ));
                        }
                        class.add_range(lo, hi);
                    }
                    (l, r) => {
                        if self.is_unicode() {
                            return Err(JsError::regex_syntax(
                                "invalid character class range",
                            ));
                        }
                        // Annex B: the escape's set joins the class and the
                        // `-` plus any char operand become singletons
                        for atom in [l, r] {
                            match atom {
                                ClassAtom::Char(cp) => class.add_char(cp),
                                ClassAtom::Ranges(ranges) => class.add_ranges(&ranges),
                            }
                        }
                        class.add_char('-' as u32);
                    }
                }
            } else {
                match left {
                    ClassAtom::Char(cp) => class.add_char(cp),
                    ClassAtom::Ranges(ranges) => class.add_ranges(&ranges),
                }
            }
        }

        class.normalize();
        if class.is_empty() && !class.inverted {
            // `[]` matches nothing; keep an impossible range so the emitter
            // has a payload
            class.add_range(0x110000, 0x110000);
        }
        Ok(class)
    }

    fn parse_class_escape(&mut self) -> Result<ClassAtom, JsError> {
        let c = match self.bump() {
            Some(c) => c,
            None => return Err(JsError::regex_syntax("pattern may not end with '\\'")),
        };
        let atom = match c {
            'd' => ClassAtom::Ranges(DIGIT_RANGES.to_vec()),
            'D' => ClassAtom::Ranges(invert_ranges(DIGIT_RANGES)),
            'w' => ClassAtom::Ranges(WORD_RANGES.to_vec()),
            'W' => ClassAtom::Ranges(invert_ranges(WORD_RANGES)),
            's' => ClassAtom::Ranges(SPACE_RANGES.to_vec()),
            'S' => ClassAtom::Ranges(invert_ranges(SPACE_RANGES)),
            'b' => ClassAtom::Char(0x08),
            'p' | 'P' if self.is_unicode() => {
                let class = self.parse_property_class(c == 'P')?;
                if class.inverted {
                    ClassAtom::Ranges(invert_ranges(&class.ranges))
                } else {
                    ClassAtom::Ranges(class.ranges)
                }
            }
            'x' => match self.parse_fixed_hex(2) {
                Some(cp) => ClassAtom::Char(cp),
                None if self.is_unicode() => {
                    return Err(JsError::regex_syntax("invalid \\x escape"))
                }
                None => ClassAtom::Char('x' as u32),
            },
            'u' => match self.parse_unicode_escape()? {
                Some(cp) => ClassAtom::Char(cp),
                None => ClassAtom::Char('u' as u32),
            },
            'c' => match self.peek() {
                Some(l) if l.is_ascii_alphabetic() => {
                    self.bump();
                    ClassAtom::Char((l as u32) % 32)
                }
                _ if self.is_unicode() => {
                    return Err(JsError::regex_syntax("invalid \\c escape"))
                }
                _ => ClassAtom::Char('\\' as u32),
            },
            'n' => ClassAtom::Char('\n' as u32),
            'r' => ClassAtom::Char('\r' as u32),
            't' => ClassAtom::Char('\t' as u32),
            'v' => ClassAtom::Char(0x0B),
            'f' => ClassAtom::Char(0x0C),
            '0'..='7' if !self.is_unicode() => {
                self.pos -= 1;
                ClassAtom::Char(self.parse_legacy_octal())
            }
            '0' => ClassAtom::Char(0),
            _ => {
                if self.is_unicode() && !"^$\\.*+?()[]{}|/-".contains(c) {
                    return Err(JsError::regex_syntax(format!("invalid escape '\\{}'", c)));
                }
                ClassAtom::Char(c as u32)
            }
        };
        Ok(atom)
    }
}

enum ClassAtom {
    Char(u32),
    Ranges(Vec<(u32, u32)>),
}

fn invert_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable();
    let mut out = Vec::with_capacity(sorted.len() + 1);
    let mut next = 0u32;
    for &(start, end) in &sorted {
        if start > next {
            out.push((next, start - 1));
        }
        next = end + 1;
    }
    if next <= 0x10FFFF {
        out.push((next, 0x10FFFF));
    }
    out
}

fn emit_literal(buf: &mut ByteBuffer, cp: u32, ignore_case: bool) {
    if cp <= 0xFFFF {
        buf.push_op(if ignore_case { ReOp::CharI } else { ReOp::Char });
        buf.push_u16(cp as u16);
    } else {
        buf.push_op(if ignore_case { ReOp::Char32I } else { ReOp::Char32 });
        buf.push_u32(cp);
    }
}

fn emit_backreference(buf: &mut ByteBuffer, index: u32, ignore_case: bool) -> Result<(), JsError> {
    if index > 255 {
        return Err(JsError::regex_syntax("too many capture groups"));
    }
    buf.push_op(if ignore_case { ReOp::BackReferenceI } else { ReOp::BackReference });
    buf.push_u8(index as u8);
    Ok(())
}

fn emit_ranges(buf: &mut ByteBuffer, ranges: &[(u32, u32)], inverted: bool, ignore_case: bool) {
    let mut class = CharacterClass::from_ranges(ranges);
    class.inverted = inverted;
    emit_class(buf, &class, ignore_case);
}

/// Emit a RANGE-family opcode:
/// [op][u16 dataSize][u16 numRanges][(u32 start, u32 end)*]
fn emit_class(buf: &mut ByteBuffer, class: &CharacterClass, ignore_case: bool) {
    let wide = class.max_code_point() > 0xFFFF;
    let op = match (class.inverted, ignore_case, wide) {
        (true, false, _) => ReOp::NotRange,
        (true, true, _) => ReOp::NotRangeI,
        (false, false, false) => ReOp::Range,
        (false, true, false) => ReOp::RangeI,
        (false, false, true) => ReOp::Range32,
        (false, true, true) => ReOp::Range32I,
    };
    buf.push_op(op);
    let num_ranges = class.ranges.len() as u16;
    buf.push_u16((num_ranges as usize * 8 + 2) as u16);
    buf.push_u16(num_ranges);
    for &(start, end) in &class.ranges {
        buf.push_u32(start);
        buf.push_u32(end);
    }
}

/// Emit `SPLIT [SET_CHAR_POS] atom [CHECK_ADVANCE] GOTO-back`
fn emit_star_loop(
    out: &mut ByteBuffer,
    atom: &ByteBuffer,
    greedy: bool,
    needs_guard: bool,
    register: u8,
) {
    let guard = if needs_guard { 2 } else { 0 };
    let body_len = guard + atom.len() + guard + 5;

    let loop_start = out.len();
    out.push_op(if greedy { ReOp::SplitNextFirst } else { ReOp::SplitGotoFirst });
    out.push_i32(body_len as i32);
    if needs_guard {
        out.push_op(ReOp::SetCharPos);
        out.push_u8(register);
    }
    out.push_bytes(atom.as_slice());
    if needs_guard {
        out.push_op(ReOp::CheckAdvance);
        out.push_u8(register);
    }
    let goto_end = out.len() + 5;
    out.push_op(ReOp::Goto);
    out.push_i32(loop_start as i32 - goto_end as i32);
}

/// True when the atom may consume no input, in which case the quantifier
/// loop needs a SET_CHAR_POS/CHECK_ADVANCE guard. Splits over-approximate:
/// a branching atom is treated as possibly-empty, which only costs the guard.
fn atom_can_match_empty(bytes: &[u8]) -> bool {
    let mut pos = 0usize;
    let mut saw_advancing = false;
    while pos < bytes.len() {
        let op = match ReOp::from_u8(bytes[pos]) {
            Some(op) => op,
            None => return true,
        };
        match op {
            ReOp::Char
            | ReOp::CharI
            | ReOp::Char32
            | ReOp::Char32I
            | ReOp::Dot
            | ReOp::Any
            | ReOp::Space
            | ReOp::NotSpace => saw_advancing = true,
            ReOp::Range
            | ReOp::RangeI
            | ReOp::Range32
            | ReOp::Range32I
            | ReOp::NotRange
            | ReOp::NotRangeI => {
                saw_advancing = true;
                let data_size =
                    u16::from_le_bytes([bytes[pos + 1], bytes[pos + 2]]) as usize;
                pos += 3 + data_size;
                continue;
            }
            ReOp::SplitGotoFirst | ReOp::SplitNextFirst => return true,
            ReOp::Lookahead
            | ReOp::NegativeLookahead
            | ReOp::Lookbehind
            | ReOp::NegativeLookbehind => {
                // Assertion bodies never advance the outer cursor
                let len = u32::from_le_bytes([
                    bytes[pos + 1],
                    bytes[pos + 2],
                    bytes[pos + 3],
                    bytes[pos + 4],
                ]) as usize;
                pos += 5 + len;
                continue;
            }
            _ => {}
        }
        pos += op.size();
    }
    !saw_advancing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        assert!(compile("a", "gimsyd").is_ok());
        assert!(compile("a", "gg").is_err());
        assert!(compile("a", "uv").is_err());
        assert!(compile("a", "q").is_err());
    }

    #[test]
    fn test_capture_count_includes_group_zero() {
        let bc = compile("(a)(b)", "").unwrap();
        assert_eq!(bc.capture_count, 3);
        assert!(bc.group_names.is_none());
    }

    #[test]
    fn test_named_group_prescan() {
        let bc = compile("(?<year>\\d+)-(?<month>\\d+)", "").unwrap();
        assert!(bc.has_flag(flags::NAMED_GROUPS));
        let names = bc.group_names.unwrap();
        assert_eq!(names[0], None);
        assert_eq!(names[1], Some("year".to_string()));
        assert_eq!(names[2], Some("month".to_string()));
    }

    #[test]
    fn test_duplicate_names_across_alternatives() {
        // ES2025: legal in different alternatives of one disjunction
        assert!(compile("(?<x>a)|(?<x>b)", "").is_ok());
        // Illegal in the same alternative path
        assert!(compile("(?<x>a)(?<x>b)", "").is_err());
        assert!(compile("((?<x>a)|(?<x>b))(?<x>c)", "").is_err());
    }

    #[test]
    fn test_forward_backreference_allowed() {
        // \2 refers to a later group; the pre-scan makes this legal
        assert!(compile("\\2(a)(b)", "").is_ok());
        // Out of range decays to octal in non-unicode mode only
        assert!(compile("\\7", "").is_ok());
        assert!(compile("\\7", "u").is_err());
    }

    #[test]
    fn test_annex_b_decays() {
        assert!(compile("a{", "").is_ok());
        assert!(compile("a{", "u").is_err());
        assert!(compile("\\q", "").is_ok());
        assert!(compile("\\q", "u").is_err());
        assert!(compile("[\\W-a]", "").is_ok());
        assert!(compile("[\\W-a]", "u").is_err());
    }

    #[test]
    fn test_quantifier_rejects_anchors() {
        assert!(compile("^*", "").is_err());
        assert!(compile("\\b+", "").is_err());
        assert!(compile("(?=a)*", "u").is_err());
        // Annex B allows quantified lookahead without the u flag
        assert!(compile("(?=a)*", "").is_ok());
    }

    #[test]
    fn test_bytecode_shape_for_simple_pattern() {
        let bc = compile("a", "").unwrap();
        let b = &bc.instructions;
        assert_eq!(b[0], ReOp::SaveStart as u8);
        assert_eq!(b[1], 0);
        assert_eq!(b[2], ReOp::Char as u8);
        assert_eq!(u16::from_le_bytes([b[3], b[4]]), 'a' as u16);
        assert_eq!(b[5], ReOp::SaveEnd as u8);
        assert_eq!(*b.last().unwrap(), ReOp::Match as u8);
    }

    #[test]
    fn test_empty_capable_atom_gets_guard() {
        let bc = compile("(a|)*b", "").unwrap();
        assert!(bc.instructions.contains(&(ReOp::SetCharPos as u8)));
        assert!(bc.instructions.contains(&(ReOp::CheckAdvance as u8)));
        let simple = compile("a*", "").unwrap();
        assert!(!simple.instructions.contains(&(ReOp::SetCharPos as u8)));
    }

    #[test]
    fn test_property_escape_requires_unicode() {
        assert!(compile("\\p{L}", "u").is_ok());
        assert!(compile("\\p{Script=Greek}", "u").is_ok());
        assert!(compile("\\p{Nope}", "u").is_err());
        // Without the u flag \p is an identity escape
        let bc = compile("\\p", "").unwrap();
        assert_eq!(bc.instructions[2], ReOp::Char as u8);
    }

    #[test]
    fn test_unmatched_paren_errors() {
        assert!(compile("(a", "").is_err());
        assert!(compile("a)", "").is_err());
    }
}
