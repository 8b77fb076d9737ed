// File: src/regex/engine.rs
//
// Backtracking interpreter for compiled regex bytecode.
// Fresh execution state is allocated per call; nothing is shared.

use crate::regex::{flags, MatchResult, ReOp, RegexBytecode};

/// Snapshot taken before a split so the not-taken branch can be resumed
#[derive(Debug, Clone)]
struct BacktrackPoint {
    pc: usize,
    pos: usize,
    capture_starts: Vec<i32>,
    capture_ends: Vec<i32>,
    registers: Vec<i64>,
}

pub struct RegexEngine {
    bytecode: RegexBytecode,
}

impl RegexEngine {
    pub fn new(bytecode: RegexBytecode) -> Self {
        Self { bytecode }
    }

    pub fn bytecode(&self) -> &RegexBytecode {
        &self.bytecode
    }

    /// Run the pattern against `input` from `start_index` (a code-point
    /// offset). Tries successive positions unless the pattern is sticky.
    /// Result indices are UTF-16 code unit offsets.
    pub fn exec(&self, input: &str, start_index: usize) -> Option<MatchResult> {
        let points: Vec<u32> = input.chars().map(|c| c as u32).collect();
        if start_index > points.len() {
            return None;
        }
        let sticky = self.bytecode.has_flag(flags::STICKY);
        let capture_count = self.bytecode.capture_count as usize;

        let mut position = start_index;
        loop {
            let mut ctx = ExecContext::new(&self.bytecode.instructions, &points, capture_count);
            ctx.ignore_case = self.bytecode.has_flag(flags::IGNORE_CASE);
            ctx.unicode = self.bytecode.is_unicode();
            if ctx.run(0, position) {
                return Some(self.build_result(input, &points, &ctx));
            }
            if sticky || position >= points.len() {
                return None;
            }
            position += 1;
        }
    }

    pub fn test(&self, input: &str) -> bool {
        self.exec(input, 0).is_some()
    }

    fn build_result(&self, input: &str, points: &[u32], ctx: &ExecContext) -> MatchResult {
        // Prefix sums translating code-point indices to UTF-16 units
        let mut utf16_at = Vec::with_capacity(points.len() + 1);
        let mut acc = 0usize;
        utf16_at.push(0);
        for c in input.chars() {
            acc += c.len_utf16();
            utf16_at.push(acc);
        }

        let mut captures = Vec::with_capacity(ctx.capture_starts.len());
        let mut indices = Vec::with_capacity(ctx.capture_starts.len());
        for i in 0..ctx.capture_starts.len() {
            let start = ctx.capture_starts[i];
            let end = ctx.capture_ends[i];
            if start >= 0 && end >= start {
                let (start, end) = (start as usize, end as usize);
                let text: String =
                    points[start..end].iter().map(|&cp| char::from_u32(cp).unwrap()).collect();
                captures.push(Some(text));
                indices.push(Some((utf16_at[start], utf16_at[end])));
            } else {
                captures.push(None);
                indices.push(None);
            }
        }

        MatchResult {
            start_index: utf16_at[ctx.capture_starts[0] as usize],
            end_index: utf16_at[ctx.capture_ends[0] as usize],
            captures,
            indices,
        }
    }
}

struct ExecContext<'a> {
    bytecode: &'a [u8],
    input: &'a [u32],
    ignore_case: bool,
    unicode: bool,
    capture_starts: Vec<i32>,
    capture_ends: Vec<i32>,
    registers: Vec<i64>,
    backtrack: Vec<BacktrackPoint>,
    /// Assertion sub-executions must end at exactly this cursor
    required_end: Option<usize>,
}

impl<'a> ExecContext<'a> {
    fn new(bytecode: &'a [u8], input: &'a [u32], capture_count: usize) -> Self {
        Self {
            bytecode,
            input,
            ignore_case: false,
            unicode: false,
            capture_starts: vec![-1; capture_count],
            capture_ends: vec![-1; capture_count],
            registers: vec![0; 8],
            backtrack: Vec::new(),
            required_end: None,
        }
    }

    fn register(&mut self, index: usize) -> &mut i64 {
        if index >= self.registers.len() {
            self.registers.resize(index + 1, 0);
        }
        &mut self.registers[index]
    }

    fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.bytecode[at], self.bytecode[at + 1]])
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.bytecode[at],
            self.bytecode[at + 1],
            self.bytecode[at + 2],
            self.bytecode[at + 3],
        ])
    }

    fn read_i32(&self, at: usize) -> i32 {
        self.read_u32(at) as i32
    }

    /// Run the interpreter from `pc` with the cursor at `pos`. True means
    /// a MATCH-family opcode was reached with all constraints met.
    fn run(&mut self, mut pc: usize, mut pos: usize) -> bool {
        loop {
            if pc >= self.bytecode.len() {
                if !self.fail(&mut pc, &mut pos) {
                    return false;
                }
                continue;
            }
            let op = match ReOp::from_u8(self.bytecode[pc]) {
                Some(op) => op,
                None => return false,
            };

            match op {
                ReOp::Match
                | ReOp::LookaheadMatch
                | ReOp::NegativeLookaheadMatch
                | ReOp::LookbehindMatch
                | ReOp::NegativeLookbehindMatch => {
                    if let Some(required) = self.required_end {
                        if pos != required {
                            if !self.fail(&mut pc, &mut pos) {
                                return false;
                            }
                            continue;
                        }
                    }
                    return true;
                }

                ReOp::Char | ReOp::CharI => {
                    let target = self.read_u16(pc + 1) as u32;
                    if self.match_char(pos, target, op == ReOp::CharI) {
                        pos += 1;
                        pc += 3;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }
                ReOp::Char32 | ReOp::Char32I => {
                    let target = self.read_u32(pc + 1);
                    if self.match_char(pos, target, op == ReOp::Char32I) {
                        pos += 1;
                        pc += 5;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }
                ReOp::Dot => {
                    let ok = self
                        .input
                        .get(pos)
                        .map(|&c| !is_line_terminator(c))
                        .unwrap_or(false);
                    if ok {
                        pos += 1;
                        pc += 1;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }
                ReOp::Any => {
                    if pos < self.input.len() {
                        pos += 1;
                        pc += 1;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }
                ReOp::Space | ReOp::NotSpace => {
                    let inside =
                        self.input.get(pos).map(|&c| is_space(c)).unwrap_or(false);
                    let ok = pos < self.input.len() && (inside == (op == ReOp::Space));
                    if ok {
                        pos += 1;
                        pc += 1;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }

                ReOp::LineStart | ReOp::LineStartM => {
                    let ok = pos == 0
                        || (op == ReOp::LineStartM && is_line_terminator(self.input[pos - 1]));
                    if ok {
                        pc += 1;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }
                ReOp::LineEnd | ReOp::LineEndM => {
                    let ok = pos == self.input.len()
                        || (op == ReOp::LineEndM && is_line_terminator(self.input[pos]));
                    if ok {
                        pc += 1;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }

                ReOp::Goto => {
                    let offset = self.read_i32(pc + 1);
                    pc = ((pc + 5) as i64 + offset as i64) as usize;
                }
                ReOp::SplitGotoFirst => {
                    let offset = self.read_i32(pc + 1);
                    let target = ((pc + 5) as i64 + offset as i64) as usize;
                    self.push_backtrack(pc + 5, pos);
                    pc = target;
                }
                ReOp::SplitNextFirst => {
                    let offset = self.read_i32(pc + 1);
                    let target = ((pc + 5) as i64 + offset as i64) as usize;
                    self.push_backtrack(target, pos);
                    pc += 5;
                }

                ReOp::SaveStart => {
                    let index = self.bytecode[pc + 1] as usize;
                    self.capture_starts[index] = pos as i32;
                    pc += 2;
                }
                ReOp::SaveEnd => {
                    let index = self.bytecode[pc + 1] as usize;
                    self.capture_ends[index] = pos as i32;
                    pc += 2;
                }
                ReOp::SaveReset => {
                    let first = self.bytecode[pc + 1] as usize;
                    let last = self.bytecode[pc + 2] as usize;
                    for i in first..=last.min(self.capture_starts.len() - 1) {
                        self.capture_starts[i] = -1;
                        self.capture_ends[i] = -1;
                    }
                    pc += 3;
                }

                ReOp::Range
                | ReOp::RangeI
                | ReOp::Range32
                | ReOp::Range32I
                | ReOp::NotRange
                | ReOp::NotRangeI => {
                    let data_size = self.read_u16(pc + 1) as usize;
                    let num_ranges = self.read_u16(pc + 3) as usize;
                    let fold = matches!(op, ReOp::RangeI | ReOp::Range32I | ReOp::NotRangeI);
                    let negate = matches!(op, ReOp::NotRange | ReOp::NotRangeI);
                    let ok = match self.input.get(pos) {
                        None => false,
                        Some(&c) => {
                            let inside = self.in_ranges(pc + 5, num_ranges, c, fold);
                            inside != negate
                        }
                    };
                    if ok {
                        pos += 1;
                        pc += 3 + data_size;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }

                ReOp::BackReference | ReOp::BackReferenceI => {
                    let index = self.bytecode[pc + 1] as usize;
                    match self.backreference_len(index, pos, op == ReOp::BackReferenceI) {
                        Some(len) => {
                            pos += len;
                            pc += 2;
                        }
                        None => {
                            if !self.fail(&mut pc, &mut pos) {
                                return false;
                            }
                        }
                    }
                }
                ReOp::BackwardBackReference | ReOp::BackwardBackReferenceI => {
                    let index = self.bytecode[pc + 1] as usize;
                    let fold = op == ReOp::BackwardBackReferenceI;
                    match self.backward_backreference_len(index, pos, fold) {
                        Some(len) => {
                            pos -= len;
                            pc += 2;
                        }
                        None => {
                            if !self.fail(&mut pc, &mut pos) {
                                return false;
                            }
                        }
                    }
                }

                ReOp::WordBoundary
                | ReOp::WordBoundaryI
                | ReOp::NotWordBoundary
                | ReOp::NotWordBoundaryI => {
                    let fold = matches!(op, ReOp::WordBoundaryI | ReOp::NotWordBoundaryI);
                    let before = pos > 0 && self.is_word_char(self.input[pos - 1], fold);
                    let here = pos < self.input.len() && self.is_word_char(self.input[pos], fold);
                    let at_boundary = before != here;
                    let want = matches!(op, ReOp::WordBoundary | ReOp::WordBoundaryI);
                    if at_boundary == want {
                        pc += 1;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }

                ReOp::Lookahead | ReOp::NegativeLookahead => {
                    let len = self.read_u32(pc + 1) as usize;
                    let negative = op == ReOp::NegativeLookahead;
                    let sub = &self.bytecode[pc + 5..pc + 5 + len];
                    let mut inner = ExecContext::new(sub, self.input, self.capture_starts.len());
                    inner.ignore_case = self.ignore_case;
                    inner.unicode = self.unicode;
                    inner.capture_starts = self.capture_starts.clone();
                    inner.capture_ends = self.capture_ends.clone();
                    let matched = inner.run(0, pos);
                    let ok = matched != negative;
                    if ok {
                        if matched && !negative {
                            self.capture_starts = inner.capture_starts;
                            self.capture_ends = inner.capture_ends;
                        }
                        pc += 5 + len;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }
                ReOp::Lookbehind | ReOp::NegativeLookbehind => {
                    let len = self.read_u32(pc + 1) as usize;
                    let negative = op == ReOp::NegativeLookbehind;
                    let sub = &self.bytecode[pc + 5..pc + 5 + len];
                    let mut matched = false;
                    for start in 0..=pos {
                        let mut inner =
                            ExecContext::new(sub, self.input, self.capture_starts.len());
                        inner.ignore_case = self.ignore_case;
                        inner.unicode = self.unicode;
                        inner.capture_starts = self.capture_starts.clone();
                        inner.capture_ends = self.capture_ends.clone();
                        inner.required_end = Some(pos);
                        if inner.run(0, start) {
                            if !negative {
                                self.capture_starts = inner.capture_starts;
                                self.capture_ends = inner.capture_ends;
                            }
                            matched = true;
                            break;
                        }
                    }
                    if matched != negative {
                        pc += 5 + len;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }

                ReOp::SetCharPos => {
                    let reg = self.bytecode[pc + 1] as usize;
                    *self.register(reg) = pos as i64;
                    pc += 2;
                }
                ReOp::CheckAdvance => {
                    let reg = self.bytecode[pc + 1] as usize;
                    if *self.register(reg) == pos as i64 {
                        if !self.fail(&mut pc, &mut pos) {
                            return false;
                        }
                    } else {
                        pc += 2;
                    }
                }
                ReOp::Prev => {
                    if pos > 0 {
                        pos -= 1;
                        pc += 1;
                    } else if !self.fail(&mut pc, &mut pos) {
                        return false;
                    }
                }
                ReOp::SetI32 => {
                    let reg = self.bytecode[pc + 1] as usize;
                    let value = self.read_i32(pc + 2);
                    *self.register(reg) = value as i64;
                    pc += 6;
                }
                ReOp::Loop => {
                    let reg = self.bytecode[pc + 1] as usize;
                    let offset = self.read_i32(pc + 2);
                    *self.register(reg) -= 1;
                    if *self.register(reg) > 0 {
                        pc = ((pc + 6) as i64 + offset as i64) as usize;
                    } else {
                        pc += 6;
                    }
                }
                ReOp::LoopSplitGotoFirst | ReOp::LoopSplitNextFirst => {
                    let reg = self.bytecode[pc + 1] as usize;
                    let offset = self.read_i32(pc + 2);
                    let target = ((pc + 6) as i64 + offset as i64) as usize;
                    *self.register(reg) -= 1;
                    if *self.register(reg) > 0 {
                        if op == ReOp::LoopSplitGotoFirst {
                            self.push_backtrack(pc + 6, pos);
                            pc = target;
                        } else {
                            self.push_backtrack(target, pos);
                            pc += 6;
                        }
                    } else {
                        pc += 6;
                    }
                }
            }
        }
    }

    fn push_backtrack(&mut self, pc: usize, pos: usize) {
        self.backtrack.push(BacktrackPoint {
            pc,
            pos,
            capture_starts: self.capture_starts.clone(),
            capture_ends: self.capture_ends.clone(),
            registers: self.registers.clone(),
        });
    }

    /// Restore the most recent backtrack point. False means the attempt is
    /// exhausted.
    fn fail(&mut self, pc: &mut usize, pos: &mut usize) -> bool {
        match self.backtrack.pop() {
            Some(point) => {
                *pc = point.pc;
                *pos = point.pos;
                self.capture_starts = point.capture_starts;
                self.capture_ends = point.capture_ends;
                self.registers = point.registers;
                true
            }
            None => false,
        }
    }

    fn match_char(&self, pos: usize, target: u32, fold: bool) -> bool {
        match self.input.get(pos) {
            None => false,
            Some(&c) => {
                if c == target {
                    true
                } else if fold {
                    fold_eq(c, target)
                } else {
                    false
                }
            }
        }
    }

    fn in_ranges(&self, data_at: usize, num_ranges: usize, c: u32, fold: bool) -> bool {
        let check = |cp: u32| -> bool {
            for i in 0..num_ranges {
                let at = data_at + i * 8;
                let start = self.read_u32(at);
                let end = self.read_u32(at + 4);
                if cp >= start && cp <= end {
                    return true;
                }
            }
            false
        };
        if check(c) {
            return true;
        }
        if fold {
            if let Some(lower) = simple_lowercase(c) {
                if lower != c && check(lower) {
                    return true;
                }
            }
            if let Some(upper) = simple_uppercase(c) {
                if upper != c && check(upper) {
                    return true;
                }
            }
        }
        false
    }

    /// Length consumed by a backreference match at `pos`, or None on
    /// mismatch. An unset group matches empty.
    fn backreference_len(&self, index: usize, pos: usize, fold: bool) -> Option<usize> {
        let start = *self.capture_starts.get(index)?;
        let end = *self.capture_ends.get(index)?;
        if start < 0 || end < start {
            return Some(0);
        }
        let (start, end) = (start as usize, end as usize);
        let len = end - start;
        if pos + len > self.input.len() {
            return None;
        }
        for i in 0..len {
            let a = self.input[start + i];
            let b = self.input[pos + i];
            if a != b && !(fold && fold_eq(a, b)) {
                return None;
            }
        }
        Some(len)
    }

    fn backward_backreference_len(&self, index: usize, pos: usize, fold: bool) -> Option<usize> {
        let start = *self.capture_starts.get(index)?;
        let end = *self.capture_ends.get(index)?;
        if start < 0 || end < start {
            return Some(0);
        }
        let (start, end) = (start as usize, end as usize);
        let len = end - start;
        if len > pos {
            return None;
        }
        for i in 0..len {
            let a = self.input[start + i];
            let b = self.input[pos - len + i];
            if a != b && !(fold && fold_eq(a, b)) {
                return None;
            }
        }
        Some(len)
    }

    fn is_word_char(&self, c: u32, fold: bool) -> bool {
        let basic = (c >= 0x30 && c <= 0x39)
            || (c >= 0x41 && c <= 0x5A)
            || (c >= 0x61 && c <= 0x7A)
            || c == 0x5F;
        if basic {
            return true;
        }
        // ignoreCase+unicode folds LONG S and KELVIN SIGN into the word set
        fold && self.unicode && (c == 0x17F || c == 0x212A)
    }
}

fn is_line_terminator(c: u32) -> bool {
    c == 0x0A || c == 0x0D || c == 0x2028 || c == 0x2029
}

fn is_space(c: u32) -> bool {
    matches!(
        c,
        0x9..=0xD
            | 0x20
            | 0xA0
            | 0x1680
            | 0x2000..=0x200A
            | 0x2028
            | 0x2029
            | 0x202F
            | 0x205F
            | 0x3000
            | 0xFEFF
    )
}

/// Case-insensitive comparison: the characters are equal if either the
/// lowercase or the uppercase of one equals the other
fn fold_eq(a: u32, b: u32) -> bool {
    if a == b {
        return true;
    }
    let (la, ua) = (simple_lowercase(a), simple_uppercase(a));
    let (lb, ub) = (simple_lowercase(b), simple_uppercase(b));
    (la.is_some() && la == lb) || (ua.is_some() && ua == ub)
}

fn simple_lowercase(c: u32) -> Option<u32> {
    let ch = char::from_u32(c)?;
    let mut it = ch.to_lowercase();
    let first = it.next()?;
    if it.next().is_some() {
        return Some(c);
    }
    Some(first as u32)
}

fn simple_uppercase(c: u32) -> Option<u32> {
    let ch = char::from_u32(c)?;
    let mut it = ch.to_uppercase();
    let first = it.next()?;
    if it.next().is_some() {
        return Some(c);
    }
    Some(first as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regex::compile;

    fn engine(pattern: &str, flags: &str) -> RegexEngine {
        RegexEngine::new(compile(pattern, flags).expect("compile error"))
    }

    #[test]
    fn test_backreference_and_group() {
        let re = engine("(foo)\\1", "");
        let m = re.exec("foofoo", 0).expect("should match");
        assert_eq!(m.start_index, 0);
        assert_eq!(m.end_index, 6);
        assert_eq!(m.captures[0].as_deref(), Some("foofoo"));
        assert_eq!(m.captures[1].as_deref(), Some("foo"));
        assert!(re.exec("foobar", 0).is_none());
    }

    #[test]
    fn test_duplicate_named_groups_share_slot() {
        let bc = compile("(?<x>a)|(?<x>b)", "").unwrap();
        let names = bc.group_names.clone().unwrap();
        assert_eq!(names[1].as_deref(), Some("x"));
        let re = RegexEngine::new(bc);
        let m = re.exec("b", 0).expect("should match");
        assert_eq!(m.captures[1].as_deref(), Some("b"));
    }

    #[test]
    fn test_empty_input_boundaries() {
        assert!(engine("^$", "").exec("", 0).is_some());
        assert!(engine(".", "").exec("", 0).is_none());
    }

    #[test]
    fn test_sticky_only_matches_at_start() {
        let re = engine("b", "y");
        assert!(re.exec("abc", 0).is_none());
        let m = re.exec("abc", 1).expect("should match at 1");
        assert_eq!(m.start_index, 1);
    }

    #[test]
    fn test_alternation_and_greedy_quantifier() {
        let m = engine("a+|b+", "").exec("xbbba", 0).unwrap();
        assert_eq!(m.start_index, 1);
        assert_eq!(m.end_index, 4);
        assert_eq!(m.captures[0].as_deref(), Some("bbb"));
    }

    #[test]
    fn test_non_greedy_quantifier() {
        let m = engine("<.+?>", "").exec("<a><b>", 0).unwrap();
        assert_eq!(m.captures[0].as_deref(), Some("<a>"));
    }

    #[test]
    fn test_class_repeat_equivalence() {
        let a = engine("[a-c][a-c]", "").exec("zab", 0).unwrap();
        let b = engine("[a-c]{2}", "").exec("zab", 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_case_insensitive_char_and_class() {
        assert!(engine("abc", "i").test("xAbCy"));
        assert!(engine("[a-z]+", "i").test("HELLO"));
        assert!(!engine("abc", "").test("ABC"));
    }

    #[test]
    fn test_multiline_anchors() {
        let re = engine("^b$", "m");
        let m = re.exec("a\nb\nc", 0).expect("should match line 2");
        assert_eq!(m.start_index, 2);
        assert!(engine("^b$", "").exec("a\nb\nc", 0).is_none());
    }

    #[test]
    fn test_dot_excludes_line_terminators() {
        assert!(!engine("a.b", "").test("a\nb"));
        assert!(engine("a.b", "s").test("a\nb"));
        assert!(!engine("a.b", "").test("a\u{2028}b"));
    }

    #[test]
    fn test_lookahead() {
        let m = engine("\\d+(?=px)", "").exec("100px", 0).unwrap();
        assert_eq!(m.captures[0].as_deref(), Some("100"));
        assert!(engine("\\d+(?!px)", "").exec("100px", 0).map(|m| m.end_index) == Some(2));
    }

    #[test]
    fn test_lookbehind() {
        let m = engine("(?<=\\$)\\d+", "").exec("price: $42", 0).unwrap();
        assert_eq!(m.captures[0].as_deref(), Some("42"));
        assert!(engine("(?<!\\$)\\d\\d", "").exec("$42 43", 0).unwrap().start_index == 4);
    }

    #[test]
    fn test_word_boundary() {
        let m = engine("\\bcat\\b", "").exec("a cat sat", 0).unwrap();
        assert_eq!(m.start_index, 2);
        assert!(!engine("\\bcat\\b", "").test("concatenate"));
    }

    #[test]
    fn test_empty_capable_loop_terminates() {
        // (a|)* can match empty forever without the advance guard
        let m = engine("(a|)*b", "").exec("aab", 0).unwrap();
        assert_eq!(m.end_index, 3);
        let m = engine("(?:a*)*b", "").exec("b", 0).unwrap();
        assert_eq!(m.end_index, 1);
    }

    #[test]
    fn test_unset_group_backreference_matches_empty() {
        let m = engine("(z)?\\1a", "").exec("a", 0).unwrap();
        assert_eq!(m.captures[0].as_deref(), Some("a"));
        assert_eq!(m.captures[1], None);
    }

    #[test]
    fn test_bounded_quantifier() {
        let m = engine("a{2,3}", "").exec("aaaa", 0).unwrap();
        assert_eq!(m.captures[0].as_deref(), Some("aaa"));
        assert!(engine("a{2,3}", "").exec("a", 0).is_none());
        let m = engine("a{2}", "").exec("aaa", 0).unwrap();
        assert_eq!(m.captures[0].as_deref(), Some("aa"));
    }

    #[test]
    fn test_quantified_group_resets_stale_captures() {
        // The second iteration matches "c" only, so group 2 must be unset
        let m = engine("(?:(a)|(b))+", "").exec("ab", 0).unwrap();
        assert_eq!(m.captures[1].as_deref(), Some("a"));
        assert_eq!(m.captures[2].as_deref(), Some("b"));
    }

    #[test]
    fn test_utf16_index_translation() {
        // Astral code points occupy two UTF-16 units
        let m = engine("b", "").exec("\u{1F600}b", 0).unwrap();
        assert_eq!(m.start_index, 2);
        assert_eq!(m.end_index, 3);
    }

    #[test]
    fn test_unicode_property_matching() {
        assert!(engine("\\p{L}+", "u").test("word"));
        assert!(engine("^\\p{Script=Greek}+$", "u").test("αβγ"));
        assert!(!engine("^\\p{Nd}$", "u").test("x"));
        assert!(engine("\\P{Nd}", "u").test("x"));
    }

    #[test]
    fn test_legacy_octal_escape() {
        let m = engine("\\101", "").exec("A", 0).unwrap();
        assert_eq!(m.captures[0].as_deref(), Some("A"));
    }

    #[test]
    fn test_counted_loop_opcodes() {
        // Hand-assembled: SET_I32 r1=3; loop: CHAR 'a'; LOOP r1 -> loop; MATCH
        use crate::regex::ByteBuffer;
        let mut buf = ByteBuffer::new();
        buf.push_op(ReOp::SaveStart);
        buf.push_u8(0);
        buf.push_op(ReOp::SetI32);
        buf.push_u8(1);
        buf.push_i32(3);
        let loop_start = buf.len();
        buf.push_op(ReOp::Char);
        buf.push_u16('a' as u16);
        buf.push_op(ReOp::Loop);
        buf.push_u8(1);
        let after = buf.len() + 4;
        buf.push_i32(loop_start as i32 - after as i32);
        buf.push_op(ReOp::SaveEnd);
        buf.push_u8(0);
        buf.push_op(ReOp::Match);

        let re = RegexEngine::new(RegexBytecode {
            instructions: buf.into_vec(),
            flags: 0,
            capture_count: 1,
            group_names: None,
        });
        let m = re.exec("aaaa", 0).expect("should match three chars");
        assert_eq!(m.end_index, 3);
        assert!(re.exec("aa", 0).is_none());
    }

    #[test]
    fn test_prev_opcode_steps_back() {
        use crate::regex::ByteBuffer;
        // CHAR 'a'; CHAR 'b'; PREV; CHAR 'b' — the cursor re-reads 'b'
        let mut buf = ByteBuffer::new();
        buf.push_op(ReOp::SaveStart);
        buf.push_u8(0);
        buf.push_op(ReOp::Char);
        buf.push_u16('a' as u16);
        buf.push_op(ReOp::Char);
        buf.push_u16('b' as u16);
        buf.push_op(ReOp::Prev);
        buf.push_op(ReOp::Char);
        buf.push_u16('b' as u16);
        buf.push_op(ReOp::SaveEnd);
        buf.push_u8(0);
        buf.push_op(ReOp::Match);

        let re = RegexEngine::new(RegexBytecode {
            instructions: buf.into_vec(),
            flags: 0,
            capture_count: 1,
            group_names: None,
        });
        let m = re.exec("ab", 0).expect("should match");
        assert_eq!(m.end_index, 2);
    }

    #[test]
    fn test_exec_never_escapes_input_bounds() {
        let re = engine("a*", "");
        for i in 0..=3 {
            if let Some(m) = re.exec("aaa", i) {
                assert!(m.start_index <= m.end_index);
                assert!(m.end_index <= 3);
            }
        }
        assert!(re.exec("aaa", 4).is_none());
    }
}
