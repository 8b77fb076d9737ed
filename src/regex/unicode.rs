// File: src/regex/unicode.rs
//
// Unicode property lookup tables for `\p{...}` escapes.
// A practical subset of the database: exact ASCII behaviour plus the
// principal BMP blocks for the supported categories and scripts.

use once_cell::sync::Lazy;
use std::collections::HashMap;

type Ranges = &'static [(u32, u32)];

const LETTER: Ranges = &[
    (0x41, 0x5A),
    (0x61, 0x7A),
    (0xAA, 0xAA),
    (0xB5, 0xB5),
    (0xBA, 0xBA),
    (0xC0, 0xD6),
    (0xD8, 0xF6),
    (0xF8, 0x2C1),
    (0x370, 0x373),
    (0x376, 0x377),
    (0x37B, 0x37D),
    (0x37F, 0x37F),
    (0x386, 0x386),
    (0x388, 0x38A),
    (0x38C, 0x38C),
    (0x38E, 0x3A1),
    (0x3A3, 0x3F5),
    (0x3F7, 0x481),
    (0x48A, 0x52F),
    (0x531, 0x556),
    (0x561, 0x587),
    (0x5D0, 0x5EA),
    (0x620, 0x64A),
    (0x671, 0x6D3),
    (0x904, 0x939),
    (0x958, 0x961),
    (0xE01, 0xE30),
    (0x10A0, 0x10C5),
    (0x1E00, 0x1FBC),
    (0x1FC2, 0x1FCC),
    (0x1FD0, 0x1FDB),
    (0x1FE0, 0x1FEC),
    (0x1FF2, 0x1FFC),
    (0x2C60, 0x2C7F),
    (0x3041, 0x3096),
    (0x30A1, 0x30FA),
    (0x3105, 0x312F),
    (0x3400, 0x4DBF),
    (0x4E00, 0x9FFF),
    (0xA000, 0xA48C),
    (0xAC00, 0xD7A3),
    (0xF900, 0xFA6D),
    (0xFB00, 0xFB06),
    (0x10400, 0x1044F),
    (0x20000, 0x2A6DF),
];

const UPPERCASE: Ranges = &[
    (0x41, 0x5A),
    (0xC0, 0xD6),
    (0xD8, 0xDE),
    (0x100, 0x100),
    (0x102, 0x102),
    (0x178, 0x179),
    (0x386, 0x386),
    (0x388, 0x38A),
    (0x38C, 0x38C),
    (0x38E, 0x38F),
    (0x391, 0x3A1),
    (0x3A3, 0x3AB),
    (0x400, 0x42F),
    (0x531, 0x556),
    (0x10A0, 0x10C5),
    (0x1E00, 0x1E00),
    (0x1F08, 0x1F0F),
    (0x2C60, 0x2C60),
    (0xFF21, 0xFF3A),
    (0x10400, 0x10427),
];

const LOWERCASE: Ranges = &[
    (0x61, 0x7A),
    (0xB5, 0xB5),
    (0xDF, 0xF6),
    (0xF8, 0xFF),
    (0x101, 0x101),
    (0x3AC, 0x3CE),
    (0x430, 0x45F),
    (0x561, 0x587),
    (0x1E01, 0x1E01),
    (0x1F00, 0x1F07),
    (0xFF41, 0xFF5A),
    (0x10428, 0x1044F),
];

const DECIMAL_NUMBER: Ranges = &[
    (0x30, 0x39),
    (0x660, 0x669),
    (0x6F0, 0x6F9),
    (0x966, 0x96F),
    (0xE50, 0xE59),
    (0xFF10, 0xFF19),
    (0x1D7CE, 0x1D7FF),
];

const NUMBER: Ranges = &[
    (0x30, 0x39),
    (0xB2, 0xB3),
    (0xB9, 0xB9),
    (0xBC, 0xBE),
    (0x660, 0x669),
    (0x6F0, 0x6F9),
    (0x966, 0x96F),
    (0xE50, 0xE59),
    (0x2160, 0x2182),
    (0xFF10, 0xFF19),
    (0x1D7CE, 0x1D7FF),
];

const WHITE_SPACE: Ranges = &[
    (0x9, 0xD),
    (0x20, 0x20),
    (0x85, 0x85),
    (0xA0, 0xA0),
    (0x1680, 0x1680),
    (0x2000, 0x200A),
    (0x2028, 0x2029),
    (0x202F, 0x202F),
    (0x205F, 0x205F),
    (0x3000, 0x3000),
];

const PUNCTUATION: Ranges = &[
    (0x21, 0x23),
    (0x25, 0x2A),
    (0x2C, 0x2F),
    (0x3A, 0x3B),
    (0x3F, 0x40),
    (0x5B, 0x5D),
    (0x5F, 0x5F),
    (0x7B, 0x7B),
    (0x7D, 0x7D),
    (0xA1, 0xA1),
    (0xBF, 0xBF),
    (0x2010, 0x2027),
    (0x2030, 0x205E),
    (0x3001, 0x3003),
    (0x3008, 0x3011),
];

const SYMBOL: Ranges = &[
    (0x24, 0x24),
    (0x2B, 0x2B),
    (0x3C, 0x3E),
    (0x5E, 0x5E),
    (0x60, 0x60),
    (0x7C, 0x7C),
    (0x7E, 0x7E),
    (0xA2, 0xA9),
    (0xAC, 0xAC),
    (0xB1, 0xB1),
    (0x2190, 0x2BFF),
];

const MATH: Ranges = &[
    (0x2B, 0x2B),
    (0x3C, 0x3E),
    (0x5E, 0x5E),
    (0x7C, 0x7C),
    (0x7E, 0x7E),
    (0xAC, 0xAC),
    (0xB1, 0xB1),
    (0xD7, 0xD7),
    (0xF7, 0xF7),
    (0x2044, 0x2044),
    (0x2190, 0x21FF),
    (0x2200, 0x22FF),
    (0x27C0, 0x27EF),
    (0x2980, 0x29FF),
    (0x1D400, 0x1D7FF),
];

const MARK: Ranges = &[(0x300, 0x36F), (0x483, 0x489), (0x591, 0x5BD), (0x610, 0x61A),
    (0x64B, 0x65F), (0x670, 0x670), (0x20D0, 0x20F0), (0xFE20, 0xFE2F)];

const CONNECTOR_PUNCT: Ranges = &[(0x5F, 0x5F), (0x203F, 0x2040), (0x2054, 0x2054),
    (0xFF3F, 0xFF3F)];

const JOIN_CONTROL: Ranges = &[(0x200C, 0x200D)];

const ASCII: Ranges = &[(0x0, 0x7F)];

const ANY: Ranges = &[(0x0, 0x10FFFF)];

// Approximation: the allocated planes (BMP, SMP, SIP, SSP private tags)
const ASSIGNED: Ranges = &[(0x0, 0x2FFFD), (0x30000, 0x3134A), (0xE0000, 0xE01EF)];

const SCRIPT_LATIN: Ranges = &[
    (0x41, 0x5A),
    (0x61, 0x7A),
    (0xAA, 0xAA),
    (0xBA, 0xBA),
    (0xC0, 0xD6),
    (0xD8, 0xF6),
    (0xF8, 0x2B8),
    (0x1E00, 0x1EFF),
    (0x2C60, 0x2C7F),
    (0xA720, 0xA7FF),
    (0xFB00, 0xFB06),
    (0xFF21, 0xFF3A),
    (0xFF41, 0xFF5A),
];

const SCRIPT_GREEK: Ranges = &[
    (0x370, 0x373),
    (0x375, 0x377),
    (0x37A, 0x37D),
    (0x37F, 0x37F),
    (0x384, 0x384),
    (0x386, 0x386),
    (0x388, 0x38A),
    (0x38C, 0x38C),
    (0x38E, 0x3A1),
    (0x3A3, 0x3E1),
    (0x3F0, 0x3FF),
    (0x1F00, 0x1F15),
    (0x1F18, 0x1F1D),
    (0x1F20, 0x1F45),
    (0x1F48, 0x1F4D),
    (0x1F50, 0x1F57),
    (0x1F5F, 0x1F7D),
    (0x1F80, 0x1FB4),
    (0x1FB6, 0x1FC4),
    (0x1FC6, 0x1FD3),
    (0x1FD6, 0x1FDB),
    (0x1FDD, 0x1FEF),
    (0x1FF2, 0x1FF4),
    (0x1FF6, 0x1FFE),
];

const SCRIPT_CYRILLIC: Ranges = &[(0x400, 0x484), (0x487, 0x52F), (0x1C80, 0x1C88),
    (0x2DE0, 0x2DFF), (0xA640, 0xA69F)];

const SCRIPT_HEBREW: Ranges = &[(0x591, 0x5C7), (0x5D0, 0x5EA), (0x5EF, 0x5F4),
    (0xFB1D, 0xFB36), (0xFB38, 0xFB3C)];

const SCRIPT_ARABIC: Ranges = &[(0x600, 0x604), (0x606, 0x60B), (0x60D, 0x61A),
    (0x620, 0x63F), (0x641, 0x64A), (0x656, 0x66F), (0x671, 0x6DC), (0x750, 0x77F),
    (0x8A0, 0x8B4), (0xFB50, 0xFBC1), (0xFE70, 0xFEFC)];

const SCRIPT_HAN: Ranges = &[(0x2E80, 0x2E99), (0x3005, 0x3005), (0x3007, 0x3007),
    (0x3400, 0x4DBF), (0x4E00, 0x9FFF), (0xF900, 0xFA6D), (0x20000, 0x2A6DF)];

const SCRIPT_HIRAGANA: Ranges = &[(0x3041, 0x3096), (0x309D, 0x309F)];

const SCRIPT_KATAKANA: Ranges = &[(0x30A1, 0x30FA), (0x30FD, 0x30FF), (0x31F0, 0x31FF),
    (0xFF66, 0xFF6F), (0xFF71, 0xFF9D)];

static PROPERTIES: Lazy<HashMap<&'static str, Ranges>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, Ranges> = HashMap::new();

    // General categories with their aliases
    map.insert("L", LETTER);
    map.insert("Letter", LETTER);
    map.insert("Lu", UPPERCASE);
    map.insert("Uppercase_Letter", UPPERCASE);
    map.insert("Ll", LOWERCASE);
    map.insert("Lowercase_Letter", LOWERCASE);
    map.insert("N", NUMBER);
    map.insert("Number", NUMBER);
    map.insert("Nd", DECIMAL_NUMBER);
    map.insert("Decimal_Number", DECIMAL_NUMBER);
    map.insert("M", MARK);
    map.insert("Mark", MARK);
    map.insert("Mn", MARK);
    map.insert("P", PUNCTUATION);
    map.insert("Punctuation", PUNCTUATION);
    map.insert("Pc", CONNECTOR_PUNCT);
    map.insert("S", SYMBOL);
    map.insert("Symbol", SYMBOL);
    map.insert("Z", WHITE_SPACE);
    map.insert("Zs", WHITE_SPACE);

    // Binary properties
    map.insert("Alphabetic", LETTER);
    map.insert("Alpha", LETTER);
    map.insert("Uppercase", UPPERCASE);
    map.insert("Lowercase", LOWERCASE);
    map.insert("White_Space", WHITE_SPACE);
    map.insert("ASCII", ASCII);
    map.insert("Any", ANY);
    map.insert("Assigned", ASSIGNED);
    map.insert("Join_Control", JOIN_CONTROL);
    map.insert("Math", MATH);

    map
});

static SCRIPTS: Lazy<HashMap<&'static str, Ranges>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, Ranges> = HashMap::new();
    map.insert("Latin", SCRIPT_LATIN);
    map.insert("Latn", SCRIPT_LATIN);
    map.insert("Greek", SCRIPT_GREEK);
    map.insert("Grek", SCRIPT_GREEK);
    map.insert("Cyrillic", SCRIPT_CYRILLIC);
    map.insert("Cyrl", SCRIPT_CYRILLIC);
    map.insert("Hebrew", SCRIPT_HEBREW);
    map.insert("Hebr", SCRIPT_HEBREW);
    map.insert("Arabic", SCRIPT_ARABIC);
    map.insert("Arab", SCRIPT_ARABIC);
    map.insert("Han", SCRIPT_HAN);
    map.insert("Hani", SCRIPT_HAN);
    map.insert("Hiragana", SCRIPT_HIRAGANA);
    map.insert("Hira", SCRIPT_HIRAGANA);
    map.insert("Katakana", SCRIPT_KATAKANA);
    map.insert("Kana", SCRIPT_KATAKANA);
    map
});

/// ID_Start: Letter ranges (the compiler adds `_`/`$` itself for
/// identifier-escape use sites, since the property proper excludes them)
pub fn id_start_ranges() -> Vec<(u32, u32)> {
    LETTER.to_vec()
}

pub fn id_continue_ranges() -> Vec<(u32, u32)> {
    let mut ranges = LETTER.to_vec();
    ranges.extend_from_slice(DECIMAL_NUMBER);
    ranges.extend_from_slice(MARK);
    ranges.extend_from_slice(CONNECTOR_PUNCT);
    ranges.extend_from_slice(JOIN_CONTROL);
    ranges
}

/// Resolve a `\p{Name}` or `\p{Key=Value}` property to code-point ranges
pub fn property_ranges(name: &str, value: Option<&str>) -> Option<Vec<(u32, u32)>> {
    match (name, value) {
        ("Script", Some(v)) | ("sc", Some(v)) | ("Script_Extensions", Some(v))
        | ("scx", Some(v)) => SCRIPTS.get(v).map(|r| r.to_vec()),
        ("General_Category", Some(v)) | ("gc", Some(v)) => {
            PROPERTIES.get(v).map(|r| r.to_vec())
        }
        ("ID_Start", None) => Some(id_start_ranges()),
        ("ID_Continue", None) => Some(id_continue_ranges()),
        (n, None) => PROPERTIES
            .get(n)
            .map(|r| r.to_vec())
            .or_else(|| SCRIPTS.get(n).map(|r| r.to_vec())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_alias_resolution() {
        let l = property_ranges("L", None).unwrap();
        let letter = property_ranges("Letter", None).unwrap();
        assert_eq!(l, letter);
        assert!(l.iter().any(|&(s, e)| s <= 'A' as u32 && 'A' as u32 <= e));
    }

    #[test]
    fn test_script_key_value_form() {
        let greek = property_ranges("Script", Some("Greek")).unwrap();
        assert!(greek.iter().any(|&(s, e)| s <= 0x3B1 && 0x3B1 <= e));
        assert!(property_ranges("Script", Some("Klingon")).is_none());
    }

    #[test]
    fn test_binary_properties() {
        assert!(property_ranges("ASCII", None).unwrap() == vec![(0, 0x7F)]);
        let any = property_ranges("Any", None).unwrap();
        assert_eq!(any, vec![(0, 0x10FFFF)]);
        assert!(property_ranges("Join_Control", None).is_some());
        assert!(property_ranges("NoSuchProperty", None).is_none());
    }
}
