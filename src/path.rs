use crate::{NsError, NsResult};

pub const SEPARATOR: char = '\\';
pub const SEPARATOR_STR: &str = "\\";

/// Longest single component accepted, in characters.
pub const MAX_NAME_LENGTH: usize = 256;
/// Hard cap on components per resolution. Exceeding it fails the whole
/// call, it is never a truncation.
pub const MAX_HASH_STACK: usize = 32;
/// Deepest node the cache will materialize, counted from a namespace root.
pub const MAX_TOTAL_LEVELS: u32 = 512;

const HASH_FACTOR: u32 = 37;

/// Locale-invariant single-codepoint uppercase mapping.
pub fn upcase(c: char) -> char {
    if c.is_ascii() {
        c.to_ascii_uppercase()
    } else {
        c.to_uppercase().next().unwrap_or(c)
    }
}

/// Fold one name into a running hash. Separators never contribute, so a
/// node's conv_key is independent of how the path around it was written.
pub fn fold_name(base: u32, name: &str) -> u32 {
    let mut h = base;
    for c in name.chars() {
        if c == SEPARATOR {
            continue;
        }
        h = h.wrapping_mul(HASH_FACTOR).wrapping_add(upcase(c) as u32);
    }
    h
}

/// One level of a hash stack: the rolling hash of the whole path up to and
/// including `name`, plus the borrowed component itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEntry<'a> {
    pub conv_key: u32,
    pub name: &'a str,
}

/// Index 0 is the component nearest the base, the last index is the
/// destination component.
pub type HashStack<'a> = Vec<HashEntry<'a>>;

/// Pull the next component off `remaining`, advancing it past the
/// component. Returns `(component, is_last)`; an exhausted path yields
/// `(None, true)`, which callers use to resolve the base node itself.
pub fn next_component<'a>(remaining: &mut &'a str) -> NsResult<(Option<&'a str>, bool)> {
    let s = remaining.trim_start_matches(SEPARATOR);
    if s.is_empty() {
        *remaining = s;
        return Ok((None, true));
    }
    let (comp, rest) = match s.find(SEPARATOR) {
        Some(pos) => (&s[..pos], &s[pos..]),
        None => (s, ""),
    };
    if comp.chars().count() > MAX_NAME_LENGTH {
        return Err(NsError::InvalidPath(format!(
            "component exceeds {} chars",
            MAX_NAME_LENGTH
        )));
    }
    *remaining = rest;
    Ok((Some(comp), rest.trim_start_matches(SEPARATOR).is_empty()))
}

/// Build the hash stack for `path` relative to a node whose conv_key is
/// `base_conv_key`. The hash accumulates across the whole path, so the
/// last entry's conv_key doubles as the full-path fingerprint.
pub fn compute_hash_stack<'a>(
    base_conv_key: u32,
    path: &'a str,
) -> NsResult<(HashStack<'a>, u32)> {
    let mut stack: HashStack<'a> = Vec::new();
    let mut h = base_conv_key;
    let mut rest = path;
    loop {
        let (comp, is_last) = next_component(&mut rest)?;
        let comp = match comp {
            Some(c) => c,
            None => break,
        };
        if stack.len() == MAX_HASH_STACK {
            return Err(NsError::NameTooLong(format!(
                "path exceeds {} components",
                MAX_HASH_STACK
            )));
        }
        h = fold_name(h, comp);
        stack.push(HashEntry { conv_key: h, name: comp });
        if is_last {
            break;
        }
    }
    let total = stack.len() as u32;
    Ok((stack, total))
}

/// Rebuild a relative path string from a slice of stack entries.
pub(crate) fn join_components(entries: &[HashEntry<'_>]) -> String {
    let mut out = String::new();
    for e in entries {
        if !out.is_empty() {
            out.push(SEPARATOR);
        }
        out.push_str(e.name);
    }
    out
}
