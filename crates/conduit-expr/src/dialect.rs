//! Operator spellings accepted on top of the evaluator's native syntax.
//!
//! Filters are commonly written with C-style boolean operators
//! (`a == 1 && !draft`). The evaluator speaks `and`/`or`/`not`, so the
//! symbolic forms are rewritten before compilation.
//!
//! `self` is reserved by the evaluator for template blocks, so a bare `self`
//! identifier is renamed to [`SELF_ALIAS`]. String literals are left
//! untouched.

use std::borrow::Cow;

/// Name the `self` binding is exposed under inside the evaluator.
pub const SELF_ALIAS: &str = "__self";

/// Rewrite `&&`, `||` and unary `!` into `and`, `or` and `not`, and `self`
/// into [`SELF_ALIAS`].
pub fn normalize(source: &str) -> Cow<'_, str> {
  if !source.contains(['&', '|', '!']) && !source.contains("self") {
    return Cow::Borrowed(source);
  }

  let chars: Vec<char> = source.chars().collect();
  let mut out = String::with_capacity(source.len() + 8);
  let mut quote: Option<char> = None;
  let mut i = 0;

  while i < chars.len() {
    let c = chars[i];
    let next = chars.get(i + 1).copied();

    if let Some(q) = quote {
      out.push(c);
      if c == '\\' {
        if let Some(escaped) = next {
          out.push(escaped);
          i += 1;
        }
      } else if c == q {
        quote = None;
      }
      i += 1;
      continue;
    }

    if is_ident_start(c) {
      let start = i;
      while i < chars.len() && is_ident_char(chars[i]) {
        i += 1;
      }
      let ident: String = chars[start..i].iter().collect();
      let is_attribute = out.trim_end().ends_with('.');
      if ident == "self" && !is_attribute {
        out.push_str(SELF_ALIAS);
      } else {
        out.push_str(&ident);
      }
      continue;
    }

    match (c, next) {
      ('"' | '\'', _) => {
        quote = Some(c);
        out.push(c);
      }
      ('&', Some('&')) => {
        out.push_str(" and ");
        i += 1;
      }
      ('|', Some('|')) => {
        out.push_str(" or ");
        i += 1;
      }
      ('!', Some('=')) => {
        out.push_str("!=");
        i += 1;
      }
      ('!', _) => out.push_str(" not "),
      _ => out.push(c),
    }
    i += 1;
  }

  Cow::Owned(out)
}

fn is_ident_start(c: char) -> bool {
  c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
  c.is_ascii_alphanumeric() || c == '_'
}
