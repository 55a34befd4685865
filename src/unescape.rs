use anyhow::{bail, Error};

/// Unescape a TEXT value.
pub fn unescape(s: &str) -> Result<String, Error> {
    let mut chars = s.chars();
    let mut out = String::with_capacity(s.len());

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(c @ '\\') | Some(c @ ';') | Some(c @ ',') => out.push(c),
            Some(c) => bail!("Unexpected escape sequence \\{}", c),
            None => bail!("String ends up in \\"),
        };
    }

    Ok(out)
}

/// Escape a TEXT value for emission.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' | ';' | ',' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_sequences() {
        assert_eq!(unescape(r"a\, b\; c\\d\ne").unwrap(), "a, b; c\\d\ne");
        assert!(unescape(r"bad\q").is_err());
        assert!(unescape("trailing\\").is_err());
    }

    #[test]
    fn escape_is_inverse() {
        let text = "Room 1, floor 2; \\ east\nwing";
        assert_eq!(unescape(&escape(text)).unwrap(), text);
    }
}
