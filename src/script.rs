//! GNU linker-script subset.
//!
//! Enough to consume the scripts that appear in practice as input files
//! (`libc.so` on glibc systems is a GROUP script, not an ELF file):
//! INPUT, GROUP, AS_NEEDED, OUTPUT_FORMAT, SEARCH_DIR. VERSION and
//! PROVIDE blocks are skipped balanced. Anything else is fatal.

use anyhow::{bail, Result};

use crate::input::{MappedFile, Reader};

pub fn parse_linker_script(rd: &mut Reader, mb: &MappedFile) -> Result<()> {
    let text = std::str::from_utf8(mb.data)
        .map_err(|_| anyhow::anyhow!("{}: linker script is not UTF-8", mb.name))?;
    let tokens = tokenize(&mb.name, text)?;
    let mut pos = 0usize;

    while pos < tokens.len() {
        let tok = tokens[pos];
        pos += 1;
        match tok {
            ";" => {}
            "OUTPUT_FORMAT" | "ENTRY" | "PROVIDE" | "PROVIDE_HIDDEN" => {
                pos = skip_group(&mb.name, &tokens, pos, "(", ")")?;
            }
            "VERSION" => {
                pos = skip_group(&mb.name, &tokens, pos, "{", "}")?;
            }
            "SEARCH_DIR" => {
                pos = expect(&mb.name, &tokens, pos, "(")?;
                while pos < tokens.len() && tokens[pos] != ")" {
                    rd.search_dirs.push(tokens[pos].to_string());
                    pos += 1;
                }
                pos = expect(&mb.name, &tokens, pos, ")")?;
            }
            "INPUT" | "GROUP" => {
                pos = expect(&mb.name, &tokens, pos, "(")?;
                pos = read_file_list(rd, &mb.name, &tokens, pos)?;
            }
            other => bail!("{}: unknown linker script token: {}", mb.name, other),
        }
    }
    Ok(())
}

/// Reads files up to the closing paren; AS_NEEDED(...) toggles the
/// read-context flag for the files inside it.
fn read_file_list<'t>(
    rd: &mut Reader,
    script: &str,
    tokens: &[&'t str],
    mut pos: usize,
) -> Result<usize> {
    while pos < tokens.len() {
        let tok = tokens[pos];
        pos += 1;
        match tok {
            ")" => return Ok(pos),
            "," => {}
            "AS_NEEDED" => {
                pos = expect(script, tokens, pos, "(")?;
                let saved = rd.ctx.as_needed;
                rd.ctx.as_needed = true;
                pos = read_file_list(rd, script, tokens, pos)?;
                rd.ctx.as_needed = saved;
            }
            name => {
                let mb = if let Some(lib) = name.strip_prefix("-l") {
                    rd.find_library(lib)?
                } else {
                    rd.resolve_script_path(name)?
                };
                rd.read_file(mb)?;
            }
        }
    }
    bail!("{}: unclosed file list", script)
}

fn expect(script: &str, tokens: &[&str], pos: usize, want: &str) -> Result<usize> {
    if tokens.get(pos).copied() != Some(want) {
        bail!("{}: expected '{}'", script, want);
    }
    Ok(pos + 1)
}

/// Skips a balanced `open`..`close` group starting at `pos`.
fn skip_group(script: &str, tokens: &[&str], pos: usize, open: &str, close: &str) -> Result<usize> {
    let mut pos = expect(script, tokens, pos, open)?;
    let mut depth = 1usize;
    while pos < tokens.len() {
        if tokens[pos] == open {
            depth += 1;
        } else if tokens[pos] == close {
            depth -= 1;
            if depth == 0 {
                return Ok(pos + 1);
            }
        }
        pos += 1;
    }
    bail!("{}: unbalanced '{}'", script, open)
}

fn tokenize<'t>(script: &str, text: &'t str) -> Result<Vec<&'t str>> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if bytes[i..].starts_with(b"/*") {
            match text[i..].find("*/") {
                Some(end) => i += end + 2,
                None => bail!("{}: unclosed comment", script),
            }
            continue;
        }
        if b == b'"' {
            let start = i + 1;
            match text[start..].find('"') {
                Some(end) => {
                    tokens.push(&text[start..start + end]);
                    i = start + end + 1;
                }
                None => bail!("{}: unclosed string", script),
            }
            continue;
        }
        if matches!(b, b'(' | b')' | b'{' | b'}' | b';' | b'=' | b',') {
            tokens.push(&text[i..i + 1]);
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len()
            && !bytes[i].is_ascii_whitespace()
            && !matches!(bytes[i], b'(' | b')' | b'{' | b'}' | b';' | b'=' | b',' | b'"')
        {
            i += 1;
        }
        tokens.push(&text[start..i]);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_basics() {
        let toks = tokenize(
            "t",
            "GROUP ( /lib/libc.so.6 /usr/lib/libc_nonshared.a AS_NEEDED ( -lm ) )",
        )
        .unwrap();
        assert_eq!(
            toks,
            vec![
                "GROUP",
                "(",
                "/lib/libc.so.6",
                "/usr/lib/libc_nonshared.a",
                "AS_NEEDED",
                "(",
                "-lm",
                ")",
                ")"
            ]
        );
    }

    #[test]
    fn tokenizer_comments_and_strings() {
        let toks = tokenize("t", "/* hi */ OUTPUT_FORMAT(\"elf64-x86-64\")").unwrap();
        assert_eq!(toks, vec!["OUTPUT_FORMAT", "(", "elf64-x86-64", ")"]);
    }

    #[test]
    fn skip_balanced_version_block() {
        let toks = tokenize("t", "VERSION { GLIBC_2.2.5 { global: *; }; }").unwrap();
        let end = skip_group("t", &toks, 1, "{", "}").unwrap();
        assert_eq!(end, toks.len());
    }
}
