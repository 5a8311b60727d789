//! Pointer command implementation.

use std::path::Path;

use anyhow::{Context, Result, bail};
use gamefix_core::{ModuleImage, PointerEncoding};
use owo_colors::OwoColorize;

use super::hex_utils::{format_hex_address, hex_bytes, parse_hex_address};
use super::read_image;

/// Parse an encoding given on the command line.
///
/// Accepted forms:
/// - `absolute:<field>`
/// - `relative:<field>`
/// - `rip:<disp>:<len>` (alias `instruction_relative`)
/// - the JSON form used in signature files, e.g. `{"kind":"relative","offset":3}`
pub fn parse_encoding(s: &str) -> Result<PointerEncoding> {
    let s = s.trim();
    if s.starts_with('{') {
        return serde_json::from_str(s).with_context(|| format!("Invalid encoding JSON: {}", s));
    }

    let parts: Vec<&str> = s.split(':').collect();
    let number = |text: &str| -> Result<usize> {
        text.parse::<usize>()
            .with_context(|| format!("Invalid offset '{}' in encoding '{}'", text, s))
    };
    let encoding = match parts.as_slice() {
        [kind, offset] if kind.eq_ignore_ascii_case("absolute") => PointerEncoding::Absolute {
            offset: number(*offset)?,
        },
        [kind, offset] if kind.eq_ignore_ascii_case("relative") => PointerEncoding::Relative {
            offset: number(*offset)?,
        },
        [kind, disp_offset, instr_len]
            if kind.eq_ignore_ascii_case("rip")
                || kind.eq_ignore_ascii_case("instruction_relative") =>
        {
            PointerEncoding::InstructionRelative {
                disp_offset: number(*disp_offset)?,
                instr_len: number(*instr_len)?,
            }
        }
        _ => bail!(
            "Unknown encoding '{}' (expected absolute:<n>, relative:<n> or rip:<disp>:<len>)",
            s
        ),
    };
    Ok(encoding)
}

/// Run the pointer command
pub fn run(file: &Path, offset: &str, encoding: &str, base: usize) -> Result<()> {
    let encoding = parse_encoding(encoding)?;
    let offset = parse_hex_address(offset)?;
    let bytes = read_image(file)?;
    let image = ModuleImage::from_slice(base, &bytes);

    let instruction = base
        .checked_add(offset)
        .context("Offset overflows the address space")?;
    let target = image
        .resolve_pointer(instruction, encoding)
        .with_context(|| {
            format!(
                "Failed to decode pointer at {}",
                format_hex_address(instruction)
            )
        })?;

    println!(
        "Instruction: {}  {}",
        format_hex_address(instruction),
        hex_bytes(&bytes, offset, 16).dimmed()
    );
    println!("Encoding:    {:?}", encoding);
    println!("Target:      {}", format_hex_address(target).green().bold());
    if image.contains(target, 1) {
        println!("             (+0x{:X} into the image)", target - base);
    } else {
        println!("             {}", "(outside the image)".yellow());
    }

    Ok(())
}
