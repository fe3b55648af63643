//! Binary model signing and low-level wire helpers.
//!
//! All primitives in the model file are little-endian. The layout is the
//! fastText binary format: a magic number and version, followed by the
//! argument header, the dictionary and the (possibly quantized) matrices.

use std::io::{BufRead, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Signature of the binary model format.
pub const MODEL_MAGIC: i32 = 793_712_314;

/// Highest model file version that this crate reads and the version it
/// writes.
pub const MODEL_VERSION: i32 = 12;

/// Write the magic number and version at the start of a model file.
pub fn sign_model(write: &mut impl Write) -> Result<()> {
    write
        .write_i32::<LittleEndian>(MODEL_MAGIC)
        .map_err(|e| Error::write_error("Cannot write magic", e))?;
    write
        .write_i32::<LittleEndian>(MODEL_VERSION)
        .map_err(|e| Error::write_error("Cannot write version", e))?;
    Ok(())
}

/// Check the magic number and version of a model file.
///
/// Returns the version on success. A wrong magic or a version newer than
/// [`MODEL_VERSION`] is a format error.
pub fn check_model(read: &mut impl Read) -> Result<i32> {
    let magic = read
        .read_i32::<LittleEndian>()
        .map_err(|e| Error::read_error("Cannot read magic", e))?;
    if magic != MODEL_MAGIC {
        return Err(Error::format_error(format!(
            "Expected {} as magic, got: {}",
            MODEL_MAGIC, magic
        )));
    }

    let version = read
        .read_i32::<LittleEndian>()
        .map_err(|e| Error::read_error("Cannot read version", e))?;
    if version > MODEL_VERSION {
        return Err(Error::format_error(format!(
            "Expected version <= {}, got: {}",
            MODEL_VERSION, version
        )));
    }

    Ok(version)
}

/// Read a zero-terminated UTF-8 string.
pub fn read_string(read: &mut impl BufRead) -> Result<String> {
    let mut buf = Vec::new();
    read.read_until(0, &mut buf)
        .map_err(|e| Error::read_error("Cannot read string", e))?;
    if buf.last() == Some(&0) {
        buf.pop();
    }
    String::from_utf8(buf)
        .map_err(|e| Error::format_error(format!("Token contains invalid UTF-8: {}", e)))
}

/// Write a string followed by a zero terminator.
pub fn write_string(write: &mut impl Write, s: &str) -> Result<()> {
    write
        .write_all(s.as_bytes())
        .and_then(|_| write.write_u8(0))
        .map_err(|e| Error::write_error("Cannot write string", e))
}

/// Format a float with `precision` significant digits, `%g` style.
///
/// Matches the output of glibc `printf("%.5g")` with trailing zeros
/// stripped, which is the number format of `.vec` files.
pub fn format_float(value: f32, precision: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }

    let exp = value.abs().log10().floor() as i32;
    let mut s = if exp < -4 || exp >= precision as i32 {
        let formatted = format!("{:.*e}", precision.saturating_sub(1), value);
        // Rust prints 1.2345e-5; %g uses at least two exponent digits.
        match formatted.split_once('e') {
            Some((mantissa, exponent)) => {
                let mantissa = strip_trailing_zeros(mantissa);
                let (sign, digits) = if let Some(digits) = exponent.strip_prefix('-') {
                    ("-", digits)
                } else {
                    ("+", exponent)
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => formatted,
        }
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        strip_trailing_zeros(&format!("{:.*}", decimals, value))
    };

    if s.starts_with('.') {
        s.insert(0, '0');
    }
    s
}

fn strip_trailing_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{check_model, format_float, read_string, sign_model, write_string};

    #[test]
    fn sign_check_roundtrip() {
        let mut cursor = Cursor::new(Vec::new());
        sign_model(&mut cursor).unwrap();
        cursor.set_position(0);
        assert_eq!(check_model(&mut cursor).unwrap(), super::MODEL_VERSION);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut cursor = Cursor::new(vec![0u8; 8]);
        assert!(check_model(&mut cursor).is_err());
    }

    #[test]
    fn string_roundtrip() {
        let mut cursor = Cursor::new(Vec::new());
        write_string(&mut cursor, "이명박").unwrap();
        write_string(&mut cursor, "</s>").unwrap();
        cursor.set_position(0);
        assert_eq!(read_string(&mut cursor).unwrap(), "이명박");
        assert_eq!(read_string(&mut cursor).unwrap(), "</s>");
    }

    #[test]
    fn float_formatting() {
        assert_eq!(format_float(0.0, 5), "0");
        assert_eq!(format_float(1.0, 5), "1");
        assert_eq!(format_float(-1.5, 5), "-1.5");
        assert_eq!(format_float(0.12345, 5), "0.12345");
        assert_eq!(format_float(123450.0, 5), "1.2345e+05");
        assert_eq!(format_float(0.000012345, 5), "1.2345e-05");
        assert_eq!(format_float(0.25, 5), "0.25");
    }
}
