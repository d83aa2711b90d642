use std::fmt::Write;

/// Format a buffer as rows of 16 hex bytes with a mid-row gap, for debug
/// logging of raw packets.
pub fn hex_dump(buffer: &[u8]) -> String {
    let mut out = String::with_capacity(buffer.len() * 3 + buffer.len() / 16 * 8);
    for (i, byte) in buffer.iter().enumerate() {
        if i % 16 == 0 {
            if i != 0 {
                out.push('\n');
            }
            let _ = write!(out, "{i:06X}: ");
        } else if i % 8 == 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02X} ");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dumps_rows_of_sixteen() {
        let buffer: Vec<u8> = (0u8..18).collect();
        let dump = hex_dump(&buffer);

        let mut lines = dump.lines();
        assert_eq!(
            lines.next(),
            Some("000000: 00 01 02 03 04 05 06 07  08 09 0A 0B 0C 0D 0E 0F ")
        );
        assert_eq!(lines.next(), Some("000010: 10 11 "));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn empty_buffer_dumps_empty() {
        assert_eq!(hex_dump(&[]), "");
    }
}
