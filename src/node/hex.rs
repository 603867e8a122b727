use core::fmt;

/// Bytes shown before a dump is cut short.
const DUMP_LIMIT: usize = 16;

/// Space separated hex of the first few bytes of a payload, for trace logs.
pub struct HexHead<'a>(&'a [u8]);

impl fmt::Display for HexHead<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.len().min(DUMP_LIMIT);
        for (i, byte) in self.0[..shown].iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        if self.0.len() > shown {
            write!(f, " ..(+{})", self.0.len() - shown)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexHead<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> HexHead<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexHead<'_> {
        HexHead(self.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_payloads_are_shown_whole() {
        assert_eq!([0x0a_u8, 0xff, 0x00].hex().to_string(), "0A FF 00");
    }

    #[test]
    fn long_payloads_are_cut() {
        let bytes = [1u8; 20];
        assert!(bytes.hex().to_string().ends_with("01 ..(+4)"));
    }
}
