/// A wrapper that formats integers and byte slices as hexadecimal.
///
/// Used in log fields and diagnostic output, e.g.
/// `tracing::debug!(pattern = %Hex(bytes), ...)`.
pub struct Hex<T>(pub T);

macro_rules! impl_base {
    ($type:ty) => {
        impl ::std::fmt::Debug for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                impl_base_fmt(f, self.0)
            }
        }

        impl ::std::fmt::Display for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                impl_base_fmt(f, self.0)
            }
        }
    };
}

fn impl_base_fmt<T>(f: &mut ::std::fmt::Formatter, data: T) -> ::std::fmt::Result
where
    T: Copy + ::std::fmt::LowerHex,
{
    match size_of::<T>() {
        1 => write!(f, "0x{:02x}", data),
        2 => write!(f, "0x{:04x}", data),
        4 => write!(f, "0x{:08x}", data),
        8 => write!(f, "0x{:016x}", data),
        _ => write!(f, "0x{:x}", data),
    }
}

impl_base!(u8);
impl_base!(u16);
impl_base!(u32);
impl_base!(u64);

impl ::std::fmt::Debug for Hex<&[u8]> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        ::std::fmt::Display::fmt(self, f)
    }
}

/// Bytes are printed as a contiguous lowercase string, the same form the
/// `itext` alarm accepts.
impl ::std::fmt::Display for Hex<&[u8]> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats() {
        assert_eq!(Hex(0x5u8).to_string(), "0x05");
        assert_eq!(Hex(0x1234u32).to_string(), "0x00001234");
        assert_eq!(Hex(&[0xbb_u8, 0x01, 0x90][..]).to_string(), "bb0190");
    }
}
