/// A hexadecimal representation of a value.
///
/// Used to render plain integers as addresses in log fields.
///
/// # Examples
///
/// ```
/// # use altrace_core::Hex;
/// assert_eq!(format!("{}", Hex(42u64)), "0x2a");
/// ```
pub struct Hex<T>(pub T);

impl<T> std::fmt::Debug for Hex<T>
where
    T: Copy + std::fmt::LowerHex,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T> std::fmt::Display for Hex<T>
where
    T: Copy + std::fmt::LowerHex,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
