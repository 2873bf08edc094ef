use core::fmt;

/// How many leading bytes of a payload end up in log lines.
const PREVIEW_BYTES: usize = 16;

/// Bounded hex rendering of a payload, e.g. `[42B 0A1B2C..]`. Request payloads
/// can be large, so logs only ever show their first few bytes.
pub struct PayloadPreview<'a>(&'a [u8]);

impl<'a> PayloadPreview<'a> {
    fn new<T>(data: &'a T) -> PayloadPreview<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        PayloadPreview(data.as_ref())
    }
}

impl fmt::Display for PayloadPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}B ", self.0.len())?;
        for byte in self.0.iter().take(PREVIEW_BYTES) {
            write!(f, "{:02X}", byte)?;
        }
        if self.0.len() > PREVIEW_BYTES {
            write!(f, "..")?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for PayloadPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn preview(&self) -> PayloadPreview<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn preview(&self) -> PayloadPreview<'_> {
        PayloadPreview::new(self)
    }
}
