//! Built-in payload conversions

use crate::error::{Error, Result};

/// One byte per value, non-zero is true
pub fn bools(data: &[u8]) -> Result<Vec<bool>> {
    Ok(data.iter().map(|&b| b != 0).collect())
}

/// Packed little-endian `i32`s
pub fn ints(data: &[u8]) -> Result<Vec<i32>> {
    packed::<4, _>(data, "i32", i32::from_le_bytes)
}

/// Packed little-endian `f64`s
pub fn doubles(data: &[u8]) -> Result<Vec<f64>> {
    packed::<8, _>(data, "f64", f64::from_le_bytes)
}

fn packed<const N: usize, T>(
    data: &[u8],
    name: &str,
    decode: impl Fn([u8; N]) -> T,
) -> Result<Vec<T>> {
    if data.len() % N != 0 {
        return Err(Error::Transmutation(format!(
            "{} bytes is not a whole number of {} values",
            data.len(),
            name
        )));
    }
    Ok(data
        .chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            decode(bytes)
        })
        .collect())
}

/// Decode an encoded still image, format detected from its header
#[cfg(feature = "image")]
pub fn image(data: &[u8]) -> Result<image::DynamicImage> {
    image::load_from_memory(data).map_err(|e| Error::Transmutation(e.to_string()))
}
